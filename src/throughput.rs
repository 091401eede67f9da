use crate::config::Settings;
use crate::error::{Result, SpeedTestError};
use crate::types::{Measurement, Server, ThroughputSample, TrialKind};
use crate::utils::{self, Spinner};
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::Client;
use std::future::Future;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tokio_util::io::StreamReader;

/// Deterministic upload body: byte `i` is `i % 256`.
pub fn upload_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

/// 下载测速: 重复 `iterations` 次, 每次限时 `trial_duration`
pub async fn measure_download(
    client: &Client,
    server: &Server,
    settings: &Settings,
    progress: &Spinner,
) -> Result<Measurement> {
    let url = utils::endpoint_url(&server.server, &server.dl_url);
    let url = url.as_str();
    run_trials(TrialKind::Download, settings, progress, || {
        download_trial(client, url, settings)
    })
    .await
}

/// 上传测速: 每次上传 `upload_payload_size` 字节
pub async fn measure_upload(
    client: &Client,
    server: &Server,
    settings: &Settings,
    progress: &Spinner,
) -> Result<Measurement> {
    let url = utils::endpoint_url(&server.server, &server.ul_url);
    let url = url.as_str();
    // 只生成一次, 每轮 clone 只增加引用计数
    let payload = Bytes::from(upload_payload(settings.upload_payload_size));
    run_trials(TrialKind::Upload, settings, progress, || {
        upload_trial(client, url, payload.clone())
    })
    .await
}

/// Runs the trials one after another with a cool-down between them.
///
/// Failed trials are logged and left out, so the returned sequences only hold
/// successful samples in trial order. Fails only if no trial succeeded.
pub(crate) async fn run_trials<F, Fut>(
    kind: TrialKind,
    settings: &Settings,
    progress: &Spinner,
    mut trial: F,
) -> Result<Measurement>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ThroughputSample>>,
{
    let mut measurement = Measurement::new(kind);

    for i in 0..settings.iterations {
        if i > 0 {
            tokio::time::sleep(settings.cooldown).await;
        }

        match trial().await {
            Ok(sample) => {
                progress.println(format!(
                    "{:.2} Mbps in {:.2} seconds",
                    sample.mbps, sample.elapsed_secs
                ));
                measurement.push(sample);
            }
            Err(e) => {
                tracing::warn!(%kind, trial = i + 1, error = %e, "trial failed");
                progress.println(format!("{} test {} failed: {}", kind, i + 1, e));
                measurement.failed += 1;
            }
        }
    }

    if measurement.is_empty() {
        return Err(SpeedTestError::AllTrialsFailed(kind));
    }
    Ok(measurement)
}

/// One download trial.
///
/// The clock starts right before the read loop. Each read is raced against the
/// deadline; once it passes, the rest of the body is dropped with the response.
/// An early end of stream just ends the trial.
pub async fn download_trial(client: &Client, url: &str, settings: &Settings) -> Result<ThroughputSample> {
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(SpeedTestError::Status {
            url: url.to_string(),
            status,
        });
    }

    let body = resp.bytes_stream().map_err(std::io::Error::other);
    let mut reader = StreamReader::new(Box::pin(body));
    let mut buffer = vec![0u8; settings.read_buffer_size.max(1)];
    let mut total_bytes: u64 = 0;

    let start = Instant::now();
    let deadline = start + settings.trial_duration;

    loop {
        match tokio::time::timeout_at(deadline, reader.read(&mut buffer)).await {
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_bytes += n as u64,
            Ok(Err(e)) => return Err(e.into()),
        }
    }

    let elapsed = start.elapsed();
    tracing::debug!(%url, total_bytes, ?elapsed, "download trial finished");

    Ok(ThroughputSample {
        mbps: utils::mbps(total_bytes, elapsed),
        elapsed_secs: elapsed.as_secs_f64(),
    })
}

/// One upload trial. Elapsed covers sending the body and receiving the response head;
/// the whole payload counts as transferred once the request succeeds.
pub async fn upload_trial(client: &Client, url: &str, payload: Bytes) -> Result<ThroughputSample> {
    let size = payload.len() as u64;

    let start = Instant::now();
    let resp = client.post(url).body(payload).send().await?;
    let elapsed = start.elapsed();

    let status = resp.status();
    if !status.is_success() {
        return Err(SpeedTestError::Status {
            url: url.to_string(),
            status,
        });
    }
    drop(resp);

    tracing::debug!(%url, size, ?elapsed, "upload trial finished");

    Ok(ThroughputSample {
        mbps: utils::mbps(size, elapsed),
        elapsed_secs: elapsed.as_secs_f64(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::time::Duration;
    use warp::hyper::body::Body;
    use warp::Filter;

    const CHUNK: usize = 16 * 1024;
    const TICK: Duration = Duration::from_millis(10);

    fn test_settings() -> Settings {
        Settings {
            iterations: 3,
            trial_duration: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
            cooldown: Duration::from_millis(10),
            ..Settings::default()
        }
    }

    fn client(settings: &Settings) -> Client {
        Client::builder().timeout(settings.request_timeout).build().unwrap()
    }

    /// Mock backend:
    /// - `/stream`: one CHUNK every TICK, forever
    /// - `/short`: 200_000 bytes, then end of stream
    /// - `/broken`: 500
    /// - `POST /upload`: waits 300ms, answers with the received length
    /// - `POST /verify`: 400 unless the body is exactly the upload pattern
    fn spawn_backend() -> SocketAddr {
        let stream = warp::path("stream").and(warp::path::end()).map(|| {
            let ticks = futures::stream::unfold(tokio::time::interval(TICK), |mut interval| async move {
                interval.tick().await;
                Some((Ok::<_, Infallible>(Bytes::from(vec![0u8; CHUNK])), interval))
            });
            warp::reply::Response::new(Body::wrap_stream(ticks))
        });
        let short = warp::path("short")
            .and(warp::path::end())
            .map(|| vec![7u8; 200_000]);
        let broken = warp::path("broken").and(warp::path::end()).map(|| {
            warp::reply::with_status("nope", warp::http::StatusCode::INTERNAL_SERVER_ERROR)
        });
        let upload = warp::post()
            .and(warp::path("upload"))
            .and(warp::path::end())
            .and(warp::body::bytes())
            .and_then(|body: Bytes| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<_, warp::Rejection>(body.len().to_string())
            });

        let verify = warp::post()
            .and(warp::path("verify"))
            .and(warp::path::end())
            .and(warp::body::bytes())
            .map(|body: Bytes| {
                let status = if body[..] == upload_payload(body.len())[..] {
                    warp::http::StatusCode::OK
                } else {
                    warp::http::StatusCode::BAD_REQUEST
                };
                warp::reply::with_status(body.len().to_string(), status)
            });

        let routes = warp::get()
            .and(stream.or(short).or(broken))
            .or(upload)
            .or(verify);
        let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }

    #[test]
    fn test_upload_payload_pattern() {
        let payload = upload_payload(1024 * 1024);
        assert_eq!(payload.len(), 1024 * 1024);
        assert_eq!(payload[0], 0);
        assert_eq!(payload[255], 255);
        assert_eq!(payload[256], 0);
        assert_eq!(payload[1000], (1000 % 256) as u8);
    }

    #[tokio::test]
    async fn test_download_converges_to_stream_rate() -> Result<()> {
        let addr = spawn_backend();
        let settings = test_settings();
        let url = format!("http://{}/stream", addr);

        let sample = download_trial(&client(&settings), &url, &settings).await?;

        let expected = (CHUNK as f64 / TICK.as_secs_f64()) * 8.0 / 1e6;
        assert!(sample.elapsed_secs >= 0.99, "elapsed {}", sample.elapsed_secs);
        assert!(sample.elapsed_secs < 1.5, "elapsed {}", sample.elapsed_secs);
        assert!(
            (sample.mbps - expected).abs() / expected < 0.35,
            "measured {} Mbps, expected about {}",
            sample.mbps,
            expected
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_download_early_eof_is_not_an_error() -> Result<()> {
        let addr = spawn_backend();
        let settings = Settings {
            trial_duration: Duration::from_secs(5),
            ..test_settings()
        };
        let url = format!("http://{}/short", addr);

        let sample = download_trial(&client(&settings), &url, &settings).await?;

        assert!(sample.elapsed_secs < 5.0);
        let bytes = sample.mbps * sample.elapsed_secs * 1e6 / 8.0;
        assert!((bytes - 200_000.0).abs() < 1.0, "counted {} bytes", bytes);
        Ok(())
    }

    #[tokio::test]
    async fn test_download_error_status_fails_trial() {
        let addr = spawn_backend();
        let settings = test_settings();
        let url = format!("http://{}/broken", addr);

        let result = download_trial(&client(&settings), &url, &settings).await;
        assert!(matches!(result, Err(SpeedTestError::Status { .. })));
    }

    #[tokio::test]
    async fn test_upload_elapsed_covers_response_delay() -> Result<()> {
        let addr = spawn_backend();
        let settings = test_settings();
        let url = format!("http://{}/upload", addr);
        let size = 1024 * 1024;

        let sample = upload_trial(&client(&settings), &url, Bytes::from(upload_payload(size))).await?;

        assert!(sample.elapsed_secs >= 0.3, "elapsed {}", sample.elapsed_secs);
        let expected = (size as f64 * 8.0) / (sample.elapsed_secs * 1e6);
        assert!((sample.mbps - expected).abs() < 1e-9);
        Ok(())
    }

    #[tokio::test]
    async fn test_download_with_tight_request_timeout() -> Result<()> {
        // 最小合法的超时: 只比截止时间多一点, 读取循环仍然先结束
        let addr = spawn_backend();
        let settings = Settings {
            iterations: 1,
            trial_duration: Duration::from_secs(1),
            request_timeout: Duration::from_millis(1500),
            ..test_settings()
        };
        settings.validate()?;
        let url = format!("http://{}/stream", addr);

        let sample = download_trial(&client(&settings), &url, &settings).await?;
        assert!(sample.elapsed_secs >= 0.99, "elapsed {}", sample.elapsed_secs);
        assert!(sample.mbps > 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_trials_share_one_payload() -> Result<()> {
        let addr = spawn_backend();
        let settings = Settings {
            iterations: 3,
            cooldown: Duration::ZERO,
            upload_payload_size: 300_000,
            ..test_settings()
        };
        let mut server = Server::new(1, "Local", &format!("http://{}", addr));
        server.ul_url = "verify".to_string();

        let m = measure_upload(&client(&settings), &server, &settings, &Spinner::quiet()).await?;
        assert_eq!(m.failed, 0);
        assert_eq!(m.speeds.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_measure_download_against_server() -> Result<()> {
        let addr = spawn_backend();
        let settings = Settings {
            iterations: 2,
            ..test_settings()
        };
        let mut server = Server::new(1, "Local", &format!("http://{}", addr));
        server.dl_url = "short".to_string();

        let m = measure_download(&client(&settings), &server, &settings, &Spinner::quiet()).await?;
        assert_eq!(m.kind, TrialKind::Download);
        assert_eq!(m.speeds.len(), 2);
        assert_eq!(m.elapsed.len(), 2);
        assert_eq!(m.failed, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_failures_keep_order() -> Result<()> {
        let settings = Settings {
            iterations: 5,
            cooldown: Duration::ZERO,
            ..test_settings()
        };
        let mut calls = 0;
        let m = run_trials(TrialKind::Download, &settings, &Spinner::quiet(), || {
            calls += 1;
            let n = calls;
            async move {
                if n == 2 || n == 4 {
                    Err(SpeedTestError::Timeout(Duration::from_secs(n)))
                } else {
                    Ok(ThroughputSample {
                        mbps: n as f64,
                        elapsed_secs: n as f64 / 10.0,
                    })
                }
            }
        })
        .await?;

        assert_eq!(m.speeds, vec![1.0, 3.0, 5.0]);
        assert_eq!(m.elapsed, vec![0.1, 0.3, 0.5]);
        assert_eq!(m.failed, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_all_trials_failed_is_error() {
        let addr = spawn_backend();
        let settings = Settings {
            cooldown: Duration::ZERO,
            ..test_settings()
        };
        let mut server = Server::new(1, "Local", &format!("http://{}", addr));
        server.ul_url = "missing".to_string();

        let result = measure_upload(&client(&settings), &server, &settings, &Spinner::quiet()).await;
        assert!(matches!(
            result,
            Err(SpeedTestError::AllTrialsFailed(TrialKind::Upload))
        ));
    }
}
