use crate::config::Settings;
use crate::error::{Result, SpeedTestError};
use crate::types::{LatencyResult, ProbeOutcome, Server};
use crate::utils;
use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// 测量到某个主机的 TCP 建连耗时
///
/// Dials `probe_attempts` times, closing each connection as soon as it is
/// established, and returns the mean. A single failed dial fails the probe.
pub async fn probe_host(host: &str, settings: &Settings) -> Result<Duration> {
    let target = utils::dial_target(host)?;
    let attempts = settings.probe_attempts.max(1);
    let mut total = Duration::ZERO;

    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(settings.probe_interval).await;
        }

        let start = Instant::now();
        let stream = tokio::time::timeout(settings.probe_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| SpeedTestError::Timeout(settings.probe_timeout))??;
        let latency = start.elapsed();
        drop(stream);

        tracing::trace!(%target, attempt, ?latency, "dial completed");
        total += latency;
    }

    Ok(total / attempts)
}

/// 并发探测所有服务器并按延迟排序
///
/// 逻辑:
/// 1. 每个服务器一个探测任务, 同时运行的任务数不超过 `probe_concurrency`
/// 2. 等待所有任务完成
/// 3. 失败的服务器记为 `penalty_latency`, 不会被剔除
/// 4. 稳定排序: 延迟相同时保持输入顺序
pub async fn rank_servers(
    servers: &[Server],
    settings: &Settings,
    pb: &ProgressBar,
) -> Vec<LatencyResult> {
    let tasks = servers.iter().cloned().map(|server| {
        let pb = pb.clone();
        async move {
            let host = utils::normalized_url(&server.server);
            let outcome = match probe_host(&host, settings).await {
                Ok(latency) => {
                    tracing::debug!(server = %server.name, %host, ?latency, "server probed");
                    ProbeOutcome::Reachable(latency)
                }
                Err(e) => {
                    tracing::warn!(server = %server.name, %host, error = %e, "server unreachable");
                    ProbeOutcome::Unreachable(e.to_string())
                }
            };
            pb.inc(1);

            let latency = outcome.effective_latency(settings.penalty_latency);
            LatencyResult {
                server,
                outcome,
                latency,
            }
        }
    });

    // buffered 保持输入顺序, 所以排序结果是确定的
    let mut results: Vec<LatencyResult> = stream::iter(tasks)
        .buffered(settings.probe_concurrency.max(1))
        .collect()
        .await;

    results.sort_by_key(|r| r.latency);
    results
}

/// Pick the server with the lowest (penalty-adjusted) latency.
pub async fn select_best(
    servers: &[Server],
    settings: &Settings,
    pb: &ProgressBar,
) -> Result<LatencyResult> {
    if servers.is_empty() {
        return Err(SpeedTestError::NoServers);
    }

    rank_servers(servers, settings, pb)
        .await
        .into_iter()
        .next()
        .ok_or(SpeedTestError::NoServers)
}
