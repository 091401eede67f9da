use crate::error::SpeedTestError;
use crate::runner::{self, RunOptions};
use crate::traits::SpeedTestProvider;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Reply};

type SharedProvider = Arc<dyn SpeedTestProvider>;

/// Routes:
/// - `GET /health`
/// - `GET /servers`   server directory as JSON
/// - `GET /speedtest` full run, `SpeedTestReport` as JSON
pub fn routes(
    provider: SharedProvider,
) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    let with_provider = warp::any().map(move || provider.clone());

    let health = warp::path("health")
        .and(warp::path::end())
        .map(|| "ok".into_response());

    let servers = warp::path("servers")
        .and(warp::path::end())
        .and(with_provider.clone())
        .and_then(list_servers);

    let speedtest = warp::path("speedtest")
        .and(warp::path::end())
        .and(with_provider)
        .and_then(speedtest);

    warp::get().and(health.or(servers).unify().or(speedtest).unify())
}

pub async fn serve(provider: SharedProvider, addr: SocketAddr) {
    tracing::info!(%addr, "API server running");
    println!("API server running on {}", addr);
    warp::serve(routes(provider).with(warp::trace::request()))
        .run(addr)
        .await;
}

async fn list_servers(provider: SharedProvider) -> Result<Response, Infallible> {
    Ok(match provider.server_list().await {
        Ok(servers) => warp::reply::json(&servers).into_response(),
        Err(e) => error_response(e),
    })
}

async fn speedtest(provider: SharedProvider) -> Result<Response, Infallible> {
    let opts = RunOptions {
        quiet: true,
        ..RunOptions::default()
    };
    Ok(match runner::run_speedtest(provider.as_ref(), opts).await {
        Ok(report) => warp::reply::json(&report).into_response(),
        Err(e) => error_response(e),
    })
}

fn error_response(err: SpeedTestError) -> Response {
    tracing::error!(error = %err, "request failed");
    warp::reply::with_status(err.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeProvider;

    #[tokio::test]
    async fn test_health() {
        let api = routes(Arc::new(FakeProvider::default()));
        let resp = warp::test::request().path("/health").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body(), "ok");
    }

    #[tokio::test]
    async fn test_speedtest_report() {
        let api = routes(Arc::new(FakeProvider::with_servers()));
        let resp = warp::test::request().path("/speedtest").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["server"]["name"], "Fast");
        assert_eq!(body["download"]["kind"], "download");
        assert_eq!(body["download"]["speeds"][1], 95.5);
        assert_eq!(body["upload"]["speeds"][0], 20.0);
    }

    #[tokio::test]
    async fn test_speedtest_without_servers() {
        let api = routes(Arc::new(FakeProvider::default()));
        let resp = warp::test::request().path("/speedtest").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.body(), "No servers available");
    }

    #[tokio::test]
    async fn test_servers_listing() {
        let api = routes(Arc::new(FakeProvider::with_servers()));
        let resp = warp::test::request().path("/servers").reply(&api).await;
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body.as_array().map(|a| a.len()), Some(2));
        assert_eq!(body[0]["dlURL"], "garbage.php");
    }
}
