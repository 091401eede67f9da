use crate::error::{Result, SpeedTestError};
use crate::traits::SpeedTestProvider;
use crate::types::SpeedTestReport;
use crate::utils::{self, Spinner};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub skip_isp: bool,
    pub skip_download: bool,
    pub skip_upload: bool,
    /// No spinners or progress lines (JSON output, API mode)
    pub quiet: bool,
}

/// 完整测速流程: 服务器列表 -> 最佳服务器 -> ISP -> 下载 -> 上传
///
/// Any failing step aborts the run; per-trial failures are already absorbed
/// by the sampler.
pub async fn run_speedtest(
    provider: &dyn SpeedTestProvider,
    opts: RunOptions,
) -> Result<SpeedTestReport> {
    let spinner = Spinner::start("Fetching server list...", opts.quiet);
    let servers = provider.server_list().await;
    spinner.finish();
    let servers = servers?;
    if servers.is_empty() {
        return Err(SpeedTestError::NoServers);
    }
    tracing::info!(count = servers.len(), "server list fetched");

    let pb = utils::probe_progress(servers.len(), opts.quiet);
    let best = provider.best_server(&servers, &pb).await;
    pb.finish_and_clear();
    let best = best?;
    if !opts.quiet {
        println!("Finding best server... done.");
        println!("Best server: {} with URL: {}", best.server.name, best.server.server);
    }

    let isp = if opts.skip_isp {
        None
    } else {
        let spinner = Spinner::start("Fetching ISP information...", opts.quiet);
        let info = provider.isp_info().await;
        spinner.finish();
        Some(info?)
    };

    let download = if opts.skip_download {
        None
    } else {
        let spinner = Spinner::start("Testing download speed...", opts.quiet);
        let m = provider.download(&best.server, &spinner).await;
        spinner.finish();
        Some(m?)
    };

    let upload = if opts.skip_upload {
        None
    } else {
        let spinner = Spinner::start("Testing upload speed...", opts.quiet);
        let m = provider.upload(&best.server, &spinner).await;
        spinner.finish();
        Some(m?)
    };

    Ok(SpeedTestReport {
        server: best.server,
        isp,
        download,
        upload,
    })
}
