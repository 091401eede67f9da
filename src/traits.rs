use crate::error::Result;
use crate::types::{IspInfo, LatencyResult, Measurement, Server};
use crate::utils::Spinner;
use async_trait::async_trait;
use indicatif::ProgressBar;

/// SpeedTestProvider: 测速流程所依赖的全部外部操作
///
/// The CLI and the HTTP API only talk to this trait, so either can run against
/// a fake provider.
#[async_trait]
pub trait SpeedTestProvider: Sync + Send {
    /// 获取候选服务器列表
    async fn server_list(&self) -> Result<Vec<Server>>;

    /// 选出延迟最低的服务器
    /// 输入为空时返回 `NoServers`
    async fn best_server(&self, servers: &[Server], pb: &ProgressBar) -> Result<LatencyResult>;

    /// 查询当前出口 IP 的 ISP 信息
    async fn isp_info(&self) -> Result<IspInfo>;

    /// 下载测速
    async fn download(&self, server: &Server, progress: &Spinner) -> Result<Measurement>;

    /// 上传测速
    async fn upload(&self, server: &Server, progress: &Spinner) -> Result<Measurement>;
}
