use crate::config::Settings;
use crate::error::{Result, SpeedTestError};
use crate::latency;
use crate::throughput;
use crate::traits::SpeedTestProvider;
use crate::types::{IspInfo, LatencyResult, Measurement, Server};
use crate::utils::Spinner;
use async_trait::async_trait;
use chrono::Utc;
use indicatif::ProgressBar;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Default provider: LibreSpeed directory + ipinfo lookups over reqwest.
pub struct HttpProvider {
    client: Client,
    settings: Settings,
}

impl HttpProvider {
    pub fn new(settings: Settings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(concat!("netspeed/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SpeedTestError::Status {
                url: url.to_string(),
                status,
            });
        }
        let body = resp.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// ipinfo 风格的响应, 所有字段都可能缺失
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IspResponse {
    ip: String,
    org: String,
    asn: String,
    country_name: String,
    city: String,
    region: String,
}

impl From<IspResponse> for IspInfo {
    fn from(resp: IspResponse) -> Self {
        IspInfo {
            ip_address: resp.ip,
            isp: resp.org.clone(),
            asn: resp.asn,
            organization: resp.org,
            country: resp.country_name,
            city: resp.city,
            region: resp.region,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl SpeedTestProvider for HttpProvider {
    async fn server_list(&self) -> Result<Vec<Server>> {
        self.get_json(&self.settings.server_list_url).await
    }

    async fn best_server(&self, servers: &[Server], pb: &ProgressBar) -> Result<LatencyResult> {
        latency::select_best(servers, &self.settings, pb).await
    }

    async fn isp_info(&self) -> Result<IspInfo> {
        let resp: IspResponse = self.get_json(&self.settings.isp_info_url).await?;
        Ok(resp.into())
    }

    async fn download(&self, server: &Server, progress: &Spinner) -> Result<Measurement> {
        throughput::measure_download(&self.client, server, &self.settings, progress).await
    }

    async fn upload(&self, server: &Server, progress: &Spinner) -> Result<Measurement> {
        throughput::measure_upload(&self.client, server, &self.settings, progress).await
    }
}
