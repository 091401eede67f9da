use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// 测速服务器定义 (LibreSpeed backend list entry)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    /// Base host, e.g. "//speed.example.net" or "https://speed.example.net/"
    pub server: String,
    #[serde(rename = "dlURL", default)]
    pub dl_url: String,
    #[serde(rename = "ulURL", default)]
    pub ul_url: String,
    #[serde(rename = "pingURL", default)]
    pub ping_url: String,
    #[serde(rename = "getIpURL", default)]
    pub get_ip_url: String,
    #[serde(rename = "sponsorName", default)]
    pub sponsor_name: String,
    #[serde(rename = "sponsorURL", default)]
    pub sponsor_url: String,
}

impl Server {
    #[cfg(test)]
    pub fn new(id: i64, name: &str, server: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            server: server.to_string(),
            dl_url: "garbage.php".to_string(),
            ul_url: "empty.php".to_string(),
            ping_url: "empty.php".to_string(),
            get_ip_url: "getIP.php".to_string(),
            sponsor_name: String::new(),
            sponsor_url: String::new(),
        }
    }
}

/// 单个服务器的探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Mean connection-establishment time over all attempts.
    Reachable(Duration),
    /// At least one dial attempt failed.
    Unreachable(String),
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable(_))
    }

    /// Latency used for ranking; unreachable servers take the penalty.
    pub fn effective_latency(&self, penalty: Duration) -> Duration {
        match self {
            ProbeOutcome::Reachable(latency) => *latency,
            ProbeOutcome::Unreachable(_) => penalty,
        }
    }
}

/// 延迟排名中的一项
#[derive(Debug, Clone)]
pub struct LatencyResult {
    pub server: Server,
    pub outcome: ProbeOutcome,
    pub latency: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialKind {
    Download,
    Upload,
}

impl fmt::Display for TrialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrialKind::Download => write!(f, "download"),
            TrialKind::Upload => write!(f, "upload"),
        }
    }
}

/// One successful trial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThroughputSample {
    pub mbps: f64,
    pub elapsed_secs: f64,
}

/// 一轮测速的结果: speeds 与 elapsed 按下标一一对应
#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
    pub kind: TrialKind,
    pub speeds: Vec<f64>,
    pub elapsed: Vec<f64>,
    pub failed: usize,
}

impl Measurement {
    pub fn new(kind: TrialKind) -> Self {
        Self {
            kind,
            speeds: Vec::new(),
            elapsed: Vec::new(),
            failed: 0,
        }
    }

    pub fn push(&mut self, sample: ThroughputSample) {
        self.speeds.push(sample.mbps);
        self.elapsed.push(sample.elapsed_secs);
    }

    pub fn samples(&self) -> impl Iterator<Item = ThroughputSample> + '_ {
        self.speeds
            .iter()
            .zip(&self.elapsed)
            .map(|(&mbps, &elapsed_secs)| ThroughputSample { mbps, elapsed_secs })
    }

    pub fn is_empty(&self) -> bool {
        self.speeds.is_empty()
    }

    pub fn mean_mbps(&self) -> Option<f64> {
        if self.speeds.is_empty() {
            return None;
        }
        Some(self.speeds.iter().sum::<f64>() / self.speeds.len() as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IspInfo {
    pub ip_address: String,
    pub isp: String,
    pub asn: String,
    pub organization: String,
    pub country: String,
    pub city: String,
    pub region: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything a full run produces, rendered by the CLI or the API.
#[derive(Debug, Clone, Serialize)]
pub struct SpeedTestReport {
    pub server: Server,
    pub isp: Option<IspInfo>,
    pub download: Option<Measurement>,
    pub upload: Option<Measurement>,
}
