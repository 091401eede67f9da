use crate::error::{Result, SpeedTestError};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SERVER_LIST_URL: &str = "https://librespeed.org/backend-servers/servers.php";
pub const ISP_INFO_URL: &str = "https://ipinfo.io/json";

/// Run parameters. Every field has a default so a partial config file is valid.
///
/// Durations are written to TOML as whole milliseconds (`*_ms` keys).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server_list_url: String,
    pub isp_info_url: String,
    /// Trials per throughput measurement kind
    pub iterations: usize,
    #[serde(rename = "trial_duration_ms", with = "millis")]
    pub trial_duration: Duration,
    #[serde(rename = "request_timeout_ms", with = "millis")]
    pub request_timeout: Duration,
    pub upload_payload_size: usize,
    pub read_buffer_size: usize,
    #[serde(rename = "cooldown_ms", with = "millis")]
    pub cooldown: Duration,
    pub probe_attempts: u32,
    #[serde(rename = "probe_timeout_ms", with = "millis")]
    pub probe_timeout: Duration,
    #[serde(rename = "probe_interval_ms", with = "millis")]
    pub probe_interval: Duration,
    pub probe_concurrency: usize,
    /// Latency assigned to unreachable servers
    #[serde(rename = "penalty_latency_ms", with = "millis")]
    pub penalty_latency: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_list_url: SERVER_LIST_URL.to_string(),
            isp_info_url: ISP_INFO_URL.to_string(),
            iterations: 10,
            trial_duration: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            upload_payload_size: 1024 * 1024,
            read_buffer_size: 32 * 1024,
            cooldown: Duration::from_secs(1),
            probe_attempts: 3,
            probe_timeout: Duration::from_secs(30),
            probe_interval: Duration::from_millis(100),
            probe_concurrency: 32,
            penalty_latency: Duration::from_secs(10),
        }
    }
}

impl Settings {
    /// Load settings.
    /// Strategy:
    /// 1. An explicit path must exist and parse
    /// 2. Otherwise try User Config (~/.config/netspeed/config.toml)
    /// 3. Fallback to built-in defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let settings = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => {
                    tracing::debug!(path = %path.display(), "loading user config");
                    Self::from_file(&path)?
                }
                _ => Self::default(),
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(SpeedTestError::Config("iterations must be at least 1".into()));
        }
        if self.probe_attempts == 0 {
            return Err(SpeedTestError::Config(
                "probe_attempts must be at least 1".into(),
            ));
        }
        if self.probe_concurrency == 0 {
            return Err(SpeedTestError::Config(
                "probe_concurrency must be at least 1".into(),
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(SpeedTestError::Config(
                "read_buffer_size must be at least 1".into(),
            ));
        }
        if self.trial_duration.is_zero() {
            return Err(SpeedTestError::Config(
                "trial_duration_ms must be positive".into(),
            ));
        }
        // reqwest 的超时包含读取响应体, 必须长于下载测速的截止时间
        if self.request_timeout <= self.trial_duration {
            return Err(SpeedTestError::Config(format!(
                "request_timeout_ms ({}) must be greater than trial_duration_ms ({})",
                self.request_timeout.as_millis(),
                self.trial_duration.as_millis()
            )));
        }
        Ok(())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "netspeed").map(|dirs| dirs.config_dir().join("config.toml"))
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
