use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub controller: ControllerSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub rule: RuleSection,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub sava: SavaSection,
}

impl DeviceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).with_context(|| {
            format!("failed to read config file {}", path.display())
        })?;
        let mut config: Self =
            serde_yaml::from_slice(&raw).with_context(|| {
                format!("failed to parse YAML config {}", path.display())
            })?;
        config.normalize()?;
        Ok(config)
    }

    #[cfg(test)]
    pub(crate) fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(yaml)
            .context("failed to parse YAML config")?;
        config.normalize()?;
        Ok(config)
    }

    fn normalize(&mut self) -> Result<()> {
        self.controller.controller_ip =
            trim_owned(self.controller.controller_ip.clone());
        if self.controller.controller_ip.is_empty() {
            bail!("device config missing `controller.controller_ip`");
        }
        if self.controller.controller_port == 0 {
            bail!("device config `controller.controller_port` must be non-zero");
        }

        self.monitor.sniffer_file_name =
            trim_owned(self.monitor.sniffer_file_name.clone());
        if self.monitor.sniffer_file_name.is_empty() {
            self.monitor.sniffer_file_name = default_sniffer_file_name();
        }
        if self.monitor.sniffer_file_path.as_os_str().is_empty() {
            self.monitor.sniffer_file_path = default_sniffer_file_path();
        }
        self.monitor.sniffer_queue_size =
            self.monitor.sniffer_queue_size.max(1);
        self.monitor.sniffer_upload_interval =
            floor_secs(self.monitor.sniffer_upload_interval);

        self.connection.heartbeat_interval =
            floor_secs(self.connection.heartbeat_interval);
        self.connection.reconnect_interval =
            floor_secs(self.connection.reconnect_interval);

        if self.rule.cache_path.as_os_str().is_empty() {
            self.rule.cache_path = default_cache_path();
        }
        self.rule.cache_max_size = self.rule.cache_max_size.max(1);

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerSection {
    pub controller_ip: String,
    pub controller_port: u16,
}

impl ControllerSection {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.controller_ip, self.controller_port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorSection {
    #[serde(default = "default_sniffer_file_path")]
    pub sniffer_file_path: PathBuf,
    #[serde(default = "default_sniffer_file_name")]
    pub sniffer_file_name: String,
    #[serde(default = "default_sniffer_queue_size")]
    pub sniffer_queue_size: usize,
    #[serde(default)]
    pub sniffer_interface: String,
    #[serde(default)]
    pub sniffer_interface_config: u8,
    #[serde(
        default = "default_sniffer_upload_interval",
        deserialize_with = "savd_helpers::de::deserialize_duration"
    )]
    pub sniffer_upload_interval: Duration,
}

impl MonitorSection {
    /// None selects every interface, mirroring `sniffer_interface_config`.
    pub fn capture_interface(&self) -> Option<&str> {
        if self.sniffer_interface_config == 0
            && !self.sniffer_interface.trim().is_empty()
        {
            Some(self.sniffer_interface.trim())
        } else {
            None
        }
    }
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            sniffer_file_path: default_sniffer_file_path(),
            sniffer_file_name: default_sniffer_file_name(),
            sniffer_queue_size: default_sniffer_queue_size(),
            sniffer_interface: String::new(),
            sniffer_interface_config: 0,
            sniffer_upload_interval: default_sniffer_upload_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionSection {
    #[serde(
        default = "default_heartbeat_interval",
        deserialize_with = "savd_helpers::de::deserialize_duration"
    )]
    pub heartbeat_interval: Duration,
    #[serde(
        default = "default_reconnect_interval",
        deserialize_with = "savd_helpers::de::deserialize_duration"
    )]
    pub reconnect_interval: Duration,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            reconnect_interval: default_reconnect_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSection {
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
    #[serde(default = "default_cache_max_size")]
    pub cache_max_size: usize,
}

impl Default for RuleSection {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            cache_max_size: default_cache_max_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSection {
    #[serde(default)]
    pub log_path: String,
}

impl LogSection {
    pub fn path(&self) -> Option<PathBuf> {
        let trimmed = self.log_path.trim();
        if trimmed.is_empty() { None } else { Some(PathBuf::from(trimmed)) }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SavaSection {
    #[serde(default)]
    pub is_sava: bool,
}

fn floor_secs(value: Duration) -> Duration {
    value.max(Duration::from_secs(1))
}

fn default_sniffer_file_path() -> PathBuf {
    PathBuf::from("storage/sniffer")
}

fn default_sniffer_file_name() -> String {
    "sniffer.csv".to_string()
}

fn default_sniffer_queue_size() -> usize {
    100
}

fn default_sniffer_upload_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("storage/rules.cache")
}

fn default_cache_max_size() -> usize {
    1024
}

fn trim_owned(value: String) -> String {
    value.trim().to_string()
}
