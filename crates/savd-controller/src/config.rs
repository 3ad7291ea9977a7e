use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub sniffer: SnifferSection,
    #[serde(default)]
    pub ddos: DdosSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub log: LogSection,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = parse_config_path_arg(env::args().skip(1))?
            .or_else(resolve_controller_config_path)
            .context(
                "controller config path not found (SAVD_CONTROLLER_CONFIG or controller.yaml)",
            )?;

        Self::from_yaml(&config_path)
    }

    pub fn from_yaml(path: &Path) -> Result<Self> {
        let mut config = load_config_yaml(path)?;
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
            self.controller.controller_ip = default_controller_ip();
        }
        if self.controller.controller_port == 0 {
            bail!("controller config `controller.controller_port` must be non-zero");
        }

        self.sniffer.name = trim_owned(self.sniffer.name.clone());
        if self.sniffer.name.is_empty() {
            self.sniffer.name = default_sniffer_name();
        }
        self.sniffer.encoding = trim_owned(self.sniffer.encoding.clone());
        if self.sniffer.encoding.is_empty() {
            self.sniffer.encoding = default_encoding();
        }
        // spool files are read and written as utf-8; reject configs that
        // ask for anything else instead of silently mis-decoding
        let encoding = self.sniffer.encoding.to_ascii_lowercase();
        if !matches!(encoding.as_str(), "utf-8" | "utf8" | "utf-8-sig") {
            bail!(
                "controller config `sniffer.encoding` must be a utf-8 variant, got {}",
                self.sniffer.encoding
            );
        }
        self.sniffer.task_time = floor_secs(self.sniffer.task_time);

        self.ddos.threshold = self.ddos.threshold.max(1);
        self.ddos.rule_interval = floor_secs(self.ddos.rule_interval);
        self.ddos.blacklist_timeout = floor_secs(self.ddos.blacklist_timeout);
        self.ddos.rule_fields.retain(|field| !field.trim().is_empty());
        if self.ddos.rule_fields.is_empty() {
            self.ddos.rule_fields = default_rule_fields();
        }
        for field in &self.ddos.rule_fields {
            if !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                bail!("controller config `ddos.rule_fields` has invalid column name: {field}");
            }
        }

        if self.database.db_path.as_os_str().is_empty() {
            self.database.db_path = default_db_path();
        }

        Ok(())
    }
}

fn parse_config_path_arg<I>(mut args: I) -> Result<Option<PathBuf>>
where
    I: Iterator<Item = String>,
{
    let first = args.next();
    let second = args.next();

    if let Some(arg) = second {
        bail!("too many arguments: {arg} (usage: savd-controller [config-path])");
    }

    if matches!(first.as_deref(), Some("-h" | "--help")) {
        bail!("usage: savd-controller [config-path]");
    }

    Ok(first.map(PathBuf::from))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerSection {
    #[serde(default = "default_controller_ip")]
    pub controller_ip: String,
    #[serde(default = "default_controller_port")]
    pub controller_port: u16,
}

impl ControllerSection {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.controller_ip, self.controller_port)
    }
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            controller_ip: default_controller_ip(),
            controller_port: default_controller_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnifferSection {
    #[serde(default = "default_sniffer_name")]
    pub name: String,
    #[serde(default = "default_readinfo_path")]
    pub readinfo_path: PathBuf,
    #[serde(default = "default_writeinfo_path")]
    pub writeinfo_path: PathBuf,
    #[serde(
        default = "default_task_time",
        deserialize_with = "savd_helpers::de::deserialize_duration"
    )]
    pub task_time: Duration,
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

impl SnifferSection {
    /// Spool file name for one peer: the configured name's stem plus the
    /// peer's ip and port.
    pub fn peer_spool_name(
        &self,
        peer: &std::net::SocketAddr,
    ) -> String {
        let stem = self.name.strip_suffix(".csv").unwrap_or(&self.name);
        format!("{}-{}-{}.csv", stem, peer.ip(), peer.port())
    }
}

impl Default for SnifferSection {
    fn default() -> Self {
        Self {
            name: default_sniffer_name(),
            readinfo_path: default_readinfo_path(),
            writeinfo_path: default_writeinfo_path(),
            task_time: default_task_time(),
            encoding: default_encoding(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DdosSection {
    #[serde(default = "default_threshold")]
    pub threshold: u64,
    #[serde(
        default = "default_rule_interval",
        deserialize_with = "savd_helpers::de::deserialize_duration"
    )]
    pub rule_interval: Duration,
    #[serde(
        default = "default_blacklist_timeout",
        deserialize_with = "savd_helpers::de::deserialize_duration"
    )]
    pub blacklist_timeout: Duration,
    #[serde(default = "default_rule_fields")]
    pub rule_fields: Vec<String>,
}

impl Default for DdosSection {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            rule_interval: default_rule_interval(),
            blacklist_timeout: default_blacklist_timeout(),
            rule_fields: default_rule_fields(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self { db_path: default_db_path() }
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

fn load_config_yaml(path: &Path) -> Result<Config> {
    let raw = std::fs::read(path).with_context(|| {
        format!("failed to read config file {}", path.display())
    })?;
    serde_yaml::from_slice(&raw).with_context(|| {
        format!("failed to parse YAML config {}", path.display())
    })
}

fn resolve_controller_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("SAVD_CONTROLLER_CONFIG") {
        return Some(PathBuf::from(path));
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    for name in ["controller.yaml", "controller.yml"] {
        let candidate = cwd.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }

    None
}

fn floor_secs(value: Duration) -> Duration {
    value.max(Duration::from_secs(1))
}

fn default_controller_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_controller_port() -> u16 {
    13145
}

fn default_sniffer_name() -> String {
    "sniffer_data.csv".to_string()
}

fn default_readinfo_path() -> PathBuf {
    PathBuf::from("storage/sniffer/read")
}

fn default_writeinfo_path() -> PathBuf {
    PathBuf::from("storage/sniffer/write")
}

fn default_task_time() -> Duration {
    Duration::from_secs(30)
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_threshold() -> u64 {
    100
}

fn default_rule_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_blacklist_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_rule_fields() -> Vec<String> {
    vec!["ip".to_string()]
}

fn default_db_path() -> PathBuf {
    PathBuf::from("storage/savd.db")
}

fn trim_owned(value: String) -> String {
    value.trim().to_string()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}
