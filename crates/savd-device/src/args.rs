use std::fmt;
use std::path::PathBuf;

use anyhow::{Result, bail};

const USAGE: &str = "usage: savd-device --mode sava|anti-ddos-device -C/--config-file PATH [--flush-rules]";

/// Device role. `sava` captures and uploads observations in addition to
/// applying rules; `anti-ddos-device` only applies received rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Sava,
    AntiDdosDevice,
}

impl Mode {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "sava" => Ok(Mode::Sava),
            "anti-ddos-device" => Ok(Mode::AntiDdosDevice),
            other => bail!("unknown mode: {other} ({USAGE})"),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Mode::Sava => f.write_str("sava"),
            Mode::AntiDdosDevice => f.write_str("anti-ddos-device"),
        }
    }
}

#[derive(Debug)]
pub struct DeviceArgs {
    pub mode: Mode,
    pub config_path: PathBuf,
    /// Operator reset: clear both packet-filter chains before startup.
    pub flush_rules: bool,
}

impl DeviceArgs {
    pub fn parse<I>(mut args: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        let mut mode = None;
        let mut config_path = None;
        let mut flush_rules = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--flush-rules" => flush_rules = true,
                "--mode" => {
                    let value = args.next().unwrap_or_default();
                    if value.is_empty() {
                        bail!("missing value for --mode ({USAGE})");
                    }
                    mode = Some(Mode::parse(&value)?);
                }
                "-C" | "--config-file" => {
                    let value = args.next().unwrap_or_default();
                    if value.is_empty() {
                        bail!("missing value for --config-file ({USAGE})");
                    }
                    config_path = Some(PathBuf::from(value));
                }
                "-h" | "--help" => bail!("{USAGE}"),
                other => bail!("unknown argument: {other} ({USAGE})"),
            }
        }

        let Some(mode) = mode else {
            bail!("missing required argument --mode ({USAGE})");
        };
        let Some(config_path) = config_path else {
            bail!("missing required argument --config-file ({USAGE})");
        };

        Ok(Self { mode, config_path, flush_rules })
    }
}
