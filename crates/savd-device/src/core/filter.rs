use std::collections::HashSet;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Input,
    Forward,
}

impl Chain {
    pub fn name(self) -> &'static str {
        match self {
            Chain::Input => "INPUT",
            Chain::Forward => "FORWARD",
        }
    }
}

/// Narrow seam over the host packet filter chains.
pub trait FilterTable {
    /// Source addresses currently matched by FORWARD-chain rules.
    async fn forward_sources(&mut self) -> Result<Vec<String>>;
    async fn append_drop(
        &mut self,
        chain: Chain,
        src_ip: &str,
    ) -> Result<()>;
    async fn flush_chain(
        &mut self,
        chain: Chain,
    ) -> Result<()>;
}

/// iptables-backed implementation, driven through the CLI.
pub struct IptablesTable {
    command: String,
}

impl Default for IptablesTable {
    fn default() -> Self {
        Self { command: "iptables".to_string() }
    }
}

impl IptablesTable {
    async fn run(
        &self,
        args: &[&str],
    ) -> Result<String> {
        let output = Command::new(&self.command)
            .args(args)
            .output()
            .await
            .with_context(|| {
                format!("failed to run {} {}", self.command, args.join(" "))
            })?;

        if !output.status.success() {
            bail!(
                "{} {} failed: {}",
                self.command,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl FilterTable for IptablesTable {
    async fn forward_sources(&mut self) -> Result<Vec<String>> {
        let listing = self.run(&["-S", Chain::Forward.name()]).await?;
        Ok(parse_rule_sources(&listing))
    }

    async fn append_drop(
        &mut self,
        chain: Chain,
        src_ip: &str,
    ) -> Result<()> {
        self.run(&["-A", chain.name(), "-s", src_ip, "-j", "DROP"]).await?;
        Ok(())
    }

    async fn flush_chain(
        &mut self,
        chain: Chain,
    ) -> Result<()> {
        self.run(&["-F", chain.name()]).await?;
        Ok(())
    }
}

/// Pulls the `-s` operand out of each `iptables -S` rule line, with the
/// /32 suffix iptables adds to host addresses stripped.
fn parse_rule_sources(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            while let Some(token) = tokens.next() {
                if token == "-s" {
                    return tokens
                        .next()
                        .map(|cidr| cidr.trim_end_matches("/32").to_string());
                }
            }
            None
        })
        .collect()
}

/// Rule application over any filter table. Rules are source IPs to drop;
/// installation is idempotent against the FORWARD chain, and a per-rule
/// failure never aborts the rest of the batch.
pub struct FilterRules<T> {
    table: T,
}

impl<T: FilterTable> FilterRules<T> {
    pub fn new(table: T) -> Self {
        Self { table }
    }

    #[cfg(test)]
    pub(crate) fn table(&self) -> &T {
        &self.table
    }

    pub async fn apply_rules(
        &mut self,
        rules: &[String],
    ) {
        if rules.is_empty() {
            return;
        }

        let mut installed: HashSet<String> =
            match self.table.forward_sources().await {
                Ok(sources) => sources.into_iter().collect(),
                Err(err) => {
                    error!(
                        "failed to list installed rules, skipping batch: error={err}"
                    );
                    return;
                }
            };

        for rule in rules {
            let src_ip = rule.trim();
            if src_ip.is_empty() {
                continue;
            }
            if installed.contains(src_ip) {
                debug!("drop rule already installed: src={src_ip}");
                continue;
            }

            let mut applied = true;
            for chain in [Chain::Input, Chain::Forward] {
                if let Err(err) = self.table.append_drop(chain, src_ip).await {
                    error!(
                        "failed to install drop rule: chain={}, src={}, error={}",
                        chain.name(),
                        src_ip,
                        err
                    );
                    applied = false;
                }
            }
            if applied {
                info!("drop rule installed: src={src_ip}");
            }
            installed.insert(src_ip.to_string());
        }
    }

    /// Removes every rule from both chains.
    pub async fn flush(&mut self) {
        for chain in [Chain::Input, Chain::Forward] {
            match self.table.flush_chain(chain).await {
                Ok(()) => info!("chain flushed: chain={}", chain.name()),
                Err(err) => error!(
                    "failed to flush chain: chain={}, error={}",
                    chain.name(),
                    err
                ),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use anyhow::{Result, bail};

    use super::{Chain, FilterTable};

    /// In-memory stand-in for the host firewall, recording every append.
    #[derive(Default)]
    pub struct FakeTable {
        pub input: Vec<String>,
        pub forward: Vec<String>,
        pub failing_sources: Vec<String>,
    }

    impl FilterTable for FakeTable {
        async fn forward_sources(&mut self) -> Result<Vec<String>> {
            Ok(self.forward.clone())
        }

        async fn append_drop(
            &mut self,
            chain: Chain,
            src_ip: &str,
        ) -> Result<()> {
            if self.failing_sources.iter().any(|bad| bad == src_ip) {
                bail!("RTNETLINK answers: operation not permitted");
            }
            match chain {
                Chain::Input => self.input.push(src_ip.to_string()),
                Chain::Forward => self.forward.push(src_ip.to_string()),
            }
            Ok(())
        }

        async fn flush_chain(
            &mut self,
            chain: Chain,
        ) -> Result<()> {
            match chain {
                Chain::Input => self.input.clear(),
                Chain::Forward => self.forward.clear(),
            }
            Ok(())
        }
    }
}
