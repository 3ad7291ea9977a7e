use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::filter::{FilterRules, FilterTable};

/// On-disk cache of the drop rules this device has applied, one source IP
/// per line, newest last, bounded by `max_size`. Lets a restarted device
/// restore its drop set before the next broadcast arrives.
pub struct RuleCache {
    path: PathBuf,
    max_size: usize,
}

impl RuleCache {
    pub fn new(
        path: PathBuf,
        max_size: usize,
    ) -> Self {
        Self { path, max_size: max_size.max(1) }
    }

    pub async fn load(&self) -> Result<Vec<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(Vec::new())
            }
            Err(err) => Err(err).with_context(|| {
                format!("failed to read rule cache {}", self.path.display())
            }),
        }
    }

    /// Merges `incoming` into the cache: repeated rules move to the tail
    /// (newest position), then the oldest entries are trimmed away. The
    /// file is replaced atomically.
    pub async fn store(
        &self,
        incoming: &[String],
    ) -> Result<()> {
        let mut entries = self.load().await?;

        let incoming_set: HashSet<&str> =
            incoming.iter().map(String::as_str).collect();
        entries.retain(|entry| !incoming_set.contains(entry.as_str()));

        let mut appended = HashSet::new();
        for rule in incoming {
            let rule = rule.trim();
            if rule.is_empty() || !appended.insert(rule.to_string()) {
                continue;
            }
            entries.push(rule.to_string());
        }

        if entries.len() > self.max_size {
            entries.drain(..entries.len() - self.max_size);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("failed to create cache dir {}", parent.display())
                })?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        let mut contents = entries.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        tokio::fs::write(&tmp_path, contents).await.with_context(|| {
            format!("failed to write rule cache {}", tmp_path.display())
        })?;
        tokio::fs::rename(&tmp_path, &self.path).await.with_context(|| {
            format!(
                "failed to replace rule cache: {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;

        Ok(())
    }
}

/// Consumes rule lists handed over by dispatch, applies them to the
/// packet filter, and records them in the cache. Cache failures are
/// logged and never block rule application.
pub async fn run_rule_applier<T: FilterTable>(
    mut rules_rx: mpsc::Receiver<Vec<String>>,
    mut filter: FilterRules<T>,
    cache: RuleCache,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("rule applier stopping");
                break;
            }
            maybe_rules = rules_rx.recv() => {
                let Some(rules) = maybe_rules else {
                    info!("rule applier stopping: dispatch channel closed");
                    break;
                };

                filter.apply_rules(&rules).await;
                if let Err(err) = cache.store(&rules).await {
                    warn!("failed to update rule cache: error={err}");
                }
            }
        }
    }
}

/// Restores the cached drop set at startup.
pub async fn reapply_cached_rules<T: FilterTable>(
    filter: &mut FilterRules<T>,
    cache: &RuleCache,
) {
    match cache.load().await {
        Ok(rules) if rules.is_empty() => debug!("rule cache empty"),
        Ok(rules) => {
            info!("re-applying cached rules: rules={}", rules.len());
            filter.apply_rules(&rules).await;
        }
        Err(err) => warn!("failed to load rule cache: error={err}"),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::sync::mpsc;
    use tokio::time::{Duration, timeout};
    use tokio_util::sync::CancellationToken;

    use super::{RuleCache, reapply_cached_rules, run_rule_applier};
    use crate::core::filter::FilterRules;
    use crate::core::filter::testing::FakeTable;

    fn scratch_cache(max_size: usize) -> (RuleCache, PathBuf) {
        let root = std::env::temp_dir()
            .join(format!("savd-rules-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&root).expect("dir");
        (RuleCache::new(root.join("rules.cache"), max_size), root)
    }

    fn rules(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[tokio::test]
    async fn store_and_load_round_trip() {
        let (cache, root) = scratch_cache(16);

        cache.store(&rules(&["10.0.0.9", "10.0.0.10"])).await.expect("store");
        assert_eq!(
            cache.load().await.expect("load"),
            rules(&["10.0.0.9", "10.0.0.10"])
        );

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn repeated_rules_move_to_the_tail_without_duplicates() {
        let (cache, root) = scratch_cache(16);

        cache.store(&rules(&["10.0.0.9", "10.0.0.10"])).await.expect("store");
        cache.store(&rules(&["10.0.0.9"])).await.expect("store");

        assert_eq!(
            cache.load().await.expect("load"),
            rules(&["10.0.0.10", "10.0.0.9"])
        );

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn cache_is_trimmed_to_the_newest_entries() {
        let (cache, root) = scratch_cache(2);

        cache
            .store(&rules(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]))
            .await
            .expect("store");

        assert_eq!(
            cache.load().await.expect("load"),
            rules(&["10.0.0.2", "10.0.0.3"])
        );

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn missing_cache_file_loads_empty() {
        let (cache, root) = scratch_cache(4);
        assert!(cache.load().await.expect("load").is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn applier_records_received_rules_in_the_cache() {
        let (cache, root) = scratch_cache(16);
        let cache_path = root.join("rules.cache");

        let (tx, rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let applier = tokio::spawn(run_rule_applier(
            rx,
            FilterRules::new(FakeTable::default()),
            cache,
            shutdown,
        ));

        tx.send(rules(&["10.0.0.9"])).await.expect("send");
        drop(tx);
        timeout(Duration::from_secs(5), applier)
            .await
            .expect("applier exits")
            .expect("join");

        let cached = tokio::fs::read_to_string(&cache_path)
            .await
            .expect("cache file");
        assert_eq!(cached, "10.0.0.9\n");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn cached_rules_are_reapplied_at_startup() {
        let (cache, root) = scratch_cache(16);
        cache.store(&rules(&["10.0.0.9", "10.0.0.10"])).await.expect("store");

        let mut filter = FilterRules::new(FakeTable::default());
        reapply_cached_rules(&mut filter, &cache).await;

        assert_eq!(filter.table().forward, rules(&["10.0.0.9", "10.0.0.10"]));
        assert_eq!(filter.table().input, rules(&["10.0.0.9", "10.0.0.10"]));

        let _ = std::fs::remove_dir_all(&root);
    }
}
