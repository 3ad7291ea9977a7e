use anyhow::{Context, Result};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::app::AppState;

/// Rules per CONTROL envelope; the remainder is flushed as a final chunk.
pub const RULE_BATCH_SIZE: usize = 128;

/// Periodic rule distribution. Each tick runs blacklist maintenance
/// first, then broadcasts the surviving rows to every trusted client.
pub async fn run_rule_distributor(state: AppState) {
    let mut ticker = interval(state.config.ddos.rule_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("rule distributor stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(err) = distribute_once(&state).await {
                    warn!("rule distribution failed: error={err}");
                }
            }
        }
    }
}

/// One maintenance-and-broadcast pass.
pub async fn distribute_once(state: &AppState) -> Result<()> {
    state
        .store
        .blacklist_refresh_durations()
        .await
        .context("blacklist duration refresh failed")?;
    let pruned = state
        .store
        .blacklist_prune(state.config.ddos.blacklist_timeout)
        .await
        .context("blacklist prune failed")?;
    if pruned > 0 {
        info!("pruned expired blacklist rows: removed={pruned}");
    }

    let rules = state
        .store
        .fetch_rules(&state.config.ddos.rule_fields)
        .await
        .context("rule generation failed")?;
    if rules.is_empty() {
        debug!("blacklist empty, nothing to distribute");
        return Ok(());
    }

    for chunk in rules.chunks(RULE_BATCH_SIZE) {
        state.registry.send_control_message(chunk).await;
    }

    info!(
        "distributed filter rules: rules={}, clients={}",
        rules.len(),
        state.registry.len()
    );
    Ok(())
}
