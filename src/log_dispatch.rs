use ethers::types::Log;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::log_filter::LogDelivery;
use crate::metrics;
use crate::orchestrator::Orchestrator;
use crate::quality::Verdict;

/// What [`Orchestrator::apply_verdict`] did with a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictOutcome {
    /// Slot unchanged, the checked watcher is still current.
    Applied,
    /// The rebuilt watcher took over the slot.
    Replaced,
    /// The slot moved on while the check ran; the verdict was dropped.
    Superseded,
}

impl Orchestrator {
    /// Entry point for everything the log filter delivers.
    pub fn handle_delivery(self: &Arc<Self>, delivery: LogDelivery) {
        match delivery {
            LogDelivery::Batch(logs) => self.process_batch(&logs),
            LogDelivery::Failed => {
                warn!(chain_id = self.chain_id, "⚠️ Log collecting failed. Pools refetching");
                metrics::increment_log_delivery_failures();
                self.refresh_all();
            }
        }
    }

    fn process_batch(self: &Arc<Self>, logs: &[Log]) {
        let names: Vec<String> = logs.iter().map(|l| self.process_log(l)).collect();
        metrics::record_log_batch(logs.len());

        let block = logs.last().and_then(|l| l.block_number);
        if let Some(block) = block {
            self.last_processed_block
                .store(block.as_u64() as i64, Ordering::SeqCst);
        }
        debug!(
            chain_id = self.chain_id,
            "Block {} {} logs: [{}], jobs: {}",
            block.map(|b| b.to_string()).unwrap_or_else(|| "<undefined>".to_string()),
            names.len(),
            names.join(","),
            self.pending.get()
        );
    }

    /// Routes one log. Never fails: problems are reported in the returned
    /// summary so the rest of the batch still gets processed.
    pub(crate) fn process_log(self: &Arc<Self>, log: &Log) -> String {
        let slot = self
            .registry
            .get(&log.address)
            .map(|slot| (slot.watcher.clone(), slot.generation));

        let Some((watcher, generation)) = slot else {
            if !self.discovering.contains_key(&log.address) {
                let this = self.clone();
                let address = log.address;
                tokio::spawn(async move {
                    this.add_pool_by_address(address).await;
                });
            }
            return "UnknPool".to_string();
        };

        self.quality.process_log(log, generation, watcher.clone());
        match catch_unwind(AssertUnwindSafe(|| watcher.process_log(log))) {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                metrics::increment_log_exceptions();
                warn!(
                    chain_id = self.chain_id,
                    "⚠️ Log processing for pool {:?} failed: {}",
                    log.address,
                    e
                );
                "Exception".to_string()
            }
            Err(_) => {
                metrics::increment_log_exceptions();
                warn!(
                    chain_id = self.chain_id,
                    "⚠️ Log processing for pool {:?} panicked",
                    log.address
                );
                "Exception".to_string()
            }
        }
    }

    /// Requests a full state refresh of every registered watcher.
    pub fn refresh_all(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.watchers()
            .into_iter()
            .map(|watcher| {
                let guard = self.pending.begin();
                let chain_id = self.chain_id;
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) = watcher.update_pool_state().await {
                        warn!(chain_id, pool = ?watcher.address(), "⚠️ Refresh failed: {}", e);
                    }
                })
            })
            .collect()
    }

    /// Applies a reconciliation verdict unless the slot has moved on since the
    /// check started.
    pub fn apply_verdict(&self, verdict: Verdict) -> VerdictOutcome {
        metrics::increment_quality_verdict(verdict.status.as_str());

        let outcome = match self.registry.get_mut(&verdict.address) {
            Some(slot) if slot.generation != verdict.generation => VerdictOutcome::Superseded,
            None => VerdictOutcome::Superseded,
            Some(mut slot) => match &verdict.replacement {
                Some(replacement) => {
                    slot.watcher = replacement.clone();
                    slot.generation += 1;
                    VerdictOutcome::Replaced
                }
                None => VerdictOutcome::Applied,
            },
        };

        if outcome == VerdictOutcome::Superseded {
            metrics::increment_quality_races();
            info!(
                chain_id = self.chain_id,
                "Pool {:?} quality check: {} dropped, pool was replaced during checking",
                verdict.address,
                verdict.status
            );
            return outcome;
        }

        let line = format!(
            "Pool {:?} quality check: {} {}({}/{})",
            verdict.address,
            verdict.status,
            if outcome == VerdictOutcome::Replaced {
                "pool was updated "
            } else {
                ""
            },
            self.quality.total_matches(),
            self.quality.total_checks()
        );
        if verdict.status.is_divergent() {
            warn!(chain_id = self.chain_id, "⚠️ {}", line);
        } else {
            info!(chain_id = self.chain_id, "{}", line);
        }
        outcome
    }
}
