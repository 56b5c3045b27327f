//! # Quality reconciliation
//!
//! Log-driven pool state is cheap but can drift: a missed log, a reorg or a
//! decoding bug all leave a watcher silently wrong. The [`QualityChecker`]
//! periodically re-derives a pool's state from direct contract reads (through a
//! [`StateProbe`]) and reports a [`Verdict`] to the extractor, which decides
//! whether the rebuilt watcher may replace the one in the registry.
//!
//! Checks are opportunistic: they are triggered by incoming logs, bounded by a
//! semaphore, limited to one in flight per pool, and spaced by a minimum
//! interval per pool.

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, Log};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

use crate::watcher::PoolWatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolSyncState {
    Match,
    /// Reserves differ but ticks agree; expected briefly after a swap.
    ReservesMismatch,
    TicksMismatch,
    Mismatch,
    CheckFailed,
}

impl PoolSyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolSyncState::Match => "match",
            PoolSyncState::ReservesMismatch => "reserves_mismatch",
            PoolSyncState::TicksMismatch => "ticks_mismatch",
            PoolSyncState::Mismatch => "mismatch",
            PoolSyncState::CheckFailed => "check_failed",
        }
    }

    /// Divergence beyond the benign window between a log and the next read.
    pub fn is_divergent(&self) -> bool {
        !matches!(self, PoolSyncState::Match | PoolSyncState::ReservesMismatch)
    }
}

impl fmt::Display for PoolSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ProbeOutcome {
    pub status: PoolSyncState,
    /// Freshly built watcher, present when the checked one is stale.
    pub replacement: Option<Arc<dyn PoolWatcher>>,
}

/// Authoritative re-read of one pool, compared with its watcher.
#[async_trait]
pub trait StateProbe: Send + Sync {
    async fn check(&self, watcher: Arc<dyn PoolWatcher>) -> anyhow::Result<ProbeOutcome>;
}

/// Result of one check, tagged with the registry generation it was run against.
pub struct Verdict {
    pub address: Address,
    pub generation: u64,
    pub reference: Arc<dyn PoolWatcher>,
    pub status: PoolSyncState,
    pub replacement: Option<Arc<dyn PoolWatcher>>,
}

impl fmt::Debug for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verdict")
            .field("address", &self.address)
            .field("generation", &self.generation)
            .field("status", &self.status)
            .field("replacement", &self.replacement.is_some())
            .finish()
    }
}

pub struct QualityChecker {
    probe: Arc<dyn StateProbe>,
    permits: Arc<Semaphore>,
    min_interval: Duration,
    last_checked: DashMap<Address, Instant>,
    in_flight: DashMap<Address, u64>,
    total_checks: AtomicU64,
    total_matches: AtomicU64,
    verdicts: mpsc::UnboundedSender<Verdict>,
}

impl QualityChecker {
    pub fn new(
        probe: Arc<dyn StateProbe>,
        max_concurrent: usize,
        min_interval: Duration,
        verdicts: mpsc::UnboundedSender<Verdict>,
    ) -> Arc<Self> {
        Arc::new(Self {
            probe,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            min_interval,
            last_checked: DashMap::new(),
            in_flight: DashMap::new(),
            total_checks: AtomicU64::new(0),
            total_matches: AtomicU64::new(0),
            verdicts,
        })
    }

    /// Schedules a check of `watcher` if the pool is due for one.
    /// Returns whether a check was scheduled.
    pub fn process_log(self: &Arc<Self>, log: &Log, generation: u64, watcher: Arc<dyn PoolWatcher>) -> bool {
        let address = log.address;
        if let Some(at) = self.last_checked.get(&address) {
            if at.elapsed() < self.min_interval {
                return false;
            }
        }
        // entry() holds the shard lock, so only one caller wins the slot
        match self.in_flight.entry(address) {
            dashmap::mapref::entry::Entry::Occupied(_) => return false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(generation);
            }
        }

        let checker = self.clone();
        tokio::spawn(async move {
            checker.run_check(address, generation, watcher).await;
        });
        true
    }

    async fn run_check(&self, address: Address, generation: u64, watcher: Arc<dyn PoolWatcher>) {
        let outcome = match self.permits.clone().acquire_owned().await {
            Ok(_permit) => self.probe.check(watcher.clone()).await,
            Err(_) => Err(anyhow::anyhow!("quality checker closed")),
        };
        let (status, replacement) = match outcome {
            Ok(o) => (o.status, o.replacement),
            Err(e) => {
                debug!(pool = ?address, error = %e, "quality probe failed");
                (PoolSyncState::CheckFailed, None)
            }
        };

        self.total_checks.fetch_add(1, Ordering::Relaxed);
        if status == PoolSyncState::Match {
            self.total_matches.fetch_add(1, Ordering::Relaxed);
        }
        self.last_checked.insert(address, Instant::now());
        self.in_flight.remove(&address);

        let _ = self.verdicts.send(Verdict {
            address,
            generation,
            reference: watcher,
            status,
            replacement,
        });
    }

    pub fn total_checks(&self) -> u64 {
        self.total_checks.load(Ordering::Relaxed)
    }

    pub fn total_matches(&self) -> u64 {
        self.total_matches.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
