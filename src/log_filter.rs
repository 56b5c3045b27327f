//! Event log delivery.
//!
//! A [`LogFilter`] hands ordered per-block batches of logs to every registered
//! sink, or a [`LogDelivery::Failed`] signal when it could not collect them.
//! After a failure the filter resumes from the current head; the consumer is
//! expected to heal the gap with direct state reads.

use ethers::prelude::{Filter, Log, Middleware, ValueOrArray, H256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub enum LogDelivery {
    /// All matching logs of one block, in log-index order.
    Batch(Vec<Log>),
    Failed,
}

pub trait LogFilter: Send + Sync {
    /// Registers `sink` for logs whose topic0 is one of `topics`.
    fn add_filter(&self, topics: Vec<H256>, sink: mpsc::UnboundedSender<LogDelivery>);
}

struct Subscription {
    topics: Vec<H256>,
    sink: mpsc::UnboundedSender<LogDelivery>,
}

/// Polls `eth_blockNumber` and fetches logs of every new block range with
/// `eth_getLogs`.
pub struct PollingLogFilter<M: Middleware> {
    provider: Arc<M>,
    poll_interval: Duration,
    max_block_range: u64,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl<M: Middleware + 'static> PollingLogFilter<M> {
    pub fn new(provider: Arc<M>, poll_interval: Duration, max_block_range: u64) -> Self {
        Self {
            provider,
            poll_interval,
            max_block_range: max_block_range.max(1),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Starts polling from the current head.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_block: Option<u64> = None;

        loop {
            interval.tick().await;
            let head = match self.provider.get_block_number().await {
                Ok(n) => n.as_u64(),
                Err(e) => {
                    warn!("⚠️ Failed to fetch head block: {}", e);
                    continue;
                }
            };

            let from = match last_block {
                None => {
                    last_block = Some(head);
                    continue;
                }
                Some(last) if head <= last => continue,
                Some(last) => last + 1,
            };

            if head - from + 1 > self.max_block_range {
                warn!(
                    "⚠️ {} blocks behind head (max range {}), skipping to {}",
                    head - from + 1,
                    self.max_block_range,
                    head
                );
                self.broadcast_failure();
            } else {
                self.deliver_range(from, head).await;
            }
            last_block = Some(head);
        }
    }

    async fn deliver_range(&self, from: u64, to: u64) {
        let subscriptions: Vec<(Vec<H256>, mpsc::UnboundedSender<LogDelivery>)> = match self.subscriptions.lock() {
            Ok(subs) => subs.iter().map(|s| (s.topics.clone(), s.sink.clone())).collect(),
            Err(_) => return,
        };

        for (topics, sink) in subscriptions {
            let filter = Filter::new()
                .from_block(from)
                .to_block(to)
                .topic0(ValueOrArray::Array(topics.into_iter().map(Some).collect()));

            match self.provider.get_logs(&filter).await {
                Ok(logs) => {
                    debug!("Blocks {}..={}: {} logs", from, to, logs.len());
                    for batch in group_by_block(logs) {
                        let _ = sink.send(LogDelivery::Batch(batch));
                    }
                }
                Err(e) => {
                    warn!("⚠️ eth_getLogs {}..={} failed: {}", from, to, e);
                    let _ = sink.send(LogDelivery::Failed);
                }
            }
        }
    }

    fn broadcast_failure(&self) {
        if let Ok(subs) = self.subscriptions.lock() {
            for sub in subs.iter() {
                let _ = sub.sink.send(LogDelivery::Failed);
            }
        }
    }
}

impl<M: Middleware + 'static> LogFilter for PollingLogFilter<M> {
    fn add_filter(&self, topics: Vec<H256>, sink: mpsc::UnboundedSender<LogDelivery>) {
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.push(Subscription { topics, sink });
        }
    }
}

/// Splits logs into per-block batches, ascending by block then log index.
/// Pending logs without a block number are dropped.
pub fn group_by_block(logs: Vec<Log>) -> Vec<Vec<Log>> {
    let mut blocks: BTreeMap<u64, Vec<Log>> = BTreeMap::new();
    for log in logs {
        if let Some(n) = log.block_number {
            blocks.entry(n.as_u64()).or_default().push(log);
        }
    }
    blocks
        .into_values()
        .map(|mut batch| {
            batch.sort_by_key(|l| l.log_index.unwrap_or_default());
            batch
        })
        .collect()
}
