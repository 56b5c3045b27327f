//! # Extractor Orchestrator
//!
//! The `Orchestrator` keeps an off-chain mirror of every genuine
//! concentrated-liquidity pool deployed by a whitelisted set of factories.
//!
//! ## Overview
//!
//! The orchestrator:
//! - Owns the pool registry (one watcher per verified pool address)
//! - Owns the negative registries (confirmed absent, foreign, cooling down)
//! - Replays the persisted pool store at startup without blocking log processing
//! - Verifies every candidate pool against its CREATE2 address before registering it
//! - Dispatches log batches to watchers and to the quality checker
//! - Answers token-pair discovery queries
//!
//! ## Lifecycle
//!
//! `start()` switches log processing on immediately; readiness
//! ([`Orchestrator::is_started`] / [`Orchestrator::ready`]) follows once the
//! initial refresh of every cached pool has settled. Registering pools before
//! `start()` fails with [`ExtractorError::LogsNotStarted`].
//!
//! ## Usage
//!
//! ```ignore
//! let settings = Settings::new()?;
//! let (orchestrator, log_filter) =
//!     Orchestrator::from_settings(&settings, watcher_factory, state_probe)?;
//! log_filter.spawn();
//! orchestrator.start().await?;
//! orchestrator.ready().await;
//! let lookup = orchestrator.get_watchers_for_tokens(&[usdc, weth]);
//! let watchers = lookup.all().await;
//! ```

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::prelude::{Address, Http, Provider};
use futures::future::join_all;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::contracts::uni_v3_event_topics;
use crate::discovery::pending::PendingOps;
use crate::error::{ExtractorError, SettingsError};
use crate::factory::{FactoryRegistry, FactoryV3};
use crate::log_filter::{LogDelivery, LogFilter, PollingLogFilter};
use crate::metrics;
use crate::multicall::{BatchCaller, MultiCallAggregator, Multicall};
use crate::permanent_cache::{PermanentCache, PoolStore};
use crate::pool_address::{sort_tokens, AddressDeriver};
use crate::pool_blacklist::{NegativeReason, NegativeRegistry, NegativeStats, Verification};
use crate::pools::{DiscoverySource, PoolCode, PoolInfo, RegisteredPool};
use crate::quality::{QualityChecker, StateProbe, Verdict};
use crate::settings::Settings;
use crate::token_manager::{TokenManager, TokenResolver};
use crate::types::conversions::string_to_address;
use crate::watcher::{PoolWatcher, WatcherFactory, WatcherParams};

/// Tunables that are not collaborators.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub tick_helper: Address,
    pub quality_check_concurrency: usize,
    pub quality_check_interval: Duration,
    pub transient_retry: Duration,
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        Ok(Self {
            tick_helper: string_to_address(&settings.extractor.tick_helper)?,
            quality_check_concurrency: settings.extractor.quality_check_concurrency,
            quality_check_interval: settings.extractor.quality_check_interval(),
            transient_retry: settings.extractor.transient_retry(),
        })
    }
}

/// External services the orchestrator consumes.
pub struct Collaborators {
    pub client: Arc<dyn BatchCaller>,
    pub tokens: Arc<dyn TokenResolver>,
    pub store: Arc<dyn PoolStore>,
    pub watchers: Arc<dyn WatcherFactory>,
    pub probe: Arc<dyn StateProbe>,
}

pub struct Orchestrator {
    pub(crate) chain_id: u64,
    pub(crate) factories: FactoryRegistry,
    pub(crate) tick_helper: Address,
    pub(crate) client: Arc<dyn BatchCaller>,
    pub(crate) tokens: Arc<dyn TokenResolver>,
    store: Arc<dyn PoolStore>,
    watcher_factory: Arc<dyn WatcherFactory>,
    pub(crate) quality: Arc<QualityChecker>,
    /// Keyed by `Address`, whose equality is on bytes: log-sourced lowercase
    /// and checksummed API addresses land on the same slot.
    pub(crate) registry: DashMap<Address, RegisteredPool>,
    pub(crate) negatives: NegativeRegistry,
    deriver: AddressDeriver,
    pub(crate) pending: Arc<PendingOps>,
    /// Unknown addresses with a discovery in flight.
    pub(crate) discovering: DashMap<Address, ()>,
    logs_started: AtomicBool,
    ready: watch::Sender<bool>,
    watched_pools: AtomicUsize,
    pub(crate) last_processed_block: AtomicI64,
    deliveries: Mutex<Option<mpsc::UnboundedReceiver<LogDelivery>>>,
    verdicts: Mutex<Option<mpsc::UnboundedReceiver<Verdict>>>,
}

impl Orchestrator {
    /// Registers the log handler with `log_filter`. Deliveries queue up until
    /// [`Orchestrator::start`].
    pub fn new(
        factories: Vec<FactoryV3>,
        config: OrchestratorConfig,
        collaborators: Collaborators,
        log_filter: &dyn LogFilter,
    ) -> Arc<Self> {
        let (verdict_tx, verdict_rx) = mpsc::unbounded_channel();
        let quality = QualityChecker::new(
            collaborators.probe,
            config.quality_check_concurrency,
            config.quality_check_interval,
            verdict_tx,
        );

        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        log_filter.add_filter(uni_v3_event_topics(), delivery_tx);

        let (ready, _) = watch::channel(false);

        Arc::new(Self {
            chain_id: collaborators.client.chain_id(),
            factories: FactoryRegistry::new(factories),
            tick_helper: config.tick_helper,
            client: collaborators.client,
            tokens: collaborators.tokens,
            store: collaborators.store,
            watcher_factory: collaborators.watchers,
            quality,
            registry: DashMap::new(),
            negatives: NegativeRegistry::new(config.transient_retry),
            deriver: AddressDeriver::new(),
            pending: PendingOps::new(),
            discovering: DashMap::new(),
            logs_started: AtomicBool::new(false),
            ready,
            watched_pools: AtomicUsize::new(0),
            last_processed_block: AtomicI64::new(-1),
            deliveries: Mutex::new(Some(delivery_rx)),
            verdicts: Mutex::new(Some(verdict_rx)),
        })
    }

    /// Wires the production collaborators from settings. The returned log
    /// filter still has to be spawned.
    pub fn from_settings(
        settings: &Settings,
        watchers: Arc<dyn WatcherFactory>,
        probe: Arc<dyn StateProbe>,
    ) -> anyhow::Result<(Arc<Self>, Arc<PollingLogFilter<Provider<Http>>>)> {
        let provider = Arc::new(Provider::<Http>::try_from(settings.chain.rpc_url.as_str())?);
        let multicall = Multicall::new(
            provider.clone(),
            string_to_address(&settings.extractor.multicall_address)?,
            settings.extractor.multicall_batch_size,
        )
        .with_timeout(settings.extractor.multicall_timeout_seconds);
        let client: Arc<dyn BatchCaller> = Arc::new(MultiCallAggregator::new(
            multicall,
            settings.chain.chain_id,
            settings.extractor.multicall_window(),
        ));

        let cache_dir = settings.extractor.cache_dir.as_str();
        let tokens = Arc::new(TokenManager::with_cache_dir(client.clone(), cache_dir));
        let store = Arc::new(PermanentCache::new(
            cache_dir,
            &format!("uniV3Pools-{}", settings.chain.chain_id),
        ));
        let log_filter = Arc::new(PollingLogFilter::new(
            provider,
            settings.extractor.log_poll_interval(),
            settings.extractor.log_max_block_range,
        ));

        let orchestrator = Self::new(
            settings.factories()?,
            OrchestratorConfig::from_settings(settings)?,
            Collaborators {
                client,
                tokens,
                store,
                watchers,
                probe,
            },
            log_filter.as_ref(),
        );
        Ok((orchestrator, log_filter))
    }

    /// Switches log processing on and replays the persisted pools.
    ///
    /// Idempotent: only the first call does anything. Returns once every cached
    /// pool is registered; readiness is signalled later, when their first
    /// refreshes have settled.
    pub async fn start(self: &Arc<Self>) -> Result<(), ExtractorError> {
        if self
            .logs_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let started_at = Instant::now();
        self.spawn_loops();

        if self.tokens.known_tokens() == 0 {
            if let Err(e) = self.tokens.add_cached_tokens().await {
                warn!(chain_id = self.chain_id, "⚠️ Token cache replay failed: {}", e);
            }
        }

        let records = match self.store.get_all_records().await {
            Ok(records) => records,
            Err(e) => {
                self.mark_ready(started_at);
                return Err(ExtractorError::Store(e));
            }
        };

        // keyed by address so repeated records collapse into one
        let mut cached: IndexMap<Address, PoolInfo> = IndexMap::new();
        for r in records {
            let (Some(address), Some(fee)) = (r.address, r.fee) else {
                continue;
            };
            let (Some(token0), Some(token1), Some(factory)) = (
                self.tokens.get_known_token(&r.token0),
                self.tokens.get_known_token(&r.token1),
                self.factories.get(&r.factory),
            ) else {
                continue;
            };
            cached.insert(
                address,
                PoolInfo {
                    address,
                    token0,
                    token1,
                    fee,
                    factory: factory.clone(),
                },
            );
        }
        info!(chain_id = self.chain_id, "{} pools were taken from cache", cached.len());

        let mut refreshes = Vec::with_capacity(cached.len());
        for pool in cached.into_values() {
            let address = pool.address;
            match self.register(pool, DiscoverySource::Cache, false).await {
                Ok((_, Some(refresh))) => refreshes.push(refresh),
                Ok((outcome, None)) => {
                    debug!(chain_id = self.chain_id, pool = ?address, "cached pool skipped: {:?}", outcome)
                }
                Err(e) => warn!(chain_id = self.chain_id, pool = ?address, "⚠️ {}", e),
            }
        }
        info!(
            chain_id = self.chain_id,
            "ExtractorV3 is started with {} factories ({}ms)",
            self.factories.len(),
            started_at.elapsed().as_millis()
        );

        let this = self.clone();
        tokio::spawn(async move {
            // failed refreshes count as settled
            join_all(refreshes).await;
            this.mark_ready(started_at);
        });
        Ok(())
    }

    fn mark_ready(&self, started_at: Instant) {
        self.ready.send_replace(true);
        info!(
            chain_id = self.chain_id,
            "ExtractorV3 is ready ({}ms)",
            started_at.elapsed().as_millis()
        );
    }

    fn spawn_loops(self: &Arc<Self>) {
        let deliveries = self.deliveries.lock().ok().and_then(|mut rx| rx.take());
        if let Some(mut rx) = deliveries {
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                while let Some(delivery) = rx.recv().await {
                    let Some(this) = weak.upgrade() else { break };
                    this.handle_delivery(delivery);
                }
            });
        }

        let verdicts = self.verdicts.lock().ok().and_then(|mut rx| rx.take());
        if let Some(mut rx) = verdicts {
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                while let Some(verdict) = rx.recv().await {
                    let Some(this) = weak.upgrade() else { break };
                    this.apply_verdict(verdict);
                }
            });
        }
    }

    /// Verifies `pool` and starts watching it.
    ///
    /// Returns the existing watcher if the address is already registered and
    /// `None` if the pool is (or turns out to be) foreign, counterfeit or on an
    /// unsupported fee tier.
    pub async fn add_pool_watching(
        self: &Arc<Self>,
        pool: PoolInfo,
        source: DiscoverySource,
        persist: bool,
    ) -> Result<Option<Arc<dyn PoolWatcher>>, ExtractorError> {
        let (outcome, _) = self.register(pool, source, persist).await?;
        Ok(outcome.watcher())
    }

    /// Registration core. The join handle is the first state refresh of a
    /// newly created watcher; `None` means nothing was created.
    pub(crate) async fn register(
        self: &Arc<Self>,
        pool: PoolInfo,
        source: DiscoverySource,
        persist: bool,
    ) -> Result<(Verification<Arc<dyn PoolWatcher>>, Option<JoinHandle<()>>), ExtractorError> {
        if !self.logs_started.load(Ordering::SeqCst) {
            return Err(ExtractorError::LogsNotStarted);
        }
        let address = pool.address;
        if let Some(existing) = self.registry.get(&address) {
            return Ok((Verification::Verified(existing.watcher.clone()), None));
        }
        if let Some(reason) = self.negatives.foreign_reason(&address) {
            return Ok((reason.into(), None));
        }

        let started_at = Instant::now();
        let pool = pool.canonical();
        let factory = pool.factory.clone();

        // persisted records were verified before they were written
        if source != DiscoverySource::Cache {
            let expected = self
                .deriver
                .compute(&factory, pool.token0.address, pool.token1.address, pool.fee);
            if expected != address {
                self.negatives
                    .record_foreign(address, NegativeReason::IdentityMismatch);
                info!(
                    chain_id = self.chain_id,
                    "FakePool: {:?} {}/{} fee {} (expected {:?})",
                    address,
                    pool.token0.label(),
                    pool.token1.label(),
                    pool.fee,
                    expected
                );
                return Ok((Verification::IdentityMismatch, None));
            }
        }
        let Some(tick_spacing) = factory.tick_spacing(pool.fee) else {
            self.negatives
                .record_foreign(address, NegativeReason::UnsupportedFee);
            info!(
                chain_id = self.chain_id,
                "Unknown spacing for pool {:?} with fee = {}. Pool is ignored",
                address,
                pool.fee
            );
            return Ok((Verification::UnsupportedFee, None));
        };

        // built outside the shard lock: factories may read the registry
        let candidate = self.watcher_factory.create(WatcherParams {
            provider: factory.provider.clone(),
            address,
            tick_helper: self.tick_helper,
            token0: pool.token0.clone(),
            token1: pool.token1.clone(),
            fee: pool.fee,
            tick_spacing,
            client: self.client.clone(),
            pending: self.pending.clone(),
        });
        let watcher = match self.registry.entry(address) {
            // lost the race; the unused candidate was never refreshed
            Entry::Occupied(slot) => {
                return Ok((Verification::Verified(slot.get().watcher.clone()), None));
            }
            Entry::Vacant(slot) => {
                slot.insert(RegisteredPool {
                    identity: pool.clone(),
                    watcher: candidate.clone(),
                    generation: 0,
                });
                candidate
            }
        };
        metrics::increment_pool_registrations(source.as_str());
        metrics::set_registered_pools(self.registry.len());
        self.negatives.clear_absent(&address);

        let refresh = {
            let watcher = watcher.clone();
            let guard = self.pending.begin();
            let chain_id = self.chain_id;
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = watcher.update_pool_state().await {
                    warn!(chain_id, pool = ?address, "⚠️ Initial refresh failed: {}", e);
                }
            })
        };
        self.notify_first_update(watcher.clone(), source, started_at);

        if persist {
            if let Err(e) = self.store.add(pool.record()).await {
                warn!(chain_id = self.chain_id, pool = ?address, "⚠️ Failed to persist pool: {}", e);
            }
        }
        Ok((Verification::Verified(watcher), Some(refresh)))
    }

    fn notify_first_update(self: &Arc<Self>, watcher: Arc<dyn PoolWatcher>, source: DiscoverySource, started_at: Instant) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            watcher.first_update().await;
            let Some(this) = weak.upgrade() else { return };
            let watched = this.watched_pools.fetch_add(1, Ordering::SeqCst) + 1;
            metrics::increment_watched_pools();
            if source != DiscoverySource::Cache {
                info!(
                    chain_id = this.chain_id,
                    "add pool {:?} ({}ms, {}), watched pools total: {}/{}",
                    watcher.address(),
                    started_at.elapsed().as_millis(),
                    source,
                    watched,
                    this.registry.len() + this.negatives.absent_len()
                );
            }
        });
    }

    /// Renderable summaries of every registered pool that has one.
    pub fn get_current_pool_codes(&self) -> Vec<PoolCode> {
        self.watchers()
            .into_iter()
            .filter_map(|w| w.pool_code())
            .collect()
    }

    pub fn get_stable_pool_codes(&self) -> Vec<PoolCode> {
        self.watchers()
            .into_iter()
            .filter(|w| w.is_stable())
            .filter_map(|w| w.pool_code())
            .collect()
    }

    /// Adds, per token, the number of registered pools that reference it.
    pub fn get_tokens_pools_quantity(&self, counts: &mut HashMap<Address, usize>) {
        for slot in self.registry.iter() {
            *counts.entry(slot.identity.token0.address).or_insert(0) += 1;
            *counts.entry(slot.identity.token1.address).or_insert(0) += 1;
        }
    }

    /// CREATE2 address of the (token_a, token_b, fee) pool of a configured
    /// factory. Token order does not matter.
    pub fn compute_address(
        &self,
        factory: &Address,
        token_a: Address,
        token_b: Address,
        fee: u32,
    ) -> Result<Address, ExtractorError> {
        let factory = self
            .factories
            .get(factory)
            .ok_or(ExtractorError::UnknownFactory(*factory))?;
        let (token0, token1) = sort_tokens(token_a, token_b);
        Ok(self.deriver.compute(factory, token0, token1, fee))
    }

    pub(crate) fn derive(&self, factory: &FactoryV3, token0: Address, token1: Address, fee: u32) -> Address {
        self.deriver.compute(factory, token0, token1, fee)
    }

    /// `true` once the startup cache replay has settled.
    pub fn is_started(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolves when [`Orchestrator::is_started`] becomes `true`.
    pub async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn is_processing_logs(&self) -> bool {
        self.logs_started.load(Ordering::SeqCst)
    }

    pub fn last_processed_block(&self) -> Option<u64> {
        let block = self.last_processed_block.load(Ordering::SeqCst);
        (block >= 0).then_some(block as u64)
    }

    pub fn watched_pools(&self) -> usize {
        self.watched_pools.load(Ordering::SeqCst)
    }

    pub fn registered_pools(&self) -> usize {
        self.registry.len()
    }

    pub fn registered(&self, address: &Address) -> Option<RegisteredPool> {
        self.registry.get(address).map(|slot| slot.clone())
    }

    pub fn watcher(&self, address: &Address) -> Option<Arc<dyn PoolWatcher>> {
        self.registry.get(address).map(|slot| slot.watcher.clone())
    }

    pub fn is_foreign(&self, address: &Address) -> bool {
        self.negatives.is_foreign(address)
    }

    pub fn is_absent(&self, address: &Address) -> bool {
        self.negatives.is_absent(address)
    }

    pub fn negative_stats(&self) -> NegativeStats {
        self.negatives.stats()
    }

    pub fn pending(&self) -> &Arc<PendingOps> {
        &self.pending
    }

    pub fn quality(&self) -> &Arc<QualityChecker> {
        &self.quality
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    // snapshot: never call into a watcher while holding a registry shard lock
    pub(crate) fn watchers(&self) -> Vec<Arc<dyn PoolWatcher>> {
        self.registry.iter().map(|slot| slot.watcher.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::ProbeOutcome;
    use async_trait::async_trait;

    struct NoWatchers;

    impl WatcherFactory for NoWatchers {
        fn create(&self, params: WatcherParams) -> Arc<dyn PoolWatcher> {
            panic!("no pool expected, got {:?}", params.address)
        }
    }

    struct NoProbe;

    #[async_trait]
    impl StateProbe for NoProbe {
        async fn check(&self, _watcher: Arc<dyn PoolWatcher>) -> anyhow::Result<ProbeOutcome> {
            anyhow::bail!("no pool expected")
        }
    }

    #[tokio::test]
    async fn test_from_settings_wires_production_collaborators() {
        let dir = tempfile::tempdir().unwrap();
        let raw = format!(
            r#"
            [chain]
            chain_id = 42161
            rpc_url = "http://127.0.0.1:1"

            [extractor]
            tick_helper = "0xbfd8137f7d1516D3ea5cA83523914859ec47F573"
            cache_dir = "{}"

            [[factories]]
            address = "0x1F98431c8aD98523631AE4a59f267346ea31F984"
            provider = "UniswapV3"
            init_code_hash = "0xe34f199b19b2b4f47f68442619d555527d244f78a3297ea89325f843f87b8b54"
            "#,
            dir.path().display()
        );
        let settings = Settings::from_toml(&raw).unwrap();

        let (orchestrator, _log_filter) =
            Orchestrator::from_settings(&settings, Arc::new(NoWatchers), Arc::new(NoProbe)).unwrap();
        assert_eq!(orchestrator.chain_id(), 42161);
        assert_eq!(orchestrator.factories.len(), 1);

        // empty cache dir: nothing to replay, no network needed
        orchestrator.start().await.unwrap();
        orchestrator.ready().await;
        assert!(orchestrator.is_started());
        assert_eq!(orchestrator.registered_pools(), 0);
    }

    #[tokio::test]
    async fn test_from_settings_rejects_missing_factories() {
        let raw = r#"
            [chain]
            chain_id = 1
            rpc_url = "http://127.0.0.1:1"

            [extractor]
            tick_helper = "0xbfd8137f7d1516D3ea5cA83523914859ec47F573"
        "#;
        let settings = Settings::from_toml(raw).unwrap();
        let result = Orchestrator::from_settings(&settings, Arc::new(NoWatchers), Arc::new(NoProbe));
        assert!(result.is_err());
    }
}
