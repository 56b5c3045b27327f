//! # Basic Extractor Setup Example
//!
//! This example wires the extractor with its production collaborators:
//! - Settings from `Config.toml` (or `EXTRACTOR_CONFIG`) plus `.env`
//! - Logger and, with `--features observability`, the Prometheus exporter
//! - Multicall-batched RPC client, token manager and pool store
//! - Polling log filter
//!
//! Pool watchers are application code; the minimal one below only tracks the
//! pool's tick spacing so the wiring can be run end to end.
//!
//! ## Usage
//!
//! ```bash
//! EXTRACTOR_RPC_URL=http://127.0.0.1:8545 cargo run --example basic_setup
//! ```

use anyhow::Result;
use async_trait::async_trait;
use ethers::prelude::{Address, Http, Log, Provider};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use v3_pool_extractor::contracts::i_uniswap_v3_pool::{IUniswapV3Pool, SwapFilter};
use v3_pool_extractor::contracts::IUNISWAPV3POOL_ABI;
use v3_pool_extractor::logging::init_logging;
use v3_pool_extractor::multicall::BatchCaller;
use v3_pool_extractor::pools::{PoolCode, TokenInfo};
use v3_pool_extractor::quality::{PoolSyncState, ProbeOutcome, StateProbe};
use v3_pool_extractor::{Orchestrator, PoolWatcher, Settings, WatcherFactory, WatcherParams};

struct TickSpacingWatcher {
    params: WatcherParams,
    observed_spacing: AtomicI32,
    updated: watch::Sender<bool>,
}

#[async_trait]
impl PoolWatcher for TickSpacingWatcher {
    fn address(&self) -> Address {
        self.params.address
    }

    async fn update_pool_state(&self) -> Result<()> {
        let spacing = self
            .params
            .client
            .call_value(self.params.address, &IUNISWAPV3POOL_ABI, "tickSpacing", vec![])
            .await?;
        let spacing = spacing
            .into_int()
            .map(|v| v.low_u32() as i32)
            .ok_or_else(|| anyhow::anyhow!("tickSpacing is not an int24"))?;
        self.observed_spacing.store(spacing, Ordering::SeqCst);
        self.updated.send_replace(true);
        Ok(())
    }

    fn process_log(&self, log: &Log) -> Result<String> {
        let is_swap = log.topics.first() == Some(&<SwapFilter as ethers::contract::EthEvent>::signature());
        Ok(if is_swap { "Swap" } else { "Event" }.to_string())
    }

    fn pool_code(&self) -> Option<PoolCode> {
        Some(PoolCode {
            address: self.params.address,
            provider: self.params.provider.clone(),
            token0: self.params.token0.clone(),
            token1: self.params.token1.clone(),
            fee: self.params.fee,
            tick_spacing: self.observed_spacing.load(Ordering::SeqCst),
            reserve0: Default::default(),
            reserve1: Default::default(),
        })
    }

    fn is_stable(&self) -> bool {
        self.params.fee <= 500
    }

    async fn first_update(&self) {
        let mut rx = self.updated.subscribe();
        let _ = rx.wait_for(|updated| *updated).await;
    }
}

struct TickSpacingWatchers;

impl WatcherFactory for TickSpacingWatchers {
    fn create(&self, params: WatcherParams) -> Arc<dyn PoolWatcher> {
        let (updated, _) = watch::channel(false);
        Arc::new(TickSpacingWatcher {
            params,
            observed_spacing: AtomicI32::new(0),
            updated,
        })
    }
}

/// Re-reads tickSpacing straight from the pool contract.
struct DirectReadProbe {
    provider: Arc<Provider<Http>>,
}

#[async_trait]
impl StateProbe for DirectReadProbe {
    async fn check(&self, watcher: Arc<dyn PoolWatcher>) -> Result<ProbeOutcome> {
        let pool = IUniswapV3Pool::new(watcher.address(), self.provider.clone());
        let on_chain = pool.tick_spacing().call().await?;
        let mirrored = watcher.pool_code().map(|c| c.tick_spacing);
        let status = if mirrored == Some(on_chain) {
            PoolSyncState::Match
        } else {
            PoolSyncState::TicksMismatch
        };
        Ok(ProbeOutcome {
            status,
            replacement: None,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load settings from config file or environment
    let settings = Settings::new()?;

    // 2. Initialize logging
    init_logging(&settings.log)?;
    println!("🚀 Initializing V3 pool extractor on chain {}...", settings.chain.chain_id);

    // 3. Metrics exporter (optional)
    #[cfg(feature = "observability")]
    if let Some(port) = settings.metrics_port {
        v3_pool_extractor::metrics::install_prometheus_exporter(port)?;
        println!("✅ Prometheus exporter on :{}", port);
    }

    // 4. Wire the orchestrator and its collaborators
    let provider = Arc::new(Provider::<Http>::try_from(settings.chain.rpc_url.as_str())?);
    let (orchestrator, log_filter) = Orchestrator::from_settings(
        &settings,
        Arc::new(TickSpacingWatchers),
        Arc::new(DirectReadProbe { provider }),
    )?;
    println!("✅ Orchestrator created");

    // 5. Start log polling, then replay the pool cache
    log_filter.spawn();
    orchestrator.start().await?;
    orchestrator.ready().await;
    println!("✅ Extractor ready: {} pools registered", orchestrator.registered_pools());

    // 6. Ask for every pool between two tokens
    let usdc = TokenInfo::new(
        "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".parse::<Address>()?,
        Some("USDC".to_string()),
        6,
    );
    let weth = TokenInfo::new(
        "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2".parse::<Address>()?,
        Some("WETH".to_string()),
        18,
    );
    let watchers = orchestrator.get_watchers_for_tokens(&[usdc, weth]).all().await;
    for watcher in &watchers {
        if let Some(code) = watcher.pool_code() {
            println!(
                "  {:?} {}/{} fee {} spacing {}",
                code.address,
                code.token0.label(),
                code.token1.label(),
                code.fee,
                code.tick_spacing
            );
        }
    }

    println!("\n🎉 Watching logs, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    Ok(())
}
