//! Seam to the per-pool state holder.
//!
//! The refresh algorithm (reserves, ticks, log decoding) lives outside this
//! crate. The extractor only constructs watchers through a [`WatcherFactory`],
//! indexes them, forwards logs and asks for summaries.

use async_trait::async_trait;
use ethers::types::{Address, Log};
use std::sync::Arc;

use crate::discovery::pending::PendingOps;
use crate::multicall::BatchCaller;
use crate::pools::{PoolCode, TokenInfo};

#[async_trait]
pub trait PoolWatcher: Send + Sync {
    fn address(&self) -> Address;

    /// Full authoritative re-read of the pool state.
    async fn update_pool_state(&self) -> anyhow::Result<()>;

    /// Applies one log and returns a short summary for the batch line.
    fn process_log(&self, log: &Log) -> anyhow::Result<String>;

    fn pool_code(&self) -> Option<PoolCode>;

    fn is_stable(&self) -> bool;

    /// Resolves once the first state refresh has completed, immediately if it
    /// already has.
    async fn first_update(&self);
}

/// Everything a watcher needs to track one verified pool.
#[derive(Clone)]
pub struct WatcherParams {
    pub provider: String,
    pub address: Address,
    pub tick_helper: Address,
    pub token0: TokenInfo,
    pub token1: TokenInfo,
    pub fee: u32,
    pub tick_spacing: i32,
    pub client: Arc<dyn BatchCaller>,
    pub pending: Arc<PendingOps>,
}

pub trait WatcherFactory: Send + Sync {
    fn create(&self, params: WatcherParams) -> Arc<dyn PoolWatcher>;
}
