// src/pools.rs

use ethers::prelude::{Address, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::factory::FactoryV3;
use crate::watcher::PoolWatcher;

/// Resolved ERC-20 metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenInfo {
    pub address: Address,
    #[serde(default)]
    pub symbol: Option<String>,
    pub decimals: u8,
}

impl TokenInfo {
    pub fn new(address: Address, symbol: Option<String>, decimals: u8) -> Self {
        Self {
            address,
            symbol,
            decimals,
        }
    }

    pub fn label(&self) -> String {
        self.symbol
            .clone()
            .unwrap_or_else(|| format!("{:?}", self.address))
    }
}

/// Where a registration request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoverySource {
    /// Replayed from the persisted pool store at startup.
    Cache,
    /// Found by a token-pair discovery query.
    Request,
    /// An unknown address appeared in an event log.
    Logs,
}

impl DiscoverySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoverySource::Cache => "cache",
            DiscoverySource::Request => "request",
            DiscoverySource::Logs => "logs",
        }
    }
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claimed identity of a concentrated-liquidity pool.
///
/// `token0`/`token1` are not guaranteed to be in canonical order until the
/// registration path has sorted them.
#[derive(Debug, Clone)]
pub struct PoolInfo {
    pub address: Address,
    pub token0: TokenInfo,
    pub token1: TokenInfo,
    pub fee: u32,
    pub factory: Arc<FactoryV3>,
}

impl PoolInfo {
    /// Returns the identity with its tokens in canonical order.
    pub fn canonical(mut self) -> Self {
        if self.token1.address < self.token0.address {
            std::mem::swap(&mut self.token0, &mut self.token1);
        }
        self
    }

    pub fn record(&self) -> PoolCacheRecord {
        PoolCacheRecord {
            address: Some(self.address),
            token0: self.token0.address,
            token1: self.token1.address,
            fee: Some(self.fee),
            factory: self.factory.address,
        }
    }
}

/// The only thing persisted per pool: enough to rebuild [`PoolInfo`] at startup.
///
/// `address` and `fee` are optional on read so that truncated or hand-edited
/// records deserialize and are then discarded, instead of failing the whole load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCacheRecord {
    #[serde(default)]
    pub address: Option<Address>,
    pub token0: Address,
    pub token1: Address,
    #[serde(default)]
    pub fee: Option<u32>,
    pub factory: Address,
}

/// Authoritative registry slot: identity plus the live watcher.
///
/// `generation` increases every time the watcher in this slot is replaced;
/// reconciliation verdicts carry the generation they were computed against.
#[derive(Clone)]
pub struct RegisteredPool {
    pub identity: PoolInfo,
    pub watcher: Arc<dyn PoolWatcher>,
    pub generation: u64,
}

impl fmt::Debug for RegisteredPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredPool")
            .field("address", &self.identity.address)
            .field("fee", &self.identity.fee)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Renderable summary of one pool, produced by its watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCode {
    pub address: Address,
    pub provider: String,
    pub token0: TokenInfo,
    pub token1: TokenInfo,
    pub fee: u32,
    pub tick_spacing: i32,
    #[serde(default)]
    pub reserve0: U256,
    #[serde(default)]
    pub reserve1: U256,
}
