//! Pool discovery: token-pair queries and unknown addresses seen in logs.

pub mod pending;

use anyhow::anyhow;
use dashmap::DashMap;
use ethers::abi::Token;
use ethers::types::{Address, U256};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::contracts::{IUNISWAPV3FACTORY_ABI, IUNISWAPV3POOL_ABI};
use crate::multicall::CallError;
use crate::orchestrator::Orchestrator;
use crate::pool_address::sort_tokens;
use crate::pool_blacklist::{AbsentPool, NegativeReason, Verification};
use crate::pools::{DiscoverySource, PoolInfo, TokenInfo};
use crate::watcher::PoolWatcher;

/// Result of a token-pair query: watchers known right away plus one pending
/// probe per candidate that needed a network round trip.
pub struct WatcherLookup {
    pub prefetched: Vec<Arc<dyn PoolWatcher>>,
    pub fetching: Vec<JoinHandle<Option<Arc<dyn PoolWatcher>>>>,
}

impl WatcherLookup {
    /// Waits for every probe and merges the hits with the prefetched watchers.
    pub async fn all(self) -> Vec<Arc<dyn PoolWatcher>> {
        let mut watchers = self.prefetched;
        for fetched in join_all(self.fetching).await {
            if let Ok(Some(w)) = fetched {
                watchers.push(w);
            }
        }
        watchers
    }
}

/// Marks an address as being discovered for as long as it lives, so the
/// marker is cleared even if discovery unwinds.
struct DiscoveringGuard<'a> {
    discovering: &'a DashMap<Address, ()>,
    address: Address,
}

impl<'a> DiscoveringGuard<'a> {
    fn acquire(discovering: &'a DashMap<Address, ()>, address: Address) -> Option<Self> {
        if discovering.insert(address, ()).is_some() {
            return None;
        }
        Some(Self {
            discovering,
            address,
        })
    }
}

impl Drop for DiscoveringGuard<'_> {
    fn drop(&mut self) {
        self.discovering.remove(&self.address);
    }
}

fn as_address(token: Token, method: &str) -> anyhow::Result<Address> {
    token
        .into_address()
        .ok_or_else(|| anyhow!(CallError::Undecodable {
            method: method.to_string(),
            reason: "expected address".to_string(),
        }))
}

fn as_fee(token: Token) -> anyhow::Result<u32> {
    let fee = token.into_uint().ok_or_else(|| {
        anyhow!(CallError::Undecodable {
            method: "fee".to_string(),
            reason: "expected uint24".to_string(),
        })
    })?;
    if fee > U256::from(u32::MAX) {
        return Err(anyhow!(CallError::Undecodable {
            method: "fee".to_string(),
            reason: format!("{} out of range", fee),
        }));
    }
    Ok(fee.low_u32())
}

impl Orchestrator {
    /// Finds every pool between any two of `tokens`, across all configured
    /// factories and all of their fee tiers.
    ///
    /// Registered pools are returned in `prefetched` without a network call;
    /// candidates already confirmed absent or foreign are skipped. Every other
    /// candidate costs one `getPool` probe. A failed probe resolves to `None`
    /// and is not recorded anywhere.
    pub fn get_watchers_for_tokens(self: &Arc<Self>, tokens: &[TokenInfo]) -> WatcherLookup {
        let started_at = Instant::now();
        let mut seen = HashSet::new();
        let unique: Vec<&TokenInfo> = tokens.iter().filter(|t| seen.insert(t.address)).collect();

        let mut prefetched = Vec::new();
        let mut fetching = Vec::new();

        for (i, token_a) in unique.iter().enumerate() {
            // warm the resolver so the token reaches its persisted cache
            let resolver = self.tokens.clone();
            let address = token_a.address;
            tokio::spawn(async move {
                if let Err(e) = resolver.find_token(address).await {
                    debug!("token {:?} warm-up failed: {}", address, e);
                }
            });

            for token_b in &unique[i + 1..] {
                let (t0, t1) = if token_a.address < token_b.address {
                    (*token_a, *token_b)
                } else {
                    (*token_b, *token_a)
                };
                for factory in self.factories.iter() {
                    for fee in factory.fees() {
                        let candidate = self.derive(factory, t0.address, t1.address, fee);
                        if let Some(w) = self.watcher(&candidate) {
                            prefetched.push(w);
                            continue;
                        }
                        if self.negatives.is_absent(&candidate) || self.negatives.is_foreign(&candidate) {
                            continue;
                        }

                        let this = self.clone();
                        let pool = PoolInfo {
                            address: candidate,
                            token0: t0.clone(),
                            token1: t1.clone(),
                            fee,
                            factory: factory.clone(),
                        };
                        fetching.push(tokio::spawn(async move {
                            this.probe_candidate(pool, started_at).await
                        }));
                    }
                }
            }
        }

        debug!(
            chain_id = self.chain_id,
            "{} tokens: {} pools prefetched, {} probing",
            unique.len(),
            prefetched.len(),
            fetching.len()
        );
        WatcherLookup {
            prefetched,
            fetching,
        }
    }

    async fn probe_candidate(self: Arc<Self>, pool: PoolInfo, started_at: Instant) -> Option<Arc<dyn PoolWatcher>> {
        let _guard = self.pending.begin();
        let deployed = self
            .client
            .call_value(
                pool.factory.address,
                &IUNISWAPV3FACTORY_ABI,
                "getPool",
                vec![
                    Token::Address(pool.token0.address),
                    Token::Address(pool.token1.address),
                    Token::Uint(U256::from(pool.fee)),
                ],
            )
            .await
            .ok()?
            .into_address()?;

        if deployed.is_zero() {
            self.negatives.record_absent(
                pool.address,
                AbsentPool {
                    factory: pool.factory.address,
                    token0: pool.token0.address,
                    token1: pool.token1.address,
                    fee: pool.fee,
                },
            );
            return None;
        }

        let address = pool.address;
        match self.register(pool, DiscoverySource::Request, true).await {
            Ok((outcome, _)) => {
                if !outcome.is_verified() {
                    debug!(chain_id = self.chain_id, pool = ?address, "requested pool rejected: {:?}", outcome);
                }
                debug!(
                    chain_id = self.chain_id,
                    pool = ?address,
                    "probe settled in {}ms",
                    started_at.elapsed().as_millis()
                );
                outcome.watcher()
            }
            Err(e) => {
                warn!(chain_id = self.chain_id, pool = ?address, "⚠️ {}", e);
                None
            }
        }
    }

    /// Verifies an address that showed up in a log and registers it if it is a
    /// genuine pool of a configured factory.
    ///
    /// Deterministic negatives (foreign factory, unresolvable tokens, calls that
    /// revert) are permanent. Network failures only start a cooldown; a later
    /// log for the same address retries once it has passed.
    pub async fn add_pool_by_address(self: &Arc<Self>, address: Address) -> Verification<Arc<dyn PoolWatcher>> {
        if let Some(reason) = self.negatives.foreign_reason(&address) {
            return reason.into();
        }
        if let Some(w) = self.watcher(&address) {
            return Verification::Verified(w);
        }
        if !self.is_processing_logs() {
            return Verification::TransientFailure("log processing not started".to_string());
        }
        if self.negatives.is_cooling_down(&address) {
            return Verification::TransientFailure("cooling down after failed probe".to_string());
        }
        let Some(_discovering) = DiscoveringGuard::acquire(&self.discovering, address) else {
            return Verification::TransientFailure("discovery already in progress".to_string());
        };

        let _guard = self.pending.begin();
        let outcome = match self.discover(address).await {
            Ok(outcome) => outcome,
            Err(e) if CallError::is_deterministic(&e) => {
                self.negatives
                    .record_foreign(address, NegativeReason::ForeignFactory);
                debug!(chain_id = self.chain_id, pool = ?address, "not a pool: {}", e);
                Verification::ForeignFactory
            }
            Err(e) => {
                self.negatives.record_transient(address, &e.to_string());
                Verification::TransientFailure(e.to_string())
            }
        };

        if outcome.is_permanent_negative() {
            info!(
                chain_id = self.chain_id,
                "other factory pool {:?} ({}), such pools known: {}",
                address,
                outcome.label(),
                self.negatives.foreign_len()
            );
        }
        outcome
    }

    async fn discover(self: &Arc<Self>, address: Address) -> anyhow::Result<Verification<Arc<dyn PoolWatcher>>> {
        let factory_address = as_address(
            self.client
                .call_value(address, &IUNISWAPV3POOL_ABI, "factory", vec![])
                .await?,
            "factory",
        )?;
        let Some(factory) = self.factories.get(&factory_address).cloned() else {
            self.negatives
                .record_foreign(address, NegativeReason::ForeignFactory);
            return Ok(Verification::ForeignFactory);
        };

        let (token0, token1, fee) = tokio::try_join!(
            self.client
                .call_value(address, &IUNISWAPV3POOL_ABI, "token0", vec![]),
            self.client
                .call_value(address, &IUNISWAPV3POOL_ABI, "token1", vec![]),
            self.client
                .call_value(address, &IUNISWAPV3POOL_ABI, "fee", vec![]),
        )?;
        let (token0, token1) = sort_tokens(as_address(token0, "token0")?, as_address(token1, "token1")?);
        let fee = as_fee(fee)?;

        // a network error here propagates and only starts a cooldown
        let (token0, token1) = tokio::try_join!(self.tokens.find_token(token0), self.tokens.find_token(token1))?;
        let (Some(token0), Some(token1)) = (token0, token1) else {
            self.negatives
                .record_foreign(address, NegativeReason::UnresolvedTokens);
            return Ok(Verification::UnresolvedTokens);
        };

        let (outcome, _) = self
            .register(
                PoolInfo {
                    address,
                    token0,
                    token1,
                    fee,
                    factory,
                },
                DiscoverySource::Logs,
                true,
            )
            .await?;
        Ok(outcome)
    }
}
