use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use ethers::abi::Token;
use ethers::types::{Address, U256};
use log::{debug, info, warn};
use std::sync::Arc;

use crate::contracts::ERC20_ABI;
use crate::metrics;
use crate::multicall::{BatchCaller, CallError};
use crate::permanent_cache::PermanentCache;
use crate::pools::TokenInfo;

/// Token metadata lookups used by the extractor.
#[async_trait]
pub trait TokenResolver: Send + Sync {
    /// Resolves through the chain on a miss and remembers the result.
    ///
    /// `Ok(None)` means the address is definitely not a usable ERC-20 (its
    /// calls revert or return garbage). Network failures are returned as
    /// errors so the caller can retry later.
    async fn find_token(&self, address: Address) -> Result<Option<TokenInfo>>;

    /// Memory only, never touches the network.
    fn get_known_token(&self, address: &Address) -> Option<TokenInfo>;

    /// Loads the persisted token cache into memory. Returns how many tokens
    /// were added.
    async fn add_cached_tokens(&self) -> Result<usize>;

    fn known_tokens(&self) -> usize;
}

/// Resolves ERC-20 `decimals`/`symbol` through the batch caller and persists
/// every newly resolved token.
pub struct TokenManager {
    client: Arc<dyn BatchCaller>,
    tokens: DashMap<Address, TokenInfo>,
    cache: PermanentCache<TokenInfo>,
}

impl TokenManager {
    pub fn new(client: Arc<dyn BatchCaller>, cache: PermanentCache<TokenInfo>) -> Self {
        Self {
            client,
            tokens: DashMap::new(),
            cache,
        }
    }

    /// The cache file is named after the chain the client talks to.
    pub fn with_cache_dir(client: Arc<dyn BatchCaller>, cache_dir: &str) -> Self {
        let name = format!("uniV3Tokens-{}", client.chain_id());
        Self::new(client, PermanentCache::new(cache_dir, &name))
    }

    async fn fetch(&self, address: Address) -> Result<Option<TokenInfo>> {
        let (decimals, symbol) = tokio::join!(
            self.client
                .call_value(address, &ERC20_ABI, "decimals", vec![]),
            self.client.call_value(address, &ERC20_ABI, "symbol", vec![]),
        );
        let decimals = match decimals {
            Ok(token) => token,
            Err(e) if CallError::is_deterministic(&e) => {
                debug!("Token {:?} has no decimals: {}", address, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let Some(decimals) = parse_decimals(decimals) else {
            debug!("Token {:?} returned invalid decimals", address);
            return Ok(None);
        };
        // bytes32 symbols (MKR and friends) fail to decode as string; the token is still usable
        let symbol = symbol.ok().and_then(Token::into_string);
        Ok(Some(TokenInfo::new(address, symbol, decimals)))
    }
}

fn parse_decimals(token: Token) -> Option<u8> {
    let value = token.into_uint()?;
    if value > U256::from(u8::MAX) {
        return None;
    }
    Some(value.low_u32() as u8)
}

#[async_trait]
impl TokenResolver for TokenManager {
    async fn find_token(&self, address: Address) -> Result<Option<TokenInfo>> {
        if let Some(known) = self.tokens.get(&address) {
            metrics::increment_cache_hit("tokens");
            return Ok(Some(known.clone()));
        }
        metrics::increment_cache_miss("tokens");

        let Some(token) = self.fetch(address).await? else {
            return Ok(None);
        };
        let inserted = self.tokens.insert(address, token.clone()).is_none();
        if inserted {
            if let Err(e) = self.cache.add(&token).await {
                warn!("⚠️ Failed to persist token {:?}: {}", address, e);
            }
        }
        Ok(Some(token))
    }

    fn get_known_token(&self, address: &Address) -> Option<TokenInfo> {
        self.tokens.get(address).map(|t| t.clone())
    }

    async fn add_cached_tokens(&self) -> Result<usize> {
        let records = self.cache.get_all_records().await?;
        let mut added = 0;
        for token in records {
            if self.tokens.insert(token.address, token).is_none() {
                added += 1;
            }
        }
        info!("Loaded {} tokens from {}", added, self.cache.path().display());
        Ok(added)
    }

    fn known_tokens(&self) -> usize {
        self.tokens.len()
    }
}
