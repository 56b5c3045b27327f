//! # Pool address derivation
//!
//! Concentrated-liquidity factories deploy every pool with CREATE2, using
//! `keccak256(abi.encode(token0, token1, fee))` as the salt. Given a factory
//! descriptor the deployment address of any (pair, fee) is therefore known
//! without touching the chain, which is what lets the extractor tell genuine
//! pools from look-alikes that merely emit the same events.

use dashmap::DashMap;
use ethers::abi::{encode, Token};
use ethers::types::{Address, U256};
use ethers::utils::{get_create2_address_from_hash, keccak256};

use crate::factory::FactoryV3;
use crate::metrics;

/// Canonical pair ordering: the numerically lesser address is token0.
pub fn sort_tokens(token_a: Address, token_b: Address) -> (Address, Address) {
    if token_a < token_b {
        (token_a, token_b)
    } else {
        (token_b, token_a)
    }
}

/// CREATE2 address of the (token0, token1, fee) pool deployed by `factory`.
///
/// Tokens must already be in canonical order; they are not reordered here.
pub fn compute_pool_address(factory: &FactoryV3, token0: Address, token1: Address, fee: u32) -> Address {
    let salt = keccak256(encode(&[
        Token::Address(token0),
        Token::Address(token1),
        Token::Uint(U256::from(fee)),
    ]));
    get_create2_address_from_hash(factory.pool_creator(), salt, factory.init_code_hash)
}

type DeriveKey = (Address, Address, u32, Address);

/// Memoizing wrapper around [`compute_pool_address`].
///
/// The derivation is pure, so entries never need invalidation. Concurrent
/// misses for the same key both compute and insert the same value.
#[derive(Debug, Default)]
pub struct AddressDeriver {
    cache: DashMap<DeriveKey, Address>,
}

impl AddressDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compute(&self, factory: &FactoryV3, token0: Address, token1: Address, fee: u32) -> Address {
        let key = (token0, token1, fee, factory.address);
        if let Some(hit) = self.cache.get(&key) {
            metrics::increment_cache_hit("derived_address");
            return *hit;
        }
        metrics::increment_cache_miss("derived_address");
        let addr = compute_pool_address(factory, token0, token1, fee);
        self.cache.insert(key, addr);
        addr
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
