//! # Factory descriptors
//!
//! A [`FactoryV3`] describes one whitelisted pool deployer: where it lives, which
//! liquidity provider it belongs to, the creation-code hash used in the CREATE2
//! formula, and which fee tiers it supports.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ethers::types::{Address, H256};
use once_cell::sync::Lazy;

/// fee (hundredths of a bip) -> tick spacing
pub type FeeSpacingMap = BTreeMap<u32, i32>;

/// Fee tiers enabled on the canonical Uniswap V3 factory.
pub static UNISWAP_FEE_SPACING: Lazy<FeeSpacingMap> = Lazy::new(|| {
    BTreeMap::from([(100, 1), (500, 10), (3_000, 60), (10_000, 200)])
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryV3 {
    pub address: Address,
    /// Liquidity provider label attached to every watcher of this factory.
    pub provider: String,
    pub init_code_hash: H256,
    /// Some forks deploy pools from a separate deployer contract; CREATE2 then
    /// uses the deployer address instead of the factory.
    pub deployer: Option<Address>,
    pub fee_spacing: Option<FeeSpacingMap>,
}

impl FactoryV3 {
    pub fn new(address: Address, provider: impl Into<String>, init_code_hash: H256) -> Self {
        Self {
            address,
            provider: provider.into(),
            init_code_hash,
            deployer: None,
            fee_spacing: None,
        }
    }

    pub fn with_deployer(mut self, deployer: Address) -> Self {
        self.deployer = Some(deployer);
        self
    }

    pub fn with_fee_spacing(mut self, fee_spacing: FeeSpacingMap) -> Self {
        self.fee_spacing = Some(fee_spacing);
        self
    }

    /// Configured fee map, or the protocol default.
    pub fn fee_spacing_map(&self) -> &FeeSpacingMap {
        self.fee_spacing.as_ref().unwrap_or(&UNISWAP_FEE_SPACING)
    }

    pub fn tick_spacing(&self, fee: u32) -> Option<i32> {
        self.fee_spacing_map().get(&fee).copied()
    }

    pub fn fees(&self) -> impl Iterator<Item = u32> + '_ {
        self.fee_spacing_map().keys().copied()
    }

    /// Address that appears as `from` in the CREATE2 formula.
    pub fn pool_creator(&self) -> Address {
        self.deployer.unwrap_or(self.address)
    }
}

/// Immutable set of whitelisted factories, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct FactoryRegistry {
    factories: Vec<Arc<FactoryV3>>,
    by_address: HashMap<Address, Arc<FactoryV3>>,
}

impl FactoryRegistry {
    pub fn new(factories: Vec<FactoryV3>) -> Self {
        let factories: Vec<Arc<FactoryV3>> = factories.into_iter().map(Arc::new).collect();
        let by_address = factories
            .iter()
            .map(|f| (f.address, f.clone()))
            .collect();
        Self {
            factories,
            by_address,
        }
    }

    /// `Address` compares bytes, so a checksummed and a lowercase spelling of the
    /// same factory resolve to the same entry.
    pub fn get(&self, address: &Address) -> Option<&Arc<FactoryV3>> {
        self.by_address.get(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<FactoryV3>> {
        self.factories.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.factories.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_fee_map_is_used_without_override() {
        let factory = FactoryV3::new(Address::random(), "UniswapV3", H256::random());
        assert_eq!(factory.tick_spacing(3_000), Some(60));
        assert_eq!(factory.tick_spacing(2_500), None);
        assert_eq!(factory.fees().collect::<Vec<_>>(), vec![100, 500, 3_000, 10_000]);
    }

    #[test]
    fn test_override_replaces_default_fee_map() {
        let factory = FactoryV3::new(Address::random(), "SushiSwapV3", H256::random())
            .with_fee_spacing(BTreeMap::from([(500, 10), (3_000, 60)]));
        assert_eq!(factory.tick_spacing(100), None);
        assert_eq!(factory.fees().count(), 2);
    }

    #[test]
    fn test_deployer_takes_precedence_for_create2() {
        let factory_addr = Address::random();
        let deployer = Address::random();
        let factory = FactoryV3::new(factory_addr, "PancakeSwapV3", H256::random());
        assert_eq!(factory.pool_creator(), factory_addr);
        assert_eq!(factory.with_deployer(deployer).pool_creator(), deployer);
    }

    #[test]
    fn test_registry_lookup() {
        let f = FactoryV3::new(Address::random(), "UniswapV3", H256::random());
        let addr = f.address;
        let registry = FactoryRegistry::new(vec![f]);
        assert!(registry.get(&addr).is_some());
        assert!(registry.get(&Address::random()).is_none());
        assert_eq!(registry.len(), 1);
    }
}
