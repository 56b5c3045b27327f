// Negative-result registries - remember addresses that are not usable pools so
// the same futile lookups are never paid for twice.
//
// Three sets:
// 1. confirmed absent: factory.getPool(pair, fee) returned the zero address
// 2. foreign / counterfeit: the address exists but is not a genuine pool of a
//    whitelisted factory (or cannot be supported)
// 3. transient: a probe failed on the network; retried only after a cooldown

use dashmap::DashMap;
use ethers::types::Address;
use std::time::{Duration, Instant};

use crate::metrics;

/// Why an address was put in the foreign set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegativeReason {
    /// Observed address differs from the CREATE2 address of its claimed identity
    IdentityMismatch,
    /// The owning factory has no tick spacing for the pool's fee
    UnsupportedFee,
    /// `pool.factory()` is not one of the configured factories
    ForeignFactory,
    /// token0/token1 could not be resolved as tokens
    UnresolvedTokens,
}

impl NegativeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegativeReason::IdentityMismatch => "identity_mismatch",
            NegativeReason::UnsupportedFee => "unsupported_fee",
            NegativeReason::ForeignFactory => "foreign_factory",
            NegativeReason::UnresolvedTokens => "unresolved_tokens",
        }
    }
}

/// Outcome of one attempt to verify and register a candidate pool.
///
/// Permanent negatives (everything but `TransientFailure`) are recorded in the
/// foreign set; a transient failure only starts a cooldown.
#[derive(Clone)]
pub enum Verification<W> {
    Verified(W),
    IdentityMismatch,
    UnsupportedFee,
    ForeignFactory,
    UnresolvedTokens,
    TransientFailure(String),
}

impl<W> Verification<W> {
    pub fn watcher(self) -> Option<W> {
        match self {
            Verification::Verified(w) => Some(w),
            _ => None,
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, Verification::Verified(_))
    }

    pub fn is_permanent_negative(&self) -> bool {
        matches!(
            self,
            Verification::IdentityMismatch
                | Verification::UnsupportedFee
                | Verification::ForeignFactory
                | Verification::UnresolvedTokens
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verification::Verified(_) => "verified",
            Verification::IdentityMismatch => "identity_mismatch",
            Verification::UnsupportedFee => "unsupported_fee",
            Verification::ForeignFactory => "foreign_factory",
            Verification::UnresolvedTokens => "unresolved_tokens",
            Verification::TransientFailure(_) => "transient_failure",
        }
    }
}

impl<W> From<NegativeReason> for Verification<W> {
    fn from(reason: NegativeReason) -> Self {
        match reason {
            NegativeReason::IdentityMismatch => Verification::IdentityMismatch,
            NegativeReason::UnsupportedFee => Verification::UnsupportedFee,
            NegativeReason::ForeignFactory => Verification::ForeignFactory,
            NegativeReason::UnresolvedTokens => Verification::UnresolvedTokens,
        }
    }
}

impl<W> std::fmt::Debug for Verification<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verification::TransientFailure(e) => write!(f, "TransientFailure({e})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Identity that was probed and found not deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsentPool {
    pub factory: Address,
    pub token0: Address,
    pub token1: Address,
    pub fee: u32,
}

/// Owned exclusively by the orchestrator; collaborators never touch it.
pub struct NegativeRegistry {
    absent: DashMap<Address, AbsentPool>,
    foreign: DashMap<Address, NegativeReason>,
    transient: DashMap<Address, (Instant, String)>,
    transient_cooldown: Duration,
}

impl NegativeRegistry {
    pub fn new(transient_cooldown: Duration) -> Self {
        Self {
            absent: DashMap::new(),
            foreign: DashMap::new(),
            transient: DashMap::new(),
            transient_cooldown,
        }
    }

    pub fn record_absent(&self, address: Address, pool: AbsentPool) {
        if self.absent.insert(address, pool).is_none() {
            metrics::increment_negative_classification("absent");
        }
    }

    pub fn is_absent(&self, address: &Address) -> bool {
        self.absent.contains_key(address)
    }

    /// Only a later successful registration takes an address out of the absent set.
    pub fn clear_absent(&self, address: &Address) -> bool {
        self.absent.remove(address).is_some()
    }

    /// Returns `true` if the address was not known as foreign before.
    pub fn record_foreign(&self, address: Address, reason: NegativeReason) -> bool {
        let inserted = self.foreign.insert(address, reason).is_none();
        if inserted {
            metrics::increment_negative_classification(reason.as_str());
            log::debug!("Pool {:?} classified as {}", address, reason.as_str());
        }
        self.transient.remove(&address);
        inserted
    }

    pub fn is_foreign(&self, address: &Address) -> bool {
        self.foreign.contains_key(address)
    }

    pub fn foreign_reason(&self, address: &Address) -> Option<NegativeReason> {
        self.foreign.get(address).map(|r| *r)
    }

    pub fn record_transient(&self, address: Address, error: &str) {
        self.transient
            .insert(address, (Instant::now(), error.to_string()));
        metrics::increment_negative_classification("transient");
        log::warn!(
            "⚠️ Probe of {:?} failed ({}), retry allowed after {}s",
            address,
            error,
            self.transient_cooldown.as_secs()
        );
    }

    /// `true` while a failed probe of `address` is still cooling down.
    /// Expired entries are removed on read.
    pub fn is_cooling_down(&self, address: &Address) -> bool {
        // copy out before removing: holding the read guard across remove() deadlocks
        let failed_at = self.transient.get(address).map(|entry| entry.0);
        match failed_at {
            Some(at) if at.elapsed() < self.transient_cooldown => true,
            Some(_) => {
                self.transient.remove(address);
                false
            }
            None => false,
        }
    }

    pub fn absent_len(&self) -> usize {
        self.absent.len()
    }

    pub fn foreign_len(&self) -> usize {
        self.foreign.len()
    }

    pub fn stats(&self) -> NegativeStats {
        NegativeStats {
            absent: self.absent.len(),
            foreign: self.foreign.len(),
            transient: self.transient.len(),
        }
    }
}

impl Default for NegativeRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegativeStats {
    pub absent: usize,
    pub foreign: usize,
    pub transient: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn absent(fee: u32) -> AbsentPool {
        AbsentPool {
            factory: Address::random(),
            token0: Address::random(),
            token1: Address::random(),
            fee,
        }
    }

    #[test]
    fn test_foreign_set_grows_monotonically() {
        let registry = NegativeRegistry::default();
        let pool = Address::random();
        assert!(registry.record_foreign(pool, NegativeReason::IdentityMismatch));
        assert!(!registry.record_foreign(pool, NegativeReason::ForeignFactory));
        assert!(registry.is_foreign(&pool));
        assert_eq!(registry.foreign_len(), 1);
    }

    #[test]
    fn test_absent_cleared_only_explicitly() {
        let registry = NegativeRegistry::default();
        let pool = Address::random();
        registry.record_absent(pool, absent(500));
        assert!(registry.is_absent(&pool));
        assert!(registry.clear_absent(&pool));
        assert!(!registry.is_absent(&pool));
        assert!(!registry.clear_absent(&pool));
    }

    #[test]
    fn test_transient_failure_expires() {
        let registry = NegativeRegistry::new(Duration::from_millis(0));
        let pool = Address::random();
        registry.record_transient(pool, "timeout");
        assert!(!registry.is_cooling_down(&pool));
        assert_eq!(registry.stats().transient, 0);

        let registry = NegativeRegistry::new(Duration::from_secs(3600));
        registry.record_transient(pool, "timeout");
        assert!(registry.is_cooling_down(&pool));
        assert!(!registry.is_foreign(&pool));
    }

    #[test]
    fn test_foreign_classification_supersedes_transient() {
        let registry = NegativeRegistry::new(Duration::from_secs(3600));
        let pool = Address::random();
        registry.record_transient(pool, "timeout");
        registry.record_foreign(pool, NegativeReason::ForeignFactory);
        assert!(!registry.is_cooling_down(&pool));
        assert_eq!(
            registry.foreign_reason(&pool),
            Some(NegativeReason::ForeignFactory)
        );
    }

    #[test]
    fn test_verification_classes() {
        let v: Verification<u8> = Verification::UnsupportedFee;
        assert!(v.is_permanent_negative());
        let t: Verification<u8> = Verification::TransientFailure("reverted".into());
        assert!(!t.is_permanent_negative());
        assert_eq!(t.label(), "transient_failure");
        assert_eq!(Verification::Verified(7u8).watcher(), Some(7));
        let from_reason: Verification<u8> = NegativeReason::UnresolvedTokens.into();
        assert!(from_reason.is_permanent_negative());
    }
}
