//! # V3 Pool Extractor
//!
//! An off-chain mirror of concentrated-liquidity (Uniswap V3 style) pools deployed by
//! a known set of factory contracts on an EVM chain.
//!
//! ## Overview
//!
//! The extractor always knows the authoritative set of genuine pools, keeps each pool's
//! live state fresh, survives restarts through a local persisted record, and detects
//! drift between log-driven updates and direct contract reads.
//!
//! - **Verification**: every candidate pool is checked against the CREATE2 address of
//!   its claimed (factory, token pair, fee) before it is watched
//! - **Discovery**: pools are found from token-pair queries and from unknown addresses
//!   appearing in event logs
//! - **Negative caching**: confirmed-absent and counterfeit addresses are remembered so
//!   the same futile lookups are never repeated
//! - **Reconciliation**: a quality checker re-reads pools and replaces stale watchers
//!   without clobbering newer state
//!
//! ## Architecture
//!
//! ### Derivation Layer
//! [`pool_address`] and [`factory`] compute deterministic pool addresses.
//!
//! ### Core
//! [`orchestrator`] owns the registry; [`discovery`] and [`log_dispatch`] extend it.
//!
//! ### Collaborators
//! [`multicall`], [`token_manager`], [`permanent_cache`], [`log_filter`] and
//! [`quality`] are consumed through traits. Pool watchers are external and plug in
//! through [`watcher::WatcherFactory`].

// Core Types
/// Pool identities, cache records and registry slots
pub mod pools;
/// Common conversions
pub mod types;
/// Error types
pub mod error;

// Derivation Layer
/// Factory descriptors and fee tiers
pub mod factory;
/// CREATE2 pool address derivation
pub mod pool_address;
/// Absent / foreign / cooling-down address registries
pub mod pool_blacklist;

// Core
/// Pool registry, startup and query surface
pub mod orchestrator;
/// Token-pair and unknown-address discovery
pub mod discovery;
/// Log batch routing and verdict application
pub mod log_dispatch;

// Collaborators
/// Per-pool watcher seam
pub mod watcher;
/// Multicall batch RPC utilities
pub mod multicall;
/// ERC-20 metadata resolution
pub mod token_manager;
/// Append-only JSON-lines store
pub mod permanent_cache;
/// Event log delivery
pub mod log_filter;
/// Quality reconciliation
pub mod quality;

// Contracts (Public ABIs Only)
/// Smart contract ABIs (read-only, no execution contracts)
pub mod contracts;

// Infrastructure
/// Metrics and observability
pub mod metrics;
/// Logger installation
pub mod logging;
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use error::ExtractorError;
pub use factory::FactoryV3;
pub use orchestrator::{Collaborators, Orchestrator, OrchestratorConfig};
pub use pool_blacklist::Verification;
pub use pools::{DiscoverySource, PoolInfo, TokenInfo};
pub use settings::Settings;
pub use watcher::{PoolWatcher, WatcherFactory, WatcherParams};
