use ethers::types::Address;

use crate::types::conversions::ConversionError;

/// Errors surfaced by the extractor's public operations.
///
/// Negative pool classifications are *not* errors: they are reported through
/// [`crate::pool_blacklist::Verification`] and recorded in the negative registries.
#[derive(Debug, thiserror::Error)]
pub enum ExtractorError {
    /// Pools may only be registered once log processing has started, otherwise a
    /// registration and the logs for the same pool could race in an unrecoverable order.
    #[error("Pools can be added only after log processing has been started")]
    LogsNotStarted,
    #[error("Factory {0:?} is not configured")]
    UnknownFactory(Address),
    #[error("Persisted pool store failed: {0}")]
    Store(#[source] anyhow::Error),
}

/// Invalid entries in the `[[factories]]` or `[extractor]` configuration.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("Factory {factory}: fee {fee} is listed twice in fee_spacing")]
    DuplicateFee { factory: String, fee: u32 },
    #[error("Factory {factory}: tick spacing for fee {fee} must be positive, got {tick_spacing}")]
    InvalidTickSpacing {
        factory: String,
        fee: u32,
        tick_spacing: i32,
    },
    #[error("No factories configured")]
    NoFactories,
}
