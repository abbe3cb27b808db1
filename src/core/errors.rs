// src/core/errors.rs

//! Defines the primary error type for the scaler, following the taxonomy of
//! spec section 7.

use thiserror::Error;

/// The main error enum. Using `thiserror` gives clean `Display`/`Error` impls
/// and lets call sites match on the taxonomy instead of string-sniffing.
#[derive(Error, Debug)]
pub enum ScalerError {
    /// Validation failure on a config reload. The previous config is kept;
    /// only the first load counts against `max_failures`.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network timeout, rate limit, or control-plane 5xx from the node
    /// provider. Logged, not counted against `max_failures`, retried next
    /// tick.
    #[error("transient provider error: {0}")]
    ProviderTransient(String),

    /// Invalid credentials, unknown region, or another error that will not
    /// resolve itself on retry. Counts against `max_failures`.
    #[error("permanent provider error: {0}")]
    ProviderPermanent(String),

    /// A `provider.create_node` call failed. Logged, event emitted, pending
    /// counter decremented; the next tick replans.
    #[error("node launch failed: {0}")]
    NodeLaunch(String),

    /// A node updater (setup/start) failed. Marks the node for termination
    /// on the next tick; does not count against `max_failures`.
    #[error("node update failed: {0}")]
    Update(String),

    /// A bug: an internal invariant was violated. Logged and survived, never
    /// propagated to the process exit path.
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl ScalerError {
    /// Whether this error should be counted against the reconciler's
    /// `max_failures` budget (spec section 7's propagation rule).
    pub fn counts_against_max_failures(&self) -> bool {
        matches!(
            self,
            ScalerError::ProviderPermanent(_) | ScalerError::Config(_)
        )
    }
}

impl From<std::io::Error> for ScalerError {
    fn from(e: std::io::Error) -> Self {
        ScalerError::Internal(e.to_string())
    }
}

impl From<toml::de::Error> for ScalerError {
    fn from(e: toml::de::Error) -> Self {
        ScalerError::Config(e.to_string())
    }
}
