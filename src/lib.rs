//! # cascade-gateway
//!
//! An intelligent gateway between clients and multiple upstream LLM
//! providers. Every query starts on the cheapest model capable of answering
//! it and escalates only when measured quality falls below a configured
//! threshold; a semantic cache short-circuits repeat work; a budget tracker
//! caps spend across rolling windows and latches a cheap emergency routing
//! mode at a critical threshold.
//!
//! ## Request flow
//!
//! ```text
//! query → classify → cache lookup → budget admission → route → cascade
//!       → cost accounting → {cache store, analytics, budget} in parallel
//! ```

use thiserror::Error;

pub mod analytics;
pub mod artifacts;
pub mod budget;
pub mod cache;
pub mod cascade;
pub mod classify;
pub mod config;
pub mod costbook;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod provider;
pub mod quality;
pub mod router;
pub mod server;

// Re-exports
pub use classify::{ClassifiedQuery, Classifier, Complexity, Intent};
pub use costbook::{CostBook, CostEstimate, ModelCostProfile};
pub use orchestrator::{Gateway, GatewayResponse, QueryOptions};
pub use router::{RoutingDecision, Strategy};

/// Gateway error taxonomy.
///
/// Core layers never catch to hide: they convert failures into these kinds
/// at boundaries, and only the transport edge maps them to HTTP status
/// codes via [`GatewayError::status_code`].
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Client fault: malformed or missing input. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Daily budget is at or past 100 percent used.
    #[error("daily budget exceeded: spent ${spent:.4} of ${limit:.2}")]
    BudgetExceeded {
        /// Spend accumulated in the current daily period, USD.
        spent: f64,
        /// Configured daily limit, USD.
        limit: f64,
    },

    /// Upstream provider call failed after retries.
    #[error("provider {provider} failed for model {model}: {message}")]
    Provider {
        /// Provider name (e.g. "openai").
        provider: String,
        /// Model identifier the call targeted.
        model: String,
        /// Upstream HTTP status, if one was received.
        status: Option<u16>,
        /// Wrapped upstream error text.
        message: String,
        /// Retry-after hint in milliseconds when the provider signalled 429.
        retry_after_ms: Option<u64>,
    },

    /// Every step of a cascade chain raised a provider failure.
    #[error("all cascade steps failed: {0}")]
    AllCascadeStepsFailed(String),

    /// Cache adapter failure. Converted to a miss on lookup and a no-op on
    /// store before it ever reaches a caller; carried here only for logging.
    #[error("cache failure: {0}")]
    Cache(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code for the HTTP error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            Self::Provider { .. } => "PROVIDER_ERROR",
            Self::AllCascadeStepsFailed(_) => "ALL_CASCADE_STEPS_FAILED",
            Self::Cache(_) => "CACHE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status this kind surfaces as at the transport edge.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::BudgetExceeded { .. } => 429,
            Self::Provider { status, .. } => match status {
                // Upstream said "unavailable"; relay that distinction.
                Some(503) => 503,
                _ => 502,
            },
            Self::AllCascadeStepsFailed(_) => 502,
            Self::Cache(_) | Self::Internal(_) => 500,
        }
    }

    /// True for failures worth one more attempt against the same provider.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider { .. })
    }
}

/// Initialise tracing with env-filter support. Call once at binary startup.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

/// Milliseconds since the Unix epoch, saturating at zero on clock skew.
pub(crate) fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Fresh request/artifact identifier.
pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(GatewayError::InvalidInput("x".into()).code(), "INVALID_INPUT");
        assert_eq!(
            GatewayError::BudgetExceeded { spent: 5.0, limit: 5.0 }.code(),
            "BUDGET_EXCEEDED"
        );
        assert_eq!(GatewayError::Internal("x".into()).code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_budget_exceeded_maps_to_429() {
        let err = GatewayError::BudgetExceeded { spent: 5.01, limit: 5.0 };
        assert_eq!(err.status_code(), 429);
    }

    #[test]
    fn test_provider_failure_maps_to_502() {
        let err = GatewayError::Provider {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            status: Some(500),
            message: "upstream".into(),
            retry_after_ms: None,
        };
        assert_eq!(err.status_code(), 502);
    }

    #[test]
    fn test_provider_unavailable_maps_to_503() {
        let err = GatewayError::Provider {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            status: Some(503),
            message: "down".into(),
            retry_after_ms: None,
        };
        assert_eq!(err.status_code(), 503);
    }

    #[test]
    fn test_only_provider_errors_are_retryable() {
        let provider = GatewayError::Provider {
            provider: "p".into(),
            model: "m".into(),
            status: None,
            message: "timeout".into(),
            retry_after_ms: None,
        };
        assert!(provider.is_retryable());
        assert!(!GatewayError::InvalidInput("x".into()).is_retryable());
        assert!(!GatewayError::BudgetExceeded { spent: 1.0, limit: 1.0 }.is_retryable());
    }

    #[test]
    fn test_epoch_ms_is_monotonic_enough() {
        let a = epoch_ms();
        let b = epoch_ms();
        assert!(b >= a);
    }

    #[test]
    fn test_new_id_is_unique() {
        assert_ne!(new_id(), new_id());
    }
}
