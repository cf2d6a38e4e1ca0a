use std::fmt;
use thiserror::Error;

/// Classification of a failure reported by a payment provider
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The provider processed the request and refused it
    Declined,
    /// The request was malformed or referenced unsupported values
    InvalidRequest,
    /// The referenced provider entity does not exist
    NotFound,
    /// The provider does not implement the requested operation
    NotSupported,
    /// The provider throttled the request
    RateLimited,
    /// The provider could not be reached or reported itself down
    Unavailable,
    /// The provider did not answer in time
    Timeout,
    Other,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::Declined => write!(f, "declined"),
            ProviderErrorKind::InvalidRequest => write!(f, "invalid request"),
            ProviderErrorKind::NotFound => write!(f, "not found"),
            ProviderErrorKind::NotSupported => write!(f, "not supported"),
            ProviderErrorKind::RateLimited => write!(f, "rate limited"),
            ProviderErrorKind::Unavailable => write!(f, "unavailable"),
            ProviderErrorKind::Timeout => write!(f, "timeout"),
            ProviderErrorKind::Other => write!(f, "error"),
        }
    }
}

/// Error returned by provider implementations
#[derive(Error, Clone, Debug)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NotFound, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidRequest, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unavailable, message)
    }

    /// Whether a later attempt against the same provider could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::RateLimited
                | ProviderErrorKind::Unavailable
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::Other
        )
    }
}

/// Error types for the payment orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Caller supplied data was rejected before any network call
    #[error("Validation error: {0}")]
    Validation(String),

    /// The selected provider does not implement an optional capability
    #[error("Provider {provider} does not support {operation}")]
    NotSupported { provider: String, operation: String },

    /// Every candidate provider failed its liveness probe
    #[error("No available provider")]
    NoAvailableProvider,

    /// The provider owning an entity is not part of the configured set
    #[error("Provider not available: {0}")]
    ProviderNotAvailable(String),

    /// A provider call failed
    #[error("Provider {provider} failed during {operation}: {source}")]
    Provider {
        provider: String,
        operation: String,
        #[source]
        source: ProviderError,
    },

    /// The circuit breaker rejected the call without attempting it
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// The guarded call was abandoned because the caller's context finished first
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Every retry attempt failed
    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<OrchestratorError>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A webhook signature did not verify
    #[error("Invalid webhook signature")]
    InvalidSignature,

    /// Error related to the storage
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Generic error with a message
    #[error("Generic error: {0}")]
    GenericError(String),
}

impl OrchestratorError {
    /// Wraps a provider error with the operation context it happened in
    pub fn provider(provider: &str, operation: &str, source: ProviderError) -> Self {
        match source.kind {
            ProviderErrorKind::NotSupported => OrchestratorError::NotSupported {
                provider: provider.to_string(),
                operation: operation.to_string(),
            },
            _ => OrchestratorError::Provider {
                provider: provider.to_string(),
                operation: operation.to_string(),
                source,
            },
        }
    }

    pub fn not_supported(provider: &str, operation: &str) -> Self {
        OrchestratorError::NotSupported {
            provider: provider.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Cancellation and deadline errors, never retried
    pub fn is_context_error(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Cancelled | OrchestratorError::DeadlineExceeded
        )
    }

    /// Failures that may clear up on their own: provider outages, throttling,
    /// abandoned calls and storage hiccups
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestratorError::Provider { source, .. } => source.is_transient(),
            OrchestratorError::Timeout(_) | OrchestratorError::StorageError(_) => true,
            OrchestratorError::RetriesExhausted { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// The innermost error, unwrapping retry exhaustion
    pub fn root(&self) -> &OrchestratorError {
        match self {
            OrchestratorError::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Attaches provider and operation names to a provider call result
pub(crate) trait ProviderResultExt<T> {
    fn during(self, provider: &str, operation: &str) -> Result<T, OrchestratorError>;
}

impl<T> ProviderResultExt<T> for Result<T, ProviderError> {
    fn during(self, provider: &str, operation: &str) -> Result<T, OrchestratorError> {
        self.map_err(|e| OrchestratorError::provider(provider, operation, e))
    }
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(err: rusqlite::Error) -> Self {
        OrchestratorError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::StorageError(err.to_string())
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        OrchestratorError::GenericError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_supported_kind_maps_to_capability_error() {
        let err = OrchestratorError::provider(
            "stripe",
            "create_plan",
            ProviderError::new(ProviderErrorKind::NotSupported, "plans disabled"),
        );
        assert!(matches!(err, OrchestratorError::NotSupported { .. }));
    }

    #[test]
    fn test_transient_classification() {
        let outage = OrchestratorError::provider(
            "stripe",
            "charge",
            ProviderError::unavailable("503"),
        );
        assert!(outage.is_transient());

        let decline = OrchestratorError::provider(
            "stripe",
            "charge",
            ProviderError::new(ProviderErrorKind::Declined, "insufficient funds"),
        );
        assert!(!decline.is_transient());
        assert!(!OrchestratorError::Cancelled.is_transient());
        assert!(OrchestratorError::DeadlineExceeded.is_context_error());
    }

    #[test]
    fn test_root_unwraps_exhaustion() {
        let err = OrchestratorError::RetriesExhausted {
            attempts: 3,
            source: Box::new(OrchestratorError::Timeout("charge".to_string())),
        };
        assert!(matches!(err.root(), OrchestratorError::Timeout(_)));
        assert!(err.to_string().contains("3 attempts"));
    }
}
