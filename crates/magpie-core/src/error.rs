// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the Magpie agent kernel.

use thiserror::Error;

/// Classification of LLM provider failures, used to decide retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Network hiccup or 5xx -- safe to retry.
    Transient,
    /// Authentication/authorization failure -- retrying cannot help.
    Auth,
    /// Malformed request rejected by the provider.
    BadRequest,
    /// 429 -- retry after backoff.
    RateLimited,
    /// Unrecoverable provider failure.
    Fatal,
}

impl ProviderErrorKind {
    /// Whether a call failing with this kind should be retried.
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }
}

/// The primary error type used across all Magpie crates.
#[derive(Debug, Error)]
pub enum MagpieError {
    /// Configuration errors (invalid TOML, unknown fields, bad values).
    #[error("configuration error: {0}")]
    Config(String),

    /// Bad input from a caller (invalid tool args, malformed records).
    #[error("validation error: {0}")]
    Validation(String),

    /// A configured limit was hit (subagent cap, queue full).
    #[error("resource limit: {0}")]
    Resource(String),

    /// Storage backend errors (file I/O, SQLite, serialization).
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Channel adapter errors (delivery failure, unknown channel).
    #[error("channel error: {message}")]
    Channel {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// LLM provider errors, classified for retry decisions.
    #[error("provider error ({kind:?}): {message}")]
    Provider {
        kind: ProviderErrorKind,
        message: String,
    },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// Unrecoverable state the user must address (corrupt on-disk data).
    /// The process continues but flags itself as degraded.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MagpieError {
    /// Convenience constructor for storage errors.
    pub fn storage<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage {
            source: Box::new(source),
        }
    }

    /// Whether the error is worth retrying at the layer that observed it.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provider { kind, .. } => kind.is_retriable(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for MagpieError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage {
            source: Box::new(e),
        }
    }
}

impl From<serde_json::Error> for MagpieError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(format!("invalid JSON: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_retriability() {
        assert!(ProviderErrorKind::Transient.is_retriable());
        assert!(ProviderErrorKind::RateLimited.is_retriable());
        assert!(!ProviderErrorKind::Auth.is_retriable());
        assert!(!ProviderErrorKind::BadRequest.is_retriable());
        assert!(!ProviderErrorKind::Fatal.is_retriable());
    }

    #[test]
    fn transient_detection_follows_provider_kind() {
        let transient = MagpieError::Provider {
            kind: ProviderErrorKind::Transient,
            message: "connection reset".to_string(),
        };
        assert!(transient.is_transient());

        let auth = MagpieError::Provider {
            kind: ProviderErrorKind::Auth,
            message: "bad key".to_string(),
        };
        assert!(!auth.is_transient());

        assert!(!MagpieError::Validation("nope".to_string()).is_transient());
    }

    #[test]
    fn io_error_converts_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: MagpieError = io.into();
        assert!(matches!(err, MagpieError::Storage { .. }));
        assert!(err.to_string().contains("missing"));
    }
}
