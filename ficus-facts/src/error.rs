//! Error types for the ficus-facts crate.

use std::time::Duration;
use thiserror::Error;

use crate::datasource::DatasourceKind;
use crate::rules::Capability;

/// Main error type for datasource registry and rule script operations
///
/// Every variant carries owned data only so that a single connect outcome can
/// be handed to all callers waiting on the same datasource.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FactError {
    /// No live datasource is registered under the code
    #[error("Unknown datasource: {0}")]
    UnknownDatasource(String),

    /// A reload did not advance the datasource version
    #[error("Stale version for datasource {code}: offered {offered}, current {current}")]
    StaleVersion {
        /// Datasource code
        code: String,
        /// Version currently held by the registry (or its tombstone)
        current: u64,
        /// Version carried by the rejected config
        offered: u64,
    },

    /// The backend driver refused the connection
    #[error("Failed to connect datasource {code} ({kind}): {reason}")]
    Connect {
        /// Datasource code
        code: String,
        /// Backend kind that was dispatched to
        kind: DatasourceKind,
        /// Driver supplied reason
        reason: String,
    },

    /// The backend driver did not answer within the connect timeout
    #[error("Connect timeout for datasource {code} after {timeout:?}")]
    ConnectTimeout {
        /// Datasource code
        code: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// No driver is registered for the backend kind
    #[error("No backend driver registered for kind {0}")]
    NoDriver(DatasourceKind),

    /// Configuration validation error
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A change event payload could not be decoded
    #[error("Malformed change event: {0}")]
    MalformedEvent(String),

    /// Event transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Applying a change event took longer than the per-event budget
    #[error("Change event for {code} exceeded its budget of {budget:?}")]
    EventBudgetExceeded {
        /// Datasource code carried by the event
        code: String,
        /// Budget that elapsed
        budget: Duration,
    },

    /// Rule source text was empty
    #[error("Rule script source is empty")]
    EmptySource,

    /// No declaration in the script implements the requested capability
    #[error("Rule script {name} declares no rule implementing {capability}")]
    NoMatchingCapability {
        /// Script name (or `<anonymous>`)
        name: String,
        /// Requested capability
        capability: Capability,
    },

    /// More than one declaration implements the capability and the tie-break
    /// policy requires a unique match
    #[error("Rule script {name} has several rules implementing {capability}: {candidates:?}")]
    AmbiguousCapability {
        /// Script name (or `<anonymous>`)
        name: String,
        /// Requested capability
        capability: Capability,
        /// Declared names of every candidate, in declaration order
        candidates: Vec<String>,
    },

    /// The script failed to parse or instantiate
    #[error("Failed to compile rule script {name} ({source_excerpt:?}): {cause}")]
    ScriptCompile {
        /// Script name (or `<anonymous>`)
        name: String,
        /// Leading part of the source text
        source_excerpt: String,
        /// Parser or instantiation error
        cause: String,
    },

    /// A compiled rule failed while evaluating
    #[error("Rule script runtime error: {0}")]
    ScriptRuntime(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,
}

/// Type alias for Result with FactError
pub type FactResult<T> = Result<T, FactError>;

impl FactError {
    /// Whether the failure is expected to clear up on retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FactError::Connect { .. } | FactError::ConnectTimeout { .. } | FactError::Transport(_)
        )
    }

    /// Whether the failure only signals an out-of-date reload
    pub fn is_stale(&self) -> bool {
        matches!(self, FactError::StaleVersion { .. })
    }
}

impl From<serde_json::Error> for FactError {
    fn from(err: serde_json::Error) -> Self {
        FactError::Serialization(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for FactError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        FactError::ChannelClosed
    }
}

/// Leading part of `source` used in compile errors, cut on a char boundary.
pub(crate) fn source_excerpt(source: &str) -> String {
    const EXCERPT_LEN: usize = 80;

    let trimmed = source.trim();
    match trimmed.char_indices().nth(EXCERPT_LEN) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = FactError::ConnectTimeout {
            code: "es_test".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert!(err.is_transient());
        assert!(!err.is_stale());

        let err = FactError::StaleVersion {
            code: "es_test".to_string(),
            current: 2,
            offered: 1,
        };
        assert!(err.is_stale());
        assert!(!err.is_transient());

        assert!(!FactError::EmptySource.is_transient());
    }

    #[test]
    fn test_source_excerpt() {
        assert_eq!(source_excerpt("  rule A {}  "), "rule A {}");

        let long = "é".repeat(200);
        let excerpt = source_excerpt(&long);
        assert!(excerpt.ends_with("..."));
        assert_eq!(excerpt.chars().count(), 83);
    }
}
