//! Error taxonomy shared by every qmd component.
//!
//! Callers match on the variant to decide how to degrade:
//! [`QmdError::InvalidQuery`] is recovered inside the lexical adapter,
//! [`QmdError::Provider`] degrades to skipping an enhancement, and
//! [`QmdError::NotReady`] is surfaced to the user with remediation text.

use std::error::Error as StdError;

/// Result alias used throughout `qmd-core`.
pub type Result<T> = std::result::Result<T, QmdError>;

#[derive(Debug, thiserror::Error)]
pub enum QmdError {
    /// The lexical backend rejected the query syntax.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Malformed caller input (empty collection name, zero chunk size, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A backend or provider is not available. The message says how to fix it.
    #[error("not ready: {0}")]
    NotReady(String),

    /// An embedding, reranking or expansion call failed.
    #[error("{provider} provider error: {message}")]
    Provider { provider: String, message: String },

    /// Content store read/write failure.
    #[error("storage error ({context}): {source}")]
    Storage {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// A lookup by docid or path found nothing.
    #[error("not found: {0}")]
    NotFound(String),
}

impl QmdError {
    pub fn provider(provider: impl Into<String>, message: impl ToString) -> Self {
        QmdError::Provider {
            provider: provider.into(),
            message: message.to_string(),
        }
    }

    pub fn storage<E>(context: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        QmdError::Storage {
            context: context.into(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_storage_error_carries_context() {
        let err = QmdError::storage("content 3f2a9c", "disk full");
        let msg = err.to_string();
        assert!(msg.contains("content 3f2a9c"));
        assert!(msg.contains("disk full"));
        assert!(err.source().is_some());
    }
}
