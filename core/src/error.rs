//! Error types for waiting-room operations.
//!
//! Only genuine failures live here. Ordinary negative outcomes of the queue
//! (a skipped promotion, a full queue, an inactive grant, a user who is not
//! in the queue) are plain enum values in [`crate::types`] and never travel
//! through `Err`.

use thiserror::Error;

/// Result type alias for waiting-room operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Failure taxonomy for the waiting room.
///
/// Store failures keep their low-level detail in the variant payload for
/// logging, but render a generic message so callers never see which store
/// or script was involved.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    // ═══════════════════════════════════════════════════════════
    // Caller Errors
    // ═══════════════════════════════════════════════════════════

    /// The protected resource or queue is unknown.
    #[error("Queue not found")]
    QueueNotFound,

    /// Queue settings violate an invariant (capacity, lifetime, batch size).
    #[error("Invalid queue settings: {0}")]
    InvalidSettings(String),

    /// A queue already exists for this resource.
    #[error("A queue already exists for resource {0}")]
    DuplicateResource(String),

    // ═══════════════════════════════════════════════════════════
    // Transient Store Errors
    // ═══════════════════════════════════════════════════════════

    /// The fast ordered store failed or is unreachable.
    #[error("Waiting room state temporarily unavailable")]
    FastStore(String),

    /// The durable store failed or is unreachable.
    #[error("Waiting room records temporarily unavailable")]
    Database(String),

    /// A store call exceeded its time bound.
    #[error("Waiting room operation timed out")]
    Timeout {
        /// Operation that timed out (for logs).
        operation: String,
    },

    // ═══════════════════════════════════════════════════════════
    // System Errors
    // ═══════════════════════════════════════════════════════════

    /// Internal invariant failure (should not be exposed to users).
    #[error("Internal error")]
    Internal(String),
}

impl QueueError {
    /// Returns `true` if the failure is transient and the call may be retried.
    ///
    /// # Examples
    ///
    /// ```
    /// # use waiting_room_core::QueueError;
    /// assert!(QueueError::FastStore("connection reset".into()).is_retryable());
    /// assert!(!QueueError::QueueNotFound.is_retryable());
    /// ```
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FastStore(_) | Self::Database(_) | Self::Timeout { .. }
        )
    }

    /// Low-level detail for logs; empty for caller errors.
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::FastStore(detail) | Self::Database(detail) | Self::Internal(detail) => detail,
            Self::Timeout { operation } => operation,
            Self::InvalidSettings(reason) => reason,
            Self::DuplicateResource(resource) => resource,
            Self::QueueNotFound => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failures_hide_their_detail() {
        let err = QueueError::FastStore("NOSCRIPT No matching script".into());
        assert_eq!(err.to_string(), "Waiting room state temporarily unavailable");
        assert_eq!(err.detail(), "NOSCRIPT No matching script");

        let err = QueueError::Timeout {
            operation: "promote".into(),
        };
        assert!(!err.to_string().contains("promote"));
    }

    #[test]
    fn only_store_failures_are_retryable() {
        assert!(QueueError::Database("pool timed out".into()).is_retryable());
        assert!(
            QueueError::Timeout {
                operation: "join".into()
            }
            .is_retryable()
        );
        assert!(!QueueError::InvalidSettings("capacity".into()).is_retryable());
        assert!(!QueueError::Internal("poisoned".into()).is_retryable());
    }
}
