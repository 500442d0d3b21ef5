//! Unified error handling for the store core.
//!
//! Every component reports failures through [`StoreError`]. The taxonomy is
//! deliberately small: callers (REST/GraphQL handlers) map each kind onto a
//! wire-level error code, so new variants are added only when callers need to
//! distinguish the failure.
//!
//! Two kinds carry security weight. Read-style permission denials surface as
//! [`StoreError::ObjectNotFound`] so that a denied caller cannot distinguish
//! "exists but hidden" from "does not exist". Writes that can never succeed
//! structurally (for example a create gated only by write-ownership rules)
//! surface as [`StoreError::OperationForbidden`] because there is no object
//! whose existence could leak.

use thiserror::Error;

/// Result type used throughout the store core.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error taxonomy of the schema and database controllers.
///
/// The enum is `Clone` because schema reloads are shared between concurrent
/// callers through a shared future, and every waiter receives the same
/// failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid class name: {0}")]
    InvalidClassName(String),

    #[error("invalid key name: {0}")]
    InvalidKeyName(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("incorrect type: {0}")]
    IncorrectType(String),

    #[error("invalid nested key: {0}")]
    InvalidNestedKey(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("operation forbidden: {0}")]
    OperationForbidden(String),

    #[error("command unavailable: {0}")]
    CommandUnavailable(String),

    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl StoreError {
    /// True when the error represents a missing class definition.
    ///
    /// Read paths treat a missing class as an empty schema; destructive and
    /// definition paths treat it as a hard error. Both interrogate the same
    /// variant through this predicate.
    pub fn is_missing_class(&self) -> bool {
        matches!(self, StoreError::InvalidClassName(msg) if msg.contains("does not exist"))
    }

    /// True for `ObjectNotFound`, the recoverable kind in relation removal.
    pub fn is_object_not_found(&self) -> bool {
        matches!(self, StoreError::ObjectNotFound(_))
    }

    /// Missing-class constructor shared by schema and database controllers.
    pub fn missing_class(class_name: &str) -> Self {
        StoreError::InvalidClassName(format!("class {} does not exist", class_name))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::InvalidJson(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_class_roundtrip() {
        let err = StoreError::missing_class("Post");
        assert!(err.is_missing_class());
        assert!(!StoreError::InvalidClassName("bad name".to_string()).is_missing_class());
    }

    #[test]
    fn serde_errors_map_to_invalid_json() {
        let err: StoreError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, StoreError::InvalidJson(_)));
    }
}
