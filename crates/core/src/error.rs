//! Error types for the cache engine
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.
//!
//! Propagation policy (one rule, applied everywhere): store-level errors
//! never cross the public read/write API as panics or poisoned state. They
//! are returned as values, attached to the triggering query's error channel,
//! and delivered to that query's subscribers only.

use crate::types::{FieldPath, RecordId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the cache engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Identity conflict: a field that already links to a real-id record was
    /// about to be relinked to a different id. Fatal to the affected write,
    /// which does not partially apply; the rest of the store is untouched.
    #[error("store integrity violated at {path}: cannot replace record id {previous} with {attempted}")]
    StoreIntegrity {
        /// Field path at which the conflicting link was written
        path: FieldPath,
        /// The id already linked at this position
        previous: RecordId,
        /// The id the rejected write tried to link
        attempted: RecordId,
    },

    /// Data exists in the store but is shaped inconsistently with the query
    /// (e.g. a reference was expected but a scalar was found)
    #[error("invalid shape at {path}: expected {expected}, found {found}")]
    InvalidShape {
        /// Field path of the mismatch
        path: FieldPath,
        /// What the selection required
        expected: &'static str,
        /// What the store held
        found: &'static str,
    },

    /// A query document referenced a variable absent from the supplied set
    #[error("missing variable: ${0}")]
    MissingVariable(String),

    /// A fragment spread named a fragment not defined in the document
    #[error("unknown fragment: {0}")]
    UnknownFragment(String),

    /// Transport failure, wrapped. Retried only if the caller re-invokes.
    #[error("network error: {0}")]
    Network(String),

    /// Application-level errors returned by the server alongside (or instead
    /// of) data
    #[error("graphql errors: {0}")]
    GraphQl(GraphQlErrors),

    /// Invalid operation or configuration (e.g. polling a cache-only query)
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The store was reset while this request was in flight
    #[error("store reset while request in flight")]
    StoreReset,

    /// A hydration snapshot carried state that may not be pre-seeded
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Fallback message used when a GraphQL error entry carries no usable message
pub const UNSPECIFIED_ERROR_MESSAGE: &str = "Unspecified error";

/// One application error returned by the server.
///
/// All fields are optional; non-conforming servers omit or null any of them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphQlError {
    /// Human-readable message, when the server provided one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Result path the error applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<serde_json::Value>>,
    /// Free-form server extensions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Value>,
}

impl GraphQlError {
    /// Error with just a message
    pub fn new(message: impl Into<String>) -> Self {
        GraphQlError {
            message: Some(message.into()),
            ..GraphQlError::default()
        }
    }

    /// The message, falling back to [`UNSPECIFIED_ERROR_MESSAGE`]
    pub fn display_message(&self) -> &str {
        self.message.as_deref().unwrap_or(UNSPECIFIED_ERROR_MESSAGE)
    }
}

/// The error list attached to a response.
///
/// Entries may be `None`: the wire format tolerates `null` entries inside the
/// error array and they are preserved as-is, rendered with a placeholder
/// message rather than crashing formatting. An empty list means "no errors"
/// even when the field itself was present.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphQlErrors(pub Vec<Option<GraphQlError>>);

impl GraphQlErrors {
    /// Whether the list carries any entries at all (a `null` entry counts)
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of entries, including `null` ones
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Messages for every entry, placeholder for `null` or message-less ones
    pub fn messages(&self) -> Vec<&str> {
        self.0
            .iter()
            .map(|e| match e {
                Some(err) => err.display_message(),
                None => UNSPECIFIED_ERROR_MESSAGE,
            })
            .collect()
    }
}

impl std::fmt::Display for GraphQlErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.messages().join("; "))
    }
}

impl From<Vec<GraphQlError>> for GraphQlErrors {
    fn from(errors: Vec<GraphQlError>) -> Self {
        GraphQlErrors(errors.into_iter().map(Some).collect())
    }
}
