//! Transport: the external network collaborator
//!
//! One-shot request/response; no retry logic is assumed here. The transport
//! call is the only suspension point in the engine — everything else runs
//! synchronously against a single store revision.

use async_trait::async_trait;
use graphcache_core::{Document, GraphQlErrors, Result, Variables};
use serde_json::Value as Json;
use std::sync::Arc;

/// One outbound request
#[derive(Debug, Clone)]
pub struct GraphQlRequest {
    /// Parsed query document
    pub document: Arc<Document>,
    /// Variable bindings
    pub variables: Variables,
    /// Operation name, when the document carries one
    pub operation_name: Option<String>,
}

/// One server response: data, errors, or both
#[derive(Debug, Clone, Default)]
pub struct GraphQlResponse {
    /// The result tree, when the server produced one
    pub data: Option<Json>,
    /// Application errors. An empty list means "no errors" even though the
    /// field was present; `null` entries are preserved.
    pub errors: GraphQlErrors,
}

impl GraphQlResponse {
    /// Response carrying only data
    pub fn data(data: Json) -> Self {
        GraphQlResponse {
            data: Some(data),
            errors: GraphQlErrors::default(),
        }
    }

    /// Whether the response carries any error entries. The presence of
    /// errors always rejects the observer, even if partial data came along.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Network interface executing one request. Implementations resolve
/// asynchronously; failures surface as [`graphcache_core::Error::Network`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute one request against the server
    async fn execute(&self, request: GraphQlRequest) -> Result<GraphQlResponse>;
}
