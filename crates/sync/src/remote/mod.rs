//! Remote Service: the authority the Outbox is replayed against.

mod http;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use stockroom_core::{EntityDescriptor, ServerId};

use crate::guard::IdempotencyToken;
use crate::record::Fields;

pub use http::HttpRemote;

/// Machine-readable failure class. The orchestrator branches on this only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network unreachable or timed out.
    Transient,
    NotFound,
    /// The server already holds the record (duplicate submission).
    Conflict,
    /// Payload rejected as malformed or violating a business rule.
    Validation,
    Server,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{category:?}: {message}")]
pub struct RemoteError {
    pub category: ErrorCategory,
    pub message: String,
}

impl RemoteError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Conflict, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Server, message)
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Per-entity CRUD surface of the server.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Create a record. Returns the created record, children included.
    async fn create(
        &self,
        desc: &EntityDescriptor,
        payload: &Fields,
        token: &IdempotencyToken,
    ) -> RemoteResult<Value>;

    /// Current authoritative set.
    async fn list(&self, desc: &EntityDescriptor) -> RemoteResult<Vec<Value>>;

    async fn update(
        &self,
        desc: &EntityDescriptor,
        id: &ServerId,
        delta: &Fields,
    ) -> RemoteResult<()>;

    async fn delete(&self, desc: &EntityDescriptor, id: &ServerId) -> RemoteResult<()>;

    /// Whether the server is reachable.
    async fn probe(&self) -> bool;
}
