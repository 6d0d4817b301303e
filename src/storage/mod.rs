//! Storage module - document persistence behind an async collaborator trait.
//!
//! # Key Concepts
//! - StorageBackend: save/get/update/delete/find over JSON documents
//! - Query: conjunction of equality predicates on dotted paths
//! - Retry: transient failures are retried with exponential backoff
//!
//! Concrete database backends live outside this crate; `InMemoryStorage`
//! is the canonical implementation used by the binary and the tests.

mod memory;
mod retry;

pub use memory::InMemoryStorage;
pub use retry::{with_retry, RetryConfig};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Collection holding the current state of every budget.
pub const BUDGETS: &str = "budgets";

/// Collection holding the append-only checkpoint chains.
pub const CHECKPOINTS: &str = "checkpoints";

pub type Document = Value;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StorageError {
    /// Connectivity or contention; safe to retry.
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("{collection}/{id} not found")]
    NotFound { collection: String, id: String },

    #[error("{collection}/{id} already exists")]
    Conflict { collection: String, id: String },

    #[error("document (de)serialization failed: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Equality predicates on dotted JSON paths, all of which must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    predicates: Vec<(String, Value)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.push((path.into(), value.into()));
        self
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.predicates.iter().all(|(path, expected)| {
            let pointer = format!("/{}", path.replace('.', "/"));
            doc.pointer(&pointer) == Some(expected)
        })
    }
}

/// Document store collaborator.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Insert a new document. `Conflict` if `id` already exists.
    async fn save(&self, collection: &str, id: &str, data: Document) -> Result<(), StorageError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StorageError>;

    /// Replace an existing document. `NotFound` if `id` is absent.
    async fn update(&self, collection: &str, id: &str, data: Document)
        -> Result<(), StorageError>;

    /// Remove a document, returning whether it existed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StorageError>;

    /// Documents matching `query`, ordered by id.
    async fn find(
        &self,
        collection: &str,
        query: &Query,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StorageError>;
}

pub fn to_document<T: Serialize>(value: &T) -> Result<Document, StorageError> {
    Ok(serde_json::to_value(value)?)
}

pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T, StorageError> {
    Ok(serde_json::from_value(doc)?)
}
