//! The document store primitives the queue is built on. Atomicity is only assumed per document.

mod memory;
mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoDbStore;

use async_trait::async_trait;
use bson::Document;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store unavailable")]
    Unavailable(#[source] anyhow::Error),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Which version of the document `find_one_and_update` hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnPolicy {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Document,
    pub unique: bool,
    /// Only documents matching this filter are indexed.
    pub partial_filter: Option<Document>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_one(&self, document: Document) -> Result<(), StoreError>;

    async fn find_one(&self, filter: Document) -> Result<Option<Document>, StoreError>;

    /// Selects one document matching `filter` (first by `sort`), applies `update` and returns it,
    /// all in one atomic step.
    async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        sort: Option<Document>,
        return_policy: ReturnPolicy,
    ) -> Result<Option<Document>, StoreError>;

    /// Must be a no-op when the index already exists.
    async fn create_index(&self, index: IndexSpec) -> Result<(), StoreError>;
}
