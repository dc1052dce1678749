//! Document storage port for the Gridmill tracker.
//!
//! Job, run, and task records are persisted as JSON documents with binary
//! attachments kept alongside them. The store is treated as an
//! eventually-consistent key-value backend with named secondary indexes; the
//! only consistency the tracker relies on is that a successful [`DocumentStore::store`]
//! is visible to the next [`DocumentStore::load`] from the same process.

pub mod memory;

use std::fmt;

use error_stack::Report;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;

/// Opaque document identifier. V7 UUIDs keep store iteration in creation
/// order, which the tracker relies on for deterministic polling passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(Uuid);

impl DocId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for DocId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A stored record: a typed JSON body inside a revisioned envelope.
///
/// `revision` implements optimistic concurrency: [`DocumentStore::store`]
/// only succeeds when the caller's revision matches the stored one, so two
/// processes racing on the same document cannot silently lose a transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocId,
    pub revision: u64,
    pub kind: String,
    pub body: serde_json::Value,
}

impl Document {
    /// Deserialize the JSON body into a typed record.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, Report<StoreError>> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| Report::new(StoreError::Serialization(e.to_string())))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {0} not found")]
    NotFound(DocId),
    #[error("revision conflict: store holds revision {stored}")]
    Conflict { stored: u64 },
    #[error("document {id} has no attachment named {name}")]
    AttachmentMissing { id: DocId, name: String },
    #[error("no view named {0} is registered")]
    UnknownView(String),
    #[error("document body could not be serialized: {0}")]
    Serialization(String),
}

/// A secondary-index key extractor. Views are registered on the store at
/// startup, replacing the CouchDB-style design documents the tracker's
/// records were originally indexed by: for each document the function emits
/// zero or more keys under which the document can be looked up.
pub type ViewFn = fn(&Document) -> Vec<String>;

/// Durable key-value storage of records plus binary attachments.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a new document with the given kind and body, returning the
    /// stored envelope (id assigned, revision 1).
    async fn create(&self, kind: &str, body: serde_json::Value)
        -> Result<Document, Report<StoreError>>;

    async fn load(&self, id: DocId) -> Result<Document, Report<StoreError>>;

    /// Write back a loaded document. Fails with [`StoreError::Conflict`] if
    /// the document changed since it was loaded; on success the revision in
    /// `doc` is bumped to the newly stored one.
    async fn store(&self, doc: &mut Document) -> Result<(), Report<StoreError>>;

    async fn put_attachment(
        &self,
        id: DocId,
        name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<(), Report<StoreError>>;

    async fn get_attachment(&self, id: DocId, name: &str) -> Result<Vec<u8>, Report<StoreError>>;

    /// Names of the attachments stored for a document.
    async fn list_attachments(&self, id: DocId) -> Result<Vec<String>, Report<StoreError>>;

    /// Enumerate documents a registered view emitted under `key`, ordered by
    /// id (v7 ids keep this close to creation order).
    async fn view(&self, view: &str, key: &str) -> Result<Vec<Document>, Report<StoreError>>;
}
