//! In-memory store adapter. This is the backend used by the test suites and
//! the demo binary; a deployment against a real document database implements
//! [`DocumentStore`] over its client library instead.

use ahash::{HashMap, HashMapExt};
use error_stack::Report;
use parking_lot::Mutex;

use crate::{DocId, Document, DocumentStore, StoreError, ViewFn};

struct Attachment {
    #[allow(dead_code)]
    content_type: String,
    bytes: Vec<u8>,
}

struct Stored {
    doc: Document,
    attachments: HashMap<String, Attachment>,
}

/// Process-local [`DocumentStore`] with the same revision-conflict semantics
/// as a remote backend. Views are evaluated on read; the store is small
/// enough in every test and dev deployment that index maintenance on write
/// would be wasted machinery.
pub struct MemoryStore {
    inner: Mutex<HashMap<DocId, Stored>>,
    views: HashMap<String, ViewFn>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            views: HashMap::new(),
        }
    }

    /// Build a store with the given named views registered, mirroring the
    /// view-synchronization step a real backend performs at startup.
    pub fn with_views(views: impl IntoIterator<Item = (&'static str, ViewFn)>) -> Self {
        let mut store = Self::new();
        for (name, f) in views {
            store.views.insert(name.to_string(), f);
        }
        store
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn create(
        &self,
        kind: &str,
        body: serde_json::Value,
    ) -> Result<Document, Report<StoreError>> {
        let doc = Document {
            id: DocId::new(),
            revision: 1,
            kind: kind.to_string(),
            body,
        };
        self.inner.lock().insert(
            doc.id,
            Stored {
                doc: doc.clone(),
                attachments: HashMap::new(),
            },
        );
        Ok(doc)
    }

    async fn load(&self, id: DocId) -> Result<Document, Report<StoreError>> {
        self.inner
            .lock()
            .get(&id)
            .map(|s| s.doc.clone())
            .ok_or_else(|| Report::new(StoreError::NotFound(id)))
    }

    async fn store(&self, doc: &mut Document) -> Result<(), Report<StoreError>> {
        let mut inner = self.inner.lock();
        let stored = inner
            .get_mut(&doc.id)
            .ok_or_else(|| Report::new(StoreError::NotFound(doc.id)))?;
        if stored.doc.revision != doc.revision {
            return Err(Report::new(StoreError::Conflict {
                stored: stored.doc.revision,
            }));
        }
        doc.revision += 1;
        stored.doc = doc.clone();
        Ok(())
    }

    async fn put_attachment(
        &self,
        id: DocId,
        name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<(), Report<StoreError>> {
        let mut inner = self.inner.lock();
        let stored = inner
            .get_mut(&id)
            .ok_or_else(|| Report::new(StoreError::NotFound(id)))?;
        stored.attachments.insert(
            name.to_string(),
            Attachment {
                content_type: content_type.to_string(),
                bytes,
            },
        );
        Ok(())
    }

    async fn get_attachment(&self, id: DocId, name: &str) -> Result<Vec<u8>, Report<StoreError>> {
        let inner = self.inner.lock();
        let stored = inner
            .get(&id)
            .ok_or_else(|| Report::new(StoreError::NotFound(id)))?;
        stored
            .attachments
            .get(name)
            .map(|a| a.bytes.clone())
            .ok_or_else(|| {
                Report::new(StoreError::AttachmentMissing {
                    id,
                    name: name.to_string(),
                })
            })
    }

    async fn list_attachments(&self, id: DocId) -> Result<Vec<String>, Report<StoreError>> {
        let inner = self.inner.lock();
        let stored = inner
            .get(&id)
            .ok_or_else(|| Report::new(StoreError::NotFound(id)))?;
        let mut names: Vec<String> = stored.attachments.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn view(&self, view: &str, key: &str) -> Result<Vec<Document>, Report<StoreError>> {
        let f = self
            .views
            .get(view)
            .copied()
            .ok_or_else(|| Report::new(StoreError::UnknownView(view.to_string())))?;
        let inner = self.inner.lock();
        let mut hits: Vec<Document> = inner
            .values()
            .filter(|s| f(&s.doc).iter().any(|k| k == key))
            .map(|s| s.doc.clone())
            .collect();
        hits.sort_by_key(|d| d.id);
        Ok(hits)
    }
}
