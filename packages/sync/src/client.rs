//! The server seam.
//!
//! The concrete REST/socket client lives outside this crate; these traits
//! are the surface the sync layer drives. Resource collections are fetched
//! as one bundle per document and pushed as wire patch batches
//! (`{op, path, value?}` with the resource kind as the path head).
//!
//! `MemoryClient` is the in-memory stand-in used by tests, shipped beside
//! the traits the way a mock filesystem ships beside the real one.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use thiserror::Error;

use easel_model::{Connector, DocumentMeta, Element, Group, Patch, Step};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("asset upload failed: {0}")]
    Upload(String),
}

/// Everything the server holds for one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentBundle {
    pub document: DocumentMeta,
    pub elements: Vec<Element>,
    pub connectors: Vec<Connector>,
    pub groups: Vec<Group>,
    pub steps: Vec<Step>,
}

/// Fetch and push persisted resources for a document.
pub trait ResourceClient: Send + Sync {
    fn fetch_document(
        &self,
        doc_id: &str,
    ) -> BoxFuture<'static, Result<DocumentBundle, ClientError>>;

    fn push_patches(
        &self,
        doc_id: &str,
        patches: Vec<Patch>,
    ) -> BoxFuture<'static, Result<(), ClientError>>;
}

/// Upload a locally-referenced blob; resolves to its persisted URL.
pub trait AssetClient: Send + Sync {
    fn upload(&self, asset_key: &str) -> BoxFuture<'static, Result<String, ClientError>>;
}

#[derive(Default)]
struct MemoryInner {
    bundle: DocumentBundle,
    pushes: Vec<Vec<Patch>>,
    fail_next_push: bool,
    uploads: Vec<String>,
    fail_uploads: bool,
}

/// In-memory server double with scripted failures.
#[derive(Clone, Default)]
pub struct MemoryClient {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bundle(bundle: DocumentBundle) -> Self {
        let client = Self::new();
        client.seed(bundle);
        client
    }

    /// Replace the served bundle.
    pub fn seed(&self, bundle: DocumentBundle) {
        self.inner.lock().unwrap().bundle = bundle;
    }

    /// Make the next push fail with a transport error.
    pub fn fail_next_push(&self) {
        self.inner.lock().unwrap().fail_next_push = true;
    }

    /// Make every upload fail.
    pub fn fail_uploads(&self) {
        self.inner.lock().unwrap().fail_uploads = true;
    }

    /// Every batch pushed so far, in push order.
    pub fn pushed_batches(&self) -> Vec<Vec<Patch>> {
        self.inner.lock().unwrap().pushes.clone()
    }

    /// Every asset key uploaded so far.
    pub fn uploaded_keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().uploads.clone()
    }
}

impl ResourceClient for MemoryClient {
    fn fetch_document(
        &self,
        doc_id: &str,
    ) -> BoxFuture<'static, Result<DocumentBundle, ClientError>> {
        let inner = self.inner.clone();
        let doc_id = doc_id.to_string();
        Box::pin(async move {
            let inner = inner.lock().unwrap();
            if inner.bundle.document.id != doc_id {
                return Err(ClientError::NotFound(doc_id));
            }
            Ok(inner.bundle.clone())
        })
    }

    fn push_patches(
        &self,
        _doc_id: &str,
        patches: Vec<Patch>,
    ) -> BoxFuture<'static, Result<(), ClientError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut inner = inner.lock().unwrap();
            if inner.fail_next_push {
                inner.fail_next_push = false;
                return Err(ClientError::Transport("connection reset".to_string()));
            }
            inner.pushes.push(patches);
            Ok(())
        })
    }
}

impl AssetClient for MemoryClient {
    fn upload(&self, asset_key: &str) -> BoxFuture<'static, Result<String, ClientError>> {
        let inner = self.inner.clone();
        let asset_key = asset_key.to_string();
        Box::pin(async move {
            let mut inner = inner.lock().unwrap();
            if inner.fail_uploads {
                return Err(ClientError::Upload(format!("rejected: {}", asset_key)));
            }
            inner.uploads.push(asset_key.clone());
            Ok(format!("https://assets.easel.dev/{}", asset_key))
        })
    }
}
