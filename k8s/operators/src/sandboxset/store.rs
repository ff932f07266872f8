//! Access to the declarative object store, abstracted so the reconciler can
//! run against the API server in production and an in-memory double in tests.

use crate::sandboxset::crd::{Sandbox, SandboxSet};
use async_trait::async_trait;
use kube::ResourceExt;
use snafu::Snafu;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Namespaced name of an object in the store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn from_resource<R: ResourceExt>(resource: &R) -> Self {
        Self {
            namespace: resource.namespace().unwrap_or_default(),
            name: resource.name(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Errors surfaced by store implementations. NotFound and Conflict are
/// distinct because callers treat them as flow control, not failures.
#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("'{}' was not found", key))]
    NotFound { key: String },
    #[snafu(display("conflicting write to '{}'", key))]
    Conflict { key: String },
    #[snafu(display("store request for '{}' failed: {}", key, reason))]
    Request { key: String, reason: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Read/write surface the reconciler needs. Reads of the owned sandbox list
/// may be served from a stale cache; everything the scaling protocol does
/// assumes exactly that.
#[async_trait]
pub trait PoolStore: Send + Sync + 'static {
    /// `Ok(None)` when the set does not exist.
    async fn get_set(&self, key: &ObjectKey) -> Result<Option<SandboxSet>, StoreError>;

    /// Full status write through the status subresource.
    async fn update_set_status(&self, set: &SandboxSet) -> Result<(), StoreError>;

    /// Sandboxes whose controller owner is the given set, resolved through
    /// an owner-uid index. Entries are shared, not copied.
    async fn list_owned(&self, set: &SandboxSet) -> Result<Vec<Arc<Sandbox>>, StoreError>;

    /// Uncached read of one sandbox; `Ok(None)` when it is gone.
    async fn get_sandbox(&self, key: &ObjectKey) -> Result<Option<Sandbox>, StoreError>;

    async fn create_sandbox(&self, sandbox: Sandbox) -> Result<Sandbox, StoreError>;

    /// Resource-version checked replace; `Conflict` when the write loses.
    async fn update_sandbox(&self, sandbox: &Sandbox) -> Result<Sandbox, StoreError>;

    /// Merge-patch labels onto a sandbox.
    async fn patch_sandbox_labels(
        &self,
        key: &ObjectKey,
        labels: BTreeMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Delete a sandbox. Deleting an absent sandbox is success.
    async fn delete_sandbox(&self, key: &ObjectKey) -> Result<(), StoreError>;
}
