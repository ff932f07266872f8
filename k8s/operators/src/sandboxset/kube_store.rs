//! Kubernetes-backed store: writes go straight to the API server, reads of
//! the owned sandbox list are served from a watch-fed cache with an
//! owner-uid index. The cache lags the server; the expectations ledgers
//! exist to make that safe.

use crate::sandboxset::crd::{Sandbox, SandboxSet};
use crate::sandboxset::store::{ObjectKey, PoolStore, StoreError};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Default)]
struct CacheInner {
    by_key: HashMap<ObjectKey, Arc<Sandbox>>,
    by_owner: HashMap<String, HashSet<ObjectKey>>,
}

impl CacheInner {
    fn insert(&mut self, sandbox: Arc<Sandbox>) -> Option<Arc<Sandbox>> {
        let key = ObjectKey::from_resource(&*sandbox);
        let previous = self.by_key.insert(key.clone(), sandbox.clone());
        if let Some(previous) = &previous {
            self.unindex(previous, &key);
        }
        if let Some(owner) = sandbox.owned_by_set() {
            self.by_owner
                .entry(owner.uid.clone())
                .or_insert_with(HashSet::new)
                .insert(key);
        }
        previous
    }

    fn remove(&mut self, key: &ObjectKey) -> Option<Arc<Sandbox>> {
        let removed = self.by_key.remove(key);
        if let Some(removed) = &removed {
            self.unindex(removed, key);
        }
        removed
    }

    fn unindex(&mut self, sandbox: &Sandbox, key: &ObjectKey) {
        if let Some(owner) = sandbox.owned_by_set() {
            if let Some(keys) = self.by_owner.get_mut(&owner.uid) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_owner.remove(&owner.uid);
                }
            }
        }
    }
}

/// Watch-fed view of the sandboxes, indexed by the owning set's uid. The
/// event router keeps it current; the store reads from it.
#[derive(Debug, Default)]
pub struct SandboxCache {
    inner: RwLock<CacheInner>,
}

impl SandboxCache {
    /// Upsert one sandbox, returning the previously cached version.
    pub fn upsert(&self, sandbox: Sandbox) -> Option<Arc<Sandbox>> {
        self.inner.write().insert(Arc::new(sandbox))
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<Arc<Sandbox>> {
        self.inner.write().remove(key)
    }

    /// Swap in a freshly listed world, returning what appeared and what
    /// vanished while the watch was away.
    pub fn replace_all(
        &self,
        sandboxes: Vec<Sandbox>,
    ) -> (Vec<Arc<Sandbox>>, Vec<Arc<Sandbox>>) {
        let mut fresh = CacheInner::default();
        for sandbox in sandboxes {
            fresh.insert(Arc::new(sandbox));
        }

        let mut inner = self.inner.write();
        let added = fresh
            .by_key
            .iter()
            .filter(|(key, _)| !inner.by_key.contains_key(*key))
            .map(|(_, sandbox)| sandbox.clone())
            .collect();
        let removed = inner
            .by_key
            .iter()
            .filter(|(key, _)| !fresh.by_key.contains_key(*key))
            .map(|(_, sandbox)| sandbox.clone())
            .collect();
        *inner = fresh;
        (added, removed)
    }

    /// Sandboxes controlled by the set with the given uid, name ordered.
    pub fn owned_by(&self, uid: &str) -> Vec<Arc<Sandbox>> {
        let inner = self.inner.read();
        let mut owned: Vec<Arc<Sandbox>> = inner
            .by_owner
            .get(uid)
            .into_iter()
            .flatten()
            .filter_map(|key| inner.by_key.get(key).cloned())
            .collect();
        owned.sort_by(|a, b| a.name().cmp(&b.name()));
        owned
    }
}

/// Store implementation against a live cluster.
pub struct KubeStore {
    client: Client,
    cache: Arc<SandboxCache>,
}

impl KubeStore {
    pub fn new(client: Client, cache: Arc<SandboxCache>) -> Self {
        Self { client, cache }
    }

    fn sets(&self, namespace: &str) -> Api<SandboxSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn sandboxes(&self, namespace: &str) -> Api<Sandbox> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn response_code(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

fn store_error(key: &ObjectKey, error: kube::Error) -> StoreError {
    match response_code(&error) {
        Some(404) => StoreError::NotFound {
            key: key.to_string(),
        },
        Some(409) => StoreError::Conflict {
            key: key.to_string(),
        },
        _ => StoreError::Request {
            key: key.to_string(),
            reason: error.to_string(),
        },
    }
}

#[async_trait]
impl PoolStore for KubeStore {
    async fn get_set(&self, key: &ObjectKey) -> Result<Option<SandboxSet>, StoreError> {
        match self.sets(&key.namespace).get(&key.name).await {
            Ok(set) => Ok(Some(set)),
            Err(error) if response_code(&error) == Some(404) => Ok(None),
            Err(error) => Err(store_error(key, error)),
        }
    }

    async fn update_set_status(&self, set: &SandboxSet) -> Result<(), StoreError> {
        let key = ObjectKey::from_resource(set);
        let data = serde_json::to_vec(set).map_err(|error| StoreError::Request {
            key: key.to_string(),
            reason: error.to_string(),
        })?;
        self.sets(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), data)
            .await
            .map(|_| ())
            .map_err(|error| store_error(&key, error))
    }

    async fn list_owned(&self, set: &SandboxSet) -> Result<Vec<Arc<Sandbox>>, StoreError> {
        let uid = match set.uid() {
            Some(uid) => uid,
            None => return Ok(Vec::new()),
        };
        Ok(self.cache.owned_by(&uid))
    }

    async fn get_sandbox(&self, key: &ObjectKey) -> Result<Option<Sandbox>, StoreError> {
        match self.sandboxes(&key.namespace).get(&key.name).await {
            Ok(sandbox) => Ok(Some(sandbox)),
            Err(error) if response_code(&error) == Some(404) => Ok(None),
            Err(error) => Err(store_error(key, error)),
        }
    }

    async fn create_sandbox(&self, sandbox: Sandbox) -> Result<Sandbox, StoreError> {
        let key = ObjectKey::from_resource(&sandbox);
        self.sandboxes(&key.namespace)
            .create(&PostParams::default(), &sandbox)
            .await
            .map_err(|error| store_error(&key, error))
    }

    async fn update_sandbox(&self, sandbox: &Sandbox) -> Result<Sandbox, StoreError> {
        let key = ObjectKey::from_resource(sandbox);
        self.sandboxes(&key.namespace)
            .replace(&key.name, &PostParams::default(), sandbox)
            .await
            .map_err(|error| store_error(&key, error))
    }

    async fn patch_sandbox_labels(
        &self,
        key: &ObjectKey,
        labels: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        self.sandboxes(&key.namespace)
            .patch(
                &key.name,
                &PatchParams::apply(utils::SBS_OPERATOR),
                &Patch::Merge(&patch),
            )
            .await
            .map(|_| ())
            .map_err(|error| store_error(key, error))
    }

    async fn delete_sandbox(&self, key: &ObjectKey) -> Result<(), StoreError> {
        match self
            .sandboxes(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if response_code(&error) == Some(404) => Ok(()),
            Err(error) => Err(store_error(key, error)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sandboxset::crd::SandboxPhase;
    use crate::sandboxset::testing::{test_set, SandboxFixture};

    #[test]
    fn owner_index_tracks_upserts_and_removals() {
        let cache = SandboxCache::default();
        let set = test_set("warm", 2);
        let uid = set.uid().unwrap();

        cache.upsert(SandboxFixture::new(&set, "warm-abc12").build());
        cache.upsert(SandboxFixture::new(&set, "warm-def34").build());
        assert_eq!(cache.owned_by(&uid).len(), 2);

        cache.remove(&ObjectKey::new("default", "warm-abc12"));
        let owned = cache.owned_by(&uid);
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].name(), "warm-def34");
    }

    #[test]
    fn upsert_returns_the_previous_version() {
        let cache = SandboxCache::default();
        let set = test_set("warm", 1);

        assert!(cache
            .upsert(SandboxFixture::new(&set, "warm-abc12").build())
            .is_none());
        let previous = cache
            .upsert(
                SandboxFixture::new(&set, "warm-abc12")
                    .phase(SandboxPhase::Running)
                    .build(),
            )
            .expect("previous version");
        assert!(previous.phase().is_none());
    }

    #[test]
    fn release_drops_a_sandbox_from_the_index() {
        let cache = SandboxCache::default();
        let set = test_set("warm", 1);
        let uid = set.uid().unwrap();

        cache.upsert(SandboxFixture::new(&set, "warm-abc12").build());
        let mut released = SandboxFixture::new(&set, "warm-abc12").build();
        released.metadata.owner_references = None;
        cache.upsert(released);
        assert!(cache.owned_by(&uid).is_empty());
    }

    #[test]
    fn api_error_codes_map_onto_store_errors() {
        let key = ObjectKey::new("default", "warm-abc12");
        let api_error = |code: u16| {
            kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "from the api server".to_string(),
                reason: "testing".to_string(),
                code,
            })
        };

        assert!(store_error(&key, api_error(404)).is_not_found());
        assert!(store_error(&key, api_error(409)).is_conflict());
        assert!(matches!(
            store_error(&key, api_error(500)),
            StoreError::Request { .. }
        ));
    }

    #[test]
    fn replace_all_reports_the_diff() {
        let cache = SandboxCache::default();
        let set = test_set("warm", 2);

        cache.upsert(SandboxFixture::new(&set, "warm-abc12").build());
        cache.upsert(SandboxFixture::new(&set, "warm-def34").build());

        let (added, removed) = cache.replace_all(vec![
            SandboxFixture::new(&set, "warm-def34").build(),
            SandboxFixture::new(&set, "warm-ghi56").build(),
        ]);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].name(), "warm-ghi56");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].name(), "warm-abc12");
    }
}
