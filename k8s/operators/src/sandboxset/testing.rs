//! Test doubles for the sandboxset controller: canned objects, an
//! in-memory store and a recording event sink.

use crate::sandboxset::crd::{
    Sandbox, SandboxCondition, SandboxPhase, SandboxSet, SandboxSetSpec, SandboxSetStatus,
    SandboxSpec, SandboxState, SandboxStatus, SandboxTemplate, SandboxRuntimeSpec,
    READY_CONDITION,
};
use crate::sandboxset::events::{EventPublisher, EventReason, EventTarget, PoolEvent};
use crate::sandboxset::store::{ObjectKey, PoolStore, StoreError};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub(crate) fn test_set(name: &str, replicas: i32) -> SandboxSet {
    let mut set = SandboxSet::new(
        name,
        SandboxSetSpec {
            replicas,
            template: SandboxTemplate {
                spec: SandboxRuntimeSpec {
                    image: "agent:v1".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        },
    );
    set.metadata.namespace = Some("default".to_string());
    set.metadata.uid = Some(format!("uid-{}", name));
    set.metadata.generation = Some(1);
    set
}

/// Builder for sandboxes in a chosen lifecycle configuration.
pub(crate) struct SandboxFixture {
    sandbox: Sandbox,
}

impl SandboxFixture {
    pub(crate) fn new(set: &SandboxSet, name: &str) -> Self {
        let mut sandbox = Sandbox::new(
            name,
            SandboxSpec {
                runtime: set.spec.template.spec.clone(),
                ..Default::default()
            },
        );
        sandbox.metadata.namespace = Some("default".to_string());
        sandbox.metadata.uid = Some(format!("uid-{}", name));
        sandbox.metadata.creation_timestamp = Some(Time(Utc::now()));
        let mut labels = BTreeMap::new();
        labels.insert(utils::POOL_LABEL.to_string(), set.name());
        labels.insert(utils::CLAIMED_LABEL.to_string(), "false".to_string());
        sandbox.metadata.labels = Some(labels);
        sandbox.metadata.owner_references = Some(vec![set.controller_owner_ref()]);
        Self { sandbox }
    }

    fn status_mut(&mut self) -> &mut SandboxStatus {
        self.sandbox.status.get_or_insert_with(Default::default)
    }

    pub(crate) fn phase(mut self, phase: SandboxPhase) -> Self {
        self.status_mut().phase = Some(phase);
        self
    }

    pub(crate) fn ready(mut self) -> Self {
        let condition = SandboxCondition {
            type_: READY_CONDITION.to_string(),
            status: "True".to_string(),
            last_transition_time: Some(Utc::now() - ChronoDuration::seconds(2)),
            ..Default::default()
        };
        self.status_mut().conditions.push(condition);
        self
    }

    pub(crate) fn state(self, state: SandboxState) -> Self {
        self.raw_state(state.as_str())
    }

    pub(crate) fn raw_state(mut self, value: &str) -> Self {
        self.sandbox
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(utils::STATE_LABEL.to_string(), value.to_string());
        self
    }

    pub(crate) fn lock(mut self, owner: &str) -> Self {
        let annotations = self
            .sandbox
            .metadata
            .annotations
            .get_or_insert_with(Default::default);
        annotations.insert(utils::LOCK_ANNOTATION.to_string(), "token".to_string());
        annotations.insert(utils::LOCK_OWNER_ANNOTATION.to_string(), owner.to_string());
        self
    }

    pub(crate) fn deleting(mut self) -> Self {
        self.sandbox.metadata.deletion_timestamp = Some(Time(Utc::now()));
        self
    }

    pub(crate) fn created_secs_ago(mut self, seconds: i64) -> Self {
        self.sandbox.metadata.creation_timestamp =
            Some(Time(Utc::now() - ChronoDuration::seconds(seconds)));
        self
    }

    pub(crate) fn build(self) -> Sandbox {
        self.sandbox
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub sets: HashMap<ObjectKey, SandboxSet>,
    pub sandboxes: HashMap<ObjectKey, Sandbox>,
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub status_writes: Vec<SandboxSetStatus>,
    pub label_patches: Vec<(String, BTreeMap<String, String>)>,
    /// Per sandbox name, how many upcoming updates lose the write race.
    pub update_conflicts: HashMap<String, u32>,
}

/// In-memory store. Unlike the cluster-backed one its reads are never
/// stale, which the tests exploit to pin down exact per-cycle behavior.
#[derive(Debug, Default)]
pub(crate) struct FakeStore {
    state: Mutex<FakeState>,
}

impl FakeStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn put_set(&self, set: SandboxSet) {
        let key = ObjectKey::from_resource(&set);
        self.state.lock().sets.insert(key, set);
    }

    pub(crate) fn put_sandbox(&self, sandbox: Sandbox) {
        let key = ObjectKey::from_resource(&sandbox);
        self.state.lock().sandboxes.insert(key, sandbox);
    }

    pub(crate) fn sandbox(&self, name: &str) -> Option<Sandbox> {
        self.state
            .lock()
            .sandboxes
            .get(&ObjectKey::new("default", name))
            .cloned()
    }

    pub(crate) fn sandbox_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .sandboxes
            .keys()
            .map(|key| key.name.clone())
            .collect();
        names.sort();
        names
    }

    pub(crate) fn created_names(&self) -> Vec<String> {
        self.state.lock().created.clone()
    }

    pub(crate) fn deleted_names(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    pub(crate) fn status_writes(&self) -> Vec<SandboxSetStatus> {
        self.state.lock().status_writes.clone()
    }

    pub(crate) fn label_patches(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.state.lock().label_patches.clone()
    }

    /// Make the next `times` updates of the named sandbox fail with a
    /// conflict, as if another writer kept winning the resource-version
    /// race.
    pub(crate) fn fail_updates_with_conflict(&self, name: &str, times: u32) {
        self.state
            .lock()
            .update_conflicts
            .insert(name.to_string(), times);
    }
}

#[async_trait]
impl PoolStore for FakeStore {
    async fn get_set(&self, key: &ObjectKey) -> Result<Option<SandboxSet>, StoreError> {
        Ok(self.state.lock().sets.get(key).cloned())
    }

    async fn update_set_status(&self, set: &SandboxSet) -> Result<(), StoreError> {
        let key = ObjectKey::from_resource(set);
        let mut state = self.state.lock();
        if let Some(status) = &set.status {
            state.status_writes.push(status.clone());
        }
        match state.sets.get_mut(&key) {
            Some(stored) => {
                stored.status = set.status.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn list_owned(&self, set: &SandboxSet) -> Result<Vec<Arc<Sandbox>>, StoreError> {
        let uid = set.uid().unwrap_or_default();
        let state = self.state.lock();
        let mut owned: Vec<Arc<Sandbox>> = state
            .sandboxes
            .values()
            .filter(|sandbox| {
                sandbox
                    .owned_by_set()
                    .map(|owner| owner.uid == uid)
                    .unwrap_or(false)
            })
            .map(|sandbox| Arc::new(sandbox.clone()))
            .collect();
        owned.sort_by(|a, b| a.name().cmp(&b.name()));
        Ok(owned)
    }

    async fn get_sandbox(&self, key: &ObjectKey) -> Result<Option<Sandbox>, StoreError> {
        Ok(self.state.lock().sandboxes.get(key).cloned())
    }

    async fn create_sandbox(&self, mut sandbox: Sandbox) -> Result<Sandbox, StoreError> {
        let key = ObjectKey::from_resource(&sandbox);
        sandbox.metadata.uid = Some(format!("uid-{}", key.name));
        sandbox.metadata.creation_timestamp = Some(Time(Utc::now()));
        let mut state = self.state.lock();
        state.created.push(key.name.clone());
        state.sandboxes.insert(key, sandbox.clone());
        Ok(sandbox)
    }

    async fn update_sandbox(&self, sandbox: &Sandbox) -> Result<Sandbox, StoreError> {
        let key = ObjectKey::from_resource(sandbox);
        let mut state = self.state.lock();
        if let Some(left) = state.update_conflicts.get_mut(&key.name) {
            if *left > 0 {
                *left -= 1;
                return Err(StoreError::Conflict {
                    key: key.to_string(),
                });
            }
        }
        if !state.sandboxes.contains_key(&key) {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }
        state.sandboxes.insert(key, sandbox.clone());
        Ok(sandbox.clone())
    }

    async fn patch_sandbox_labels(
        &self,
        key: &ObjectKey,
        labels: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.label_patches.push((key.name.clone(), labels.clone()));
        match state.sandboxes.get_mut(key) {
            Some(sandbox) => {
                sandbox
                    .metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .extend(labels);
                Ok(())
            }
            None => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn delete_sandbox(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.sandboxes.remove(key).is_some() {
            state.deleted.push(key.name.clone());
        }
        Ok(())
    }
}

/// Event sink capturing everything published.
#[derive(Debug, Default)]
pub(crate) struct RecordingEvents {
    records: Mutex<Vec<(EventReason, String)>>,
}

impl RecordingEvents {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn count(&self, reason: EventReason) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|(seen, _)| *seen == reason)
            .count()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(&self, _target: &EventTarget, event: PoolEvent) {
        self.records.lock().push((event.reason, event.message));
    }
}
