//! Translates sandbox watch notifications into ledger acknowledgements and
//! work-queue enqueues for the owning set, and keeps the sandbox cache in
//! step with the watch. Notifications for sandboxes without a SandboxSet
//! controller owner are dropped.

use crate::sandboxset::classify::{classify, SandboxGroup};
use crate::sandboxset::crd::Sandbox;
use crate::sandboxset::expectations::{ScaleAction, ScaleExpectations};
use crate::sandboxset::kube_store::SandboxCache;
use crate::sandboxset::queue::WorkQueue;
use crate::sandboxset::store::ObjectKey;
use chrono::Utc;
use kube::ResourceExt;
use kube_runtime::watcher;
use std::collections::HashSet;
use std::sync::Arc;

pub struct EventRouter {
    cache: Arc<SandboxCache>,
    scale_up: Arc<ScaleExpectations>,
    scale_down: Arc<ScaleExpectations>,
    queue: Arc<WorkQueue>,
}

/// Key of the set controlling a sandbox, when there is one.
fn owning_set_key(sandbox: &Sandbox) -> Option<ObjectKey> {
    let owner = sandbox.owned_by_set()?;
    Some(ObjectKey::new(
        &sandbox.namespace().unwrap_or_default(),
        &owner.name,
    ))
}

impl EventRouter {
    pub fn new(
        cache: Arc<SandboxCache>,
        scale_up: Arc<ScaleExpectations>,
        scale_down: Arc<ScaleExpectations>,
        queue: Arc<WorkQueue>,
    ) -> Self {
        Self {
            cache,
            scale_up,
            scale_down,
            queue,
        }
    }

    /// Feed one watch notification through the router.
    pub fn handle(&self, event: watcher::Event<Sandbox>) {
        match event {
            watcher::Event::Applied(sandbox) => self.applied(sandbox),
            watcher::Event::Deleted(sandbox) => self.deleted(sandbox),
            watcher::Event::Restarted(sandboxes) => self.restarted(sandboxes),
        }
    }

    fn applied(&self, sandbox: Sandbox) {
        let previous = self.cache.upsert(sandbox.clone());
        let set_key = match owning_set_key(&sandbox) {
            Some(key) => key,
            None => return,
        };

        let previous = match previous {
            // first sighting confirms a creation
            None => {
                self.scale_up
                    .observe(&set_key, ScaleAction::Create, &sandbox.name());
                self.queue.add(set_key);
                return;
            }
            Some(previous) => previous,
        };

        match (classify(&previous), classify(&sandbox)) {
            (Ok(before), Ok(after)) => {
                if before.group == after.group {
                    return;
                }
                if before.group == SandboxGroup::Creating
                    && after.group == SandboxGroup::Available
                {
                    log_available_latency(&sandbox);
                }
                self.queue.add(set_key);
            }
            // let the reconciler trip over the unknown state and report it
            _ => self.queue.add(set_key),
        }
    }

    fn deleted(&self, sandbox: Sandbox) {
        self.cache.remove(&ObjectKey::from_resource(&sandbox));
        if let Some(set_key) = owning_set_key(&sandbox) {
            self.scale_down
                .observe(&set_key, ScaleAction::Delete, &sandbox.name());
            self.queue.add(set_key);
        }
    }

    /// A relist after a watch gap: resync the cache, acknowledge whatever
    /// happened while the watch was away, and wake every affected set.
    fn restarted(&self, sandboxes: Vec<Sandbox>) {
        let mut owners: HashSet<ObjectKey> =
            sandboxes.iter().filter_map(owning_set_key).collect();

        let (added, removed) = self.cache.replace_all(sandboxes);
        for sandbox in &added {
            if let Some(set_key) = owning_set_key(sandbox) {
                self.scale_up
                    .observe(&set_key, ScaleAction::Create, &sandbox.name());
            }
        }
        for sandbox in &removed {
            if let Some(set_key) = owning_set_key(sandbox) {
                self.scale_down
                    .observe(&set_key, ScaleAction::Delete, &sandbox.name());
                owners.insert(set_key);
            }
        }

        for set_key in owners {
            self.queue.add(set_key);
        }
    }
}

fn log_available_latency(sandbox: &Sandbox) {
    let now = Utc::now();
    let created = sandbox
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|time| time.0);
    let ready_at = sandbox
        .ready_condition()
        .and_then(|condition| condition.last_transition_time);

    let ready_latency_ms = match (created, ready_at) {
        (Some(created), Some(ready)) => (ready - created).num_milliseconds(),
        _ => -1,
    };
    let post_ready_ms = match ready_at {
        Some(ready) => (now - ready).num_milliseconds(),
        None => -1,
    };
    tracing::info!(
        sandbox = %ObjectKey::from_resource(sandbox),
        ready_latency_ms,
        post_ready_ms,
        "sandbox became available"
    );
}
