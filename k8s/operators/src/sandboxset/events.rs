//! Operator-facing events. These tell a human what the pool did and why;
//! they are not a log. All pool events are attached to the owning set so
//! `kubectl describe` on it reads as a history of the pool.

use crate::sandboxset::crd::SandboxSet;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event as K8sEvent, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::error;

const WHO_AM_I_SHORT: &str = "sbs-operator";

/// Machine readable reasons carried on pool events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventReason {
    SandboxCreated,
    CreateSandboxFailed,
    SandboxAvailable,
    SandboxScaledDown,
    SandboxReleased,
    FailedSandboxDeleted,
}

impl EventReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventReason::SandboxCreated => "SandboxCreated",
            EventReason::CreateSandboxFailed => "CreateSandboxFailed",
            EventReason::SandboxAvailable => "SandboxAvailable",
            EventReason::SandboxScaledDown => "SandboxScaledDown",
            EventReason::SandboxReleased => "SandboxReleased",
            EventReason::FailedSandboxDeleted => "FailedSandboxDeleted",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// One human-oriented notification about a pool.
#[derive(Clone, Debug)]
pub struct PoolEvent {
    pub type_: EventType,
    pub reason: EventReason,
    /// What was being attempted when the event fired.
    pub action: &'static str,
    pub message: String,
}

impl PoolEvent {
    pub fn normal(reason: EventReason, action: &'static str, message: String) -> Self {
        Self {
            type_: EventType::Normal,
            reason,
            action,
            message,
        }
    }

    pub fn warning(reason: EventReason, action: &'static str, message: String) -> Self {
        Self {
            type_: EventType::Warning,
            reason,
            action,
            message,
        }
    }
}

/// The object an event is filed against.
#[derive(Clone, Debug)]
pub struct EventTarget {
    pub namespace: String,
    pub name: String,
    pub kind: String,
    pub api_version: String,
    pub uid: Option<String>,
}

impl EventTarget {
    pub fn for_set(set: &SandboxSet) -> Self {
        Self {
            namespace: set.namespace().unwrap_or_default(),
            name: set.name(),
            kind: SandboxSet::kind(&()).to_string(),
            api_version: SandboxSet::api_version(&()).to_string(),
            uid: set.uid(),
        }
    }
}

/// Sink for pool events. Publishing is best effort everywhere; a dropped
/// event never fails a reconcile.
#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    async fn publish(&self, target: &EventTarget, event: PoolEvent);
}

/// Posts events to the API server under the operator's identity.
pub struct KubeEventPublisher {
    client: Client,
}

impl KubeEventPublisher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, target: &EventTarget, event: PoolEvent) {
        let events: Api<K8sEvent> = Api::namespaced(self.client.clone(), &target.namespace);
        let time = Utc::now();

        let metadata = ObjectMeta {
            // the name must be unique for all events we post
            generate_name: Some(format!("{}.{:x}", target.name, time.timestamp())),
            namespace: Some(target.namespace.clone()),
            ..Default::default()
        };

        let _ = events
            .create(
                &PostParams::default(),
                &K8sEvent {
                    event_time: Some(MicroTime(time)),
                    involved_object: ObjectReference {
                        api_version: Some(target.api_version.clone()),
                        kind: Some(target.kind.clone()),
                        name: Some(target.name.clone()),
                        namespace: Some(target.namespace.clone()),
                        uid: target.uid.clone(),
                        ..Default::default()
                    },
                    action: Some(event.action.into()),
                    reason: Some(event.reason.as_str().into()),
                    type_: Some(event.type_.as_str().into()),
                    metadata,
                    reporting_component: Some(WHO_AM_I_SHORT.into()),
                    reporting_instance: Some(
                        std::env::var("MY_POD_NAME")
                            .ok()
                            .unwrap_or_else(|| WHO_AM_I_SHORT.into()),
                    ),
                    message: Some(event.message),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| error!(?e, "failed to post event"));
    }
}
