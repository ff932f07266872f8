//! Custom resources for the sandbox pool: the declarative `SandboxSet` and
//! the individual `Sandbox` slots it manages.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Declares a pool of pre-warmed sandboxes: the controller keeps
/// `replicas` sandboxes either booting or available for claim.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "sandboxes.io",
    version = "v1alpha1",
    kind = "SandboxSet",
    plural = "sandboxsets",
    status = "SandboxSetStatus",
    shortname = "sbs",
    scale = r#"{"specReplicasPath":".spec.replicas", "statusReplicasPath":".status.replicas", "labelSelectorPath":".status.selector"}"#,
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current", "type":"integer", "jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Available", "type":"integer", "jsonPath":".status.availableReplicas"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSetSpec {
    /// Desired pool size, counting sandboxes that are booting or available.
    /// Claimed sandboxes no longer count; the pool refills behind them.
    pub replicas: i32,
    /// Template stamped onto every sandbox created for this set.
    pub template: SandboxTemplate,
    /// Claim templates carried onto sandboxes. Volume lifecycle is the
    /// sandbox controller's business, not the pool's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_templates: Option<Vec<VolumeClaimTemplate>>,
    /// Cluster template this set was derived from, recorded as a label on
    /// each sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<String>,
    /// Hints about pre-provisioned content, passed through to sandboxes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_content: Option<PersistentContentHints>,
    /// Pool sizing bounds. Only the min/max clamp is applied; the watermark
    /// fields are accepted for forward compatibility and not yet consulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<ScalingBounds>,
}

/// Observed pool state, written back after each reconcile.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSetStatus {
    /// Sandboxes counted toward the pool: booting plus available.
    pub replicas: i32,
    /// Sandboxes ready to be claimed.
    pub available_replicas: i32,
    /// Spec generation this status was computed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Content hash of the template the pool is currently stamped from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_revision: Option<String>,
    /// Label query backing the scale subresource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

/// Pod-shaped template a pool stamps its sandboxes from.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Hash, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxTemplate {
    #[serde(default)]
    pub metadata: TemplateMetadata,
    #[serde(default)]
    pub spec: SandboxRuntimeSpec,
}

/// Labels and annotations copied onto created sandboxes.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Hash, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// What actually runs inside a sandbox.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Hash, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRuntimeSpec {
    /// Container image booted for the sandbox.
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequests>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, Hash, PartialEq, JsonSchema)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Requested compute, as opaque quantity strings.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Hash, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequests {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// A persistent volume claim stamped alongside each sandbox.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Hash, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

/// Where pre-provisioned sandbox content comes from. Opaque to the pool;
/// the sandbox controller interprets it.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Hash, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistentContentHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// Bounds for the pool size. Watermark driven sizing is reserved.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Hash, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScalingBounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_watermark: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_watermark: Option<i32>,
}

/// A single pool slot: created warm, handed out on claim, deleted on drain.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "sandboxes.io",
    version = "v1alpha1",
    kind = "Sandbox",
    plural = "sandboxes",
    status = "SandboxStatus",
    shortname = "sbx",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSpec {
    #[serde(default)]
    pub runtime: SandboxRuntimeSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claims: Option<Vec<VolumeClaimTemplate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_content: Option<PersistentContentHints>,
}

/// Runtime state reported by the sandbox controller.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<SandboxPhase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<SandboxCondition>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum SandboxPhase {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    Terminating,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown", the condition convention.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Condition type flipped to "True" once a sandbox can serve a claimant.
pub const READY_CONDITION: &str = "Ready";

/// Claim state advertised through the state label. `Available` is written
/// once by the pool controller and never taken back by it; claimants move
/// sandboxes to `Running`/`Paused`; `Killing` marks a drain in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxState {
    Available,
    Running,
    Paused,
    Killing,
}

impl SandboxState {
    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "Available" => Some(SandboxState::Available),
            "Running" => Some(SandboxState::Running),
            "Paused" => Some(SandboxState::Paused),
            "Killing" => Some(SandboxState::Killing),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Available => "Available",
            SandboxState::Running => "Running",
            SandboxState::Paused => "Paused",
            SandboxState::Killing => "Killing",
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SandboxSet {
    /// Owner reference stamped onto every sandbox this set creates.
    pub fn controller_owner_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: SandboxSet::api_version(&()).to_string(),
            kind: SandboxSet::kind(&()).to_string(),
            name: self.name(),
            uid: self.uid().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// String form of the label query matching this set's unclaimed
    /// sandboxes, published for the scale subresource.
    pub fn selector_string(&self) -> String {
        format!(
            "{}={},{}=false",
            utils::POOL_LABEL,
            self.name(),
            utils::CLAIMED_LABEL
        )
    }
}

impl Sandbox {
    pub fn phase(&self) -> Option<SandboxPhase> {
        self.status.as_ref().and_then(|status| status.phase)
    }

    /// Raw value of the state label, when present and non-empty.
    pub fn state_label(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(utils::STATE_LABEL))
            .map(|value| value.as_str())
            .filter(|value| !value.is_empty())
    }

    /// True once the ready condition reports "True".
    pub fn is_ready(&self) -> bool {
        self.ready_condition()
            .map(|condition| condition.status == "True")
            .unwrap_or(false)
    }

    pub fn ready_condition(&self) -> Option<&SandboxCondition> {
        self.status
            .as_ref()
            .and_then(|status| status.conditions.iter().find(|c| c.type_ == READY_CONDITION))
    }

    /// Current lock token, when one is held.
    pub fn lock(&self) -> Option<&str> {
        self.annotation(utils::LOCK_ANNOTATION)
    }

    /// Who holds the lock token.
    pub fn lock_owner(&self) -> Option<&str> {
        self.annotation(utils::LOCK_OWNER_ANNOTATION)
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(|value| value.as_str())
            .filter(|value| !value.is_empty())
    }

    /// The SandboxSet controlling this sandbox, when it still has one.
    pub fn owned_by_set(&self) -> Option<&OwnerReference> {
        self.metadata
            .owner_references
            .as_ref()
            .and_then(|owners| {
                owners.iter().find(|owner| {
                    owner.controller == Some(true)
                        && owner.kind == SandboxSet::kind(&())
                        && owner
                            .api_version
                            .starts_with(utils::API_GROUP)
                })
            })
    }
}
