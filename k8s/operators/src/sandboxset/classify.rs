//! Lifecycle grouping. Every owned sandbox lands in exactly one group, and
//! the grouping depends only on the sandbox's observed fields.

use crate::sandboxset::crd::{Sandbox, SandboxPhase, SandboxState};
use kube::ResourceExt;
use std::fmt;
use std::sync::Arc;

/// The four lifecycle groups. Transitions are one way: a sandbox boots
/// (`Creating`), becomes claimable (`Available`), is taken (`Used`) and
/// eventually dies (`Dead`); only `Creating -> Available` is driven by the
/// sandbox reaching ready.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxGroup {
    Creating,
    Available,
    Used,
    Dead,
}

/// A group plus the observation that put the sandbox there.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classified {
    pub group: SandboxGroup,
    pub reason: &'static str,
}

impl Classified {
    fn new(group: SandboxGroup, reason: &'static str) -> Self {
        Self { group, reason }
    }
}

/// A state label outside the known set. The reconcile fails so an operator
/// can look at what wrote it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownState {
    pub sandbox: String,
    pub value: String,
}

impl fmt::Display for UnknownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sandbox '{}' carries unknown state label '{}'",
            self.sandbox, self.value
        )
    }
}

impl std::error::Error for UnknownState {}

/// Pure mapping of observed fields to a lifecycle group.
pub fn classify(sandbox: &Sandbox) -> Result<Classified, UnknownState> {
    if sandbox.metadata.deletion_timestamp.is_some() {
        return Ok(Classified::new(SandboxGroup::Dead, "deleted"));
    }

    match sandbox.phase() {
        None => Ok(Classified::new(SandboxGroup::Creating, "unscheduled")),
        Some(SandboxPhase::Pending) => Ok(Classified::new(SandboxGroup::Creating, "booting")),
        Some(SandboxPhase::Failed) => Ok(Classified::new(SandboxGroup::Dead, "failed")),
        Some(SandboxPhase::Succeeded) => Ok(Classified::new(SandboxGroup::Dead, "exited")),
        Some(SandboxPhase::Terminating) => {
            Ok(Classified::new(SandboxGroup::Dead, "terminating"))
        }
        Some(SandboxPhase::Running) | Some(SandboxPhase::Paused) => {
            match sandbox.state_label() {
                // ready but the reconciler has not labelled it yet
                None => Ok(Classified::new(SandboxGroup::Creating, "unlabelled")),
                Some(value) => match SandboxState::from_label(value) {
                    Some(SandboxState::Available) => {
                        Ok(Classified::new(SandboxGroup::Available, "available"))
                    }
                    Some(SandboxState::Running) | Some(SandboxState::Paused) => {
                        Ok(Classified::new(SandboxGroup::Used, "claimed"))
                    }
                    Some(SandboxState::Killing) => {
                        Ok(Classified::new(SandboxGroup::Dead, "killing"))
                    }
                    None => Err(UnknownState {
                        sandbox: sandbox.name(),
                        value: value.to_string(),
                    }),
                },
            }
        }
    }
}

/// Per-reconcile partition of the owned sandbox list.
#[derive(Debug, Default)]
pub struct GroupedSandboxes {
    pub creating: Vec<Arc<Sandbox>>,
    pub available: Vec<Arc<Sandbox>>,
    pub used: Vec<Arc<Sandbox>>,
    pub dead: Vec<Arc<Sandbox>>,
}

impl GroupedSandboxes {
    pub fn insert(&mut self, group: SandboxGroup, sandbox: Arc<Sandbox>) {
        match group {
            SandboxGroup::Creating => self.creating.push(sandbox),
            SandboxGroup::Available => self.available.push(sandbox),
            SandboxGroup::Used => self.used.push(sandbox),
            SandboxGroup::Dead => self.dead.push(sandbox),
        }
    }

    /// Sandboxes counted toward the declared pool size.
    pub fn pool_size(&self) -> i32 {
        (self.creating.len() + self.available.len()) as i32
    }
}
