//! The sandboxset operator keeps a pool of pre-warmed sandboxes at the size
//! each `SandboxSet` declares. Claimants take sandboxes out of the pool by
//! locking them; the reconciler refills, drains and garbage collects.

pub mod batch;
pub mod classify;
pub mod crd;
pub mod events;
pub mod expectations;
pub mod kube_store;
pub mod queue;
pub mod reconciler;
pub mod revision;
pub mod router;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
