//! K8S operators for the sandbox pool control plane.

pub mod sandboxset;
