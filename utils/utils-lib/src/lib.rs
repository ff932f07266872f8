/// Tracing initialisation with optional jaeger export.
pub mod tracing_telemetry;

use std::time::Duration;

/// The api group all pool labels and annotations live under.
pub const API_GROUP: &str = "sandboxes.io";

/// Label recording the owning pool's name on every sandbox.
pub const POOL_LABEL: &str = "sandboxes.io/pool";
/// Label recording the template content hash a sandbox was stamped from.
pub const TEMPLATE_HASH_LABEL: &str = "sandboxes.io/template-hash";
/// Label telling claimants apart from warm pool slots ("false"/"true").
pub const CLAIMED_LABEL: &str = "sandboxes.io/claimed";
/// Label set to the sandbox's own name once it is handed out as available.
pub const SANDBOX_ID_LABEL: &str = "sandboxes.io/sandbox-id";
/// Label carrying the claim state of a sandbox.
pub const STATE_LABEL: &str = "sandboxes.io/state";
/// Label referencing the cluster template a set was built from, when any.
pub const TEMPLATE_REF_LABEL: &str = "sandboxes.io/template";

/// Annotation holding the current lock token of a sandbox.
pub const LOCK_ANNOTATION: &str = "sandboxes.io/lock";
/// Annotation naming whoever holds the lock token.
pub const LOCK_OWNER_ANNOTATION: &str = "sandboxes.io/lock-owner";
/// Lock owner written by the pool controller while it tears a sandbox down.
pub const SCALE_DOWN_LOCK_OWNER: &str = "manager-scale-down";

/// Annotation identifying who created an object.
pub const CREATED_BY_KEY: &str = "sandboxes.io/created-by";
/// Value of [`CREATED_BY_KEY`] for objects created by this operator.
pub const SBS_OPERATOR: &str = "sandboxset-operator";

/// Environment variable gating the pool controller on and off.
pub const POOL_GUARD_GATE: &str = "SANDBOX_POOL_GUARD";

/// Default number of concurrent set reconciles.
pub const DEFAULT_WORKERS: &str = "3";
/// Default first wave size for bulk sandbox operations.
pub const DEFAULT_INITIAL_BATCH_SIZE: &str = "16";

/// How long pending scale intents may go unconfirmed before they are
/// force cleared.
pub const EXPECTATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Requeue delay after a force clear.
pub const EXPECTATION_RETRY_PERIOD: Duration = Duration::from_secs(3);
/// Window after a scale up during which scale down is held back.
pub const SCALE_UP_COOLDOWN: Duration = Duration::from_secs(5);

/// First retry delay applied to a failed reconcile.
pub const RECONCILE_BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Retry delay ceiling for repeatedly failing reconciles.
pub const RECONCILE_BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

/// The pool controller stands down when the gate is explicitly disabled.
/// Anything other than an explicit off value counts as enabled.
pub fn pool_guard_enabled() -> bool {
    match std::env::var(POOL_GUARD_GATE) {
        Ok(value) => !matches!(value.to_lowercase().as_str(), "0" | "false" | "off"),
        Err(_) => true,
    }
}

/// Git revision baked in at build time, when the sources were in a git tree.
pub fn raw_version_str() -> &'static str {
    git_version::git_version!(args = ["--abbrev=12", "--always"], fallback = "unknown")
}

/// Package description baked in at build time.
#[macro_export]
macro_rules! package_description {
    () => {
        env!("CARGO_PKG_DESCRIPTION")
    };
}

/// Cargo version plus the git revision it was built from.
#[macro_export]
macro_rules! version_info_str {
    () => {
        format!("{} ({})", env!("CARGO_PKG_VERSION"), $crate::raw_version_str())
    };
}

/// One line startup banner, printed before tracing is up.
#[macro_export]
macro_rules! print_package_info {
    () => {
        println!("{} {}", $crate::package_description!(), $crate::version_info_str!());
    };
}
