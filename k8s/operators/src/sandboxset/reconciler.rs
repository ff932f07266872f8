//! The reconcile loop: drive each set's observed pool toward its declared
//! size, without over- or under-provisioning while the store's view lags
//! behind our own writes.

use crate::sandboxset::batch::slow_start_batch;
use crate::sandboxset::classify::{classify, GroupedSandboxes, UnknownState};
use crate::sandboxset::crd::{
    Sandbox, SandboxPhase, SandboxSet, SandboxSetStatus, SandboxSpec, SandboxState,
};
use crate::sandboxset::events::{EventPublisher, EventReason, EventTarget, PoolEvent};
use crate::sandboxset::expectations::{ExpectationStatus, ScaleAction, ScaleExpectations};
use crate::sandboxset::queue::WorkQueue;
use crate::sandboxset::revision::template_revision;
use crate::sandboxset::store::{ObjectKey, PoolStore, StoreError};
use kube::ResourceExt;
use parking_lot::Mutex;
use rand::Rng;
use shutdown::Shutdown;
use snafu::Snafu;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Attempts at stripping an owner reference before giving up for the cycle.
const RELEASE_CONFLICT_RETRIES: usize = 3;

/// Alphabet for generated name suffixes; mirrors the api-server's
/// generate-name one (no vowels, no look-alikes).
const SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("store access for '{}' failed: {}", set, source))]
    StoreOp { set: String, source: StoreError },

    #[snafu(display("{}", source))]
    Classification { source: UnknownState },

    #[snafu(display("sandbox '{}' is locked by '{}', leaving it alone", sandbox, owner))]
    LockedByClaimant { sandbox: String, owner: String },

    #[snafu(display("kept losing update races for sandbox '{}'", sandbox))]
    ReleaseRetriesExhausted { sandbox: String },

    #[snafu(display("{} reconcile steps failed: [{}]", errors.len(), joined(errors)))]
    Aggregate { errors: Vec<Error> },
}

fn joined(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|error| error.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// None for no failures, the lone failure, or everything joined.
fn squash(mut errors: Vec<Error>) -> Result<(), Error> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(Error::Aggregate { errors }),
    }
}

/// Tunables threaded in from the command line.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// First wave size of bulk sandbox operations.
    pub initial_batch_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: 16,
        }
    }
}

/// State shared by the reconcile workers and the event router.
pub struct OperatorContext {
    store: Arc<dyn PoolStore>,
    events: Arc<dyn EventPublisher>,
    /// Pending creates awaiting watch confirmation.
    pub scale_up: Arc<ScaleExpectations>,
    /// Pending deletes awaiting watch confirmation.
    pub scale_down: Arc<ScaleExpectations>,
    /// Per set, when the last scale up was issued.
    cooldowns: Mutex<HashMap<ObjectKey, Instant>>,
    config: PoolConfig,
}

impl OperatorContext {
    pub fn new(
        store: Arc<dyn PoolStore>,
        events: Arc<dyn EventPublisher>,
        config: PoolConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            scale_up: Arc::new(ScaleExpectations::default()),
            scale_down: Arc::new(ScaleExpectations::default()),
            cooldowns: Mutex::new(HashMap::new()),
            config,
        })
    }
}

/// Worker: take keys off the queue, reconcile, and reschedule with
/// exponential backoff on failure.
pub async fn worker_loop(ctx: Arc<OperatorContext>, queue: Arc<WorkQueue>, mut shutdown: Shutdown) {
    let signal = shutdown.clone();
    let mut failures: HashMap<ObjectKey, u32> = HashMap::new();
    loop {
        let key = tokio::select! {
            _ = shutdown.triggered() => return,
            key = queue.next() => key,
        };
        match reconcile_set(&ctx, &key, &signal).await {
            Ok(requeue_after) => {
                failures.remove(&key);
                if let Some(delay) = requeue_after {
                    queue.add_after(key.clone(), delay);
                }
            }
            Err(reconcile_error) => {
                let strikes = failures.entry(key.clone()).or_insert(0);
                *strikes += 1;
                let delay = retry_backoff(*strikes);
                error!(set = %key, error = %reconcile_error, retry_in = ?delay, "reconcile failed");
                queue.add_after(key.clone(), delay);
            }
        }
        queue.done(&key);
    }
}

fn retry_backoff(strikes: u32) -> Duration {
    let exponent = strikes.saturating_sub(1).min(16);
    utils::RECONCILE_BACKOFF_BASE
        .saturating_mul(1u32 << exponent)
        .min(utils::RECONCILE_BACKOFF_MAX)
}

/// Drive one set toward its declared pool size. Returns how long to wait
/// before the next look, when a timer (rather than a watch event) should
/// bring us back.
#[tracing::instrument(skip(ctx, key, shutdown), fields(set = %key))]
pub async fn reconcile_set(
    ctx: &OperatorContext,
    key: &ObjectKey,
    shutdown: &Shutdown,
) -> Result<Option<Duration>, Error> {
    // a vanished set takes its bookkeeping with it
    let set = match ctx.store.get_set(key).await.map_err(|source| store_op(key, source))? {
        Some(set) => set,
        None => {
            ctx.scale_up.delete(key);
            ctx.scale_down.delete(key);
            ctx.cooldowns.lock().remove(key);
            debug!(set = %key, "set is gone, dropped its ledgers");
            return Ok(None);
        }
    };
    let target = EventTarget::for_set(&set);
    let revision = template_revision(&set.spec.template);

    let mut requeue: Option<Duration> = None;
    let scale_up_ok = expectation_gate(&ctx.scale_up, key, "scale-up", &mut requeue);
    let scale_down_ok = expectation_gate(&ctx.scale_down, key, "scale-down", &mut requeue);

    // every sandbox the store already shows us confirms its own creation
    let owned = ctx
        .store
        .list_owned(&set)
        .await
        .map_err(|source| store_op(key, source))?;
    let mut groups = GroupedSandboxes::default();
    for sandbox in owned {
        ctx.scale_up
            .observe(key, ScaleAction::Create, &sandbox.name());
        let classified =
            classify(&sandbox).map_err(|source| Error::Classification { source })?;
        groups.insert(classified.group, sandbox);
    }

    let mut errors: Vec<Error> = Vec::new();

    // hand newly ready sandboxes their pool labels; they count as creating
    // until the relabel is observed
    for sandbox in groups
        .creating
        .iter()
        .filter(|sandbox| ready_for_promotion(sandbox))
    {
        if let Err(promotion_error) = promote_to_available(ctx, &target, sandbox).await {
            errors.push(promotion_error);
        }
    }

    let desired = desired_pool_size(&set);
    let actual = groups.pool_size();
    let delta = desired - actual;

    if delta > 0 {
        if !scale_up_ok {
            debug!(set = %key, delta, "creates still in flight, holding scale up");
        } else {
            let (created, first_error) =
                scale_up(ctx, &set, key, &target, &revision, delta as usize, shutdown).await;
            if created > 0 {
                ctx.cooldowns.lock().insert(key.clone(), Instant::now());
            }
            if let Some(scale_error) = first_error {
                errors.push(scale_error);
            }
        }
    } else if delta < 0 {
        if !(scale_up_ok && scale_down_ok) {
            debug!(set = %key, delta, "scale operations still in flight, holding scale down");
        } else if let Some(wait) = cooldown_remaining(ctx, key) {
            debug!(set = %key, wait = ?wait, "scale up cool down active, holding scale down");
            requeue = sooner(requeue, wait);
        } else {
            let candidates = deletion_candidates(&groups, (-delta) as usize);
            let (_, first_error) =
                scale_down(ctx, key, &target, candidates, shutdown).await;
            if let Some(scale_error) = first_error {
                errors.push(scale_error);
            }
        }
    }

    // terminal sandboxes not yet being deleted are garbage
    for sandbox in groups
        .dead
        .iter()
        .filter(|sandbox| sandbox.metadata.deletion_timestamp.is_none())
    {
        let sandbox_key = ObjectKey::from_resource(&**sandbox);
        match ctx.store.delete_sandbox(&sandbox_key).await {
            Ok(()) => {
                ctx.events
                    .publish(
                        &target,
                        PoolEvent::normal(
                            EventReason::FailedSandboxDeleted,
                            "GarbageCollect",
                            format!("Deleted dead sandbox '{}'", sandbox_key.name),
                        ),
                    )
                    .await;
            }
            Err(source) => errors.push(store_op(key, source)),
        }
    }

    // claimed sandboxes leave the pool's ownership
    let set_uid = set.uid().unwrap_or_default();
    let holding: Vec<Arc<Sandbox>> = groups
        .used
        .iter()
        .filter(|sandbox| {
            sandbox
                .owned_by_set()
                .map(|owner| owner.uid == set_uid)
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    if !holding.is_empty() {
        let (_, first_error) = slow_start_batch(
            holding,
            ctx.config.initial_batch_size,
            shutdown,
            |sandbox| release_sandbox(ctx, &set, &target, sandbox),
        )
        .await;
        if let Some(release_error) = first_error {
            errors.push(release_error);
        }
    }

    let new_status = SandboxSetStatus {
        replicas: groups.pool_size(),
        available_replicas: groups.available.len() as i32,
        observed_generation: set.metadata.generation,
        update_revision: Some(revision),
        selector: Some(set.selector_string()),
    };
    if let Err(status_error) = write_status(ctx, key, new_status).await {
        errors.push(status_error);
    }

    squash(errors).map(|_| requeue)
}

fn store_op(key: &ObjectKey, source: StoreError) -> Error {
    Error::StoreOp {
        set: key.to_string(),
        source,
    }
}

/// True when the ledger allows scaling. An entry dirty past the timeout is
/// force cleared (a watch event went missing); scaling resumes on the short
/// requeue that follows.
fn expectation_gate(
    ledger: &ScaleExpectations,
    key: &ObjectKey,
    which: &str,
    requeue: &mut Option<Duration>,
) -> bool {
    let status: ExpectationStatus = ledger.satisfied(key);
    if status.satisfied {
        return true;
    }
    if let Some(age) = status.unsatisfied_for {
        if age >= utils::EXPECTATION_TIMEOUT {
            error!(
                set = %key,
                ledger = which,
                pending = ?status.pending,
                elapsed = ?age,
                "expectations timed out, force clearing"
            );
            ledger.delete(key);
            *requeue = sooner(*requeue, utils::EXPECTATION_RETRY_PERIOD);
        } else {
            // make sure a cycle runs at the deadline even if the
            // confirming event never shows up
            *requeue = sooner(*requeue, utils::EXPECTATION_TIMEOUT - age);
        }
    }
    false
}

fn sooner(current: Option<Duration>, candidate: Duration) -> Option<Duration> {
    Some(match current {
        Some(current) => current.min(candidate),
        None => candidate,
    })
}

/// Pool size requested by the spec, clamped into the optional bounds. The
/// watermark fields do not feed in yet.
fn desired_pool_size(set: &SandboxSet) -> i32 {
    let mut desired = set.spec.replicas.max(0);
    if let Some(bounds) = &set.spec.scaling {
        if let Some(max) = bounds.max_replicas {
            desired = desired.min(max.max(0));
        }
        if let Some(min) = bounds.min_replicas {
            desired = desired.max(min.max(0));
        }
    }
    desired
}

fn ready_for_promotion(sandbox: &Sandbox) -> bool {
    matches!(
        sandbox.phase(),
        Some(SandboxPhase::Running) | Some(SandboxPhase::Paused)
    ) && sandbox.is_ready()
        && sandbox.state_label().is_none()
}

async fn promote_to_available(
    ctx: &OperatorContext,
    target: &EventTarget,
    sandbox: &Sandbox,
) -> Result<(), Error> {
    let sandbox_key = ObjectKey::from_resource(sandbox);
    let mut labels = BTreeMap::new();
    labels.insert(
        utils::STATE_LABEL.to_string(),
        SandboxState::Available.to_string(),
    );
    labels.insert(utils::SANDBOX_ID_LABEL.to_string(), sandbox_key.name.clone());

    ctx.store
        .patch_sandbox_labels(&sandbox_key, labels)
        .await
        .map_err(|source| store_op(&sandbox_key, source))?;
    ctx.events
        .publish(
            target,
            PoolEvent::normal(
                EventReason::SandboxAvailable,
                "Promote",
                format!("Sandbox '{}' is available", sandbox_key.name),
            ),
        )
        .await;
    Ok(())
}

async fn scale_up(
    ctx: &OperatorContext,
    set: &SandboxSet,
    key: &ObjectKey,
    target: &EventTarget,
    revision: &str,
    count: usize,
    shutdown: &Shutdown,
) -> (usize, Option<Error>) {
    info!(set = %key, count, "scaling up");
    let names: Vec<String> = (0..count).map(|_| generated_name(set)).collect();
    slow_start_batch(names, ctx.config.initial_batch_size, shutdown, |name| {
        create_one_sandbox(ctx, set, key, target, revision, name)
    })
    .await
}

async fn create_one_sandbox(
    ctx: &OperatorContext,
    set: &SandboxSet,
    key: &ObjectKey,
    target: &EventTarget,
    revision: &str,
    name: String,
) -> Result<(), Error> {
    let sandbox = new_sandbox(set, revision, &name);
    // the intent goes on the books before the create can become visible
    ctx.scale_up.expect(key, ScaleAction::Create, &name);
    match ctx.store.create_sandbox(sandbox).await {
        Ok(_) => {
            ctx.events
                .publish(
                    target,
                    PoolEvent::normal(
                        EventReason::SandboxCreated,
                        "ScaleUp",
                        format!("Created sandbox '{}'", name),
                    ),
                )
                .await;
            Ok(())
        }
        Err(source) => {
            ctx.scale_up.observe(key, ScaleAction::Create, &name);
            ctx.events
                .publish(
                    target,
                    PoolEvent::warning(
                        EventReason::CreateSandboxFailed,
                        "ScaleUp",
                        format!("Failed to create sandbox '{}': {}", name, source),
                    ),
                )
                .await;
            Err(store_op(key, source))
        }
    }
}

/// A fresh sandbox stamped from the set's template.
fn new_sandbox(set: &SandboxSet, revision: &str, name: &str) -> Sandbox {
    let template = &set.spec.template;
    let internal_prefix = format!("{}/", utils::API_GROUP);

    let mut labels = template.metadata.labels.clone();
    labels.insert(utils::POOL_LABEL.to_string(), set.name());
    labels.insert(utils::TEMPLATE_HASH_LABEL.to_string(), revision.to_string());
    labels.insert(utils::CLAIMED_LABEL.to_string(), "false".to_string());
    if let Some(reference) = &set.spec.template_ref {
        labels.insert(utils::TEMPLATE_REF_LABEL.to_string(), reference.clone());
    }

    // template annotations come across minus anything under our prefix,
    // which only the controller may write
    let mut annotations: BTreeMap<String, String> = template
        .metadata
        .annotations
        .iter()
        .filter(|(annotation, _)| !annotation.starts_with(&internal_prefix))
        .map(|(annotation, value)| (annotation.clone(), value.clone()))
        .collect();
    annotations.insert(utils::CREATED_BY_KEY.to_string(), utils::SBS_OPERATOR.to_string());

    let mut sandbox = Sandbox::new(
        name,
        SandboxSpec {
            runtime: template.spec.clone(),
            volume_claims: set.spec.volume_claim_templates.clone(),
            persistent_content: set.spec.persistent_content.clone(),
        },
    );
    sandbox.metadata.namespace = set.namespace();
    sandbox.metadata.labels = Some(labels);
    sandbox.metadata.annotations = Some(annotations);
    sandbox.metadata.owner_references = Some(vec![set.controller_owner_ref()]);
    sandbox
}

fn generated_name(set: &SandboxSet) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..5)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}", set.name(), suffix)
}

fn lock_token() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

fn cooldown_remaining(ctx: &OperatorContext, key: &ObjectKey) -> Option<Duration> {
    let mut cooldowns = ctx.cooldowns.lock();
    let started = *cooldowns.get(key)?;
    let elapsed = started.elapsed();
    if elapsed < utils::SCALE_UP_COOLDOWN {
        Some(utils::SCALE_UP_COOLDOWN - elapsed)
    } else {
        cooldowns.remove(key);
        None
    }
}

/// Scale down prefers sandboxes that never became available, youngest
/// first, so established capacity survives the drain.
fn deletion_candidates(groups: &GroupedSandboxes, count: usize) -> Vec<Arc<Sandbox>> {
    let mut candidates = youngest_first(&groups.creating);
    candidates.extend(youngest_first(&groups.available));
    candidates.truncate(count);
    candidates
}

fn youngest_first(sandboxes: &[Arc<Sandbox>]) -> Vec<Arc<Sandbox>> {
    let mut ordered = sandboxes.to_vec();
    ordered.sort_by(|a, b| created_at(b).cmp(&created_at(a)));
    ordered
}

fn created_at(sandbox: &Sandbox) -> Option<chrono::DateTime<chrono::Utc>> {
    sandbox
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|time| time.0)
}

async fn scale_down(
    ctx: &OperatorContext,
    key: &ObjectKey,
    target: &EventTarget,
    candidates: Vec<Arc<Sandbox>>,
    shutdown: &Shutdown,
) -> (usize, Option<Error>) {
    info!(set = %key, count = candidates.len(), "scaling down");
    slow_start_batch(
        candidates,
        ctx.config.initial_batch_size,
        shutdown,
        |sandbox| scale_down_one(ctx, key, target, sandbox),
    )
    .await
}

/// Tear one sandbox down: take the lock, mark it killing, delete it. A
/// claimant's lock wins; a lost update race is retried on the next cycle.
async fn scale_down_one(
    ctx: &OperatorContext,
    key: &ObjectKey,
    target: &EventTarget,
    sandbox: Arc<Sandbox>,
) -> Result<(), Error> {
    let sandbox_key = ObjectKey::from_resource(&*sandbox);

    // the cached copy may lag claim activity, always look again
    let mut current = match ctx
        .store
        .get_sandbox(&sandbox_key)
        .await
        .map_err(|source| store_op(&sandbox_key, source))?
    {
        Some(current) => current,
        None => return Ok(()), // already gone
    };

    if let Some(lock) = current.lock() {
        let owner = current.lock_owner().unwrap_or("").to_string();
        if owner != utils::SCALE_DOWN_LOCK_OWNER {
            debug!(sandbox = %sandbox_key, lock, owner = %owner, "foreign lock, skipping");
            return Err(Error::LockedByClaimant {
                sandbox: sandbox_key.name,
                owner,
            });
        }
    }

    let annotations = current
        .metadata
        .annotations
        .get_or_insert_with(Default::default);
    annotations.insert(utils::LOCK_ANNOTATION.to_string(), lock_token());
    annotations.insert(
        utils::LOCK_OWNER_ANNOTATION.to_string(),
        utils::SCALE_DOWN_LOCK_OWNER.to_string(),
    );
    current
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(
            utils::STATE_LABEL.to_string(),
            SandboxState::Killing.to_string(),
        );

    ctx.scale_down
        .expect(key, ScaleAction::Delete, &sandbox_key.name);

    if let Err(source) = ctx.store.update_sandbox(&current).await {
        ctx.scale_down
            .observe(key, ScaleAction::Delete, &sandbox_key.name);
        if source.is_conflict() {
            // a claimant moved first; their update event brings us back
            debug!(sandbox = %sandbox_key, "lost the lock race, leaving it for now");
            return Ok(());
        }
        if source.is_not_found() {
            return Ok(()); // vanished while we were locking it
        }
        return Err(store_op(&sandbox_key, source));
    }

    if let Err(source) = ctx.store.delete_sandbox(&sandbox_key).await {
        ctx.scale_down
            .observe(key, ScaleAction::Delete, &sandbox_key.name);
        return Err(store_op(&sandbox_key, source));
    }

    ctx.events
        .publish(
            target,
            PoolEvent::normal(
                EventReason::SandboxScaledDown,
                "ScaleDown",
                format!("Scaled down sandbox '{}'", sandbox_key.name),
            ),
        )
        .await;
    Ok(())
}

/// A claimed sandbox stops being the pool's: drop our owner reference so
/// the claimant's lifecycle, not ours, governs it from here.
async fn release_sandbox(
    ctx: &OperatorContext,
    set: &SandboxSet,
    target: &EventTarget,
    sandbox: Arc<Sandbox>,
) -> Result<(), Error> {
    let sandbox_key = ObjectKey::from_resource(&*sandbox);
    let set_uid = set.uid().unwrap_or_default();

    for _ in 0..RELEASE_CONFLICT_RETRIES {
        let mut current = match ctx
            .store
            .get_sandbox(&sandbox_key)
            .await
            .map_err(|source| store_op(&sandbox_key, source))?
        {
            Some(current) => current,
            None => return Ok(()),
        };

        let owners = match current.metadata.owner_references.take() {
            Some(owners) => owners,
            None => return Ok(()), // already released
        };
        let remaining: Vec<_> = owners
            .into_iter()
            .filter(|owner| owner.uid != set_uid)
            .collect();
        current.metadata.owner_references =
            if remaining.is_empty() { None } else { Some(remaining) };
        current
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(utils::CLAIMED_LABEL.to_string(), "true".to_string());

        match ctx.store.update_sandbox(&current).await {
            Ok(_) => {
                ctx.events
                    .publish(
                        target,
                        PoolEvent::normal(
                            EventReason::SandboxReleased,
                            "Release",
                            format!("Released claimed sandbox '{}'", sandbox_key.name),
                        ),
                    )
                    .await;
                return Ok(());
            }
            Err(source) if source.is_conflict() => continue,
            Err(source) if source.is_not_found() => return Ok(()),
            Err(source) => return Err(store_op(&sandbox_key, source)),
        }
    }
    Err(Error::ReleaseRetriesExhausted {
        sandbox: sandbox_key.name,
    })
}

/// Write the new status unless the stored one already matches.
async fn write_status(
    ctx: &OperatorContext,
    key: &ObjectKey,
    new_status: SandboxSetStatus,
) -> Result<(), Error> {
    let mut current = match ctx
        .store
        .get_set(key)
        .await
        .map_err(|source| store_op(key, source))?
    {
        Some(current) => current,
        None => return Ok(()), // deleted underneath us, nothing to record
    };

    if current.status.as_ref() == Some(&new_status) {
        debug!(set = %key, "status unchanged");
        return Ok(());
    }

    debug!(set = %key, old = ?current.status, new = ?new_status, "status changed");
    current.status = Some(new_status);
    ctx.store
        .update_set_status(&current)
        .await
        .map_err(|source| store_op(key, source))
}
