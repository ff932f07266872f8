//! In-memory record of scaling intents the controller has issued but not
//! yet seen confirmed by the watch. The store is eventually consistent, so
//! a set must not re-issue creates or deletes until the previous batch has
//! been observed; these ledgers are the only cross-task coordination the
//! protocol needs.

use crate::sandboxset::store::ObjectKey;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// The store mutation an expectation covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleAction {
    Create,
    Delete,
}

#[derive(Debug, Default)]
struct Entry {
    pending_creates: HashSet<String>,
    pending_deletes: HashSet<String>,
    /// When the entry first became non-empty without draining since.
    dirty_since: Option<Instant>,
    /// Synthetic extra age, so tests can fast-forward the dirty clock.
    #[cfg(test)]
    dirty_debt: Duration,
}

impl Entry {
    fn dirty_age(&self) -> Option<Duration> {
        let age = self.dirty_since.map(|since| since.elapsed());
        #[cfg(test)]
        let age = age.map(|age| age + self.dirty_debt);
        age
    }

    fn pending(&mut self, action: ScaleAction) -> &mut HashSet<String> {
        match action {
            ScaleAction::Create => &mut self.pending_creates,
            ScaleAction::Delete => &mut self.pending_deletes,
        }
    }

    fn is_empty(&self) -> bool {
        self.pending_creates.is_empty() && self.pending_deletes.is_empty()
    }

    fn snapshot(&self) -> Vec<String> {
        self.pending_creates
            .iter()
            .chain(self.pending_deletes.iter())
            .cloned()
            .collect()
    }
}

/// Outcome of a ledger check.
#[derive(Debug)]
pub struct ExpectationStatus {
    /// True iff nothing is pending for the set.
    pub satisfied: bool,
    /// How long the entry has been dirty, when unsatisfied.
    pub unsatisfied_for: Option<Duration>,
    /// Pending names, for operator-facing logs.
    pub pending: Vec<String>,
}

/// Pending intent names per set. An `expect` is always registered before
/// the mutation it covers is issued, so confirmations can never outrun
/// their registration; an `observe` with no matching entry (a delete we
/// never asked for, a resync replay) is a no-op.
#[derive(Debug, Default)]
pub struct ScaleExpectations {
    entries: Mutex<HashMap<ObjectKey, Entry>>,
}

impl ScaleExpectations {
    /// Record an intent for `name` ahead of issuing the mutation.
    pub fn expect(&self, key: &ObjectKey, action: ScaleAction, name: &str) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_default();
        entry.pending(action).insert(name.to_string());
        if entry.dirty_since.is_none() {
            entry.dirty_since = Some(Instant::now());
        }
    }

    /// Confirm (or withdraw) an intent. Unknown names are ignored.
    pub fn observe(&self, key: &ObjectKey, action: ScaleAction, name: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.pending(action).remove(name);
            if entry.is_empty() {
                entries.remove(key);
            }
        }
    }

    pub fn satisfied(&self, key: &ObjectKey) -> ExpectationStatus {
        let entries = self.entries.lock();
        match entries.get(key) {
            None => ExpectationStatus {
                satisfied: true,
                unsatisfied_for: None,
                pending: Vec::new(),
            },
            Some(entry) => ExpectationStatus {
                satisfied: entry.is_empty(),
                unsatisfied_for: entry.dirty_age(),
                pending: entry.snapshot(),
            },
        }
    }

    /// Drop everything recorded for a set: it was deleted, or its entry
    /// aged out and is being force cleared.
    pub fn delete(&self, key: &ObjectKey) {
        self.entries.lock().remove(key);
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, key: &ObjectKey, by: Duration) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.dirty_debt += by;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key() -> ObjectKey {
        ObjectKey::new("default", "warm")
    }

    #[test]
    fn empty_ledger_is_satisfied() {
        let ledger = ScaleExpectations::default();
        let status = ledger.satisfied(&key());
        assert!(status.satisfied);
        assert!(status.unsatisfied_for.is_none());
    }

    #[test]
    fn expect_then_observe_drains() {
        let ledger = ScaleExpectations::default();
        ledger.expect(&key(), ScaleAction::Create, "warm-abc12");
        ledger.expect(&key(), ScaleAction::Create, "warm-def34");

        let status = ledger.satisfied(&key());
        assert!(!status.satisfied);
        assert_eq!(status.pending.len(), 2);
        assert!(status.unsatisfied_for.is_some());

        ledger.observe(&key(), ScaleAction::Create, "warm-abc12");
        assert!(!ledger.satisfied(&key()).satisfied);

        ledger.observe(&key(), ScaleAction::Create, "warm-def34");
        let status = ledger.satisfied(&key());
        assert!(status.satisfied);
        assert!(status.unsatisfied_for.is_none());
    }

    #[test]
    fn unsolicited_observe_is_a_noop() {
        let ledger = ScaleExpectations::default();
        ledger.observe(&key(), ScaleAction::Delete, "warm-gone1");
        assert!(ledger.satisfied(&key()).satisfied);

        // and it must not poison a later intent for a different name
        ledger.expect(&key(), ScaleAction::Delete, "warm-gone2");
        ledger.observe(&key(), ScaleAction::Delete, "warm-gone2");
        assert!(ledger.satisfied(&key()).satisfied);
    }

    #[test]
    fn create_and_delete_sides_are_independent() {
        let ledger = ScaleExpectations::default();
        ledger.expect(&key(), ScaleAction::Create, "warm-abc12");
        ledger.observe(&key(), ScaleAction::Delete, "warm-abc12");
        assert!(!ledger.satisfied(&key()).satisfied);
        ledger.observe(&key(), ScaleAction::Create, "warm-abc12");
        assert!(ledger.satisfied(&key()).satisfied);
    }

    #[test]
    fn sets_do_not_interfere() {
        let ledger = ScaleExpectations::default();
        let other = ObjectKey::new("default", "cold");
        ledger.expect(&key(), ScaleAction::Create, "warm-abc12");
        assert!(ledger.satisfied(&other).satisfied);
    }

    #[test]
    fn delete_clears_the_entry() {
        let ledger = ScaleExpectations::default();
        ledger.expect(&key(), ScaleAction::Create, "warm-abc12");
        ledger.delete(&key());
        assert!(ledger.satisfied(&key()).satisfied);
    }

    #[test]
    fn dirty_age_grows_from_first_intent() {
        let ledger = ScaleExpectations::default();
        ledger.expect(&key(), ScaleAction::Create, "warm-abc12");
        ledger.backdate(&key(), Duration::from_secs(600));
        let status = ledger.satisfied(&key());
        assert!(status.unsatisfied_for.expect("dirty") >= Duration::from_secs(600));
    }
}
