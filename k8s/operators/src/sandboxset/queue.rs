//! Keyed work queue feeding the reconcile workers. At most one reconcile
//! runs per key at any instant: a key added while it is being worked on is
//! remembered and replayed once the worker calls `done`.

use crate::sandboxset::store::ObjectKey;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct State {
    order: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    active: HashSet<ObjectKey>,
    redo: HashSet<ObjectKey>,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<State>,
    wakeup: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enqueue a key. Duplicates of queued keys collapse; keys currently
    /// being worked on are replayed after `done`.
    pub fn add(&self, key: ObjectKey) {
        {
            let mut state = self.state.lock();
            if state.active.contains(&key) {
                state.redo.insert(key);
                return;
            }
            if !state.queued.insert(key.clone()) {
                return;
            }
            state.order.push_back(key);
        }
        self.wakeup.notify_one();
    }

    /// Enqueue a key once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Next key to work on; parks until one is available. The caller owns
    /// the key until it calls [`WorkQueue::done`].
    pub async fn next(&self) -> ObjectKey {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(key) = state.order.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    if !state.order.is_empty() {
                        // cascade so sibling workers parked on the same
                        // notify are not left sleeping on a non-empty queue
                        self.wakeup.notify_one();
                    }
                    return key;
                }
            }
            self.wakeup.notified().await;
        }
    }

    /// Release a key taken with [`WorkQueue::next`], replaying any adds
    /// that arrived while it was active.
    pub fn done(&self, key: &ObjectKey) {
        let replay = {
            let mut state = self.state.lock();
            state.active.remove(key);
            state.redo.remove(key)
        };
        if replay {
            self.add(key.clone());
        }
    }

    #[cfg(test)]
    pub(crate) fn drain(&self) -> Vec<ObjectKey> {
        let mut state = self.state.lock();
        state.queued.clear();
        state.order.drain(..).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("default", name)
    }

    #[test]
    fn queued_duplicates_collapse() {
        let queue = WorkQueue::new();
        queue.add(key("warm"));
        queue.add(key("warm"));
        queue.add(key("cold"));
        assert_eq!(queue.drain().len(), 2);
    }

    #[tokio::test]
    async fn active_keys_replay_after_done() {
        let queue = WorkQueue::new();
        queue.add(key("warm"));
        let taken = queue.next().await;
        assert_eq!(taken, key("warm"));

        // arrives while the worker holds the key
        queue.add(key("warm"));
        assert!(queue.drain().is_empty());

        queue.done(&taken);
        assert_eq!(queue.drain(), vec![key("warm")]);
    }

    #[tokio::test]
    async fn add_after_lands_eventually() {
        let queue = WorkQueue::new();
        queue.add_after(key("warm"), Duration::from_millis(10));
        let taken = queue.next().await;
        assert_eq!(taken, key("warm"));
    }
}
