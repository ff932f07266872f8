//! Cancellation token wired to the process termination signals.

use tokio::sync::watch;

/// Cloneable token resolved once the process is asked to stop.
///
/// Long running work checks [`Shutdown::is_triggered`] at safe points;
/// select loops await [`Shutdown::triggered`].
#[derive(Clone, Debug)]
pub struct Shutdown {
    stop: watch::Receiver<bool>,
}

/// Hand-operated counterpart of a [`Shutdown`], used by tests and by the
/// signal listener.
#[derive(Debug)]
pub struct Trigger {
    stop: watch::Sender<bool>,
}

impl Trigger {
    /// Resolve every token cloned from the paired [`Shutdown`].
    pub fn trigger(&self) {
        let _ = self.stop.send(true);
    }
}

impl Shutdown {
    /// A token pair with no signal wiring.
    pub fn manual() -> (Trigger, Self) {
        let (tx, rx) = watch::channel(false);
        (Trigger { stop: tx }, Self { stop: rx })
    }

    /// A token resolved by SIGINT or SIGTERM.
    pub fn install() -> Self {
        let (trigger, shutdown) = Self::manual();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::warn!("termination signal received, shutting down");
            trigger.trigger();
            // park the sender so receivers keep observing the final value
            std::future::pending::<()>().await;
        });
        shutdown
    }

    /// True once a stop was requested.
    pub fn is_triggered(&self) -> bool {
        *self.stop.borrow()
    }

    /// Completes when a stop is requested. A dropped [`Trigger`] counts as
    /// a stop request.
    pub async fn triggered(&mut self) {
        while !*self.stop.borrow() {
            if self.stop.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(error) => {
            tracing::error!(%error, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::Shutdown;

    #[tokio::test]
    async fn manual_trigger_resolves_tokens() {
        let (trigger, shutdown) = Shutdown::manual();
        let mut waiter = shutdown.clone();
        assert!(!shutdown.is_triggered());
        trigger.trigger();
        assert!(shutdown.is_triggered());
        waiter.triggered().await;
    }

    #[tokio::test]
    async fn dropped_trigger_counts_as_stop() {
        let (trigger, mut shutdown) = Shutdown::manual();
        drop(trigger);
        shutdown.triggered().await;
    }
}
