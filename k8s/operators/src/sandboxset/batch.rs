//! Slow-start execution of bulk store mutations. Bulk creates, releases
//! and scale downs all go through here so a broken API server is probed
//! with one small wave instead of hammered with the whole batch.

use futures::future::join_all;
use shutdown::Shutdown;
use std::future::Future;

/// Run `work` over `items` in doubling waves.
///
/// The first wave is at most `initial_batch` wide; each fully successful
/// wave doubles the next one. Any failure stops further waves (work already
/// in flight completes and is counted). Returns how many invocations
/// succeeded and the first error seen.
pub async fn slow_start_batch<T, W, F, E>(
    items: Vec<T>,
    initial_batch: usize,
    shutdown: &Shutdown,
    work: W,
) -> (usize, Option<E>)
where
    W: Fn(T) -> F,
    F: Future<Output = Result<(), E>>,
{
    let mut remaining = items.into_iter();
    let mut left = remaining.len();
    let mut batch = initial_batch.max(1);
    let mut successes = 0;
    let mut first_error = None;

    while left > 0 && !shutdown.is_triggered() {
        let wave: Vec<T> = remaining.by_ref().take(batch.min(left)).collect();
        left -= wave.len();

        let mut wave_failed = false;
        for result in join_all(wave.into_iter().map(&work)).await {
            match result {
                Ok(()) => successes += 1,
                Err(error) => {
                    wave_failed = true;
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
        if wave_failed {
            break;
        }
        batch = batch.saturating_mul(2);
    }

    (successes, first_error)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_shutdown() -> Shutdown {
        let (trigger, shutdown) = Shutdown::manual();
        // keep the channel open for the duration of the test
        std::mem::forget(trigger);
        shutdown
    }

    #[tokio::test]
    async fn all_items_run_when_nothing_fails() {
        let attempts = AtomicUsize::new(0);
        let (successes, error) = slow_start_batch(
            (0..9).collect::<Vec<i32>>(),
            2,
            &noop_shutdown(),
            |_item| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Result::<(), &str>::Ok(()) }
            },
        )
        .await;
        assert_eq!(successes, 9);
        assert!(error.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn failure_stops_later_waves() {
        // waves of 1, 2, 4...; item 2 fails in the second wave
        let attempts = AtomicUsize::new(0);
        let (successes, error) = slow_start_batch(
            (0..10).collect::<Vec<i32>>(),
            1,
            &noop_shutdown(),
            |item| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if item == 2 {
                        Err("boom")
                    } else {
                        Ok(())
                    }
                }
            },
        )
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(successes, 2);
        assert_eq!(error, Some("boom"));
    }

    #[tokio::test]
    async fn shutdown_skips_remaining_waves() {
        let (trigger, shutdown) = Shutdown::manual();
        trigger.trigger();
        let (successes, error) =
            slow_start_batch((0..4).collect::<Vec<i32>>(), 2, &shutdown, |_item| async {
                Result::<(), &str>::Ok(())
            })
            .await;
        assert_eq!(successes, 0);
        assert!(error.is_none());
    }
}
