//! Order-preserving bounded-concurrency pipeline.
//!
//! Items are taken from an input channel in arrival order and each one is
//! resolved on its own task, with at most `window` resolutions running at
//! once. Results come out of [`Ordered::next`] strictly in arrival order:
//! the consumer awaits slot *n* before it can see slot *n + 1*, so a slow
//! item holds back the ones behind it but never lets them overtake it.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;

/// Default number of in-flight resolutions for the live relay.
pub const DEFAULT_WINDOW: usize = 50;

/// Why a slot produced no value.
#[derive(Debug, thiserror::Error)]
pub enum SlotError<E> {
    #[error("resolution failed: {0}")]
    Failed(E),
    #[error("resolution task aborted: {0}")]
    Aborted(String),
}

/// Consumer half of a running pipeline.
pub struct Ordered<O, E> {
    slots: mpsc::Receiver<JoinHandle<Result<O, E>>>,
    producer: JoinHandle<()>,
}

/// Start a pipeline over `input`, resolving each item with `resolve`.
pub fn ordered<I, O, E, F, Fut>(mut input: mpsc::Receiver<I>, window: usize, resolve: F) -> Ordered<O, E>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
    F: Fn(I) -> Fut + Send + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
{
    let window = window.max(1);
    let (slot_tx, slots) = mpsc::channel(window);
    let permits = Arc::new(Semaphore::new(window));

    let producer = tokio::spawn(async move {
        while let Some(item) = input.recv().await {
            // Acquired before spawning so no more than `window` run at once.
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let work = resolve(item);
            let handle = tokio::spawn(async move {
                let _permit = permit;
                work.await
            });
            if let Err(mpsc::error::SendError(handle)) = slot_tx.send(handle).await {
                handle.abort();
                break;
            }
        }
    });

    Ordered { slots, producer }
}

impl<O, E> Ordered<O, E> {
    /// Next result in arrival order, or `None` once the input is exhausted
    /// and every slot has been consumed.
    pub async fn next(&mut self) -> Option<Result<O, SlotError<E>>> {
        let handle = self.slots.recv().await?;
        Some(match handle.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(SlotError::Failed(e)),
            Err(join) => Err(SlotError::Aborted(join.to_string())),
        })
    }
}

impl<O, E> Drop for Ordered<O, E> {
    fn drop(&mut self) {
        self.producer.abort();
        self.slots.close();
        while let Ok(handle) = self.slots.try_recv() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Seeded latencies so failures reproduce.
    fn latencies(n: usize, seed: u64, max_ms: u64) -> Vec<u64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen_range(0..=max_ms)).collect()
    }

    async fn run(n: usize, window: usize, delays: Vec<u64>) -> (Vec<usize>, usize) {
        let (tx, rx) = mpsc::channel(16);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut pipe = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let delays = Arc::new(delays);
            ordered(rx, window, move |i: usize| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                let delay = delays[i];
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(i)
                }
            })
        };

        tokio::spawn(async move {
            for i in 0..n {
                tx.send(i).await.unwrap();
            }
        });

        let mut out = Vec::new();
        while let Some(result) = pipe.next().await {
            out.push(result.unwrap());
        }
        (out, peak.load(Ordering::SeqCst))
    }

    #[tokio::test(start_paused = true)]
    async fn empty_input_yields_nothing() {
        let (out, peak) = run(0, 4, Vec::new()).await;
        assert!(out.is_empty());
        assert_eq!(peak, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn preserves_order_under_random_latency() {
        for (seed, n, window) in [(7, 1, 1), (11, 40, 4), (23, 200, 50), (99, 120, 3)] {
            let (out, peak) = run(n, window, latencies(n, seed, 40)).await;
            assert_eq!(out, (0..n).collect::<Vec<_>>(), "seed {seed}");
            assert!(peak <= window, "peak {peak} > window {window}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reverse_latency_still_in_order() {
        let n = 30;
        let delays: Vec<u64> = (0..n as u64).rev().map(|d| d * 5).collect();
        let (out, peak) = run(n, 10, delays).await;
        assert_eq!(out, (0..n).collect::<Vec<_>>());
        assert_eq!(peak, 10);
    }

    #[tokio::test]
    async fn failed_slot_is_reported_and_skipped() {
        let (tx, rx) = mpsc::channel(8);
        let mut pipe = ordered(rx, 2, |i: u32| async move {
            if i == 1 { Err(format!("bad {i}")) } else { Ok(i) }
        });
        for i in 0..3 {
            tx.send(i).await.unwrap();
        }
        drop(tx);

        assert_eq!(pipe.next().await.unwrap().unwrap(), 0);
        match pipe.next().await.unwrap() {
            Err(SlotError::Failed(e)) => assert_eq!(e, "bad 1"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(pipe.next().await.unwrap().unwrap(), 2);
        assert!(pipe.next().await.is_none());
    }

    #[tokio::test]
    async fn zero_window_is_treated_as_one() {
        let (tx, rx) = mpsc::channel(4);
        let mut pipe = ordered(rx, 0, |i: u8| async move { Ok::<_, ()>(i) });
        tx.send(5).await.unwrap();
        drop(tx);
        assert_eq!(pipe.next().await.unwrap().unwrap(), 5);
    }
}
