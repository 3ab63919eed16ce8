//! Keyed work queue for the database-driven controllers.
//!
//! Reconcile requests arrive as a stream of keys (row identities) from any
//! number of sources. At most one reconcile per key is in flight; a request
//! for a key that is already running collapses into a single rerun once the
//! current pass finishes. Failed passes are retried after a fixed delay,
//! forever, until the token is cancelled. A key has at most one delayed
//! retry pending; failures while one is scheduled do not add another.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc;
use futures::stream::{self, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metrics::Metrics;

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub name: &'static str,
    pub concurrency: usize,
    pub retry_delay: Duration,
}

/// Drive `reconcile` for every key produced by `triggers` until `cancel`
/// fires. In-flight passes are allowed to finish.
pub async fn run<K, S, F, Fut>(
    config: RunnerConfig,
    triggers: S,
    metrics: Arc<dyn Metrics>,
    cancel: CancellationToken,
    reconcile: F,
) where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    S: Stream<Item = K> + Send,
    F: Fn(K) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    let (retry_tx, retry_rx) = mpsc::unbounded::<K>();
    // key → rerun requested while in flight
    let in_flight: Mutex<HashMap<K, bool>> = Mutex::new(HashMap::new());
    // keys with a delayed retry already scheduled
    let retry_pending: Mutex<HashSet<K>> = Mutex::new(HashSet::new());

    info!(controller = config.name, "starting controller");
    metrics.controller_health(config.name, true);

    let config = &config;
    let in_flight = &in_flight;
    let retry_pending = &retry_pending;
    let reconcile = &reconcile;
    let metrics = &metrics;
    let requests = stream::select(
        triggers.map(|key| (key, false)),
        retry_rx.map(|key| (key, true)),
    );
    requests
        .take_until(cancel.clone().cancelled_owned())
        .for_each_concurrent(config.concurrency.max(1), |(key, is_retry)| {
            let retry_tx = retry_tx.clone();
            let cancel = cancel.clone();
            async move {
                if is_retry {
                    lock(retry_pending).remove(&key);
                }
                if !claim(in_flight, &key) {
                    debug!(controller = config.name, %key, "already in flight, coalesced");
                    return;
                }
                loop {
                    match reconcile(key.clone()).await {
                        Ok(()) => debug!(controller = config.name, %key, "reconciled"),
                        Err(e) => {
                            metrics.reconcile_error(config.name, e.category());
                            let first = lock(retry_pending).insert(key.clone());
                            if first {
                                warn!(
                                    controller = config.name,
                                    %key,
                                    %e,
                                    delay = ?config.retry_delay,
                                    "reconcile failed, retrying"
                                );
                                schedule_retry(
                                    key.clone(),
                                    config.retry_delay,
                                    retry_tx.clone(),
                                    cancel.clone(),
                                );
                            } else {
                                warn!(
                                    controller = config.name,
                                    %key,
                                    %e,
                                    "reconcile failed, retry already scheduled"
                                );
                            }
                        }
                    }
                    if !release(in_flight, &key) {
                        break;
                    }
                }
            }
        })
        .await;

    metrics.controller_health(config.name, false);
    info!(controller = config.name, "controller stopped");
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Mark `key` in flight. Returns false (and requests a rerun) if it
/// already was.
fn claim<K: Eq + Hash + Clone>(in_flight: &Mutex<HashMap<K, bool>>, key: &K) -> bool {
    let mut map = lock(in_flight);
    match map.get_mut(key) {
        Some(rerun) => {
            *rerun = true;
            false
        }
        None => {
            map.insert(key.clone(), false);
            true
        }
    }
}

/// Finish a pass for `key`. Returns true if a rerun was requested meanwhile,
/// in which case the key stays claimed.
fn release<K: Eq + Hash>(in_flight: &Mutex<HashMap<K, bool>>, key: &K) -> bool {
    let mut map = lock(in_flight);
    match map.get_mut(key) {
        Some(rerun) if *rerun => {
            *rerun = false;
            true
        }
        _ => {
            map.remove(key);
            false
        }
    }
}

fn schedule_retry<K: Send + 'static>(
    key: K,
    delay: Duration,
    tx: mpsc::UnboundedSender<K>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                let _ = tx.unbounded_send(key);
            }
        }
    });
}

/// Emit every key returned by `list`, once per `every`, starting
/// immediately. A failed listing is counted and skipped.
pub fn periodic<K, L, Fut>(
    name: &'static str,
    every: Duration,
    metrics: Arc<dyn Metrics>,
    list: L,
) -> impl Stream<Item = K> + Send
where
    K: Send + 'static,
    L: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<K>>> + Send,
{
    let tick = tokio::time::interval(every);
    stream::unfold((tick, list, metrics), move |(mut tick, list, metrics)| async move {
        tick.tick().await;
        let keys = match list().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(controller = name, %e, "periodic listing failed");
                metrics.reconcile_error(name, e.category());
                Vec::new()
            }
        };
        Some((stream::iter(keys), (tick, list, metrics)))
    })
    .flatten()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::Error;
    use crate::metrics::recording::RecordingMetrics;

    fn config() -> RunnerConfig {
        RunnerConfig {
            name: "test",
            concurrency: 4,
            retry_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn claims_coalesce_into_one_rerun() {
        let map = Mutex::new(HashMap::new());
        assert!(claim(&map, &"a"));
        assert!(!claim(&map, &"a"));
        assert!(!claim(&map, &"a"));
        assert!(claim(&map, &"b"));
        assert!(release(&map, &"a"));
        assert!(!release(&map, &"a"));
        assert!(claim(&map, &"a"));
    }

    #[tokio::test]
    async fn every_key_is_reconciled_until_cancelled() {
        let metrics = Arc::new(RecordingMetrics::default());
        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded::<u32>();
        for k in [1, 2, 3] {
            tx.unbounded_send(k).unwrap();
        }

        let seen_in = seen.clone();
        let stopper = cancel.clone();
        run(config(), rx, metrics.clone(), cancel, move |k| {
            let seen = seen_in.clone();
            let stopper = stopper.clone();
            async move {
                let mut s = seen.lock().unwrap();
                s.push(k);
                if s.len() == 3 {
                    stopper.cancel();
                }
                Ok(())
            }
        })
        .await;

        let mut keys = seen.lock().unwrap().clone();
        keys.sort();
        assert_eq!(keys, [1, 2, 3]);
        assert_eq!(metrics.count("health:test:true"), 1);
        assert_eq!(metrics.count("health:test:false"), 1);
    }

    #[tokio::test]
    async fn failures_are_retried_after_the_delay() {
        let metrics = Arc::new(RecordingMetrics::default());
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded::<&'static str>();
        tx.unbounded_send("vdc-1").unwrap();

        let attempts_in = attempts.clone();
        let stopper = cancel.clone();
        run(config(), rx, metrics.clone(), cancel, move |_| {
            let attempts = attempts_in.clone();
            let stopper = stopper.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(Error::malformed("no namespace"));
                }
                stopper.cancel();
                Ok(())
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.count("reconcile_error:test:malformed"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_triggers_share_one_retry_chain() {
        let metrics = Arc::new(RecordingMetrics::default());
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let config = RunnerConfig {
            retry_delay: Duration::from_millis(100),
            ..config()
        };
        // The same key five times, 50ms apart, then nothing.
        let triggers = stream::unfold(0u32, |sent| async move {
            if sent == 5 {
                return None;
            }
            if sent > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Some(("vdc-1", sent + 1))
        });

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stopper.cancel();
        });
        let attempts_in = attempts.clone();
        run(config, triggers, metrics.clone(), cancel, move |_| {
            let attempts = attempts_in.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::malformed("no namespace"))
            }
        })
        .await;

        // Five triggered passes plus a single chain of ~10 retries.
        let n = attempts.load(Ordering::SeqCst);
        assert!((10..=16).contains(&n), "attempts: {n}");
        assert_eq!(metrics.count("reconcile_error:test:malformed"), n);
    }

    #[tokio::test]
    async fn periodic_lists_immediately() {
        let metrics: Arc<dyn Metrics> = Arc::new(RecordingMetrics::default());
        let keys: Vec<u32> = periodic("test", Duration::from_secs(3600), metrics, || async {
            Ok(vec![7, 8])
        })
        .take(2)
        .collect()
        .await;
        assert_eq!(keys, [7, 8]);
    }
}
