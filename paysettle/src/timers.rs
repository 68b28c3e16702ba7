use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;

struct Scheduled {
    token: u64,
    handle: JoinHandle<()>,
}

type Table = Arc<Mutex<HashMap<String, Scheduled>>>;

/// One-shot expiry callbacks keyed by payment id.
///
/// Firing and cancelling both resolve by removing the entry under the table
/// lock, so for any id at most one of them wins. A callback that won runs to
/// completion even if `cancel` is called while it executes.
#[derive(Default)]
pub struct ExpiryTimers {
    table: Table,
    next_token: AtomicU64,
}

impl ExpiryTimers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(table: &Table) -> MutexGuard<'_, HashMap<String, Scheduled>> {
        table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Must be called within a tokio runtime. Replaces any timer already
    /// registered for `id`.
    pub fn schedule<F, Fut>(&self, id: &str, delay: Duration, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let table = self.table.clone();
        let key = id.to_string();

        // Held across spawn so the entry exists before the task can look for it.
        let mut guard = Self::lock(&self.table);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let won = {
                let mut entries = Self::lock(&table);
                match entries.get(&key) {
                    Some(entry) if entry.token == token => {
                        entries.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if won {
                debug!("timer fired id={key}");
                callback().await;
            }
        });
        if let Some(previous) = guard.insert(id.to_string(), Scheduled { token, handle }) {
            previous.handle.abort();
        }
    }

    /// True if this call prevented the callback from running.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = Self::lock(&self.table).remove(id);
        match removed {
            Some(entry) => {
                entry.handle.abort();
                debug!("timer cancelled id={id}");
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, id: &str) -> bool {
        Self::lock(&self.table).contains_key(id)
    }

    pub fn len(&self) -> usize {
        Self::lock(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aborts every pending timer. Used on shutdown.
    pub fn clear(&self) {
        for (_, entry) in Self::lock(&self.table).drain() {
            entry.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let timers = ExpiryTimers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        timers.schedule("inv", Duration::from_secs(60), move || async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.is_scheduled("inv"));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!timers.is_scheduled("inv"));
        assert!(!timers.cancel("inv"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_preempts_firing() {
        let timers = ExpiryTimers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        timers.schedule("inv", Duration::from_secs(5), move || async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.cancel("inv"));
        assert!(!timers.cancel("inv"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_previous_timer() {
        let timers = ExpiryTimers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for delay in [5, 10] {
            let h = hits.clone();
            timers.schedule("inv", Duration::from_secs(delay), move || async move {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(timers.len(), 1);
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_and_fire_never_both_win() {
        let timers = Arc::new(ExpiryTimers::new());
        for round in 0..200 {
            let id = format!("inv-{round}");
            let fired = Arc::new(AtomicUsize::new(0));
            let f = fired.clone();
            timers.schedule(&id, Duration::from_millis(1), move || async move {
                f.fetch_add(1, Ordering::SeqCst);
            });
            let t = timers.clone();
            let cancel_id = id.clone();
            let cancelled = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                t.cancel(&cancel_id)
            })
            .await
            .unwrap();
            if cancelled {
                tokio::time::sleep(Duration::from_millis(5)).await;
                assert_eq!(fired.load(Ordering::SeqCst), 0, "round {round}: cancelled timer fired");
            } else {
                for _ in 0..500 {
                    if fired.load(Ordering::SeqCst) == 1 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                assert_eq!(fired.load(Ordering::SeqCst), 1, "round {round}: timer neither fired nor cancelled");
            }
        }
    }
}
