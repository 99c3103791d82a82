//! Retry-with-timeout bookkeeping for outstanding requests (spec §4.3).
//!
//! A task fires its attempt callback immediately on registration, then
//! again every `interval` until either [`TaskManager::complete`] /
//! [`TaskManager::fail`] removes it, or it exhausts `max_attempts`, in
//! which case the last attempt is itself the failure signal to the
//! caller. `complete`/`fail` on an unknown `uid` are no-ops — a reply can
//! race a timeout-driven removal and both sides tolerate the race.
//! Callbacks always run after the internal map lock is released, so a
//! callback is free to call back into the `TaskManager` (e.g. retry or
//! cancel another task) without deadlocking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

pub type Uid = String;

struct Task {
    attempt: Arc<dyn Fn() + Send + Sync>,
    cancel_tx: mpsc::Sender<()>,
}

/// Thread-safe `uid -> Task` registry driving periodic retry attempts.
#[derive(Clone)]
pub struct TaskManager {
    tasks: Arc<Mutex<HashMap<Uid, Task>>>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a task: `attempt` fires now and then every `interval` up
    /// to `max_attempts` times total, `on_exhausted` fires once if the
    /// task is still registered after the final attempt.
    pub fn start<F, G>(&self, uid: Uid, interval: Duration, max_attempts: u32, attempt: F, on_exhausted: G)
    where
        F: Fn() + Send + Sync + 'static,
        G: FnOnce() + Send + 'static,
    {
        let attempt = Arc::new(attempt);
        let (cancel_tx, mut cancel_rx) = mpsc::channel(1);

        {
            let mut tasks = self.tasks.lock();
            tasks.insert(
                uid.clone(),
                Task {
                    attempt: attempt.clone(),
                    cancel_tx,
                },
            );
        }
        (attempt)();

        let tasks = self.tasks.clone();
        let uid_for_task = uid.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            let mut attempts_made = 1u32;
            loop {
                tokio::select! {
                    _ = cancel_rx.recv() => return,
                    _ = ticker.tick() => {}
                }
                let still_registered = tasks.lock().contains_key(&uid_for_task);
                if !still_registered {
                    return;
                }
                attempts_made += 1;
                (attempt)();
                if attempts_made >= max_attempts {
                    let removed = tasks.lock().remove(&uid_for_task).is_some();
                    if removed {
                        on_exhausted();
                    }
                    return;
                }
            }
        });
    }

    /// Mark a task as successfully completed, removing it. No-op if
    /// `uid` is not (or is no longer) registered.
    pub fn complete(&self, uid: &str) {
        self.remove_and_signal(uid);
    }

    /// Mark a task as failed, removing it without waiting for further
    /// retries. No-op if `uid` is not (or is no longer) registered.
    pub fn fail(&self, uid: &str) {
        self.remove_and_signal(uid);
    }

    fn remove_and_signal(&self, uid: &str) {
        if let Some(task) = self.tasks.lock().remove(uid) {
            let _ = task.cancel_tx.try_send(());
        }
    }

    /// Drop every outstanding task without invoking any callback.
    pub fn cancel_all(&self) {
        self.tasks.lock().clear();
    }

    pub fn is_active(&self, uid: &str) -> bool {
        self.tasks.lock().contains_key(uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn attempt_fires_immediately() {
        let manager = TaskManager::new();
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();
        manager.start(
            "u1".into(),
            Duration::from_secs(60),
            3,
            move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            },
            || {},
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn complete_is_idempotent_on_unknown_uid() {
        let manager = TaskManager::new();
        manager.complete("never-registered");
        manager.fail("never-registered");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_callback_fires_once_after_max_attempts() {
        let manager = TaskManager::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let exhausted = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let exhausted_clone = exhausted.clone();

        manager.start(
            "u2".into(),
            Duration::from_millis(10),
            3,
            move || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                exhausted_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::advance(Duration::from_millis(35)).await;
        tokio::task::yield_now().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);
        assert!(!manager.is_active("u2"));
    }

    #[tokio::test(start_paused = true)]
    async fn complete_stops_further_attempts() {
        let manager = TaskManager::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        manager.start(
            "u3".into(),
            Duration::from_millis(10),
            5,
            move || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
            },
            || {},
        );
        manager.complete("u3");

        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_all_clears_without_callbacks() {
        let manager = TaskManager::new();
        let exhausted = Arc::new(AtomicU32::new(0));
        let exhausted_clone = exhausted.clone();
        manager.start(
            "u4".into(),
            Duration::from_secs(60),
            2,
            || {},
            move || {
                exhausted_clone.fetch_add(1, Ordering::SeqCst);
            },
        );
        manager.cancel_all();
        assert!(!manager.is_active("u4"));
        assert_eq!(exhausted.load(Ordering::SeqCst), 0);
    }
}
