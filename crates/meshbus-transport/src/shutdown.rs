//! Shared cancellation token for coordinating background task shutdown.
//!
//! Transports, connections and the router all need the same three things:
//! a flag saying whether they are live, a `watch` channel to tell their
//! background tasks to stop, and the `JoinHandle`s of those tasks so that
//! stopping can wait for them. [`ShutdownToken`] bundles the three.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A cancellation token that coordinates shutdown of background tasks.
///
/// 1. [`subscribe()`](Self::subscribe) once per background task and check
///    the receiver in a `tokio::select!` branch.
/// 2. Register spawned tasks with [`add_task()`](Self::add_task).
/// 3. To stop, call [`signal_stop()`](Self::signal_stop) then
///    [`join_all()`](Self::join_all).
#[derive(Debug)]
pub struct ShutdownToken {
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    online: AtomicBool,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownToken {
    /// A token in the "not online, not stopped" state.
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            stop_tx,
            stop_rx,
            online: AtomicBool::new(false),
            task_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_rx.clone()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Resolve once the stop signal has been sent (immediately if it already was).
    pub async fn stopped(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so `wait_for` only returns once stopped.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    pub fn set_online(&self) {
        self.online.store(true, Ordering::SeqCst);
    }

    pub fn set_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub async fn add_task(&self, handle: JoinHandle<()>) {
        let mut handles = self.task_handles.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Number of tracked tasks that have not finished yet.
    pub async fn live_tasks(&self) -> usize {
        self.task_handles
            .lock()
            .await
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Send the stop signal. Idempotent.
    pub fn signal_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn signal_stop_and_go_offline(&self) {
        self.signal_stop();
        self.set_offline();
    }

    /// Await every registered task, including ones registered while waiting.
    ///
    /// Panics and cancellations inside tasks are ignored.
    pub async fn join_all(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = self.task_handles.lock().await.drain(..).collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_offline_and_running() {
        let token = ShutdownToken::new();
        assert!(!token.is_online());
        assert!(!token.is_stopped());
    }

    #[test]
    fn stop_is_visible_to_existing_and_late_subscribers() {
        let token = ShutdownToken::new();
        let early = token.subscribe();
        token.set_online();
        token.signal_stop_and_go_offline();
        token.signal_stop();
        assert!(*early.borrow());
        assert!(*token.subscribe().borrow());
        assert!(!token.is_online());
    }

    #[tokio::test]
    async fn stopped_resolves_after_signal() {
        let token = std::sync::Arc::new(ShutdownToken::new());
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.stopped().await })
        };
        token.signal_stop();
        waiter.await.unwrap();
        // Already stopped: resolves immediately.
        token.stopped().await;
    }

    #[tokio::test]
    async fn join_all_waits_for_tasks() {
        let token = ShutdownToken::new();
        let mut rx = token.subscribe();
        token
            .add_task(tokio::spawn(async move {
                let _ = rx.changed().await;
            }))
            .await;
        assert_eq!(token.live_tasks().await, 1);

        token.signal_stop();
        token.join_all().await;
        assert_eq!(token.live_tasks().await, 0);
    }

    #[tokio::test]
    async fn join_all_on_empty_token() {
        ShutdownToken::new().join_all().await;
    }
}
