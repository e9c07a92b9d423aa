//! Process-wide shutdown coordination.
//!
//! Built once by the entry point and shared by the task service (which
//! triggers it) and the RPC server (which drains on it).

use log::{debug, info};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

type Callback = Box<dyn FnOnce() + Send>;

/// Idempotent shutdown trigger with callbacks and an awaitable signal.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

struct Inner {
    tx: watch::Sender<bool>,
    callbacks: Mutex<Vec<Callback>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shutdown")
            .field("is_shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tx,
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Trigger shutdown and run the registered callbacks.
    ///
    /// Returns true only for the call that actually triggered it.
    pub fn shutdown(&self) -> bool {
        let triggered = self.inner.tx.send_if_modified(|down| {
            if *down {
                false
            } else {
                *down = true;
                true
            }
        });

        if !triggered {
            debug!("Shutdown already in progress");
            return false;
        }

        info!("Shutdown requested");
        let callbacks = std::mem::take(
            &mut *self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for callback in callbacks {
            callback();
        }
        true
    }

    /// Run `callback` once on shutdown, or right away if it already happened.
    pub fn register_callback(&self, callback: impl FnOnce() + Send + 'static) {
        let mut callbacks = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_shutdown() {
            drop(callbacks);
            callback();
            return;
        }
        callbacks.push(Box::new(callback));
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.tx.borrow()
    }

    /// Resolve once shutdown has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.inner.tx.subscribe();
        let _ = rx.wait_for(|down| *down).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_triggers_once() {
        let shutdown = Shutdown::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        shutdown.register_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!shutdown.is_shutdown());
        assert!(shutdown.shutdown());
        assert!(!shutdown.shutdown());
        assert!(shutdown.clone().is_shutdown());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_triggers() {
        let shutdown = Shutdown::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        shutdown.register_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let shutdown = shutdown.clone();
                std::thread::spawn(move || shutdown.shutdown())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_callback_runs_immediately() {
        let shutdown = Shutdown::new();
        shutdown.shutdown();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        shutdown.register_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
