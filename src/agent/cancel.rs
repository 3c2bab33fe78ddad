//! Per-session cancellation plumbing.
//!
//! Each run registers a [`CancelHandle`] keyed by session key; the matching
//! [`CancelToken`] propagates into the model HTTP call, tool executions, and
//! sandboxed subprocesses.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::watch;

/// Sender kept alive for the process lifetime so unstoppable tokens never
/// observe a closed channel.
static UNSTOPPABLE: Lazy<(watch::Sender<bool>, watch::Receiver<bool>)> =
    Lazy::new(|| watch::channel(false));

/// Observer side of a cancellation signal. Cheap to clone.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that can never fire. Used where no run owns the execution.
    pub fn unstoppable() -> Self {
        CancelToken {
            rx: UNSTOPPABLE.1.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation fires. Pends forever if the handle is
    /// dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

/// Owner side of a cancellation signal.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Registry of in-flight runs by session key.
#[derive(Default)]
pub struct CancelRegistry {
    handles: DashMap<String, CancelHandle>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        CancelRegistry {
            handles: DashMap::new(),
        }
    }

    /// Register a new run for the session, returning its token.
    pub fn register(&self, session_key: &str) -> CancelToken {
        let (handle, token) = CancelHandle::new();
        self.handles.insert(session_key.to_string(), handle);
        token
    }

    pub fn deregister(&self, session_key: &str) {
        self.handles.remove(session_key);
    }

    /// Fire the abort signal for a session's in-flight run, if any.
    /// Returns whether a run was actually signalled.
    pub fn cancel(&self, session_key: &str) -> bool {
        if let Some(handle) = self.handles.get(session_key) {
            handle.cancel();
            true
        } else {
            false
        }
    }

    pub fn in_flight(&self) -> usize {
        self.handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn token_fires_on_cancel() {
        let (handle, token) = CancelHandle::new();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
        timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("cancelled() should resolve");
    }

    #[tokio::test]
    async fn unstoppable_token_never_fires() {
        let token = CancelToken::unstoppable();
        assert!(!token.is_cancelled());
        assert!(
            timeout(Duration::from_millis(50), token.cancelled())
                .await
                .is_err(),
            "unstoppable token must pend"
        );
    }

    #[tokio::test]
    async fn registry_cancels_by_key() {
        let registry = CancelRegistry::new();
        let token = registry.register("a:b:c");
        assert!(registry.cancel("a:b:c"));
        assert!(token.is_cancelled());
        registry.deregister("a:b:c");
        assert!(!registry.cancel("a:b:c"));
    }
}
