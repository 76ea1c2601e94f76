//! Process-wide registry of live sessions, keyed by connection identifier.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

/// A session the registry can tear down with an application-initiated
/// disconnect. Implemented by both roles' session handles.
#[async_trait]
pub trait RegistrySession: Send + Sync {
    async fn close(&self) -> Result<()>;
}

/// Maps connection identifiers (e.g. the server URI) to active sessions.
///
/// At most one live session exists per key; registering over an occupied key
/// closes and evicts the occupant first. All mutation runs under a single
/// mutex, so eviction and installation are never observed interleaved.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<dyn RegistrySession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `session` under `key`, closing any prior occupant before the
    /// new session becomes reachable through [`get`](Self::get).
    pub async fn register(&self, key: impl Into<String>, session: Arc<dyn RegistrySession>) {
        let key = key.into();
        let mut sessions = self.sessions.lock().await;
        if let Some(previous) = sessions.remove(&key) {
            debug!(key = %key, "evicting existing session");
            if let Err(err) = previous.close().await {
                warn!(key = %key, error = %err, "failed to close evicted session");
            }
        }
        sessions.insert(key, session);
    }

    pub async fn get(&self, key: &str) -> Option<Arc<dyn RegistrySession>> {
        self.sessions.lock().await.get(key).cloned()
    }

    /// Drop the entry under `key` without closing it. Used once a session has
    /// already ended on its own.
    pub async fn remove(&self, key: &str) -> Option<Arc<dyn RegistrySession>> {
        self.sessions.lock().await.remove(key)
    }

    /// Close and evict every session whose key is in `keys`, or every session
    /// when `keys` is absent. Close failures are logged, never propagated;
    /// eviction always completes.
    pub async fn close_all(&self, keys: Option<&[String]>) {
        let drained: Vec<(String, Arc<dyn RegistrySession>)> = {
            let mut sessions = self.sessions.lock().await;
            match keys {
                None => sessions.drain().collect(),
                Some(keys) => keys
                    .iter()
                    .filter_map(|key| sessions.remove(key).map(|s| (key.clone(), s)))
                    .collect(),
            }
        };

        for (key, session) in drained {
            if let Err(err) = session.close().await {
                warn!(key = %key, error = %err, "session close failed during teardown");
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockSession {
        closed: AtomicBool,
        fail_close: bool,
    }

    impl MockSession {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                closed: AtomicBool::new(false),
                fail_close: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                closed: AtomicBool::new(false),
                fail_close: true,
            })
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RegistrySession for MockSession {
        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            if self.fail_close {
                return Err(Error::Other("close refused".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn register_closes_prior_session_under_same_key() {
        let registry = SessionRegistry::new();
        let first = MockSession::new();
        let second = MockSession::new();

        registry.register("wss://relay", first.clone()).await;
        registry.register("wss://relay", second.clone()).await;

        assert!(first.is_closed(), "evicted session must be closed");
        assert!(!second.is_closed());
        assert_eq!(registry.len().await, 1);

        assert!(registry.get("wss://relay").await.is_some());
        registry.close_all(None).await;
        assert!(second.is_closed(), "the replacement session is the live one");
    }

    #[tokio::test]
    async fn close_all_without_filter_empties_the_registry() {
        let registry = SessionRegistry::new();
        let a = MockSession::new();
        let b = MockSession::new();
        registry.register("a", a.clone()).await;
        registry.register("b", b.clone()).await;

        registry.close_all(None).await;

        assert!(registry.is_empty().await);
        assert!(a.is_closed());
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn close_all_with_filter_leaves_other_sessions_alone() {
        let registry = SessionRegistry::new();
        let keep = MockSession::new();
        let evict = MockSession::new();
        registry.register("keep", keep.clone()).await;
        registry.register("evict", evict.clone()).await;

        registry.close_all(Some(&["evict".to_string()])).await;

        assert!(evict.is_closed());
        assert!(!keep.is_closed());
        assert!(registry.get("keep").await.is_some());
        assert!(registry.get("evict").await.is_none());
    }

    #[tokio::test]
    async fn failing_close_still_evicts() {
        let registry = SessionRegistry::new();
        registry.register("bad", MockSession::failing()).await;

        registry.close_all(None).await;

        assert!(registry.is_empty().await);
    }
}
