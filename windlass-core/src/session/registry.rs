//! In-process cache of live sessions
//!
//! Sessions are created on first use (restoring any stored snapshot) and
//! dropped from memory once they have been idle for the configured timeout.
//! Idle eviction works on whole sessions and is unrelated to token-budget
//! eviction inside a window.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;

use super::{Clock, PersistenceEventSender, SystemClock};
use crate::config::WindlassConfig;
use crate::context::ContextWindowManager;
use crate::error::Result;
use crate::llm::{LLMProvider, StubLLMProvider};
use crate::storage::ContextStorage;

/// Shared handle to one session's manager. Callers serialize work on a
/// session by holding its lock.
pub type SessionHandle = Arc<Mutex<ContextWindowManager>>;

/// Filled once the session has been built. Concurrent callers for the same id
/// wait on the cell instead of the registry map.
type SessionSlot = Arc<OnceCell<SessionHandle>>;

struct SessionEntry {
    slot: SessionSlot,
    last_access: DateTime<Utc>,
}

/// Map of session id to live manager.
///
/// Lock order is session manager first, then the map. The map lock is never
/// held across storage I/O.
pub struct SessionRegistry {
    config: WindlassConfig,
    llm: Arc<dyn LLMProvider>,
    storage: Option<ContextStorage>,
    clock: Arc<dyn Clock>,
    event_sender: Option<PersistenceEventSender>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    /// Registry without storage, using the stub provider
    pub fn new(config: WindlassConfig) -> Self {
        Self {
            config,
            llm: Arc::new(StubLLMProvider),
            storage: None,
            clock: Arc::new(SystemClock),
            event_sender: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Provider shared by every session
    pub fn with_llm(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.llm = provider;
        self
    }

    /// Storage shared by every session
    pub fn with_storage(mut self, storage: ContextStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Channel receiving persistence outcomes of every session
    pub fn with_event_sender(mut self, sender: PersistenceEventSender) -> Self {
        self.event_sender = Some(sender);
        self
    }

    /// Handle for `session_id`, creating (and restoring) the session if it is
    /// not live.
    ///
    /// Restoring one session does not hold up callers of other sessions.
    pub async fn get_or_create(&self, session_id: &str) -> Result<SessionHandle> {
        let now = self.clock.now();
        let slot = {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions
                .entry(session_id.to_string())
                .or_insert_with(|| SessionEntry {
                    slot: Arc::new(OnceCell::new()),
                    last_access: now,
                });
            entry.last_access = now;
            entry.slot.clone()
        };

        match slot.get_or_try_init(|| self.open(session_id)).await {
            Ok(handle) => Ok(handle.clone()),
            Err(e) => {
                let mut sessions = self.sessions.lock().await;
                let failed = sessions
                    .get(session_id)
                    .is_some_and(|entry| Arc::ptr_eq(&entry.slot, &slot) && !slot.initialized());
                if failed {
                    sessions.remove(session_id);
                }
                Err(e)
            }
        }
    }

    async fn open(&self, session_id: &str) -> Result<SessionHandle> {
        let mut builder = ContextWindowManager::builder(session_id)
            .config(self.config.clone())
            .llm(self.llm.clone())
            .clock(self.clock.clone());
        if let Some(storage) = &self.storage {
            builder = builder.storage(storage.clone());
        }
        if let Some(sender) = &self.event_sender {
            builder = builder.event_sender(sender.clone());
        }

        let manager = builder.build().await?;
        tracing::debug!(session_id, "session opened");
        Ok(Arc::new(Mutex::new(manager)))
    }

    /// Handle for a live session, refreshing its access time
    pub async fn get(&self, session_id: &str) -> Option<SessionHandle> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get_mut(session_id)?;
        let handle = entry.slot.get()?.clone();
        entry.last_access = self.clock.now();
        Some(handle)
    }

    /// Drop a session from memory without saving it
    pub async fn remove(&self, session_id: &str) -> Option<SessionHandle> {
        let entry = self.sessions.lock().await.remove(session_id)?;
        entry.slot.get().cloned()
    }

    /// Ids of live sessions
    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .lock()
            .await
            .iter()
            .filter(|(_, entry)| entry.slot.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|entry| entry.slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every session idle for longer than the configured timeout,
    /// saving dirty ones first. Returns the dropped ids.
    ///
    /// A session is only dropped if it is still idle once its manager lock is
    /// held, so a caller that picks it up mid-sweep keeps the live instance.
    /// Sessions whose save fails stay in memory.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let timeout = chrono::Duration::from_std(self.config.sessions.idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let is_idle = |entry: &SessionEntry| {
            self.clock.now().signed_duration_since(entry.last_access) > timeout
        };

        let candidates: Vec<(String, SessionSlot)> = self
            .sessions
            .lock()
            .await
            .iter()
            .filter(|(_, entry)| entry.slot.initialized() && is_idle(*entry))
            .map(|(id, entry)| (id.clone(), entry.slot.clone()))
            .collect();

        let mut dropped = Vec::new();
        for (id, slot) in candidates {
            let Some(handle) = slot.get() else {
                continue;
            };
            let mut manager = handle.lock().await;
            if let Err(e) = save_if_dirty(&mut manager).await {
                tracing::warn!(session_id = %id, error = %e, "failed to save idle session; keeping it");
                continue;
            }

            let mut sessions = self.sessions.lock().await;
            let still_idle = sessions
                .get(&id)
                .is_some_and(|entry| Arc::ptr_eq(&entry.slot, &slot) && is_idle(entry));
            if still_idle {
                sessions.remove(&id);
                dropped.push(id);
            }
        }

        if !dropped.is_empty() {
            tracing::info!(swept = dropped.len(), "idle sessions dropped");
        }
        dropped
    }

    /// Save every dirty live session
    pub async fn flush_all(&self) {
        let handles: Vec<(String, SessionHandle)> = self
            .sessions
            .lock()
            .await
            .iter()
            .filter_map(|(id, entry)| entry.slot.get().map(|h| (id.clone(), h.clone())))
            .collect();
        for (id, handle) in &handles {
            let mut manager = handle.lock().await;
            if let Err(e) = save_if_dirty(&mut manager).await {
                tracing::warn!(session_id = %id, error = %e, "failed to save session");
            }
        }
    }

    /// Run [`Self::sweep_idle`] every `sessions.sweep_interval` until the
    /// registry is dropped
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sessions.sweep_interval.max(std::time::Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    tracing::debug!("session registry dropped; sweeper stopping");
                    break;
                };
                registry.sweep_idle().await;
            }
        })
    }
}

async fn save_if_dirty(manager: &mut ContextWindowManager) -> Result<()> {
    if !manager.is_dirty() || !manager.has_storage() {
        return Ok(());
    }
    manager.save_to_storage().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowConfig;
    use crate::message::MessageRole;
    use crate::session::ManualClock;
    use crate::error::WindlassError;
    use crate::storage::{ContextSnapshot, InMemorySnapshotStore, SnapshotStore};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Holds back loads of `gated` until notified
    struct GatedStore {
        gated: &'static str,
        gate: Arc<Notify>,
        inner: InMemorySnapshotStore,
    }

    #[async_trait]
    impl SnapshotStore for GatedStore {
        async fn load(&self, key: &str) -> Result<Option<ContextSnapshot>> {
            if key == self.gated {
                self.gate.notified().await;
            }
            self.inner.load(key).await
        }

        async fn save(&self, key: &str, snapshot: &ContextSnapshot) -> Result<()> {
            self.inner.save(key, snapshot).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }
    }

    struct ReadOnlyStore;

    #[async_trait]
    impl SnapshotStore for ReadOnlyStore {
        async fn load(&self, _key: &str) -> Result<Option<ContextSnapshot>> {
            Ok(None)
        }

        async fn save(&self, _key: &str, _snapshot: &ContextSnapshot) -> Result<()> {
            Err(WindlassError::Storage("read-only".to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }
    }

    fn config() -> WindlassConfig {
        let mut config = WindlassConfig::default();
        config.window = WindowConfig::new().with_auto_persist(false);
        config.sessions.idle_timeout = Duration::from_secs(3600);
        config.sessions.sweep_interval = Duration::from_secs(60);
        config
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_live_session() {
        let registry = SessionRegistry::new(config());
        let a = registry.get_or_create("a").await.unwrap();
        a.lock()
            .await
            .add_message(MessageRole::User, "hi", None)
            .await;

        let again = registry.get_or_create("a").await.unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(again.lock().await.get_messages().len(), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_sweep_drops_idle_and_saves_dirty() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(InMemorySnapshotStore::new());
        let registry = SessionRegistry::new(config())
            .with_storage(ContextStorage::new(store.clone()))
            .with_clock(clock.clone());

        let idle = registry.get_or_create("idle").await.unwrap();
        idle.lock()
            .await
            .add_message(MessageRole::User, "remember this", None)
            .await;
        drop(idle);

        clock.advance(chrono::Duration::minutes(50));
        registry.get_or_create("busy").await.unwrap();
        clock.advance(chrono::Duration::minutes(20));

        assert_eq!(registry.sweep_idle().await, vec!["idle".to_string()]);
        assert_eq!(registry.session_ids().await, vec!["busy".to_string()]);
        assert_eq!(store.len(), 1);

        // Coming back restores from storage
        let restored = registry.get_or_create("idle").await.unwrap();
        assert_eq!(restored.lock().await.get_messages()[0].content, "remember this");
    }

    #[tokio::test]
    async fn test_get_refreshes_access_time() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = SessionRegistry::new(config()).with_clock(clock.clone());
        registry.get_or_create("a").await.unwrap();

        clock.advance(chrono::Duration::minutes(59));
        assert!(registry.get("a").await.is_some());
        clock.advance(chrono::Duration::minutes(59));
        assert!(registry.sweep_idle().await.is_empty());
        assert!(registry.get("missing").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_periodically() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = Arc::new(SessionRegistry::new(config()).with_clock(clock.clone()));
        registry.get_or_create("a").await.unwrap();
        clock.advance(chrono::Duration::hours(2));

        let sweeper = registry.spawn_sweeper();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(registry.is_empty().await);

        sweeper.abort();
    }

    #[tokio::test]
    async fn test_session_in_use_survives_sweep() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = SessionRegistry::new(config()).with_clock(clock.clone());
        let handle = registry.get_or_create("s").await.unwrap();

        let mut guard = handle.lock().await;
        guard.add_message(MessageRole::User, "unsaved work", None).await;
        clock.advance(chrono::Duration::hours(2));

        let (registry_ref, handle_ref) = (&registry, &handle);
        let (swept, ()) = tokio::join!(registry.sweep_idle(), async move {
            // The sweep is now waiting on the manager lock
            tokio::task::yield_now().await;
            let again = registry_ref.get_or_create("s").await.unwrap();
            assert!(Arc::ptr_eq(&again, handle_ref));
            drop(guard);
        });

        assert!(swept.is_empty());
        assert_eq!(registry.session_ids().await, vec!["s".to_string()]);
        assert_eq!(handle.lock().await.get_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_slow_restore_does_not_block_other_sessions() {
        let gate = Arc::new(Notify::new());
        let store = GatedStore {
            gated: "slow",
            gate: gate.clone(),
            inner: InMemorySnapshotStore::new(),
        };
        let registry =
            SessionRegistry::new(config()).with_storage(ContextStorage::new(Arc::new(store)));

        let (slow, (fast, live)) = tokio::join!(registry.get_or_create("slow"), async {
            tokio::task::yield_now().await;
            let fast =
                tokio::time::timeout(Duration::from_secs(1), registry.get_or_create("fast")).await;
            let live = registry.session_ids().await;
            gate.notify_one();
            (fast, live)
        });

        assert!(matches!(fast, Ok(Ok(_))));
        assert_eq!(live, vec!["fast".to_string()]);
        assert!(slow.is_ok());
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_idle_session() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = SessionRegistry::new(config())
            .with_storage(ContextStorage::new(Arc::new(ReadOnlyStore)))
            .with_clock(clock.clone());

        let handle = registry.get_or_create("a").await.unwrap();
        handle
            .lock()
            .await
            .add_message(MessageRole::User, "not yet saved", None)
            .await;
        clock.advance(chrono::Duration::hours(2));

        assert!(registry.sweep_idle().await.is_empty());
        assert_eq!(registry.session_ids().await, vec!["a".to_string()]);
    }
}
