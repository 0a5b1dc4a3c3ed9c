use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::session::{Session, SessionEnv};

/// Write-through LRU cache for sessions, the in-memory front of the
/// persistence layer.
///
/// The cache exclusively owns live [`Session`] objects: all components fetch
/// through it so that concurrent requests for the same identifier observe
/// the same instance. Eviction is driven both by idle age and by capacity;
/// evicted sessions are written back first so their last access time stays
/// durable.
pub(crate) struct SessionCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    env: SessionEnv,
}

impl SessionCache {
    pub(crate) fn new(env: SessionEnv) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                sessions: RwLock::new(HashMap::new()),
                env,
            }),
        }
    }

    /// Returns the session with the given identifier, from the cache if
    /// present, otherwise loaded from the persistence layer (and cached if
    /// capacity permits). Does not update the session's access time.
    pub(crate) async fn get(&self, id: &str) -> Result<Option<Arc<Session>>> {
        {
            let sessions = self.inner.sessions.read().await;
            if let Some(session) = sessions.get(id) {
                return Ok(Some(session.clone()));
            }
        }

        let Some(record) = self
            .inner
            .env
            .backend
            .load_session(id)
            .await
            .map_err(Error::Backend)?
        else {
            return Ok(None);
        };
        trace!(session_id = %id, "loaded session from the persistence layer");

        // A logged-in record stores only the user identifier; resolve it
        // before the session is handed out.
        let user = match &record.user_id {
            Some(user_id) => self
                .inner
                .env
                .backend
                .load_user(user_id)
                .await
                .map_err(Error::Backend)?,
            None => None,
        };
        let session = Session::from_record(id.to_string(), record, user, self.inner.env.clone());

        if self.inner.env.config.max_cache_size != 0 {
            let mut sessions = self.inner.sessions.write().await;
            // Another request may have loaded the same identifier while we
            // were not holding the lock; it wins, so both observe one
            // instance.
            if let Some(existing) = sessions.get(id) {
                return Ok(Some(existing.clone()));
            }
            self.compact(&mut sessions, 1).await?;
            sessions.insert(id.to_string(), session.clone());
        }

        Ok(Some(session))
    }

    /// Inserts or refreshes a session, stamping its access time, then
    /// writes it through to the persistence layer. A write-through failure
    /// is returned but does not undo the insertion; the cache holds the
    /// authoritative in-memory state.
    pub(crate) async fn set(&self, session: &Arc<Session>) -> Result<()> {
        session.stamp_last_access(Utc::now());
        self.put(session).await
    }

    /// Like [`set`](Self::set), but leaves the session's access time alone.
    /// Rotation uses this to store shadows with a backdated stamp.
    pub(crate) async fn put(&self, session: &Arc<Session>) -> Result<()> {
        let id = session.id();
        {
            let mut sessions = self.inner.sessions.write().await;
            let required_space = usize::from(!sessions.contains_key(&id));
            self.compact(&mut sessions, required_space).await?;
            if self.inner.env.config.max_cache_size != 0 {
                sessions.insert(id.clone(), session.clone());
            }
        }

        let record = session.to_record();
        self.inner
            .env
            .backend
            .save_session(&id, &record)
            .await
            .map_err(Error::Backend)
    }

    /// Removes a session from the cache and from the persistence layer.
    pub(crate) async fn delete(&self, id: &str) -> Result<()> {
        let mut sessions = self.inner.sessions.write().await;
        sessions.remove(id);
        self.inner
            .env
            .backend
            .delete_session(id)
            .await
            .map_err(Error::Backend)
    }

    /// Writes every cached session back through the persistence layer, so
    /// last access times are durable, then clears the cache. Intended as a
    /// shutdown hook; write-back failures are logged, not returned.
    pub(crate) async fn purge_all(&self) {
        let mut sessions = self.inner.sessions.write().await;
        for (id, session) in sessions.iter() {
            let record = session.to_record();
            if let Err(error) = self.inner.env.backend.save_session(id, &record).await {
                warn!(session_id = %id, error = %error, "failed to write session back during purge");
            }
        }
        sessions.clear();
    }

    /// Number of sessions currently cached.
    pub(crate) async fn size(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Makes room for `required_space` additional sessions. Sessions idle
    /// beyond the configured threshold are written back and dropped first;
    /// if the capacity bound still does not fit, the sessions with the
    /// oldest access time follow, one by one.
    async fn compact(
        &self,
        sessions: &mut HashMap<String, Arc<Session>>,
        required_space: usize,
    ) -> Result<()> {
        let config = &self.inner.env.config;
        let now = Utc::now().timestamp_millis();
        let expiry_ms = i64::try_from(config.cache_expiry.as_millis()).unwrap_or(i64::MAX);

        let idle: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| now - session.last_access_millis() > expiry_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in idle {
            if let Some(session) = sessions.get(&id) {
                let record = session.to_record();
                self.inner
                    .env
                    .backend
                    .save_session(&id, &record)
                    .await
                    .map_err(Error::Backend)?;
                sessions.remove(&id);
                debug!(session_id = %id, "wrote back and dropped idle cached session");
            }
        }

        if config.max_cache_size < 0 {
            return Ok(());
        }
        let max = config.max_cache_size as usize;
        let required_space = required_space.min(max);
        while sessions.len() + required_space > max {
            let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, session)| session.last_access_millis())
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            if let Some(session) = sessions.get(&oldest) {
                let record = session.to_record();
                self.inner
                    .env
                    .backend
                    .save_session(&oldest, &record)
                    .await
                    .map_err(Error::Backend)?;
            }
            sessions.remove(&oldest);
            debug!(session_id = %oldest, "wrote back and dropped oldest cached session");
        }

        Ok(())
    }
}

impl Clone for SessionCache {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::DateTime;

    use super::*;
    use crate::config::Config;
    use crate::persistence::PersistenceLayer;
    use crate::record::SessionRecord;

    #[derive(Debug, Default)]
    struct CountingStore {
        records: Mutex<HashMap<String, SessionRecord>>,
        loaded: AtomicUsize,
        saved: AtomicUsize,
        deleted: AtomicUsize,
    }

    #[async_trait]
    impl PersistenceLayer for CountingStore {
        async fn load_session(&self, id: &str) -> anyhow::Result<Option<SessionRecord>> {
            self.loaded.fetch_add(1, Ordering::SeqCst);
            Ok(self.records.lock().unwrap().get(id).cloned())
        }

        async fn save_session(&self, id: &str, record: &SessionRecord) -> anyhow::Result<()> {
            self.saved.fetch_add(1, Ordering::SeqCst);
            self.records
                .lock()
                .unwrap()
                .insert(id.to_string(), record.clone());
            Ok(())
        }

        async fn delete_session(&self, id: &str) -> anyhow::Result<()> {
            self.deleted.fetch_add(1, Ordering::SeqCst);
            self.records.lock().unwrap().remove(id);
            Ok(())
        }
    }

    fn record(last_access: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            created: last_access,
            last_access,
            last_ip: "10.0.0.1:80".to_string(),
            user_agent_hash: 0,
            reference_id: None,
            user_id: None,
            data: HashMap::new(),
        }
    }

    fn cache_with(store: Arc<CountingStore>, config: Config) -> (SessionCache, SessionEnv) {
        let env = SessionEnv {
            config: Arc::new(config),
            backend: store,
        };
        (SessionCache::new(env.clone()), env)
    }

    fn new_session(id: &str, env: &SessionEnv) -> Arc<Session> {
        Session::new(id.to_string(), "10.0.0.1:80".to_string(), 0, env.clone())
    }

    #[tokio::test]
    async fn get_loads_missing_sessions_once() {
        let store = Arc::new(CountingStore::default());
        store
            .records
            .lock()
            .unwrap()
            .insert("s3".to_string(), record(Utc::now()));
        let (cache, _env) = cache_with(store.clone(), Config::new());

        assert!(cache.get("s2").await.unwrap().is_none());
        let session = cache.get("s3").await.unwrap().unwrap();
        assert_eq!(session.id(), "s3");
        // The second fetch is served from the cache.
        assert!(cache.get("s3").await.unwrap().is_some());
        assert_eq!(store.loaded.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn set_writes_through_and_delete_removes() {
        let store = Arc::new(CountingStore::default());
        let (cache, env) = cache_with(store.clone(), Config::new());

        let session = new_session("s1", &env);
        cache.set(&session).await.unwrap();
        assert_eq!(store.saved.load(Ordering::SeqCst), 1);
        assert!(store.records.lock().unwrap().contains_key("s1"));

        cache.delete("s1").await.unwrap();
        assert_eq!(store.deleted.load(Ordering::SeqCst), 1);
        assert!(!store.records.lock().unwrap().contains_key("s1"));
        // Deleting an uncached, absent session is still success.
        cache.delete("s1").await.unwrap();
    }

    #[tokio::test]
    async fn compaction_drops_idle_then_oldest_sessions() {
        let store = Arc::new(CountingStore::default());
        let (cache, env) = cache_with(
            store.clone(),
            Config::new()
                .with_max_cache_size(2)
                .with_cache_expiry(Duration::from_millis(10)),
        );

        cache.set(&new_session("s1", &env)).await.unwrap();
        cache.set(&new_session("s2", &env)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;

        // Both cached sessions are now idle; inserting two more first
        // writes them back and drops them.
        cache.set(&new_session("s3", &env)).await.unwrap();
        cache.set(&new_session("s4", &env)).await.unwrap();
        assert_eq!(cache.size().await, 2);
        assert!(store.records.lock().unwrap().contains_key("s1"));

        // At capacity, the entry with the oldest access time makes room.
        cache.set(&new_session("s5", &env)).await.unwrap();
        assert_eq!(cache.size().await, 2);
        assert!(cache.get("s3").await.unwrap().is_some());
        assert_eq!(store.loaded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_capacity_disables_caching() {
        let store = Arc::new(CountingStore::default());
        let (cache, env) = cache_with(store.clone(), Config::new().with_max_cache_size(0));

        cache.set(&new_session("s1", &env)).await.unwrap();
        assert_eq!(cache.size().await, 0);
        assert_eq!(store.saved.load(Ordering::SeqCst), 1);
        // Every get goes to the persistence layer.
        assert!(cache.get("s1").await.unwrap().is_some());
        assert!(cache.get("s1").await.unwrap().is_some());
        assert_eq!(store.loaded.load(Ordering::SeqCst), 2);
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test]
    async fn purge_all_writes_back_and_clears() {
        let store = Arc::new(CountingStore::default());
        let (cache, env) = cache_with(store.clone(), Config::new());

        cache.set(&new_session("s1", &env)).await.unwrap();
        cache.set(&new_session("s2", &env)).await.unwrap();
        store.saved.store(0, Ordering::SeqCst);

        cache.purge_all().await;
        assert_eq!(cache.size().await, 0);
        assert_eq!(store.saved.load(Ordering::SeqCst), 2);
    }
}
