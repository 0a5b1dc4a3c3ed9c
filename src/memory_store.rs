use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::Config;
use crate::persistence::PersistenceLayer;
use crate::record::SessionRecord;
use crate::user::User;

/// # In-memory persistence backend
///
/// This store keeps binary-encoded session records in memory, without any
/// durability. It is intended for tests, examples, and debugging; a real
/// deployment connects its database through [`PersistenceLayer`].
///
/// Besides the session records it holds a user registry (see
/// [`add_user`](MemoryStore::add_user)) so the log-in flow can be exercised,
/// and an optional role hierarchy. Expired sessions are only dropped when
/// [`delete_expired_sessions`](MemoryStore::delete_expired_sessions) is
/// called.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreData>,
}

#[derive(Default)]
struct MemoryStoreData {
    sessions: HashMap<String, Vec<u8>>,
    user_index: HashMap<String, HashSet<String>>,
    users: HashMap<String, Arc<dyn User>>,
    roles: HashMap<String, String>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user so [`load_user`](PersistenceLayer::load_user) can
    /// resolve it.
    pub fn add_user(&self, user: Arc<dyn User>) {
        let mut inner = self.inner.lock().unwrap();
        inner.users.insert(user.id(), user);
    }

    /// Installs the role hierarchy returned by
    /// [`role_hierarchy`](PersistenceLayer::role_hierarchy), as a
    /// child-to-parent mapping.
    pub fn set_role_hierarchy(&self, hierarchy: HashMap<String, String>) {
        self.inner.lock().unwrap().roles = hierarchy;
    }

    /// The number of stored session records.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// Whether the store holds no session records.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().sessions.is_empty()
    }

    /// Drops all session records that have expired under the given
    /// configuration, a sweep the crate itself never performs. Records
    /// that no longer decode are dropped as well. Returns how many were
    /// removed.
    pub fn delete_expired_sessions(&self, config: &Config) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.sessions.len();
        inner.sessions.retain(|_, payload| {
            SessionRecord::decode(payload)
                .map(|record| !record.expired(config))
                .unwrap_or(false)
        });
        before - inner.sessions.len()
    }
}

impl MemoryStoreData {
    fn reindex(&mut self, id: &str, user_id: Option<&str>) {
        for sessions in self.user_index.values_mut() {
            sessions.remove(id);
        }
        if let Some(user_id) = user_id {
            self.user_index
                .entry(user_id.to_string())
                .or_default()
                .insert(id.to_string());
        }
    }
}

#[async_trait]
impl PersistenceLayer for MemoryStore {
    async fn load_session(&self, id: &str) -> anyhow::Result<Option<SessionRecord>> {
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .get(id)
            .map(|payload| SessionRecord::decode(payload))
            .transpose()
            .map_err(anyhow::Error::from)
    }

    async fn save_session(&self, id: &str, record: &SessionRecord) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.reindex(id, record.user_id.as_deref());
        inner.sessions.insert(id.to_string(), record.encode());
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.reindex(id, None);
        inner.sessions.remove(id);
        Ok(())
    }

    async fn user_sessions(&self, user_id: &str) -> anyhow::Result<Option<Vec<String>>> {
        let inner = self.inner.lock().unwrap();
        let mut sessions: Vec<String> = inner
            .user_index
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        sessions.sort();
        Ok(Some(sessions))
    }

    async fn load_user(&self, user_id: &str) -> anyhow::Result<Option<Arc<dyn User>>> {
        Ok(self.inner.lock().unwrap().users.get(user_id).cloned())
    }

    async fn role_hierarchy(&self) -> anyhow::Result<HashMap<String, String>> {
        Ok(self.inner.lock().unwrap().roles.clone())
    }
}

impl Debug for MemoryStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("MemoryStore")
            .field("sessions", &inner.sessions.len())
            .field("users", &inner.users.len())
            .finish_non_exhaustive()
    }
}
