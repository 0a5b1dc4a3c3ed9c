use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::mem;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::persistence::PersistenceLayer;
use crate::record::SessionRecord;
use crate::user::User;

/// The configuration and backend handles shared by every component.
#[derive(Clone)]
pub(crate) struct SessionEnv {
    pub(crate) config: Arc<Config>,
    pub(crate) backend: Arc<dyn PersistenceLayer>,
}

/// A browser session which may persist across multiple HTTP requests. A
/// session is usually obtained with
/// [`SessionManager::start`](crate::SessionManager::start) and may be ended
/// with [`SessionManager::destroy`](crate::SessionManager::destroy).
///
/// Sessions are uniquely identified by their session identifier, which is
/// exchanged regularly to prevent hijacking; see
/// [`SessionManager::regenerate_id`](crate::SessionManager::regenerate_id).
///
/// All methods are thread-safe. The data operations ([`set`](Session::set),
/// [`take`](Session::take), [`remove`](Session::remove)) write through to
/// the persistence layer and surface its errors.
pub struct Session {
    /// Milliseconds since the epoch of the last access, kept outside the
    /// state lock so the cache can scan ages lock-free.
    last_access_ms: AtomicI64,
    state: RwLock<SessionState>,
    env: SessionEnv,
}

struct SessionState {
    /// The session identifier. Not part of the stored record; it is the
    /// storage key.
    id: String,
    created: DateTime<Utc>,
    last_ip: String,
    user_agent_hash: u64,
    /// When set, this session is a shadow redirecting to its successor.
    reference_id: Option<String>,
    user: Option<Arc<dyn User>>,
    data: HashMap<String, Value>,
}

impl Session {
    /// A fresh primary session, created `now` from the request that asked
    /// for it.
    pub(crate) fn new(
        id: String,
        remote_addr: String,
        user_agent_hash: u64,
        env: SessionEnv,
    ) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            last_access_ms: AtomicI64::new(now.timestamp_millis()),
            state: RwLock::new(SessionState {
                id,
                created: now,
                last_ip: remote_addr,
                user_agent_hash,
                reference_id: None,
                user: None,
                data: HashMap::new(),
            }),
            env,
        })
    }

    /// Revives a session from its stored record, with the user already
    /// resolved by the caller.
    pub(crate) fn from_record(
        id: String,
        record: SessionRecord,
        user: Option<Arc<dyn User>>,
        env: SessionEnv,
    ) -> Arc<Self> {
        Arc::new(Self {
            last_access_ms: AtomicI64::new(record.last_access.timestamp_millis()),
            state: RwLock::new(SessionState {
                id,
                created: record.created,
                last_ip: record.last_ip,
                user_agent_hash: record.user_agent_hash,
                reference_id: record.reference_id,
                user,
                data: record.data,
            }),
            env,
        })
    }

    /// Builds the shadow left behind by a rotation: it lives under the
    /// retired identifier, points at the successor, and carries no data.
    /// Its access time is backdated by one rotation interval so the only
    /// thing that can expire it is the grace window.
    pub(crate) fn shadow_of(primary: &Arc<Session>, old_id: String, env: SessionEnv) -> Arc<Self> {
        let (created, last_ip, user_agent_hash, successor) = {
            let state = primary.state.read().unwrap();
            (
                state.created,
                state.last_ip.clone(),
                state.user_agent_hash,
                state.id.clone(),
            )
        };
        let backdated = Utc::now()
            - TimeDelta::from_std(env.config.id_rotation_interval).unwrap_or_else(|_| TimeDelta::zero());
        Arc::new(Self {
            last_access_ms: AtomicI64::new(backdated.timestamp_millis()),
            state: RwLock::new(SessionState {
                id: old_id,
                created,
                last_ip,
                user_agent_hash,
                reference_id: Some(successor),
                user: None,
                data: HashMap::new(),
            }),
            env,
        })
    }

    /// The current session identifier.
    pub fn id(&self) -> String {
        self.state.read().unwrap().id.clone()
    }

    /// When this session was created. Rotation resets this.
    pub fn created(&self) -> DateTime<Utc> {
        self.state.read().unwrap().created
    }

    /// The time this session was last accessed.
    pub fn last_access(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_access_ms.load(Ordering::Relaxed))
            .unwrap_or_else(Utc::now)
    }

    /// The remote address (`ip:port`) observed on the last request.
    pub fn last_ip(&self) -> String {
        self.state.read().unwrap().last_ip.clone()
    }

    /// Fingerprint of the last request's `User-Agent` header; 0 when the
    /// header was absent.
    pub fn user_agent_hash(&self) -> u64 {
        self.state.read().unwrap().user_agent_hash
    }

    /// For a shadow session, the identifier of its successor.
    pub fn reference_id(&self) -> Option<String> {
        self.state.read().unwrap().reference_id.clone()
    }

    /// Whether this is a shadow session, kept only to redirect in-flight
    /// requests after a rotation.
    pub fn is_shadow(&self) -> bool {
        self.state.read().unwrap().reference_id.is_some()
    }

    /// The user logged in to this session, if any.
    pub fn user(&self) -> Option<Arc<dyn User>> {
        self.state.read().unwrap().user.clone()
    }

    /// Stores a value under a key in the session, overwriting any previous
    /// value, then writes the session through to the persistence layer. The
    /// error returned is the error of
    /// [`save_session`](crate::PersistenceLayer::save_session).
    pub async fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        {
            let mut state = self.state.write().unwrap();
            state.data.insert(key.into(), value.into());
        }
        self.save().await
    }

    /// Returns the value stored under the given key, if any.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.read().unwrap().data.get(key).cloned()
    }

    /// Removes and returns the value stored under the given key. When a
    /// value was present, the session is written through to the persistence
    /// layer.
    pub async fn take(&self, key: &str) -> Result<Option<Value>> {
        let removed = {
            let mut state = self.state.write().unwrap();
            state.data.remove(key)
        };
        if removed.is_some() {
            self.save().await?;
        }
        Ok(removed)
    }

    /// Deletes a key from the session, then writes the session through to
    /// the persistence layer.
    pub async fn remove(&self, key: &str) -> Result<()> {
        {
            let mut state = self.state.write().unwrap();
            state.data.remove(key);
        }
        self.save().await
    }

    /// Logs the currently logged-in user out of this session. The session
    /// itself stays alive; use
    /// [`SessionManager::destroy`](crate::SessionManager::destroy) to end it
    /// as well. If no user is logged in, nothing happens.
    pub async fn log_out(&self) -> Result<()> {
        {
            let mut state = self.state.write().unwrap();
            if state.user.is_none() {
                return Ok(());
            }
            state.user = None;
        }
        self.save().await
    }

    /// Whether this session has expired: a shadow whose grace window has
    /// passed, or a primary idle beyond the inactivity ceiling and old
    /// enough that no rotation overlap can still be pending. Useful for
    /// periodic purges of the session store.
    pub fn expired(&self) -> bool {
        self.to_record().expired(&self.env.config)
    }

    /// Snapshot for the persistence layer.
    pub(crate) fn to_record(&self) -> SessionRecord {
        let state = self.state.read().unwrap();
        SessionRecord {
            created: state.created,
            last_access: self.last_access(),
            last_ip: state.last_ip.clone(),
            user_agent_hash: state.user_agent_hash,
            reference_id: state.reference_id.clone(),
            user_id: state.user.as_ref().map(|user| user.id()),
            data: state.data.clone(),
        }
    }

    /// Stamps the fields refreshed on every observed request.
    pub(crate) fn touch(&self, remote_addr: &str, user_agent_hash: u64) {
        {
            let mut state = self.state.write().unwrap();
            state.last_ip = remote_addr.to_string();
            state.user_agent_hash = user_agent_hash;
        }
        self.stamp_last_access(Utc::now());
    }

    pub(crate) fn stamp_last_access(&self, at: DateTime<Utc>) {
        self.last_access_ms.store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub(crate) fn last_access_millis(&self) -> i64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    /// Installs the new identifier during rotation, resetting the creation
    /// time, and returns the retired identifier.
    pub(crate) fn rekey(&self, new_id: String) -> String {
        let mut state = self.state.write().unwrap();
        state.created = Utc::now();
        mem::replace(&mut state.id, new_id)
    }

    pub(crate) fn replace_user(&self, user: Option<Arc<dyn User>>) {
        self.state.write().unwrap().user = user;
    }

    async fn save(&self) -> Result<()> {
        let id = self.id();
        let record = self.to_record();
        self.env
            .backend
            .save_session(&id, &record)
            .await
            .map_err(Error::Backend)
    }
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.state.read().unwrap();
        f.debug_struct("Session")
            .field("id", &state.id)
            .field("created", &state.created)
            .field("last_access", &self.last_access())
            .field("last_ip", &state.last_ip)
            .field("user_agent_hash", &state.user_agent_hash)
            .field("reference_id", &state.reference_id)
            .field("user", &state.user.as_ref().map(|user| user.id()))
            .field("data", &state.data)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    #[derive(Debug, Default)]
    struct CountingBackend {
        saves: AtomicUsize,
    }

    #[async_trait]
    impl PersistenceLayer for CountingBackend {
        async fn save_session(&self, _id: &str, _record: &SessionRecord) -> anyhow::Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn environment(backend: Arc<dyn PersistenceLayer>) -> SessionEnv {
        SessionEnv {
            config: Arc::new(
                Config::new()
                    .with_session_expiry(Duration::from_secs(3600))
                    .with_id_rotation_interval(Duration::from_secs(600))
                    .with_grace_period(Duration::from_secs(60)),
            ),
            backend,
        }
    }

    fn session(backend: Arc<dyn PersistenceLayer>) -> Arc<Session> {
        Session::new(
            "A".repeat(24),
            "192.168.178.1:49152".to_string(),
            7,
            environment(backend),
        )
    }

    #[tokio::test]
    async fn data_operations_write_through() {
        let backend = Arc::new(CountingBackend::default());
        let session = session(backend.clone());

        session.set("visits", 3).await.unwrap();
        assert_eq!(session.get("visits"), Some(Value::from(3)));
        assert_eq!(backend.saves.load(Ordering::SeqCst), 1);

        assert_eq!(session.take("visits").await.unwrap(), Some(Value::from(3)));
        assert_eq!(backend.saves.load(Ordering::SeqCst), 2);

        // Taking an absent key does not touch the backend.
        assert_eq!(session.take("visits").await.unwrap(), None);
        assert_eq!(backend.saves.load(Ordering::SeqCst), 2);

        session.remove("absent").await.unwrap();
        assert_eq!(backend.saves.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn log_out_without_user_is_a_no_op() {
        let backend = Arc::new(CountingBackend::default());
        let session = session(backend.clone());
        session.log_out().await.unwrap();
        assert_eq!(backend.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fresh_sessions_are_not_expired() {
        let session = session(Arc::new(CountingBackend::default()));
        assert!(!session.expired());
        assert!(!session.is_shadow());
    }

    #[tokio::test]
    async fn idle_shadows_expire_after_the_grace_window() {
        let backend: Arc<dyn PersistenceLayer> = Arc::new(CountingBackend::default());
        let primary = session(backend.clone());
        let shadow = Session::shadow_of(
            &primary,
            "B".repeat(24),
            environment(backend),
        );
        // Backdated by a full rotation interval, the shadow is immediately
        // past its grace window if nothing touches it.
        assert!(shadow.is_shadow());
        assert!(shadow.expired());
        assert_eq!(shadow.reference_id(), Some(primary.id()));
    }
}
