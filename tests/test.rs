use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cookie_sessions::{
    Config, Cookie, Error, MemoryStore, NullPersistence, PersistenceLayer, RequestContext,
    SessionManager, SessionRecord, User,
};

const REMOTE_ADDR: &str = "192.168.178.1:49152";

/// A persistence layer that records every call, in the spirit of a real
/// key-value store.
#[derive(Default)]
struct RecordingStore {
    records: Mutex<HashMap<String, SessionRecord>>,
    users: Mutex<HashMap<String, Arc<dyn User>>>,
    loaded: AtomicUsize,
    saved: AtomicUsize,
    deleted: AtomicUsize,
}

impl RecordingStore {
    fn seed(&self, id: &str, record: SessionRecord) {
        self.records.lock().unwrap().insert(id.to_string(), record);
    }

    fn record(&self, id: &str) -> Option<SessionRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }

    fn contains(&self, id: &str) -> bool {
        self.records.lock().unwrap().contains_key(id)
    }

    fn add_user(&self, user: Arc<dyn User>) {
        self.users.lock().unwrap().insert(user.id(), user);
    }
}

#[async_trait]
impl PersistenceLayer for RecordingStore {
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

    async fn user_sessions(&self, user_id: &str) -> anyhow::Result<Option<Vec<String>>> {
        let records = self.records.lock().unwrap();
        let mut sessions: Vec<String> = records
            .iter()
            .filter(|(_, record)| record.user_id.as_deref() == Some(user_id))
            .map(|(id, _)| id.clone())
            .collect();
        sessions.sort();
        Ok(Some(sessions))
    }

    async fn load_user(&self, user_id: &str) -> anyhow::Result<Option<Arc<dyn User>>> {
        Ok(self.users.lock().unwrap().get(user_id).cloned())
    }
}

#[derive(Debug)]
struct TestUser {
    id: String,
    roles: Vec<String>,
}

impl TestUser {
    fn new(id: &str, roles: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            roles: roles.iter().map(|&role| role.to_string()).collect(),
        })
    }
}

impl User for TestUser {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn roles(&self) -> Vec<String> {
        self.roles.clone()
    }
}

fn manager_with(config: Config) -> (SessionManager, Arc<RecordingStore>) {
    let store = Arc::new(RecordingStore::default());
    (SessionManager::new(store.clone(), config), store)
}

fn primary_record(created: DateTime<Utc>, last_access: DateTime<Utc>) -> SessionRecord {
    SessionRecord {
        created,
        last_access,
        last_ip: REMOTE_ADDR.to_string(),
        user_agent_hash: 0,
        reference_id: None,
        user_id: None,
        data: HashMap::new(),
    }
}

fn request() -> RequestContext {
    RequestContext::new(REMOTE_ADDR)
}

fn cookie_values<'a>(cookies: &'a [Cookie<'static>]) -> Vec<&'a str> {
    cookies.iter().map(|cookie| cookie.value()).collect()
}

/// A request without a cookie and without permission to create a session
/// yields nothing, and no cookies are emitted.
#[tokio::test]
async fn no_cookie_no_create_yields_nothing() {
    let (manager, store) = manager_with(Config::new());
    let mut cookies: Vec<Cookie<'static>> = Vec::new();

    let session = manager.start(&request(), &mut cookies, false).await.unwrap();
    assert!(session.is_none());
    assert!(cookies.is_empty());
    assert_eq!(store.loaded.load(Ordering::SeqCst), 0);
}

/// A well-formed cookie that matches no session yields nothing and is
/// answered with a deletion cookie.
#[tokio::test]
async fn unknown_cookie_is_deleted() {
    let (manager, _store) = manager_with(Config::new());
    let mut cookies: Vec<Cookie<'static>> = Vec::new();

    let session = manager
        .start(
            &request().with_cookie("X".repeat(24)),
            &mut cookies,
            false,
        )
        .await
        .unwrap();
    assert!(session.is_none());
    assert_eq!(cookie_values(&cookies), ["deleted"]);
}

/// A malformed cookie (wrong length) is treated as no session at all: with
/// `create_if_missing` a fresh session is issued.
#[tokio::test]
async fn malformed_cookie_creates_a_fresh_session() {
    let (manager, _store) = manager_with(Config::new());
    let mut cookies: Vec<Cookie<'static>> = Vec::new();

    let session = manager
        .start(&request().with_cookie("short"), &mut cookies, true)
        .await
        .unwrap()
        .expect("a session was requested");
    assert_eq!(session.id().len(), 24);
    assert_eq!(cookie_values(&cookies), [session.id().as_str()]);
}

/// Once a session's age reaches the rotation interval, the next request
/// exchanges its identifier: the primary moves to a fresh identifier, a
/// shadow stays behind under the old one, and the shadow is collected when
/// the grace period has passed.
#[tokio::test]
async fn due_sessions_rotate_and_shadows_are_collected() {
    let (manager, store) = manager_with(
        Config::new()
            .with_id_rotation_interval(Duration::from_secs(3600))
            .with_grace_period(Duration::from_millis(100)),
    );
    let old_id = "A".repeat(24);
    store.seed(
        &old_id,
        primary_record(
            Utc::now() - chrono::Duration::hours(2),
            Utc::now() - chrono::Duration::minutes(1),
        ),
    );

    let mut cookies: Vec<Cookie<'static>> = Vec::new();
    let session = manager
        .start(&request().with_cookie(&old_id), &mut cookies, false)
        .await
        .unwrap()
        .expect("the stored session must be returned");

    let new_id = session.id();
    assert_ne!(new_id, old_id);
    assert_eq!(new_id.len(), 24);
    assert_eq!(cookie_values(&cookies), [new_id.as_str()]);

    // Exactly two writes: the rekeyed primary and the shadow.
    assert_eq!(store.saved.load(Ordering::SeqCst), 2);
    let shadow = store.record(&old_id).expect("the shadow must be stored");
    assert_eq!(shadow.reference_id.as_deref(), Some(new_id.as_str()));
    assert!(store.contains(&new_id));

    // After the grace period the shadow identifier is dropped.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!store.contains(&old_id));
    assert!(store.contains(&new_id));
}

/// A request presenting a shadow's identifier is redirected: it receives a
/// cookie carrying the successor and the successor session itself.
#[tokio::test]
async fn shadow_cookies_follow_to_the_successor() {
    let (manager, store) = manager_with(Config::new());
    let shadow_id = "A".repeat(24);
    let primary_id = "B".repeat(24);
    let mut shadow = primary_record(Utc::now(), Utc::now());
    shadow.reference_id = Some(primary_id.clone());
    store.seed(&shadow_id, shadow);
    store.seed(&primary_id, primary_record(Utc::now(), Utc::now()));

    let mut cookies: Vec<Cookie<'static>> = Vec::new();
    let session = manager
        .start(&request().with_cookie(&shadow_id), &mut cookies, false)
        .await
        .unwrap()
        .expect("the successor must be returned");

    assert_eq!(session.id(), primary_id);
    assert_eq!(cookie_values(&cookies), [primary_id.as_str()]);
}

/// A shadow whose successor vanished is a hard failure; the cookie is left
/// for the next request.
#[tokio::test]
async fn missing_successor_is_reported() {
    let (manager, store) = manager_with(Config::new());
    let shadow_id = "A".repeat(24);
    let mut shadow = primary_record(Utc::now(), Utc::now());
    shadow.reference_id = Some("B".repeat(24));
    store.seed(&shadow_id, shadow);

    let mut cookies: Vec<Cookie<'static>> = Vec::new();
    let result = manager
        .start(&request().with_cookie(&shadow_id), &mut cookies, false)
        .await;
    assert!(matches!(result, Err(Error::ReferenceMissing)));
}

/// A session whose grace window has fully passed while it was still cached
/// is deleted and reported as expired, leaving the cookie untouched.
#[tokio::test]
async fn sessions_past_the_grace_window_expire() {
    let (manager, store) = manager_with(
        Config::new()
            .with_id_rotation_interval(Duration::from_secs(3600))
            .with_grace_period(Duration::from_secs(60)),
    );
    let shadow_id = "A".repeat(24);
    let mut shadow = primary_record(Utc::now() - chrono::Duration::hours(2), Utc::now());
    shadow.reference_id = Some("B".repeat(24));
    store.seed(&shadow_id, shadow);

    let mut cookies: Vec<Cookie<'static>> = Vec::new();
    let result = manager
        .start(&request().with_cookie(&shadow_id), &mut cookies, false)
        .await;
    assert!(matches!(result, Err(Error::Expired)));
    assert!(!store.contains(&shadow_id));
    assert!(cookies.is_empty());
}

/// With three significant address octets configured, a client hopping to a
/// different network loses the session.
#[tokio::test]
async fn ip_prefix_drift_invalidates() {
    let (manager, store) = manager_with(Config::new().with_accept_remote_ip_bytes(3));
    let id = "A".repeat(24);
    let mut record = primary_record(Utc::now(), Utc::now());
    record.last_ip = "192.168.178.1:80".to_string();
    store.seed(&id, record);

    let mut cookies: Vec<Cookie<'static>> = Vec::new();
    let session = manager
        .start(
            &RequestContext::new("192.100.100.50:8080").with_cookie(&id),
            &mut cookies,
            false,
        )
        .await
        .unwrap();
    assert!(session.is_none());
    assert!(!store.contains(&id));
    assert_eq!(cookie_values(&cookies), ["deleted"]);
}

/// A change within the accepted prefix is fine.
#[tokio::test]
async fn ip_change_within_prefix_is_accepted() {
    let (manager, store) = manager_with(Config::new().with_accept_remote_ip_bytes(3));
    let id = "A".repeat(24);
    let mut record = primary_record(Utc::now(), Utc::now());
    record.last_ip = "192.168.178.1:80".to_string();
    store.seed(&id, record);

    let mut cookies: Vec<Cookie<'static>> = Vec::new();
    let session = manager
        .start(
            &RequestContext::new("192.168.99.2:8080").with_cookie(&id),
            &mut cookies,
            false,
        )
        .await
        .unwrap();
    assert!(session.is_some());
    assert!(store.contains(&id));
}

/// A changed user agent invalidates the session unless the check is
/// disabled.
#[tokio::test]
async fn user_agent_drift_invalidates() {
    let (manager, store) = manager_with(Config::new());
    let id = "A".repeat(24);
    store.seed(&id, primary_record(Utc::now(), Utc::now()));

    // The stored fingerprint is "no user agent"; presenting one now is a
    // change.
    let mut cookies: Vec<Cookie<'static>> = Vec::new();
    let session = manager
        .start(
            &request().with_cookie(&id).with_user_agent("Other/1.0"),
            &mut cookies,
            false,
        )
        .await
        .unwrap();
    assert!(session.is_none());
    assert!(!store.contains(&id));
    assert_eq!(cookie_values(&cookies), ["deleted"]);
}

#[tokio::test]
async fn user_agent_drift_can_be_accepted() {
    let (manager, store) =
        manager_with(Config::new().with_accept_changing_user_agent(true));
    let id = "A".repeat(24);
    store.seed(&id, primary_record(Utc::now(), Utc::now()));

    let mut cookies: Vec<Cookie<'static>> = Vec::new();
    let session = manager
        .start(
            &request().with_cookie(&id).with_user_agent("Other/1.0"),
            &mut cookies,
            false,
        )
        .await
        .unwrap();
    assert!(session.is_some());
}

/// A session idle beyond the inactivity ceiling is destroyed.
#[tokio::test]
async fn stale_sessions_are_destroyed() {
    let (manager, store) =
        manager_with(Config::new().with_session_expiry(Duration::from_secs(1800)));
    let id = "A".repeat(24);
    store.seed(
        &id,
        primary_record(
            Utc::now() - chrono::Duration::hours(1),
            Utc::now() - chrono::Duration::hours(1),
        ),
    );

    let mut cookies: Vec<Cookie<'static>> = Vec::new();
    let session = manager
        .start(&request().with_cookie(&id), &mut cookies, false)
        .await
        .unwrap();
    assert!(session.is_none());
    assert!(!store.contains(&id));
}

/// Thirty concurrent requests carrying the same rotation-due cookie all
/// end up on the same new primary session, with exactly one shadow and
/// exactly two stored writes for the whole transition.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn rotation_storm_converges_on_one_primary() {
    let (manager, store) = manager_with(
        Config::new()
            .with_id_rotation_interval(Duration::from_secs(3600))
            .with_grace_period(Duration::from_secs(60)),
    );
    let old_id = "A".repeat(24);
    store.seed(
        &old_id,
        primary_record(
            Utc::now() - chrono::Duration::hours(2),
            Utc::now() - chrono::Duration::minutes(1),
        ),
    );

    let mut requests = Vec::new();
    for _ in 0..30 {
        let manager = manager.clone();
        let old_id = old_id.clone();
        requests.push(tokio::spawn(async move {
            let mut cookies: Vec<Cookie<'static>> = Vec::new();
            let session = manager
                .start(&RequestContext::new(REMOTE_ADDR).with_cookie(&old_id), &mut cookies, false)
                .await
                .unwrap()
                .expect("every request must observe the session");
            session.id()
        }));
    }

    let mut ids = Vec::new();
    for request in requests {
        ids.push(request.await.unwrap());
    }
    let new_id = ids[0].clone();
    assert_ne!(new_id, old_id);
    assert!(ids.iter().all(|id| *id == new_id));

    assert_eq!(store.loaded.load(Ordering::SeqCst), 1);
    assert_eq!(store.saved.load(Ordering::SeqCst), 2);
    let shadow = store.record(&old_id).expect("one shadow must exist");
    assert_eq!(shadow.reference_id.as_deref(), Some(new_id.as_str()));
}

/// The cache honors its capacity: idle sessions are written back and
/// dropped first, then the oldest by access time.
#[tokio::test]
async fn cache_compaction_writes_back_and_evicts() {
    let (manager, store) = manager_with(
        Config::new()
            .with_max_cache_size(2)
            .with_cache_expiry(Duration::from_millis(10)),
    );

    let mut cookies: Vec<Cookie<'static>> = Vec::new();
    manager.start(&request(), &mut cookies, true).await.unwrap();
    manager.start(&request(), &mut cookies, true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;
    manager.start(&request(), &mut cookies, true).await.unwrap();
    manager.start(&request(), &mut cookies, true).await.unwrap();

    assert_eq!(manager.cached_sessions().await, 2);
    // Four created sessions, plus the two idle ones written back on
    // eviction.
    assert_eq!(store.saved.load(Ordering::SeqCst), 6);
    assert_eq!(store.records.lock().unwrap().len(), 4);
}

/// Logging in attaches the user, rotates the identifier, and persists the
/// user's identifier only; logging the user out everywhere clears it.
#[tokio::test]
async fn log_in_rotates_and_log_out_clears_everywhere() {
    let (manager, store) = manager_with(Config::new());
    let alice = TestUser::new("alice", &["admin"]);
    store.add_user(alice.clone());

    let mut cookies: Vec<Cookie<'static>> = Vec::new();
    let session = manager
        .start(&request(), &mut cookies, true)
        .await
        .unwrap()
        .expect("a session was requested");
    let anonymous_id = session.id();

    manager
        .log_in(&session, alice.clone(), false, &mut cookies)
        .await
        .unwrap();
    assert_ne!(session.id(), anonymous_id);
    assert_eq!(session.user().expect("logged in").id(), "alice");
    assert_eq!(
        store.record(&session.id()).unwrap().user_id.as_deref(),
        Some("alice")
    );

    manager.log_out("alice").await.unwrap();
    assert!(session.user().is_none());
    assert_eq!(store.record(&session.id()).unwrap().user_id, None);
}

/// An exclusive log-in terminates the user's other sessions' log-ins
/// first.
#[tokio::test]
async fn exclusive_log_in_logs_other_sessions_out() {
    let (manager, store) = manager_with(Config::new());
    let alice = TestUser::new("alice", &[]);
    store.add_user(alice.clone());

    let mut cookies: Vec<Cookie<'static>> = Vec::new();
    let first = manager
        .start(&request(), &mut cookies, true)
        .await
        .unwrap()
        .expect("a session was requested");
    manager
        .log_in(&first, alice.clone(), false, &mut cookies)
        .await
        .unwrap();

    let second = manager
        .start(&request(), &mut cookies, true)
        .await
        .unwrap()
        .expect("a session was requested");
    manager
        .log_in(&second, alice.clone(), true, &mut cookies)
        .await
        .unwrap();

    assert!(first.user().is_none());
    assert_eq!(second.user().expect("logged in").id(), "alice");
}

/// Refreshing a user swaps the attached object on all of their sessions.
#[tokio::test]
async fn refresh_user_updates_attached_sessions() {
    let (manager, store) = manager_with(Config::new());
    let alice = TestUser::new("alice", &["user"]);
    store.add_user(alice.clone());

    let mut cookies: Vec<Cookie<'static>> = Vec::new();
    let session = manager
        .start(&request(), &mut cookies, true)
        .await
        .unwrap()
        .expect("a session was requested");
    manager
        .log_in(&session, alice, false, &mut cookies)
        .await
        .unwrap();

    let promoted = TestUser::new("alice", &["user", "admin"]);
    manager.refresh_user(promoted).await.unwrap();
    assert_eq!(
        session.user().expect("still logged in").roles(),
        vec!["user".to_string(), "admin".to_string()]
    );
}

/// A loaded session resolves its stored user identifier back to a user
/// object.
#[tokio::test]
async fn loading_a_session_resolves_its_user() {
    let (manager, store) = manager_with(Config::new());
    let alice = TestUser::new("alice", &[]);
    store.add_user(alice);
    let id = "A".repeat(24);
    let mut record = primary_record(Utc::now(), Utc::now());
    record.user_id = Some("alice".to_string());
    store.seed(&id, record);

    let mut cookies: Vec<Cookie<'static>> = Vec::new();
    let session = manager
        .start(&request().with_cookie(&id), &mut cookies, false)
        .await
        .unwrap()
        .expect("the stored session must be returned");
    assert_eq!(session.user().expect("user resolved").id(), "alice");
}

/// With no persistence at all, sessions still work out of the local cache,
/// and the user-scoped operations degrade to no-ops.
#[tokio::test]
async fn null_backend_keeps_sessions_in_memory() {
    let manager = SessionManager::new(Arc::new(NullPersistence), Config::new());

    let mut cookies: Vec<Cookie<'static>> = Vec::new();
    let session = manager
        .start(&request(), &mut cookies, true)
        .await
        .unwrap()
        .expect("a session was requested");
    session.set("visits", 1).await.unwrap();

    let mut more_cookies: Vec<Cookie<'static>> = Vec::new();
    let returning = manager
        .start(
            &request().with_cookie(session.id()),
            &mut more_cookies,
            false,
        )
        .await
        .unwrap()
        .expect("the cache must serve the session");
    assert_eq!(returning.get("visits"), Some(1.into()));

    manager.log_out("nobody").await.unwrap();
}

/// The shutdown purge writes all cached sessions back and empties the
/// cache.
#[tokio::test]
async fn purge_sessions_flushes_the_cache() {
    let (manager, store) = manager_with(Config::new());
    let mut cookies: Vec<Cookie<'static>> = Vec::new();
    manager.start(&request(), &mut cookies, true).await.unwrap();
    manager.start(&request(), &mut cookies, true).await.unwrap();
    store.saved.store(0, Ordering::SeqCst);

    manager.purge_sessions().await;
    assert_eq!(manager.cached_sessions().await, 0);
    assert_eq!(store.saved.load(Ordering::SeqCst), 2);
}

/// The bundled memory store supports the full lifecycle, including user
/// resolution, through the public persistence interface.
#[tokio::test]
async fn memory_store_backs_the_full_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    let manager = SessionManager::new(store.clone(), Config::new());
    let alice = TestUser::new("alice", &[]);
    store.add_user(alice.clone());

    let mut cookies: Vec<Cookie<'static>> = Vec::new();
    let session = manager
        .start(&request(), &mut cookies, true)
        .await
        .unwrap()
        .expect("a session was requested");
    manager
        .log_in(&session, alice, false, &mut cookies)
        .await
        .unwrap();
    session.set("theme", "dark").await.unwrap();

    // Drop the cache so the next request must load through the store.
    manager.purge_sessions().await;

    let mut more_cookies: Vec<Cookie<'static>> = Vec::new();
    let returning = manager
        .start(
            &request().with_cookie(session.id()),
            &mut more_cookies,
            false,
        )
        .await
        .unwrap()
        .expect("the store must serve the session");
    assert_eq!(returning.get("theme"), Some("dark".into()));
    assert_eq!(returning.user().expect("user resolved").id(), "alice");
}
