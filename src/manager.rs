use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::cache::SessionCache;
use crate::config::Config;
use crate::cookies::{deletion_cookie, session_cookie, CookieSink, RequestContext};
use crate::error::{Error, Result};
use crate::ids::{agent_fingerprint, generate_session_id, SESSION_ID_LENGTH};
use crate::mutexes::KeyedMutexes;
use crate::persistence::PersistenceLayer;
use crate::session::{Session, SessionEnv};
use crate::user::User;

/// The entry point of the subsystem: owns the session cache, the keyed lock
/// registry, and the configuration, and runs the per-request state machine.
///
/// A manager is created once at startup and shared (it is cheap to clone).
/// It must be created inside a Tokio runtime, since it spawns the registry's
/// coordinator and the timers that collect shadow sessions.
///
/// [`purge_sessions`](SessionManager::purge_sessions) is the recommended
/// shutdown hook; it makes the cached access times durable.
#[derive(Clone)]
pub struct SessionManager {
    env: SessionEnv,
    cache: SessionCache,
    locks: KeyedMutexes<String>,
}

impl SessionManager {
    /// Creates a manager on top of the given persistence backend.
    pub fn new(backend: Arc<dyn PersistenceLayer>, config: Config) -> Self {
        let locks = KeyedMutexes::new(
            config.lock_purge_interval,
            config.lock_stale_after,
            config.lock_max_entries,
        );
        let env = SessionEnv {
            config: Arc::new(config),
            backend,
        };
        let cache = SessionCache::new(env.clone());
        Self { env, cache, locks }
    }

    /// The configuration this manager was created with.
    pub fn config(&self) -> &Config {
        &self.env.config
    }

    /// Returns the session for the given request. Because this may emit
    /// cookies, it must be called before anything is written to the
    /// response body.
    ///
    /// The presented cookie is validated (inactivity, IPv4 prefix drift,
    /// user-agent drift), the identifier is rotated when it is due, and
    /// shadow identifiers are followed to their successor. An anomaly is
    /// not an error: the session is destroyed, a deletion cookie is
    /// emitted, and the request proceeds as if it had presented nothing.
    ///
    /// `Ok(None)` is returned when no session exists and `create_if_missing`
    /// is false. Note that if the client rejects cookies, passing true
    /// creates a new session on every request; any privacy regulations on
    /// cookies and session data also remain the caller's responsibility.
    pub async fn start(
        &self,
        request: &RequestContext,
        response: &mut dyn CookieSink,
        create_if_missing: bool,
    ) -> Result<Option<Arc<Session>>> {
        let config = &self.env.config;
        let agent_hash = agent_fingerprint(request.user_agent());

        let candidate = request
            .cookie()
            .filter(|value| value.len() == SESSION_ID_LENGTH)
            .map(str::to_owned);

        // All updates on one identifier serialize here, so concurrent
        // requests with the same cookie observe the same primary session.
        // The guard lives until this function returns.
        let _guard = match &candidate {
            Some(id) => Some(self.locks.lock(id.clone()).await),
            None => None,
        };

        let mut session = None;
        if let Some(id) = &candidate {
            session = self.cache.get(id).await?;
            if session.is_none() {
                response.set_cookie(deletion_cookie(config));
            }
        }

        if let Some(current) = session {
            let now = Utc::now();
            let untouched = elapsed(current.last_access(), now);
            let age = elapsed(current.created(), now);

            let mut valid = true;

            // Is it stale?
            if untouched >= config.session_expiry {
                valid = false;
            }

            // Has the remote IP changed too much?
            if valid && config.accept_remote_ip_bytes > 1 {
                if let (Some(previous), Some(observed)) = (
                    ipv4_octets(&current.last_ip()),
                    ipv4_octets(request.remote_addr()),
                ) {
                    let significant = config.accept_remote_ip_bytes.clamp(1, 4) as usize - 1;
                    if previous[..significant] != observed[..significant] {
                        valid = false;
                    }
                }
            }

            // Has the user agent changed?
            if valid && !config.accept_changing_user_agent {
                valid = current.user_agent_hash() == agent_hash;
            }

            if valid {
                let reference_id = current.reference_id();
                if reference_id.is_none() && age >= config.id_rotation_interval {
                    // The identifier is due for replacement.
                    self.rotate(&current, response).await?;
                } else if age
                    >= config
                        .id_rotation_interval
                        .saturating_add(config.grace_period)
                {
                    // The grace window has passed; the session may no longer
                    // be used. The cookie is left alone, a newer rotation
                    // may still overwrite it on a later request.
                    self.cache.delete(&current.id()).await?;
                    return Err(Error::Expired);
                }

                // A shadow redirects to its successor.
                let selected = match reference_id {
                    Some(successor) => {
                        response.set_cookie(session_cookie(config, &successor));
                        self.cache
                            .get(&successor)
                            .await?
                            .ok_or(Error::ReferenceMissing)?
                    }
                    None => current,
                };

                selected.touch(request.remote_addr(), agent_hash);
                return Ok(Some(selected));
            }

            // The session failed an anomaly check and may not be used.
            self.destroy(&current, response).await?;
        }

        if !create_if_missing {
            return Ok(None);
        }

        let id = generate_session_id()?;
        let session = Session::new(
            id.clone(),
            request.remote_addr().to_string(),
            agent_hash,
            self.env.clone(),
        );
        self.cache.set(&session).await?;
        response.set_cookie(session_cookie(config, &id));
        debug!(session_id = %id, "created new session");
        Ok(Some(session))
    }

    /// Exchanges the session's identifier for a fresh one. Use this
    /// whenever the user's privilege level changes, e.g. on a password
    /// change.
    ///
    /// To avoid losing sessions on slow networks or when many requests for
    /// the same identifier arrive at once, the old identifier is kept as a
    /// shadow session for the configured grace period; requests presenting
    /// it are redirected to the new identifier.
    pub async fn regenerate_id(
        &self,
        session: &Arc<Session>,
        response: &mut dyn CookieSink,
    ) -> Result<()> {
        let _guard = self.locks.lock(session.id()).await;
        self.rotate(session, response).await
    }

    /// Rotation body; the caller holds the keyed lock for the session's
    /// current identifier.
    async fn rotate(&self, session: &Arc<Session>, response: &mut dyn CookieSink) -> Result<()> {
        let new_id = generate_session_id()?;
        let old_id = session.rekey(new_id.clone());
        self.cache.set(session).await?;

        let shadow = Session::shadow_of(session, old_id.clone(), self.env.clone());
        self.cache.put(&shadow).await?;

        // Collect the shadow once the grace period has passed. If the
        // process exits first, the shadow is left for an external expiry
        // sweep.
        let cache = self.cache.clone();
        let grace = self.env.config.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(error) = cache.delete(&old_id).await {
                debug!(session_id = %old_id, error = %error, "failed to collect shadow session");
            }
        });

        response.set_cookie(session_cookie(&self.env.config, &new_id));
        debug!(session_id = %new_id, "rotated session identifier");
        Ok(())
    }

    /// Marks the end of a session: it is removed from the cache and the
    /// persistence layer, and the client's cookie is invalidated. The
    /// session should not be used afterwards.
    pub async fn destroy(
        &self,
        session: &Arc<Session>,
        response: &mut dyn CookieSink,
    ) -> Result<()> {
        self.cache.delete(&session.id()).await?;
        response.set_cookie(deletion_cookie(&self.env.config));
        Ok(())
    }

    /// Assigns a user to the session, replacing any previously assigned
    /// user. With `exclusive`, the user's other sessions are logged out
    /// first (which requires
    /// [`user_sessions`](PersistenceLayer::user_sessions) support).
    ///
    /// Logging in also rotates the session identifier, so it must be called
    /// before anything is written to the response body.
    pub async fn log_in(
        &self,
        session: &Arc<Session>,
        user: Arc<dyn User>,
        exclusive: bool,
        response: &mut dyn CookieSink,
    ) -> Result<()> {
        if exclusive {
            self.log_out(&user.id()).await?;
        } else {
            session.log_out().await?;
        }

        session.replace_user(Some(user));
        self.cache.set(session).await?;

        let _guard = self.locks.lock(session.id()).await;
        self.rotate(session, response).await
    }

    /// Logs the user with the given identifier out of all of their
    /// sessions. When the backend does not support
    /// [`user_sessions`](PersistenceLayer::user_sessions), this does
    /// nothing.
    pub async fn log_out(&self, user_id: &str) -> Result<()> {
        let Some(session_ids) = self
            .env
            .backend
            .user_sessions(user_id)
            .await
            .map_err(Error::Backend)?
        else {
            return Ok(());
        };

        for id in session_ids {
            if let Some(session) = self.cache.get(&id).await? {
                session.replace_user(None);
                self.cache.set(&session).await?;
            }
        }
        Ok(())
    }

    /// Re-attaches the given user object to all of the user's sessions.
    /// Call this when the user record changed (e.g. after a password
    /// change) so every session observes the same object. The user's
    /// identifier itself must not have changed.
    ///
    /// When the backend does not support
    /// [`user_sessions`](PersistenceLayer::user_sessions), this does
    /// nothing.
    pub async fn refresh_user(&self, user: Arc<dyn User>) -> Result<()> {
        let Some(session_ids) = self
            .env
            .backend
            .user_sessions(&user.id())
            .await
            .map_err(Error::Backend)?
        else {
            return Ok(());
        };

        for id in session_ids {
            if let Some(session) = self.cache.get(&id).await? {
                session.replace_user(Some(user.clone()));
                self.cache.set(&session).await?;
            }
        }
        Ok(())
    }

    /// Writes all cached sessions back through the persistence layer and
    /// empties the cache, making last access times durable. Call this when
    /// the process shuts down.
    pub async fn purge_sessions(&self) {
        self.cache.purge_all().await;
    }

    /// The number of sessions currently held in the local cache.
    pub async fn cached_sessions(&self) -> usize {
        self.cache.size().await
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.env.config)
            .finish_non_exhaustive()
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

/// The octets of an IPv4 `ip:port` address, or `None` for anything else
/// (IPv6, or addresses a proxy left unparseable, which are deliberately
/// not checked).
fn ipv4_octets(addr: &str) -> Option<[u8; 4]> {
    match addr.parse::<SocketAddr>() {
        Ok(SocketAddr::V4(v4)) => Some(v4.ip().octets()),
        _ => None,
    }
}
