//! # Cookie-based web sessions with safety built in.
//!
//! This crate manages browser sessions with special emphasis on security,
//! implementing OWASP recommendations:
//!
//!  * no session data stored on the client,
//!  * automatic session expiry,
//!  * session identifier rotation with a grace-period overlap,
//!  * anomaly detection via IP address and user-agent analysis.
//!
//! It also provides server-side key/value storage per session, log-in and
//! log-out of users across sessions, identifier generation helpers, a
//! role-hierarchy helper, and password strength checks.
//!
//! The crate is not a web framework: it is meant to be wrapped into
//! middleware for the framework of your choice. On the front end,
//! [`SessionManager::start`] maps one request (its cookie and headers) to a
//! valid [`Session`], emitting cookies into a [`CookieSink`]. On the back
//! end, the [`PersistenceLayer`] trait connects any storage system; a
//! bounded write-through cache sits in between. Implement only the parts of
//! [`PersistenceLayer`] you need — with none of them, sessions simply live
//! in memory.
//!
//! Sessions are not replicated: run a single process, or put a load
//! balancer with sticky sessions in front.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use cookie_sessions::{Config, Cookie, NullPersistence, RequestContext, SessionManager};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> cookie_sessions::Result<()> {
//! let manager = SessionManager::new(Arc::new(NullPersistence), Config::default());
//!
//! // Per request: hand the cookie value, user agent, and peer address to
//! // the manager, and forward the cookies it emits onto the response.
//! let request = RequestContext::new("192.168.178.1:49152")
//!     .with_user_agent("Mozilla/5.0");
//! let mut cookies: Vec<Cookie> = Vec::new();
//! let session = manager
//!     .start(&request, &mut cookies, true)
//!     .await?
//!     .expect("requested a session to be created");
//!
//! session.set("visits", 1).await?;
//! assert_eq!(cookies.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Sessions and their identifiers
//!
//! Session identifiers are exchanged regularly (see
//! [`Config::id_rotation_interval`]) to make hijacking harder. A rotation
//! leaves a *shadow* session behind under the retired identifier: for the
//! duration of [`Config::grace_period`], requests still presenting the old
//! cookie are redirected to the new identifier instead of losing their
//! session. Anomalies — too much change in the client's IPv4 address
//! ([`Config::accept_remote_ip_bytes`]) or a changed user agent — destroy
//! the session instead.
//!
//! ## Shutdown
//!
//! Call [`SessionManager::purge_sessions`] when the process exits, so the
//! access times of cached sessions are written back through the
//! persistence layer.

#![forbid(unsafe_code)]
#![deny(
    future_incompatible,
    missing_debug_implementations,
    nonstandard_style,
    missing_docs,
    unreachable_pub,
    missing_copy_implementations,
    unused_qualifications
)]

mod cache;
mod config;
mod cookies;
mod error;
mod ids;
mod manager;
mod memory_store;
mod mutexes;
mod passwords;
mod persistence;
mod record;
mod roles;
mod session;
mod user;

pub use ::cookie::Cookie;

pub use config::{Config, CookieTemplate};
pub use cookies::{CookieSink, RequestContext};
pub use error::{DecodeError, Error, Result};
pub use ids::{cuid, random_id};
pub use manager::SessionManager;
pub use memory_store::MemoryStore;
pub use mutexes::{KeyedMutexGuard, KeyedMutexes};
pub use passwords::{password_strength, PasswordIssue, PasswordLists};
pub use persistence::{NullPersistence, PersistenceLayer};
pub use record::SessionRecord;
pub use roles::RoleHierarchy;
pub use session::Session;
pub use user::User;
