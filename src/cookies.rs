use cookie::Cookie;
use time::{Duration as CookieDuration, OffsetDateTime};

use crate::config::Config;

/// The value emitted in place of a session identifier when the cookie is
/// invalidated.
const DELETED_VALUE: &str = "deleted";

/// The parts of an HTTP request that the session lifecycle inspects. Build
/// one from your web framework's request type and hand it to
/// [`SessionManager::start`](crate::SessionManager::start).
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cookie: Option<String>,
    user_agent: Option<String>,
    remote_addr: String,
}

impl RequestContext {
    /// Creates a request view with the peer's remote address, as
    /// `ip:port`. IPv6 addresses are accepted but exempt from the address
    /// anomaly check.
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            cookie: None,
            user_agent: None,
            remote_addr: remote_addr.into(),
        }
    }

    /// Attaches the value of the session cookie presented by the client,
    /// if there was one.
    pub fn with_cookie(mut self, value: impl Into<String>) -> Self {
        self.cookie = Some(value.into());
        self
    }

    /// Attaches the request's `User-Agent` header.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// The presented session cookie value, if any.
    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    /// The request's `User-Agent` header, or the empty string.
    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or_default()
    }

    /// The peer's remote address.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }
}

/// Receiver for the cookies emitted by the session lifecycle. Adapters
/// forward them onto the HTTP response; because session handling
/// manipulates cookies, this must happen before any body is written.
///
/// `Send` is required so session futures can move between threads.
/// Implemented for `Vec<Cookie<'static>>`, which simply collects them.
pub trait CookieSink: Send {
    /// Queues a cookie to be sent with the response.
    fn set_cookie(&mut self, cookie: Cookie<'static>);
}

impl CookieSink for Vec<Cookie<'static>> {
    fn set_cookie(&mut self, cookie: Cookie<'static>) {
        self.push(cookie);
    }
}

/// A cookie carrying the given session identifier, shaped by the
/// configured template.
pub(crate) fn session_cookie(config: &Config, id: &str) -> Cookie<'static> {
    let mut cookie = (config.cookie_template)();
    cookie.set_name(config.cookie_name.clone());
    cookie.set_value(id.to_string());
    cookie
}

/// A cookie that removes the session cookie from the client: the value is
/// replaced, the expiry moved into the past, and the max-age negative.
pub(crate) fn deletion_cookie(config: &Config) -> Cookie<'static> {
    let mut cookie = (config.cookie_template)();
    cookie.set_name(config.cookie_name.clone());
    cookie.set_value(DELETED_VALUE);
    cookie.set_expires(OffsetDateTime::UNIX_EPOCH);
    cookie.set_max_age(CookieDuration::seconds(-1));
    cookie
}
