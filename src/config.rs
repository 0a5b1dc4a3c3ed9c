use std::fmt::{self, Debug, Formatter};
use std::time::Duration;

use cookie::Cookie;
use time::{Duration as CookieDuration, OffsetDateTime};

/// Factory producing the attribute template for emitted session cookies.
///
/// The template's `Name` and `Value` are overwritten by the crate; every
/// other attribute (`Domain`, `Path`, `Secure`, `HttpOnly`, `SameSite`,
/// expiry) is taken as-is. Production deployments should install their own
/// template, in particular to set `Secure` when serving over TLS.
pub type CookieTemplate = Box<dyn Fn() -> Cookie<'static> + Send + Sync>;

/// Configuration of the session subsystem.
///
/// All values are read when the [`SessionManager`](crate::SessionManager) is
/// created and are not expected to change afterwards. The defaults allow a
/// quick start but lean towards convenience; see the individual fields for
/// what to harden in production.
pub struct Config {
    /// The maximum time which may pass before a session that has not been
    /// accessed is destroyed, logging the user out. The default is
    /// effectively infinite.
    pub session_expiry: Duration,

    /// The maximum duration a session identifier is used before it is
    /// exchanged for a new one. Rotation makes session hijacking harder. It
    /// may be lowered all the way to zero, at the cost of considerable load
    /// on the persistence layer.
    pub id_rotation_interval: Duration,

    /// How long a replaced (old) session identifier remains usable, so that
    /// concurrent requests from a slow network do not lose their session
    /// when a rotation happens mid-flight.
    pub grace_period: Duration,

    /// How much change of an IPv4 remote address is accepted before a
    /// session is destroyed, expressed as the number of leading octets that
    /// must match, from 1 (any change accepted) to 4 (only the last octet
    /// may change). Addresses that do not parse as IPv4, including IPv6,
    /// are not checked. Does not work behind a proxy that rewrites the
    /// remote address.
    pub accept_remote_ip_bytes: u32,

    /// If true, a changing `User-Agent` header no longer destroys the
    /// session.
    pub accept_changing_user_agent: bool,

    /// Name of the cookie that carries the session identifier.
    pub cookie_name: String,

    /// Factory for the cookie attribute template, see [`CookieTemplate`].
    pub cookie_template: CookieTemplate,

    /// The maximum size of the local session cache. `0` disables caching
    /// entirely, a negative value lets the cache grow without bound. When
    /// the limit is reached, the sessions with the oldest access time are
    /// written back and dropped.
    pub max_cache_size: i64,

    /// The maximum duration an inactive session remains in the local cache
    /// before it is written back and dropped.
    pub cache_expiry: Duration,

    /// Cadence at which idle entries are purged from the keyed lock
    /// registry.
    pub lock_purge_interval: Duration,

    /// Idle age after which an unlocked registry entry is purged.
    pub lock_stale_after: Duration,

    /// Size cap of the lock registry; when exceeded, all unlocked entries
    /// are purged.
    pub lock_max_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_expiry: Duration::MAX,
            id_rotation_interval: Duration::from_secs(60 * 60),
            grace_period: Duration::from_secs(5 * 60),
            accept_remote_ip_bytes: 1,
            accept_changing_user_agent: false,
            cookie_name: "id".to_string(),
            cookie_template: Box::new(default_cookie_template),
            max_cache_size: 1024 * 1024,
            cache_expiry: Duration::from_secs(60 * 60),
            lock_purge_interval: Duration::from_secs(10 * 60),
            lock_stale_after: Duration::from_secs(60 * 60),
            lock_max_entries: 1024 * 1024,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the inactivity ceiling after which sessions are destroyed.
    pub fn with_session_expiry(mut self, expiry: Duration) -> Self {
        self.session_expiry = expiry;
        self
    }

    /// Sets the time between mandatory identifier rotations.
    pub fn with_id_rotation_interval(mut self, interval: Duration) -> Self {
        self.id_rotation_interval = interval;
        self
    }

    /// Sets the lifetime of a shadow session after rotation.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Sets the number of leading IPv4 octets that must match, clamped to
    /// `1..=4`.
    pub fn with_accept_remote_ip_bytes(mut self, octets: u32) -> Self {
        self.accept_remote_ip_bytes = octets.clamp(1, 4);
        self
    }

    /// Disables or enables the user-agent consistency check.
    pub fn with_accept_changing_user_agent(mut self, accept: bool) -> Self {
        self.accept_changing_user_agent = accept;
        self
    }

    /// Sets the name of the session cookie.
    pub fn with_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    /// Installs the cookie attribute template.
    pub fn with_cookie_template(
        mut self,
        template: impl Fn() -> Cookie<'static> + Send + Sync + 'static,
    ) -> Self {
        self.cookie_template = Box::new(template);
        self
    }

    /// Sets the session cache capacity. `0` disables the cache, a negative
    /// value removes the bound.
    pub fn with_max_cache_size(mut self, size: i64) -> Self {
        self.max_cache_size = size;
        self
    }

    /// Sets the idle threshold for cache eviction.
    pub fn with_cache_expiry(mut self, expiry: Duration) -> Self {
        self.cache_expiry = expiry;
        self
    }
}

/// The built-in cookie template: a ten-year lifetime and `HttpOnly`.
/// `Expires` is set alongside `Max-Age` for clients that ignore the latter.
fn default_cookie_template() -> Cookie<'static> {
    let lifetime = CookieDuration::days(10 * 365);
    let mut cookie = Cookie::new("", "");
    cookie.set_http_only(true);
    cookie.set_max_age(lifetime);
    cookie.set_expires(OffsetDateTime::now_utc() + lifetime);
    cookie
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("session_expiry", &self.session_expiry)
            .field("id_rotation_interval", &self.id_rotation_interval)
            .field("grace_period", &self.grace_period)
            .field("accept_remote_ip_bytes", &self.accept_remote_ip_bytes)
            .field("accept_changing_user_agent", &self.accept_changing_user_agent)
            .field("cookie_name", &self.cookie_name)
            .field("max_cache_size", &self.max_cache_size)
            .field("cache_expiry", &self.cache_expiry)
            .field("lock_purge_interval", &self.lock_purge_interval)
            .field("lock_stale_after", &self.lock_stale_after)
            .field("lock_max_entries", &self.lock_max_entries)
            .finish_non_exhaustive()
    }
}
