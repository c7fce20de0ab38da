//! Cookie-based session correlation.
//!
//! Tracks a per-client cookie id (`cbtid`), binds live transport
//! connections to it, and caches authentication results so reconnecting
//! clients can skip re-authentication. Three interchangeable backends
//! implement [`CookieStore`]: memory-only, append-only file-backed, and
//! embedded-database-backed.

pub mod database;
pub mod file;
pub mod memory;

use chrono::{DateTime, Duration, Utc};
use http::header::COOKIE;
use http::HeaderMap;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use wampd_core::{newid, utcnow, TransportAuth, WampResult};

pub use database::DatabaseCookieStore;
pub use file::FileCookieStore;
pub use memory::MemoryCookieStore;

/// Cookie tracking configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CookieConfig {
    /// Name of the HTTP cookie in use.
    #[serde(default = "default_cookie_name")]
    pub name: String,
    /// Length of the random cookie id value.
    #[serde(default = "default_cookie_length")]
    pub length: usize,
    /// Cookie lifetime in seconds (RFC 6265 max-age).
    #[serde(default = "default_cookie_max_age")]
    pub max_age: u64,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: default_cookie_name(),
            length: default_cookie_length(),
            max_age: default_cookie_max_age(),
        }
    }
}

fn default_cookie_name() -> String {
    "cbtid".to_string()
}
fn default_cookie_length() -> usize {
    24
}
fn default_cookie_max_age() -> u64 {
    86400 * 7
}

/// Handle identifying one live transport connection bound to a cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// One tracked cookie.
#[derive(Debug, Clone)]
pub struct Cookie {
    /// UTC timestamp when the cookie was created.
    pub created: DateTime<Utc>,
    /// Maximum lifetime in seconds.
    pub max_age: u64,
    /// When the auth fields were last changed (file-backed audit trail).
    pub modified: Option<DateTime<Utc>>,
    /// Auth decision cached once a connection bearing this cookie
    /// authenticates.
    pub auth: TransportAuth,
}

impl Cookie {
    fn new(max_age: u64) -> Self {
        Self {
            created: utcnow(),
            max_age,
            modified: None,
            auth: TransportAuth::default(),
        }
    }

    /// Whether `created + max_age` has passed relative to `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.created + Duration::seconds(self.max_age as i64) < now
    }
}

/// Store of per-client tracking cookies and their live connections.
///
/// `parse`/`exists`/`create` and the connection-binding calls are pure
/// in-memory operations on every backend; `create`, `set_auth` and
/// `del_auth` additionally persist on the file and database backends and
/// may block the caller for the duration of the write. Persistence I/O
/// errors propagate to the caller; they are not retried internally.
pub trait CookieStore: Send + Sync {
    /// Extract a *known* cookie id from HTTP request headers.
    ///
    /// Parse failures and unknown/stale ids degrade to `None` (a fresh
    /// cookie is issued downstream); they are never fatal to a connection.
    fn parse(&self, headers: &HeaderMap) -> Option<String>;

    fn exists(&self, cbtid: &str) -> bool;

    /// Create a new cookie, returning the id and the `Set-Cookie`-ready
    /// header value (`name=value;max-age=N`, never with a `Secure`
    /// attribute — the binding lives at the transport layer).
    fn create(&self) -> WampResult<(String, String)>;

    /// Cached auth decision; all-`None` if unknown or unauthenticated.
    fn get_auth(&self, cbtid: &str) -> TransportAuth;

    /// Update the cached auth decision. Returns whether anything changed;
    /// repeated identical calls are no-ops and cause no persistence I/O.
    fn set_auth(&self, cbtid: &str, auth: &TransportAuth) -> WampResult<bool>;

    /// Remove the cookie and its connection bindings. Returns whether it
    /// existed. The id is never reissued by this store instance.
    fn del_auth(&self, cbtid: &str) -> WampResult<bool>;

    /// Bind a live connection to the cookie; returns the new binding count
    /// (0 if the cookie does not exist — the connection is not tracked).
    fn add_connection(&self, cbtid: &str, connection: ConnectionId) -> usize;

    /// Unbind a connection; returns the remaining count. Once it reaches 0
    /// the binding entry is dropped entirely.
    fn drop_connection(&self, cbtid: &str, connection: ConnectionId) -> usize;

    /// All connections currently bound to the cookie.
    fn connections(&self, cbtid: &str) -> Vec<ConnectionId>;
}

/// Extract the named cookie's value from `Cookie` headers.
///
/// Scans semicolon-delimited segments of every `Cookie` header manually,
/// tolerating folding and ordering quirks. Malformed headers yield `None`.
pub fn parse_cookie_header(headers: &HeaderMap, name: &str) -> Option<String> {
    for value in headers.get_all(COOKIE) {
        let Ok(raw) = value.to_str() else {
            continue;
        };
        for segment in raw.split(';') {
            let Some((key, val)) = segment.split_once('=') else {
                continue;
            };
            if key.trim() == name {
                let val = val.trim().trim_matches('"');
                if !val.is_empty() {
                    return Some(val.to_string());
                }
            }
        }
    }
    None
}

/// Shared in-memory state used by all backends: the cookie table, the
/// connection bindings (never persisted), and the set of retired ids.
///
/// Mutations take a single lock and never straddle an await point, so
/// interleaved connection-open/close callbacks cannot observe a
/// half-updated set.
pub(crate) struct CookieTracker {
    config: CookieConfig,
    cookies: Mutex<HashMap<String, Cookie>>,
    connections: Mutex<HashMap<String, HashSet<ConnectionId>>>,
    retired: Mutex<HashSet<String>>,
}

impl CookieTracker {
    pub(crate) fn new(config: CookieConfig) -> Self {
        Self {
            config,
            cookies: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            retired: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn config(&self) -> &CookieConfig {
        &self.config
    }

    pub(crate) fn parse(&self, headers: &HeaderMap) -> Option<String> {
        let cbtid = parse_cookie_header(headers, &self.config.name)?;
        if self.exists(&cbtid) {
            Some(cbtid)
        } else {
            None
        }
    }

    pub(crate) fn exists(&self, cbtid: &str) -> bool {
        self.cookies.lock().contains_key(cbtid)
    }

    /// Generate a fresh id, never colliding with a live or retired one.
    pub(crate) fn generate_id(&self) -> String {
        loop {
            let cbtid = newid(self.config.length);
            if !self.cookies.lock().contains_key(&cbtid) && !self.retired.lock().contains(&cbtid) {
                return cbtid;
            }
        }
    }

    /// `Set-Cookie`-ready header value for the given id.
    pub(crate) fn set_cookie_value(&self, cbtid: &str) -> String {
        format!("{}={};max-age={}", self.config.name, cbtid, self.config.max_age)
    }

    /// Create and insert a new unauthenticated cookie.
    pub(crate) fn new_cookie(&self) -> (String, Cookie) {
        let cbtid = self.generate_id();
        let cookie = Cookie::new(self.config.max_age);
        self.cookies.lock().insert(cbtid.clone(), cookie.clone());
        (cbtid, cookie)
    }

    /// Insert a cookie reconstructed from persistent storage.
    pub(crate) fn insert_loaded(&self, cbtid: String, cookie: Cookie) {
        self.cookies.lock().insert(cbtid, cookie);
    }

    pub(crate) fn retire(&self, cbtid: &str) {
        self.retired.lock().insert(cbtid.to_string());
    }

    pub(crate) fn get(&self, cbtid: &str) -> Option<Cookie> {
        self.cookies.lock().get(cbtid).cloned()
    }

    pub(crate) fn get_auth(&self, cbtid: &str) -> TransportAuth {
        self.cookies
            .lock()
            .get(cbtid)
            .map(|c| c.auth.clone())
            .unwrap_or_default()
    }

    /// Update auth fields if anything differs. Returns `None` when the
    /// cookie is unknown, otherwise whether an update occurred (and the
    /// updated cookie for persistence).
    pub(crate) fn set_auth(&self, cbtid: &str, auth: &TransportAuth) -> Option<(bool, Cookie)> {
        let mut cookies = self.cookies.lock();
        let cookie = cookies.get_mut(cbtid)?;
        if cookie.auth == *auth {
            return Some((false, cookie.clone()));
        }
        cookie.auth = auth.clone();
        cookie.modified = Some(utcnow());
        Some((true, cookie.clone()))
    }

    /// Remove the cookie, retire its id and drop all connection bindings.
    pub(crate) fn delete(&self, cbtid: &str) -> Option<Cookie> {
        let removed = self.cookies.lock().remove(cbtid);
        if removed.is_some() {
            self.retired.lock().insert(cbtid.to_string());
            self.connections.lock().remove(cbtid);
        }
        removed
    }

    /// Snapshot of all cookies, sorted by id (for compaction).
    pub(crate) fn snapshot(&self) -> Vec<(String, Cookie)> {
        let mut entries: Vec<(String, Cookie)> = self
            .cookies
            .lock()
            .iter()
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    // Connection bindings. Callers guard with their own existence check so
    // a binding entry is never created for an unknown cookie.

    pub(crate) fn bind(&self, cbtid: &str, connection: ConnectionId) -> usize {
        let mut connections = self.connections.lock();
        let set = connections.entry(cbtid.to_string()).or_default();
        set.insert(connection);
        set.len()
    }

    pub(crate) fn unbind(&self, cbtid: &str, connection: ConnectionId) -> usize {
        let mut connections = self.connections.lock();
        let Some(set) = connections.get_mut(cbtid) else {
            return 0;
        };
        set.remove(&connection);
        let remaining = set.len();
        if remaining == 0 {
            connections.remove(cbtid);
        }
        remaining
    }

    pub(crate) fn bound(&self, cbtid: &str) -> Vec<ConnectionId> {
        self.connections
            .lock()
            .get(cbtid)
            .map(|set| {
                let mut v: Vec<ConnectionId> = set.iter().copied().collect();
                v.sort();
                v
            })
            .unwrap_or_default()
    }

    pub(crate) fn has_binding_entry(&self, cbtid: &str) -> bool {
        self.connections.lock().contains_key(cbtid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with_cookie(raw: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(raw).unwrap());
        headers
    }

    #[test]
    fn parse_plain_cookie() {
        let headers = headers_with_cookie("cbtid=abc123");
        assert_eq!(
            parse_cookie_header(&headers, "cbtid"),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn parse_among_other_cookies() {
        let headers = headers_with_cookie("foo=bar; cbtid=abc123 ;baz=1");
        assert_eq!(
            parse_cookie_header(&headers, "cbtid"),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn parse_quoted_value() {
        let headers = headers_with_cookie("cbtid=\"abc123\"");
        assert_eq!(
            parse_cookie_header(&headers, "cbtid"),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn parse_missing_cookie() {
        let headers = headers_with_cookie("foo=bar");
        assert_eq!(parse_cookie_header(&headers, "cbtid"), None);
    }

    #[test]
    fn parse_no_header() {
        assert_eq!(parse_cookie_header(&HeaderMap::new(), "cbtid"), None);
    }

    #[test]
    fn parse_does_not_match_name_substring() {
        let headers = headers_with_cookie("xcbtid=evil");
        assert_eq!(parse_cookie_header(&headers, "cbtid"), None);
    }

    #[test]
    fn parse_folded_headers() {
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("foo=bar"));
        headers.append(COOKIE, HeaderValue::from_static("cbtid=abc123"));
        assert_eq!(
            parse_cookie_header(&headers, "cbtid"),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn cookie_expiry() {
        let mut cookie = Cookie::new(300);
        let now = utcnow();
        assert!(!cookie.is_expired(now));
        cookie.created = now - Duration::seconds(310);
        assert!(cookie.is_expired(now));
        cookie.created = now - Duration::seconds(5);
        assert!(!cookie.is_expired(now));
    }
}
