//! Router configuration, loaded from a TOML file.

use crate::cookie::{
    CookieConfig, CookieStore, DatabaseCookieStore, FileCookieStore, MemoryCookieStore,
};
use crate::longpoll::LongPollOptions;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use wampd_core::{WampError, WampResult};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub cookie: CookieSection,
    #[serde(default)]
    pub longpoll: LongPollSection,
    #[serde(default)]
    pub websocket: WebSocketSection,
}

impl Config {
    pub fn load(path: &Path) -> WampResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| WampError::Other(format!("invalid config: {e}")))
    }
}

/// The uni-socket listener.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which persistence backend a cookie store uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CookieBackend {
    Memory,
    File,
    Database,
}

/// Cookie tracking, off by default.
#[derive(Debug, Clone, Deserialize)]
pub struct CookieSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub cookie: CookieConfig,
    #[serde(default = "default_cookie_backend")]
    pub store: CookieBackend,
    /// Log file for the `file` backend.
    #[serde(default = "default_cookie_file")]
    pub file: PathBuf,
    /// Compact the cookie log when the `file` backend starts.
    #[serde(default)]
    pub purge_on_startup: bool,
    /// Database file for the `database` backend.
    #[serde(default = "default_cookie_database")]
    pub database: PathBuf,
    /// Wipe the cookie table when the `database` backend starts.
    #[serde(default)]
    pub scratch_on_startup: bool,
}

impl Default for CookieSection {
    fn default() -> Self {
        Self {
            enabled: false,
            cookie: CookieConfig::default(),
            store: default_cookie_backend(),
            file: default_cookie_file(),
            purge_on_startup: false,
            database: default_cookie_database(),
            scratch_on_startup: false,
        }
    }
}

fn default_cookie_backend() -> CookieBackend {
    CookieBackend::Memory
}
fn default_cookie_file() -> PathBuf {
    PathBuf::from("cookies.dat")
}
fn default_cookie_database() -> PathBuf {
    PathBuf::from("cookies.db")
}

impl CookieSection {
    /// Build the configured cookie store, or `None` when tracking is off.
    pub fn build_store(&self) -> WampResult<Option<Arc<dyn CookieStore>>> {
        if !self.enabled {
            return Ok(None);
        }
        let config = self.cookie.clone();
        let store: Arc<dyn CookieStore> = match self.store {
            CookieBackend::Memory => Arc::new(MemoryCookieStore::new(config)),
            CookieBackend::File => {
                Arc::new(FileCookieStore::new(&self.file, config, self.purge_on_startup)?)
            }
            CookieBackend::Database => Arc::new(DatabaseCookieStore::new(
                &self.database,
                config,
                self.scratch_on_startup,
            )?),
        };
        Ok(Some(store))
    }
}

/// The long-poll HTTP endpoint, off by default.
#[derive(Debug, Clone, Deserialize)]
pub struct LongPollSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_longpoll_bind")]
    pub bind: SocketAddr,
    /// Seconds of client inactivity before a transport is closed; 0
    /// disables the reaper.
    #[serde(default = "default_kill_after")]
    pub kill_after: u64,
    #[serde(default = "default_queue_limit_bytes")]
    pub queue_limit_bytes: usize,
    #[serde(default = "default_queue_limit_messages")]
    pub queue_limit_messages: usize,
    /// Fixed transport id for debugging; never set in production.
    #[serde(default)]
    pub debug_transport_id: Option<String>,
}

impl Default for LongPollSection {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_longpoll_bind(),
            kill_after: default_kill_after(),
            queue_limit_bytes: default_queue_limit_bytes(),
            queue_limit_messages: default_queue_limit_messages(),
            debug_transport_id: None,
        }
    }
}

fn default_longpoll_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8090))
}
fn default_kill_after() -> u64 {
    30
}
fn default_queue_limit_bytes() -> usize {
    128 * 1024
}
fn default_queue_limit_messages() -> usize {
    100
}

impl LongPollSection {
    pub fn options(&self) -> LongPollOptions {
        LongPollOptions {
            kill_after: Duration::from_secs(self.kill_after),
            queue_limit_bytes: self.queue_limit_bytes,
            queue_limit_messages: self.queue_limit_messages,
            debug_transport_id: self.debug_transport_id.clone(),
        }
    }
}

/// WebSocket upgrades on the uni-socket listener.
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketSection {
    /// First path segments routed to the WAMP WebSocket handler.
    #[serde(default = "default_websocket_paths")]
    pub paths: Vec<String>,
    #[serde(default)]
    pub require_subprotocol: bool,
    /// Recover cached cookie authentications for new connections.
    #[serde(default)]
    pub cookie_auth: bool,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            paths: default_websocket_paths(),
            require_subprotocol: false,
            cookie_auth: false,
        }
    }
}

fn default_websocket_paths() -> Vec<String> {
    vec!["ws".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.listener.bind, "127.0.0.1:8080".parse().unwrap());
        assert!(!config.cookie.enabled);
        assert_eq!(config.cookie.store, CookieBackend::Memory);
        assert_eq!(config.cookie.cookie.name, "cbtid");
        assert_eq!(config.cookie.cookie.max_age, 604800);
        assert!(!config.longpoll.enabled);
        assert_eq!(config.longpoll.kill_after, 30);
        assert_eq!(config.websocket.paths, vec!["ws"]);
        assert!(!config.websocket.require_subprotocol);
        assert!(!config.websocket.cookie_auth);
    }

    #[test]
    fn full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [listener]
            bind = "0.0.0.0:9000"

            [cookie]
            enabled = true
            name = "tracking"
            length = 32
            max_age = 3600
            store = "file"
            file = "/var/lib/wampd/cookies.dat"
            purge_on_startup = true

            [longpoll]
            enabled = true
            bind = "0.0.0.0:9001"
            kill_after = 60
            queue_limit_bytes = 65536
            queue_limit_messages = 50

            [websocket]
            paths = ["ws", "wamp"]
            require_subprotocol = true
            cookie_auth = true
            "#,
        )
        .unwrap();

        assert_eq!(config.listener.bind, "0.0.0.0:9000".parse().unwrap());
        assert!(config.cookie.enabled);
        assert_eq!(config.cookie.store, CookieBackend::File);
        assert_eq!(config.cookie.cookie.name, "tracking");
        assert_eq!(config.cookie.cookie.length, 32);
        assert!(config.cookie.purge_on_startup);

        let opts = config.longpoll.options();
        assert_eq!(opts.kill_after, Duration::from_secs(60));
        assert_eq!(opts.queue_limit_bytes, 65536);
        assert_eq!(opts.queue_limit_messages, 50);

        assert_eq!(config.websocket.paths, vec!["ws", "wamp"]);
        assert!(config.websocket.require_subprotocol);
        assert!(config.websocket.cookie_auth);
    }

    #[test]
    fn disabled_cookie_section_builds_no_store() {
        let section = CookieSection::default();
        assert!(section.build_store().unwrap().is_none());
    }

    #[test]
    fn memory_store_builds() {
        let section = CookieSection {
            enabled: true,
            ..CookieSection::default()
        };
        let store = section.build_store().unwrap().unwrap();
        let (cbtid, _) = store.create().unwrap();
        assert!(store.exists(&cbtid));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [cookie]
            store = "redis"
            "#,
        );
        assert!(result.is_err());
    }
}
