//! Memory-backed cookie store: no persistence, a process restart loses all
//! cookies.

use super::{ConnectionId, CookieConfig, CookieStore, CookieTracker};
use http::HeaderMap;
use tracing::debug;
use wampd_core::{TransportAuth, WampResult};

pub struct MemoryCookieStore {
    tracker: CookieTracker,
}

impl MemoryCookieStore {
    pub fn new(config: CookieConfig) -> Self {
        Self {
            tracker: CookieTracker::new(config),
        }
    }
}

impl CookieStore for MemoryCookieStore {
    fn parse(&self, headers: &HeaderMap) -> Option<String> {
        self.tracker.parse(headers)
    }

    fn exists(&self, cbtid: &str) -> bool {
        self.tracker.exists(cbtid)
    }

    fn create(&self) -> WampResult<(String, String)> {
        let (cbtid, _cookie) = self.tracker.new_cookie();
        let header = self.tracker.set_cookie_value(&cbtid);
        debug!(cbtid = %cbtid, "new cookie created");
        Ok((cbtid, header))
    }

    fn get_auth(&self, cbtid: &str) -> TransportAuth {
        self.tracker.get_auth(cbtid)
    }

    fn set_auth(&self, cbtid: &str, auth: &TransportAuth) -> WampResult<bool> {
        Ok(self
            .tracker
            .set_auth(cbtid, auth)
            .map(|(changed, _)| changed)
            .unwrap_or(false))
    }

    fn del_auth(&self, cbtid: &str) -> WampResult<bool> {
        Ok(self.tracker.delete(cbtid).is_some())
    }

    fn add_connection(&self, cbtid: &str, connection: ConnectionId) -> usize {
        if !self.tracker.exists(cbtid) {
            return 0;
        }
        self.tracker.bind(cbtid, connection)
    }

    fn drop_connection(&self, cbtid: &str, connection: ConnectionId) -> usize {
        self.tracker.unbind(cbtid, connection)
    }

    fn connections(&self, cbtid: &str) -> Vec<ConnectionId> {
        self.tracker.bound(cbtid)
    }
}
