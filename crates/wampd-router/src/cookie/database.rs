//! Database-backed cookie store on embedded SQLite.
//!
//! The full cookie table is loaded into memory at startup and kept there;
//! SQLite is the durability layer, written through on every mutation. A
//! `scratch_on_startup` switch drops and recreates the table, which is
//! useful on test and staging nodes.

use super::{ConnectionId, Cookie, CookieConfig, CookieStore, CookieTracker};
use chrono::{DateTime, Utc};
use http::HeaderMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use wampd_core::{TransportAuth, WampError, WampResult};

fn db_err(e: rusqlite::Error) -> WampError {
    WampError::Database(e.to_string())
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cookies (
    oid        INTEGER PRIMARY KEY,
    cbtid      TEXT NOT NULL,
    created    TEXT NOT NULL,
    max_age    INTEGER NOT NULL,
    modified   TEXT,
    authid     TEXT,
    authrole   TEXT,
    authmethod TEXT,
    authrealm  TEXT,
    authextra  TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_cookies_cbtid ON cookies (cbtid);
";

pub struct DatabaseCookieStore {
    tracker: CookieTracker,
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl DatabaseCookieStore {
    /// Open (or create) the cookie database at `path`.
    ///
    /// When `scratch_on_startup` is set, the cookie table is dropped and
    /// recreated empty before loading.
    pub fn new<P: AsRef<Path>>(
        path: P,
        config: CookieConfig,
        scratch_on_startup: bool,
    ) -> WampResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(db_err)?;

        if scratch_on_startup {
            conn.execute("DROP TABLE IF EXISTS cookies", [])
                .map_err(db_err)?;
            info!(path = %path.display(), "cookie table scratched");
        }
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        let tracker = CookieTracker::new(config);
        let loaded = Self::load(&conn, &tracker)?;
        info!(cookies = loaded, path = %path.display(), "cookie database opened");

        Ok(Self {
            tracker,
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(conn: &Connection, tracker: &CookieTracker) -> WampResult<usize> {
        let mut stmt = conn
            .prepare(
                "SELECT cbtid, created, max_age, modified,
                        authid, authrole, authmethod, authrealm, authextra
                 FROM cookies",
            )
            .map_err(db_err)?;
        let mut rows = stmt.query([]).map_err(db_err)?;

        let mut n = 0;
        while let Some(row) = rows.next().map_err(db_err)? {
            let cbtid: String = row.get(0).map_err(db_err)?;
            let created: String = row.get(1).map_err(db_err)?;
            let created = DateTime::parse_from_rfc3339(&created)
                .map_err(|e| WampError::Database(format!("corrupt cookie timestamp: {e}")))?
                .with_timezone(&Utc);
            let modified: Option<String> = row.get(3).map_err(db_err)?;
            let modified = match modified {
                Some(ts) => Some(
                    DateTime::parse_from_rfc3339(&ts)
                        .map_err(|e| {
                            WampError::Database(format!("corrupt cookie timestamp: {e}"))
                        })?
                        .with_timezone(&Utc),
                ),
                None => None,
            };
            let authextra: Option<String> = row.get(8).map_err(db_err)?;
            let authextra = match authextra {
                Some(raw) => Some(serde_json::from_str(&raw)?),
                None => None,
            };
            let cookie = Cookie {
                created,
                max_age: row.get(2).map_err(db_err)?,
                modified,
                auth: TransportAuth {
                    authid: row.get(4).map_err(db_err)?,
                    authrole: row.get(5).map_err(db_err)?,
                    authmethod: row.get(6).map_err(db_err)?,
                    authrealm: row.get(7).map_err(db_err)?,
                    authextra,
                },
            };
            tracker.insert_loaded(cbtid, cookie);
            n += 1;
        }
        Ok(n)
    }

    /// The row id for a cookie id, if stored.
    fn lookup_oid(conn: &Connection, cbtid: &str) -> WampResult<Option<i64>> {
        conn.query_row(
            "SELECT oid FROM cookies WHERE cbtid = ?1",
            params![cbtid],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    fn authextra_text(auth: &TransportAuth) -> WampResult<Option<String>> {
        match &auth.authextra {
            Some(value) => Ok(Some(serde_json::to_string(value)?)),
            None => Ok(None),
        }
    }
}

impl CookieStore for DatabaseCookieStore {
    fn parse(&self, headers: &HeaderMap) -> Option<String> {
        self.tracker.parse(headers)
    }

    fn exists(&self, cbtid: &str) -> bool {
        self.tracker.exists(cbtid)
    }

    fn create(&self) -> WampResult<(String, String)> {
        let (cbtid, cookie) = self.tracker.new_cookie();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cookies (cbtid, created, max_age) VALUES (?1, ?2, ?3)",
            params![cbtid, cookie.created.to_rfc3339(), cookie.max_age],
        )
        .map_err(db_err)?;
        debug!(cbtid = %cbtid, "new cookie stored");
        Ok((cbtid.clone(), self.tracker.set_cookie_value(&cbtid)))
    }

    fn get_auth(&self, cbtid: &str) -> TransportAuth {
        self.tracker.get_auth(cbtid)
    }

    fn set_auth(&self, cbtid: &str, auth: &TransportAuth) -> WampResult<bool> {
        match self.tracker.set_auth(cbtid, auth) {
            None | Some((false, _)) => Ok(false),
            Some((true, cookie)) => {
                let authextra = Self::authextra_text(&cookie.auth)?;
                let modified = cookie.modified.map(|ts| ts.to_rfc3339());
                let conn = self.conn.lock();
                let tx = conn.unchecked_transaction().map_err(db_err)?;
                let Some(oid) = Self::lookup_oid(&tx, cbtid)? else {
                    return Err(WampError::Database(format!(
                        "cookie {cbtid} missing from database"
                    )));
                };
                tx.execute(
                    "UPDATE cookies SET modified = ?1, authid = ?2, authrole = ?3,
                                        authmethod = ?4, authrealm = ?5, authextra = ?6
                     WHERE oid = ?7",
                    params![
                        modified,
                        cookie.auth.authid,
                        cookie.auth.authrole,
                        cookie.auth.authmethod,
                        cookie.auth.authrealm,
                        authextra,
                        oid
                    ],
                )
                .map_err(db_err)?;
                tx.commit().map_err(db_err)?;
                Ok(true)
            }
        }
    }

    fn del_auth(&self, cbtid: &str) -> WampResult<bool> {
        if self.tracker.delete(cbtid).is_none() {
            return Ok(false);
        }
        let conn = self.conn.lock();
        conn.execute("DELETE FROM cookies WHERE cbtid = ?1", params![cbtid])
            .map_err(db_err)?;
        Ok(true)
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn auth(authid: &str) -> TransportAuth {
        TransportAuth {
            authid: Some(authid.to_string()),
            authrole: Some("user".to_string()),
            authmethod: Some("cookie".to_string()),
            authrealm: Some("realm1".to_string()),
            authextra: Some(json!({"tier": "gold"})),
        }
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookies.db");

        let cbtid = {
            let store = DatabaseCookieStore::new(&path, CookieConfig::default(), false).unwrap();
            let (cbtid, header) = store.create().unwrap();
            assert_eq!(header, format!("cbtid={cbtid};max-age=604800"));
            assert!(store.set_auth(&cbtid, &auth("alice")).unwrap());
            cbtid
        };

        let store = DatabaseCookieStore::new(&path, CookieConfig::default(), false).unwrap();
        assert!(store.exists(&cbtid));
        assert_eq!(store.get_auth(&cbtid), auth("alice"));
    }

    #[test]
    fn del_auth_removes_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookies.db");

        let cbtid = {
            let store = DatabaseCookieStore::new(&path, CookieConfig::default(), false).unwrap();
            let (cbtid, _) = store.create().unwrap();
            assert!(store.del_auth(&cbtid).unwrap());
            assert!(!store.del_auth(&cbtid).unwrap());
            cbtid
        };

        let store = DatabaseCookieStore::new(&path, CookieConfig::default(), false).unwrap();
        assert!(!store.exists(&cbtid));
    }

    #[test]
    fn set_auth_is_idempotent_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookies.db");

        let store = DatabaseCookieStore::new(&path, CookieConfig::default(), false).unwrap();
        let (cbtid, _) = store.create().unwrap();
        assert!(store.set_auth(&cbtid, &auth("alice")).unwrap());
        assert!(!store.set_auth(&cbtid, &auth("alice")).unwrap());
        drop(store);

        let store = DatabaseCookieStore::new(&path, CookieConfig::default(), false).unwrap();
        assert!(!store.set_auth(&cbtid, &auth("alice")).unwrap());
        assert!(store.set_auth(&cbtid, &auth("bob")).unwrap());
    }

    #[test]
    fn scratch_on_startup_empties_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookies.db");

        let cbtid = {
            let store = DatabaseCookieStore::new(&path, CookieConfig::default(), false).unwrap();
            store.create().unwrap().0
        };

        let store = DatabaseCookieStore::new(&path, CookieConfig::default(), true).unwrap();
        assert!(!store.exists(&cbtid));
        // still usable after the scratch
        let (fresh, _) = store.create().unwrap();
        assert!(store.exists(&fresh));
    }

    #[test]
    fn connections_are_not_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookies.db");

        let cbtid = {
            let store = DatabaseCookieStore::new(&path, CookieConfig::default(), false).unwrap();
            let (cbtid, _) = store.create().unwrap();
            assert_eq!(store.add_connection(&cbtid, ConnectionId(1)), 1);
            cbtid
        };

        let store = DatabaseCookieStore::new(&path, CookieConfig::default(), false).unwrap();
        assert!(store.exists(&cbtid));
        assert!(store.connections(&cbtid).is_empty());
    }
}
