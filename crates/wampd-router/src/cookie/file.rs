//! File-backed cookie store: an append-only log of JSON records, one per
//! cookie mutation.
//!
//! The file only ever grows; history is never rewritten. On startup the log
//! is replayed in order and the last non-deleted state per cookie id wins.
//! Every mutation appends exactly one record and is flushed + fsynced
//! before the call returns, so a crash never loses a just-issued auth
//! decision. An optional purge on startup compacts the file down to
//! unexpired, non-deleted cookies — that pass replaces the file and assumes
//! this process is the only one touching it.

use super::{ConnectionId, Cookie, CookieConfig, CookieStore, CookieTracker};
use chrono::{DateTime, Utc};
use http::HeaderMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use wampd_core::{utcnow, TransportAuth, WampError, WampResult};

/// Status tag on a persisted cookie record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Created,
    Modified,
    Deleted,
}

/// One line of the cookie log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CookieRecord {
    cbtid: String,
    status: RecordStatus,
    created: DateTime<Utc>,
    modified: Option<DateTime<Utc>>,
    deleted: Option<DateTime<Utc>>,
    max_age: u64,
    authid: Option<String>,
    authrole: Option<String>,
    authmethod: Option<String>,
    authrealm: Option<String>,
    authextra: Option<serde_json::Value>,
}

impl CookieRecord {
    fn from_cookie(
        cbtid: &str,
        cookie: &Cookie,
        status: RecordStatus,
        deleted: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            cbtid: cbtid.to_string(),
            status,
            created: cookie.created,
            modified: cookie.modified,
            deleted,
            max_age: cookie.max_age,
            authid: cookie.auth.authid.clone(),
            authrole: cookie.auth.authrole.clone(),
            authmethod: cookie.auth.authmethod.clone(),
            authrealm: cookie.auth.authrealm.clone(),
            authextra: cookie.auth.authextra.clone(),
        }
    }

    fn into_cookie(self) -> Cookie {
        Cookie {
            created: self.created,
            max_age: self.max_age,
            modified: self.modified,
            auth: TransportAuth {
                authid: self.authid,
                authrole: self.authrole,
                authmethod: self.authmethod,
                authrealm: self.authrealm,
                authextra: self.authextra,
            },
        }
    }
}

pub struct FileCookieStore {
    tracker: CookieTracker,
    file: Mutex<File>,
    path: PathBuf,
}

impl FileCookieStore {
    /// Open (or create) the cookie log at `path` and replay it.
    ///
    /// When `purge_on_startup` is set, the file is rewritten keeping only
    /// unexpired, non-deleted cookies. The compaction is destructive.
    pub fn new<P: AsRef<Path>>(
        path: P,
        config: CookieConfig,
        purge_on_startup: bool,
    ) -> WampResult<Self> {
        let path = path.as_ref().to_path_buf();
        let tracker = CookieTracker::new(config);

        if path.is_file() {
            let records = Self::replay(&path, &tracker)?;
            info!(
                records,
                cookies = tracker.snapshot().len(),
                path = %path.display(),
                "cookie log replayed"
            );
        } else {
            debug!(path = %path.display(), "new cookie log");
        }

        if purge_on_startup {
            Self::compact(&path, &tracker)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            tracker,
            file: Mutex::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay the log in order, keeping the last non-deleted state per id.
    fn replay(path: &Path, tracker: &CookieTracker) -> WampResult<usize> {
        let reader = BufReader::new(File::open(path)?);
        let mut n = 0;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: CookieRecord = serde_json::from_str(&line)
                .map_err(|e| WampError::CookieStore(format!("corrupt cookie record: {e}")))?;
            n += 1;
            match record.status {
                RecordStatus::Created | RecordStatus::Modified => {
                    let cbtid = record.cbtid.clone();
                    tracker.insert_loaded(cbtid, record.into_cookie());
                }
                RecordStatus::Deleted => {
                    // a tombstone suppresses the id entirely and blocks reuse
                    tracker.delete(&record.cbtid);
                    tracker.retire(&record.cbtid);
                }
            }
        }
        Ok(n)
    }

    /// Rewrite the file keeping only unexpired, non-deleted cookies.
    fn compact(path: &Path, tracker: &CookieTracker) -> WampResult<()> {
        let now = utcnow();
        let mut file = File::create(path)?;
        let mut kept = 0usize;
        let mut dropped = 0usize;

        for (cbtid, cookie) in tracker.snapshot() {
            if cookie.is_expired(now) {
                tracker.delete(&cbtid);
                dropped += 1;
                continue;
            }
            let record = CookieRecord::from_cookie(&cbtid, &cookie, RecordStatus::Created, None);
            let mut line = serde_json::to_string(&record)?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
            kept += 1;
        }

        file.flush()?;
        file.sync_all()?;
        info!(kept, dropped, "cookie log purged");
        Ok(())
    }

    /// Append one record and make it durable before returning.
    fn persist(&self, record: &CookieRecord) -> WampResult<()> {
        let mut file = self.file.lock();
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

impl CookieStore for FileCookieStore {
    fn parse(&self, headers: &HeaderMap) -> Option<String> {
        self.tracker.parse(headers)
    }

    fn exists(&self, cbtid: &str) -> bool {
        self.tracker.exists(cbtid)
    }

    fn create(&self) -> WampResult<(String, String)> {
        let (cbtid, cookie) = self.tracker.new_cookie();
        let record = CookieRecord::from_cookie(&cbtid, &cookie, RecordStatus::Created, None);
        self.persist(&record)?;
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
                let record =
                    CookieRecord::from_cookie(cbtid, &cookie, RecordStatus::Modified, None);
                self.persist(&record)?;
                Ok(true)
            }
        }
    }

    fn del_auth(&self, cbtid: &str) -> WampResult<bool> {
        match self.tracker.delete(cbtid) {
            None => Ok(false),
            Some(cookie) => {
                let record = CookieRecord::from_cookie(
                    cbtid,
                    &cookie,
                    RecordStatus::Deleted,
                    Some(utcnow()),
                );
                self.persist(&record)?;
                Ok(true)
            }
        }
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
    use chrono::Duration;
    use serde_json::json;
    use tempfile::tempdir;

    fn config() -> CookieConfig {
        CookieConfig {
            max_age: 300,
            ..CookieConfig::default()
        }
    }

    fn auth(authid: &str) -> TransportAuth {
        TransportAuth {
            authid: Some(authid.to_string()),
            authrole: Some("user".to_string()),
            authmethod: Some("wampcra".to_string()),
            authrealm: Some("realm1".to_string()),
            authextra: Some(json!({})),
        }
    }

    fn raw_record(cbtid: &str, status: &str, created: DateTime<Utc>, authid: Option<&str>) -> String {
        serde_json::to_string(&json!({
            "cbtid": cbtid,
            "status": status,
            "created": created.to_rfc3339(),
            "modified": null,
            "deleted": null,
            "max_age": 300,
            "authid": authid,
            "authrole": authid.map(|_| "user"),
            "authmethod": authid.map(|_| "wampcra"),
            "authrealm": authid.map(|_| "realm1"),
            "authextra": null,
        }))
        .unwrap()
    }

    fn write_log(path: &Path, lines: &[String]) {
        std::fs::write(path, lines.join("\n") + "\n").unwrap();
    }

    fn read_log(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookies.dat");

        let (cbtid, header) = {
            let store = FileCookieStore::new(&path, config(), false).unwrap();
            let (cbtid, header) = store.create().unwrap();
            assert!(store.set_auth(&cbtid, &auth("alice")).unwrap());
            (cbtid, header)
        };

        let store = FileCookieStore::new(&path, config(), false).unwrap();
        assert!(store.exists(&cbtid));
        assert_eq!(store.get_auth(&cbtid), auth("alice"));
        assert_eq!(header, format!("cbtid={cbtid};max-age=300"));
    }

    #[test]
    fn replay_keeps_last_non_deleted_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookies.dat");
        let now = utcnow();

        write_log(
            &path,
            &[
                raw_record("idOne", "created", now, None),
                raw_record("idTwo", "created", now, Some("bob")),
                raw_record("idOne", "modified", now, Some("alice")),
                raw_record("idTwo", "deleted", now, Some("bob")),
            ],
        );

        let store = FileCookieStore::new(&path, config(), false).unwrap();
        assert!(store.exists("idOne"));
        assert_eq!(store.get_auth("idOne").authid.as_deref(), Some("alice"));
        assert!(!store.exists("idTwo"));
        assert!(!store.get_auth("idTwo").is_authenticated());
    }

    #[test]
    fn replay_matches_fresh_mutation_sequence() {
        let dir = tempdir().unwrap();
        let fresh_path = dir.path().join("fresh.dat");
        let replayed_path = dir.path().join("replayed.dat");

        let fresh = FileCookieStore::new(&fresh_path, config(), false).unwrap();
        let (cbtid, _) = fresh.create().unwrap();
        fresh.set_auth(&cbtid, &auth("alice")).unwrap();

        std::fs::copy(&fresh_path, &replayed_path).unwrap();
        let replayed = FileCookieStore::new(&replayed_path, config(), false).unwrap();

        assert!(replayed.exists(&cbtid));
        assert_eq!(replayed.get_auth(&cbtid), fresh.get_auth(&cbtid));
    }

    #[test]
    fn purge_on_startup_drops_only_expired() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookies.dat");
        let now = utcnow();

        // max_age is 300: 310s old is expired, 5s old is not
        write_log(
            &path,
            &[
                raw_record("staleCookie", "created", now - Duration::seconds(310), Some("old")),
                raw_record("freshCookie", "created", now - Duration::seconds(5), Some("new")),
            ],
        );

        let store = FileCookieStore::new(&path, config(), true).unwrap();
        assert!(!store.exists("staleCookie"));
        assert!(store.exists("freshCookie"));

        let records = read_log(&path);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["cbtid"], "freshCookie");
        assert_eq!(records[0]["authid"], "new");
        // the surviving record keeps its original creation time
        let kept: DateTime<Utc> =
            serde_json::from_value(records[0]["created"].clone()).unwrap();
        assert_eq!(kept, now - Duration::seconds(5));
    }

    #[test]
    fn no_purge_keeps_expired_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookies.dat");
        let now = utcnow();

        write_log(
            &path,
            &[raw_record("staleCookie", "created", now - Duration::seconds(310), None)],
        );

        let store = FileCookieStore::new(&path, config(), false).unwrap();
        assert!(store.exists("staleCookie"));
        assert_eq!(read_log(&path).len(), 1);
    }

    #[test]
    fn idempotent_set_auth_appends_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookies.dat");
        let store = FileCookieStore::new(&path, config(), false).unwrap();

        let (cbtid, _) = store.create().unwrap();
        assert_eq!(read_log(&path).len(), 1);

        assert!(store.set_auth(&cbtid, &auth("alice")).unwrap());
        assert_eq!(read_log(&path).len(), 2);

        // identical auth: no update, no write
        assert!(!store.set_auth(&cbtid, &auth("alice")).unwrap());
        assert_eq!(read_log(&path).len(), 2);
    }

    #[test]
    fn del_auth_appends_tombstone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookies.dat");

        let cbtid = {
            let store = FileCookieStore::new(&path, config(), false).unwrap();
            let (cbtid, _) = store.create().unwrap();
            assert!(store.del_auth(&cbtid).unwrap());
            cbtid
        };

        let records = read_log(&path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["status"], "deleted");

        let store = FileCookieStore::new(&path, config(), false).unwrap();
        assert!(!store.exists(&cbtid));
    }
}
