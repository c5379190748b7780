//! Rollout session journal backed by redb.
//!
//! # Table design
//!
//! A single `SESSIONS` table uses a 24-byte composite key:
//! ```text
//! [ started_at_ms: u64 big-endian (8 bytes) | uuid: 16 bytes ]
//! ```
//!
//! Byte ordering equals start-time ordering, so a plain iteration yields
//! sessions oldest first. Both parts of the key are fixed when a session is
//! opened, which makes every write an upsert of the same key.

use std::fmt::Display;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{Database, DatabaseError, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::error::{Result, RolloutError};
use crate::events::{RolloutEvent, RolloutObserver};
use crate::types::{RolloutOutcome, ServiceRef};

use super::model::RolloutSession;

// ---------------------------------------------------------------------------
// Table definition
// ---------------------------------------------------------------------------

/// Key: 24-byte composite (started_at_ms big-endian ++ uuid bytes)
/// Value: JSON-encoded RolloutSession
const SESSIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sessions");

fn session_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

fn db_err(e: impl Display) -> RolloutError {
    RolloutError::SessionDb(e.to_string())
}

// ---------------------------------------------------------------------------
// SessionDb
// ---------------------------------------------------------------------------

/// Persistent journal of `RolloutSession` records.
pub struct SessionDb {
    db: Database,
}

impl SessionDb {
    /// Open or create the journal at `path`.
    ///
    /// redb holds an exclusive file lock for as long as the database is open,
    /// so a journal held by another process is `JournalBusy`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = match Database::create(path) {
            Ok(db) => db,
            Err(DatabaseError::DatabaseAlreadyOpen) => {
                return Err(RolloutError::JournalBusy(path.display().to_string()))
            }
            Err(e) => return Err(db_err(e)),
        };
        // Ensure the table exists before any reads
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(SESSIONS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    /// Insert `session`, replacing any earlier snapshot of it.
    pub fn upsert(&self, session: &RolloutSession) -> Result<()> {
        let key = session_key(session.started_at, session.id);
        let value = serde_json::to_vec(session)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(SESSIONS).map_err(db_err)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<RolloutSession>> {
        Ok(self.list_all()?.into_iter().find(|s| s.id == id))
    }

    /// All sessions, newest first.
    pub fn list_all(&self) -> Result<Vec<RolloutSession>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(SESSIONS).map_err(db_err)?;

        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let session: RolloutSession = serde_json::from_slice(v.value())?;
            result.push(session);
        }
        // key order is oldest first
        result.reverse();
        Ok(result)
    }

    /// Sessions for one service, newest first.
    pub fn list_for_service(&self, service: &ServiceRef) -> Result<Vec<RolloutSession>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|s| &s.service == service)
            .collect())
    }

    pub fn latest_for_service(&self, service: &ServiceRef) -> Result<Option<RolloutSession>> {
        Ok(self.list_for_service(service)?.into_iter().next())
    }

    /// The newest session for `service` still in `Pending`, if any.
    pub fn pending_for_service(&self, service: &ServiceRef) -> Result<Option<RolloutSession>> {
        Ok(self
            .list_for_service(service)?
            .into_iter()
            .find(|s| s.outcome == RolloutOutcome::Pending))
    }

    /// Mark every `Pending` session not touched within `max_age` as `Failed`.
    ///
    /// Such sessions belong to a process that exited mid-rollout. Returns the
    /// number of sessions recovered.
    pub fn startup_recovery(&self, max_age: Duration) -> Result<u32> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).map_err(db_err)?;

        let mut count = 0u32;
        for mut session in self.list_all()? {
            if session.outcome == RolloutOutcome::Pending && session.updated_at < cutoff {
                session.record(
                    RolloutOutcome::Failed,
                    Some("abandoned: process exited before the rollout finished".into()),
                )?;
                self.upsert(&session)?;
                count += 1;
            }
        }
        if count > 0 {
            tracing::warn!(count, "recovered abandoned rollout sessions");
        }
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Journal observer
// ---------------------------------------------------------------------------

impl RolloutObserver for SessionDb {
    fn on_event(&self, event: &RolloutEvent) {
        let Some(session) = event.session() else {
            return;
        };
        if let Err(e) = self.upsert(session) {
            tracing::error!(session = %session.id, error = %e, "failed to journal rollout session");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SpecId;
    use chrono::Duration as CDur;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, SessionDb) {
        let dir = TempDir::new().unwrap();
        let db = SessionDb::open(&dir.path().join("sessions.db")).unwrap();
        (dir, db)
    }

    fn session(service: &str, started_at: DateTime<Utc>) -> RolloutSession {
        let mut s = RolloutSession::open(
            Uuid::new_v4(),
            ServiceRef::new("prod", service),
            SpecId::new(format!("{service}:1")),
            SpecId::new(format!("{service}:2")),
            vec![],
            Duration::from_secs(600),
        );
        s.started_at = started_at;
        s.updated_at = started_at;
        s
    }

    #[test]
    fn upsert_replaces_the_same_session() {
        let (_dir, db) = open_tmp();
        let mut s = session("api", Utc::now());
        db.upsert(&s).unwrap();
        s.record(RolloutOutcome::Stable, None).unwrap();
        db.upsert(&s).unwrap();

        let all = db.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].outcome, RolloutOutcome::Stable);
        assert_eq!(db.get(s.id).unwrap().unwrap().outcome, RolloutOutcome::Stable);
    }

    #[test]
    fn list_all_is_newest_first() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let older = session("api", now - CDur::minutes(5));
        let newer = session("api", now);
        // insert out of order
        db.upsert(&newer).unwrap();
        db.upsert(&older).unwrap();

        let all = db.list_all().unwrap();
        assert_eq!(all[0].id, newer.id);
        assert_eq!(all[1].id, older.id);
    }

    #[test]
    fn latest_for_service_ignores_other_services() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let api = session("api", now - CDur::minutes(1));
        let worker = session("worker", now);
        db.upsert(&api).unwrap();
        db.upsert(&worker).unwrap();

        let latest = db
            .latest_for_service(&ServiceRef::new("prod", "api"))
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, api.id);
        assert!(db
            .latest_for_service(&ServiceRef::new("prod", "billing"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn second_open_of_a_held_journal_is_busy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.db");
        let held = SessionDb::open(&path).unwrap();

        let err = SessionDb::open(&path).err().unwrap();
        assert!(matches!(err, RolloutError::JournalBusy(p) if p.ends_with("sessions.db")));

        drop(held);
        assert!(SessionDb::open(&path).is_ok());
    }

    #[test]
    fn pending_for_service_skips_finished_sessions() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let running = session("api", now - CDur::minutes(2));
        let mut finished = session("api", now);
        finished.record(RolloutOutcome::Stable, None).unwrap();
        db.upsert(&running).unwrap();
        db.upsert(&finished).unwrap();

        let api = ServiceRef::new("prod", "api");
        assert_eq!(db.pending_for_service(&api).unwrap().unwrap().id, running.id);
        assert!(db
            .pending_for_service(&ServiceRef::new("prod", "worker"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn startup_recovery_fails_stale_pending_sessions_only() {
        let (_dir, db) = open_tmp();
        let stale = session("api", Utc::now() - CDur::minutes(30));
        let fresh = session("worker", Utc::now() - CDur::seconds(5));
        let mut done = session("billing", Utc::now() - CDur::minutes(30));
        done.record(RolloutOutcome::Stable, None).unwrap();
        done.updated_at = Utc::now() - CDur::minutes(30);
        for s in [&stale, &fresh, &done] {
            db.upsert(s).unwrap();
        }

        let recovered = db.startup_recovery(Duration::from_secs(900)).unwrap();
        assert_eq!(recovered, 1);

        let stale = db.get(stale.id).unwrap().unwrap();
        assert_eq!(stale.outcome, RolloutOutcome::Failed);
        assert!(stale.reason.unwrap().contains("abandoned"));
        assert_eq!(
            db.get(fresh.id).unwrap().unwrap().outcome,
            RolloutOutcome::Pending
        );
        assert_eq!(
            db.get(done.id).unwrap().unwrap().outcome,
            RolloutOutcome::Stable
        );
    }

    #[test]
    fn startup_recovery_on_empty_db_returns_zero() {
        let (_dir, db) = open_tmp();
        assert_eq!(db.startup_recovery(Duration::from_secs(60)).unwrap(), 0);
    }

    #[test]
    fn journal_observer_persists_event_sessions() {
        let (_dir, db) = open_tmp();
        let s = session("api", Utc::now());
        db.on_event(&RolloutEvent::RolloutStarted { session: s.clone() });
        assert_eq!(db.get(s.id).unwrap().unwrap(), s);
    }
}
