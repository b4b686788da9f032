//! Blocking rusqlite access. Wrapped and driven off the async executor by
//! [`crate::Store`]; nothing here talks to tokio.

use crate::error::{StoreError, StoreResult};
use rt_protocol::{EventRecord, SessionRecord};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// `rusqlite::Connection` is `Send` but not `Sync`; the mutex is what makes
/// `Arc<Db>` shareable across the `spawn_blocking`/`tokio::spawn` tasks that
/// hold it, the way the teacher guards its `Journal`'s connection
/// (services/forwarder/src/status_http.rs).
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn: Mutex::new(conn) };
        db.apply_pragmas()?;
        db.apply_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Mutex::new(conn) };
        db.apply_pragmas()?;
        db.apply_schema()?;
        Ok(db)
    }

    pub fn integrity_check(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let r: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if r != "ok" {
            return Err(StoreError::IntegrityCheckFailed(r));
        }
        Ok(())
    }

    fn apply_pragmas(&self) -> StoreResult<()> {
        self.conn.lock().unwrap().execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA wal_autocheckpoint=1000; PRAGMA foreign_keys=ON;",
        )?;
        Ok(())
    }

    fn apply_schema(&self) -> StoreResult<()> {
        self.conn.lock().unwrap().execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Most recent auth record for `name`, ordered by disconnect time. `None`
    /// if `name` has never authenticated.
    pub fn get_last_auth(&self, name: &str) -> StoreResult<Option<SessionRecord>> {
        self.conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT name, ip, connected_at, disconnected_at, recover_since, recover_until
                 FROM auth WHERE name = ?1 ORDER BY disconnected_at DESC LIMIT 1",
                params![name],
                row_to_session,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn insert_auth(&self, rec: &SessionRecord) -> StoreResult<()> {
        self.conn.lock().unwrap().execute(
            "INSERT INTO auth (name, ip, connected_at, disconnected_at, recover_since, recover_until)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rec.name,
                rec.ip,
                rec.connected_at,
                rec.disconnected_at,
                rec.recover_since,
                rec.recover_until
            ],
        )?;
        Ok(())
    }

    /// Update the row matching `(name, connected_at)` — the same row
    /// `insert_auth` created for this connection's lifetime.
    pub fn update_auth(&self, rec: &SessionRecord) -> StoreResult<()> {
        self.conn.lock().unwrap().execute(
            "UPDATE auth SET ip = ?1, disconnected_at = ?2, recover_since = ?3, recover_until = ?4
             WHERE name = ?5 AND connected_at = ?6",
            params![
                rec.ip,
                rec.disconnected_at,
                rec.recover_since,
                rec.recover_until,
                rec.name,
                rec.connected_at
            ],
        )?;
        Ok(())
    }

    /// Every auth record for `name`, most recent connection first.
    pub fn each_auth(&self, name: &str) -> StoreResult<Vec<SessionRecord>> {
        const PAGE: i64 = 10;
        let mut out = Vec::new();
        let mut offset = 0i64;
        let conn = self.conn.lock().unwrap();
        loop {
            let mut stmt = conn.prepare(
                "SELECT name, ip, connected_at, disconnected_at, recover_since, recover_until
                 FROM auth WHERE name = ?1 ORDER BY connected_at DESC LIMIT ?2 OFFSET ?3",
            )?;
            let page: Vec<SessionRecord> = stmt
                .query_map(params![name, PAGE, offset], row_to_session)?
                .collect::<Result<_, _>>()?;
            let n = page.len();
            out.extend(page);
            if (n as i64) < PAGE {
                break;
            }
            offset += PAGE;
        }
        Ok(out)
    }

    pub fn insert_event(&self, rec: &EventRecord) -> StoreResult<()> {
        self.conn.lock().unwrap().execute(
            "INSERT OR IGNORE INTO events (hash, name, prefix, length, raw, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![rec.hash, rec.name, rec.prefix, rec.length, rec.raw, rec.received_at],
        )?;
        Ok(())
    }

    /// Events with `received_at` in `[since, until]` (`until <= 0` means no
    /// upper bound) whose prefix is in `prefixes` (empty means no filter).
    pub fn each_events(&self, prefixes: &[String], since: i64, until: i64) -> StoreResult<Vec<EventRecord>> {
        const PAGE: i64 = 100;
        let mut out = Vec::new();
        let mut offset = 0i64;
        loop {
            let page = self.events_page(prefixes, since, until, PAGE, offset)?;
            let n = page.len();
            out.extend(page);
            if (n as i64) < PAGE {
                break;
            }
            offset += PAGE;
        }
        Ok(out)
    }

    fn events_page(
        &self,
        prefixes: &[String],
        since: i64,
        until: i64,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<EventRecord>> {
        let mut sql = String::from("SELECT hash, name, prefix, length, raw, received_at FROM events WHERE received_at >= ?");
        if until > 0 {
            sql.push_str(" AND received_at <= ?");
        }
        if !prefixes.is_empty() {
            let placeholders: Vec<&str> = prefixes.iter().map(|_| "?").collect();
            sql.push_str(&format!(" AND prefix IN ({})", placeholders.join(", ")));
        }
        sql.push_str(" ORDER BY received_at ASC LIMIT ? OFFSET ?");

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&since];
        if until > 0 {
            params.push(&until);
        }
        for p in prefixes {
            params.push(p);
        }
        params.push(&limit);
        params.push(&offset);

        let rows = stmt
            .query_map(params.as_slice(), row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete auth and event rows older than `before`. Active sessions
    /// (`disconnected_at == 0`) are never collected.
    pub fn gc(&self, before: i64) -> StoreResult<(usize, usize)> {
        let conn = self.conn.lock().unwrap();
        let auth_deleted = conn.execute("DELETE FROM auth WHERE disconnected_at > 0 AND disconnected_at < ?1", params![before])?;
        let events_deleted = conn.execute("DELETE FROM events WHERE received_at < ?1", params![before])?;
        Ok((auth_deleted, events_deleted))
    }
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        name: row.get(0)?,
        ip: row.get(1)?,
        connected_at: row.get(2)?,
        disconnected_at: row.get(3)?,
        recover_since: row.get(4)?,
        recover_until: row.get(5)?,
    })
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<EventRecord> {
    Ok(EventRecord {
        hash: row.get(0)?,
        name: row.get(1)?,
        prefix: row.get(2)?,
        length: row.get(3)?,
        raw: row.get(4)?,
        received_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(name: &str, connected_at: i64) -> SessionRecord {
        SessionRecord {
            name: name.to_owned(),
            ip: "127.0.0.1".to_owned(),
            connected_at,
            disconnected_at: 0,
            recover_since: 0,
            recover_until: 0,
        }
    }

    #[test]
    fn insert_and_get_last_auth() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.get_last_auth("worker").unwrap().is_none());
        db.insert_auth(&rec("worker", 100)).unwrap();
        let mut second = rec("worker", 200);
        second.disconnected_at = 250;
        db.insert_auth(&second).unwrap();
        let last = db.get_last_auth("worker").unwrap().unwrap();
        assert_eq!(last.connected_at, 200);
    }

    #[test]
    fn update_auth_targets_connected_at_row() {
        let db = Db::open_in_memory().unwrap();
        db.insert_auth(&rec("worker", 100)).unwrap();
        let mut updated = rec("worker", 100);
        updated.disconnected_at = 150;
        db.update_auth(&updated).unwrap();
        let last = db.get_last_auth("worker").unwrap().unwrap();
        assert_eq!(last.disconnected_at, 150);
    }

    #[test]
    fn each_auth_orders_most_recent_first() {
        let db = Db::open_in_memory().unwrap();
        db.insert_auth(&rec("worker", 100)).unwrap();
        db.insert_auth(&rec("worker", 200)).unwrap();
        db.insert_auth(&rec("other", 50)).unwrap();
        let all = db.each_auth("worker").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].connected_at, 200);
    }

    #[test]
    fn insert_and_filter_events() {
        let db = Db::open_in_memory().unwrap();
        let e1 = EventRecord::new("job.1", b"a", 100);
        let e2 = EventRecord::new("job.2", b"b", 200);
        let e3 = EventRecord::new("other.1", b"c", 300);
        db.insert_event(&e1).unwrap();
        db.insert_event(&e2).unwrap();
        db.insert_event(&e3).unwrap();

        let all = db.each_events(&[], 0, 0).unwrap();
        assert_eq!(all.len(), 3);

        let windowed = db.each_events(&[], 150, 250).unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].name, "job.2");

        let by_prefix = db.each_events(&["job".to_owned()], 0, 0).unwrap();
        assert_eq!(by_prefix.len(), 2);
    }

    #[test]
    fn insert_event_dedupes_on_hash() {
        let db = Db::open_in_memory().unwrap();
        let e = EventRecord::new("job.1", b"a", 100);
        db.insert_event(&e).unwrap();
        db.insert_event(&e).unwrap();
        assert_eq!(db.each_events(&[], 0, 0).unwrap().len(), 1);
    }

    #[test]
    fn gc_drops_old_rows_but_keeps_active_sessions() {
        let db = Db::open_in_memory().unwrap();
        let mut stale = rec("worker", 1);
        stale.disconnected_at = 2;
        db.insert_auth(&stale).unwrap();
        db.insert_auth(&rec("active", 5)).unwrap(); // disconnected_at == 0
        db.insert_event(&EventRecord::new("job.1", b"a", 1)).unwrap();

        let (auth_gone, events_gone) = db.gc(1000).unwrap();
        assert_eq!(auth_gone, 1);
        assert_eq!(events_gone, 1);
        assert!(db.get_last_auth("active").unwrap().is_some());
    }

    #[test]
    fn integrity_check_passes_on_fresh_db() {
        let db = Db::open_in_memory().unwrap();
        db.integrity_check().unwrap();
    }
}
