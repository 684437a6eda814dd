//! SQLite-backed cycle store

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use super::{CycleStore, CycleWrite, SampleRecord, StoreError};
use crate::quota::models::{Cycle, CycleUpdate, QuotaKey, WindowPoint};

const CYCLE_COLUMNS: &str = "id, quota_key, start_ns, end_ns, peak, start_consumed, \
                             total_delta, resets_at_ns, last_seen_ns";

/// SQLite storage for cycles and samples
pub struct SqliteCycleStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCycleStore {
    /// Open (or create) the database at `db_path`
    pub fn new(db_path: &Path) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cycles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                quota_key TEXT NOT NULL,
                start_ns INTEGER NOT NULL,
                end_ns INTEGER,
                peak REAL NOT NULL,
                start_consumed REAL NOT NULL,
                total_delta REAL NOT NULL DEFAULT 0,
                resets_at_ns INTEGER,
                last_seen_ns INTEGER NOT NULL,
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_cycles_one_active
                ON cycles(quota_key) WHERE end_ns IS NULL;
            CREATE INDEX IF NOT EXISTS idx_cycles_key_start ON cycles(quota_key, start_ns);

            CREATE TABLE IF NOT EXISTS samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                quota_key TEXT NOT NULL,
                timestamp_ns INTEGER NOT NULL,
                consumed REAL NOT NULL,
                limit_value REAL,
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            );

            CREATE INDEX IF NOT EXISTS idx_samples_timestamp ON samples(timestamp_ns);
            CREATE INDEX IF NOT EXISTS idx_samples_key_timestamp ON samples(quota_key, timestamp_ns);
        "#,
        )?;

        Ok(())
    }

    /// Get total counts for diagnostics
    pub fn get_counts(&self) -> Result<(i64, i64), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let cycles: i64 = conn.query_row("SELECT COUNT(*) FROM cycles", [], |row| row.get(0))?;
        let samples: i64 = conn.query_row("SELECT COUNT(*) FROM samples", [], |row| row.get(0))?;

        Ok((cycles, samples))
    }
}

impl Clone for SqliteCycleStore {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}

fn to_ns(t: DateTime<Utc>) -> Result<i64, StoreError> {
    t.timestamp_nanos_opt()
        .ok_or(StoreError::TimestampOutOfRange(t))
}

/// Query bound in nanoseconds, clamped to the storable range
fn bound_ns(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or(if t.timestamp() < 0 {
        i64::MIN
    } else {
        i64::MAX
    })
}

fn opt_to_ns(t: Option<DateTime<Utc>>) -> Result<Option<i64>, StoreError> {
    t.map(to_ns).transpose()
}

fn from_ns(ns: i64) -> Result<DateTime<Utc>, StoreError> {
    let secs = ns.div_euclid(1_000_000_000);
    let nanos = ns.rem_euclid(1_000_000_000) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .ok_or(StoreError::InvalidTimestamp(ns))
}

/// Column values as read from a `cycles` row
struct CycleRow {
    id: i64,
    quota_key: String,
    start_ns: i64,
    end_ns: Option<i64>,
    peak: f64,
    start_consumed: f64,
    total_delta: f64,
    resets_at_ns: Option<i64>,
    last_seen_ns: i64,
}

impl CycleRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            quota_key: row.get(1)?,
            start_ns: row.get(2)?,
            end_ns: row.get(3)?,
            peak: row.get(4)?,
            start_consumed: row.get(5)?,
            total_delta: row.get(6)?,
            resets_at_ns: row.get(7)?,
            last_seen_ns: row.get(8)?,
        })
    }

    fn into_cycle(self) -> Result<Cycle, StoreError> {
        let quota_key = self
            .quota_key
            .parse()
            .map_err(|_| StoreError::InvalidKey(self.quota_key.clone()))?;

        Ok(Cycle {
            id: self.id,
            quota_key,
            start: from_ns(self.start_ns)?,
            end: self.end_ns.map(from_ns).transpose()?,
            peak: self.peak,
            start_consumed: self.start_consumed,
            total_delta: self.total_delta,
            resets_at: self.resets_at_ns.map(from_ns).transpose()?,
            last_seen: from_ns(self.last_seen_ns)?,
        })
    }
}

fn collect_cycles(
    rows: impl Iterator<Item = rusqlite::Result<CycleRow>>,
) -> Result<Vec<Cycle>, StoreError> {
    let mut cycles = Vec::new();
    for row in rows {
        cycles.push(row?.into_cycle()?);
    }
    Ok(cycles)
}

fn insert_cycle(
    conn: &Connection,
    key: &QuotaKey,
    start: DateTime<Utc>,
    initial_peak: f64,
    resets_at: Option<DateTime<Utc>>,
) -> Result<Cycle, StoreError> {
    let start_ns = to_ns(start)?;

    let inserted = conn.execute(
        "INSERT INTO cycles (quota_key, start_ns, peak, start_consumed, total_delta, resets_at_ns, last_seen_ns)
         VALUES (?1, ?2, ?3, ?3, 0, ?4, ?2)",
        params![key.to_string(), start_ns, initial_peak, opt_to_ns(resets_at)?],
    );

    match inserted {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            return Err(StoreError::ActiveCycleExists(key.to_string()));
        }
        Err(e) => return Err(e.into()),
    }

    Ok(Cycle {
        id: conn.last_insert_rowid(),
        quota_key: key.clone(),
        start,
        end: None,
        peak: initial_peak,
        start_consumed: initial_peak,
        total_delta: 0.0,
        resets_at,
        last_seen: start,
    })
}

/// Distinguish a missing cycle from one that is already closed
fn inactive_cycle_error(conn: &Connection, id: i64) -> StoreError {
    let closed = conn
        .query_row(
            "SELECT end_ns IS NOT NULL FROM cycles WHERE id = ?1",
            params![id],
            |row| row.get::<_, bool>(0),
        )
        .optional();

    match closed {
        Ok(Some(true)) => StoreError::CycleClosed(id),
        Ok(_) => StoreError::CycleNotFound(id),
        Err(e) => e.into(),
    }
}

fn close_in(conn: &Connection, id: i64, end: DateTime<Utc>) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE cycles SET end_ns = ?2 WHERE id = ?1 AND end_ns IS NULL",
        params![id, to_ns(end)?],
    )?;
    if changed == 0 {
        return Err(inactive_cycle_error(conn, id));
    }
    Ok(())
}

fn update_in(conn: &Connection, id: i64, update: &CycleUpdate) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE cycles SET peak = ?2, total_delta = ?3, last_seen_ns = ?4, resets_at_ns = ?5
         WHERE id = ?1 AND end_ns IS NULL",
        params![
            id,
            update.peak,
            update.total_delta,
            to_ns(update.last_seen)?,
            opt_to_ns(update.resets_at)?
        ],
    )?;
    if changed == 0 {
        return Err(inactive_cycle_error(conn, id));
    }
    Ok(())
}

fn cycle_by_id(conn: &Connection, id: i64) -> Result<Cycle, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM cycles WHERE id = ?1", CYCLE_COLUMNS),
            params![id],
            CycleRow::read,
        )
        .optional()?;

    row.ok_or(StoreError::CycleNotFound(id))?.into_cycle()
}

fn insert_sample(conn: &Connection, key: &QuotaKey, sample: &SampleRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO samples (quota_key, timestamp_ns, consumed, limit_value) VALUES (?1, ?2, ?3, ?4)",
        params![key.to_string(), to_ns(sample.timestamp)?, sample.consumed, sample.limit],
    )?;
    Ok(())
}

impl CycleStore for SqliteCycleStore {
    fn get_active_cycle(&self, key: &QuotaKey) -> Result<Option<Cycle>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM cycles WHERE quota_key = ?1 AND end_ns IS NULL",
                    CYCLE_COLUMNS
                ),
                params![key.to_string()],
                CycleRow::read,
            )
            .optional()?;

        row.map(CycleRow::into_cycle).transpose()
    }

    fn create_cycle(
        &self,
        key: &QuotaKey,
        start: DateTime<Utc>,
        initial_peak: f64,
        resets_at: Option<DateTime<Utc>>,
    ) -> Result<Cycle, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        insert_cycle(&conn, key, start, initial_peak, resets_at)
    }

    fn update_cycle(&self, id: i64, update: &CycleUpdate) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        update_in(&conn, id, update)
    }

    fn close_cycle(&self, id: i64, end: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        close_in(&conn, id, end)
    }

    fn roll_over_cycle(
        &self,
        closing_id: i64,
        end: DateTime<Utc>,
        key: &QuotaKey,
        start: DateTime<Utc>,
        initial_peak: f64,
        resets_at: Option<DateTime<Utc>>,
    ) -> Result<Cycle, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        let tx = conn.transaction()?;

        close_in(&tx, closing_id, end)?;
        let cycle = insert_cycle(&tx, key, start, initial_peak, resets_at)?;

        tx.commit()?;
        Ok(cycle)
    }

    fn list_cycles_since(
        &self,
        key: &QuotaKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<Cycle>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM cycles
             WHERE quota_key = ?1 AND start_ns >= ?2
             ORDER BY start_ns DESC, id DESC",
            CYCLE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![key.to_string(), bound_ns(since)], CycleRow::read)?;

        collect_cycles(rows)
    }

    fn list_cycle_history(&self, key: &QuotaKey, limit: usize) -> Result<Vec<Cycle>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM cycles
             WHERE quota_key = ?1 AND end_ns IS NOT NULL
             ORDER BY start_ns DESC, id DESC
             LIMIT ?2",
            CYCLE_COLUMNS
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![key.to_string(), limit], CycleRow::read)?;

        collect_cycles(rows)
    }

    fn apply_sample(
        &self,
        key: &QuotaKey,
        write: &CycleWrite,
        sample: &SampleRecord,
    ) -> Result<Cycle, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        let tx = conn.transaction()?;

        let cycle = match *write {
            CycleWrite::Open {
                start,
                initial_peak,
                resets_at,
            } => insert_cycle(&tx, key, start, initial_peak, resets_at)?,
            CycleWrite::Update { id, ref update } => {
                update_in(&tx, id, update)?;
                cycle_by_id(&tx, id)?
            }
            CycleWrite::RollOver {
                closing_id,
                end,
                start,
                initial_peak,
                resets_at,
            } => {
                close_in(&tx, closing_id, end)?;
                insert_cycle(&tx, key, start, initial_peak, resets_at)?
            }
        };
        insert_sample(&tx, key, sample)?;

        tx.commit()?;
        Ok(cycle)
    }

    fn record_sample(
        &self,
        key: &QuotaKey,
        point: &WindowPoint,
        limit: Option<f64>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        insert_sample(
            &conn,
            key,
            &SampleRecord {
                timestamp: point.timestamp,
                consumed: point.consumed,
                limit,
            },
        )
    }

    fn list_samples_since(
        &self,
        key: &QuotaKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<SampleRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let mut stmt = conn.prepare(
            "SELECT timestamp_ns, consumed, limit_value FROM samples
             WHERE quota_key = ?1 AND timestamp_ns >= ?2
             ORDER BY timestamp_ns ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![key.to_string(), bound_ns(since)], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, Option<f64>>(2)?,
            ))
        })?;

        let mut samples = Vec::new();
        for row in rows {
            let (timestamp_ns, consumed, limit) = row?;
            samples.push(SampleRecord {
                timestamp: from_ns(timestamp_ns)?,
                consumed,
                limit,
            });
        }

        Ok(samples)
    }

    fn latest_sample(&self, key: &QuotaKey) -> Result<Option<SampleRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let row = conn
            .query_row(
                "SELECT timestamp_ns, consumed, limit_value FROM samples
                 WHERE quota_key = ?1
                 ORDER BY timestamp_ns DESC, id DESC
                 LIMIT 1",
                params![key.to_string()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(timestamp_ns, consumed, limit)| {
            Ok(SampleRecord {
                timestamp: from_ns(timestamp_ns)?,
                consumed,
                limit,
            })
        })
        .transpose()
    }

    fn prune_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let deleted = conn.execute(
            "DELETE FROM samples WHERE timestamp_ns < ?1",
            params![bound_ns(cutoff)],
        )?;

        Ok(deleted)
    }

    fn list_quota_keys(&self) -> Result<Vec<QuotaKey>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let mut stmt = conn.prepare(
            "SELECT quota_key FROM cycles
             UNION
             SELECT quota_key FROM samples
             ORDER BY 1",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            let raw = row?;
            keys.push(raw.parse().map_err(|_| StoreError::InvalidKey(raw.clone()))?);
        }

        Ok(keys)
    }
}
