//! Trip and detection persistence.
//!
//! The pipeline consumes two narrow store interfaces: raw trips keyed by
//! `trip_id`, and an append-only-per-trip detection log. [`SqliteStore`]
//! implements both on one connection. Detection replacement for a trip
//! runs in a single transaction, so a concurrent scan sees either the
//! old or the new set for that trip, never a mixture.

use chrono::DateTime;
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::trip::TripDocument;
use crate::DetectionEvent;

/// Storage for raw trip documents, idempotent by `trip_id`.
pub trait TripStore {
    /// Insert or overwrite the document for a trip.
    fn put_trip(&mut self, doc: &TripDocument) -> Result<()>;

    /// Fetch a stored trip document back for reprocessing.
    fn get_trip(&self, trip_id: &str) -> Result<Option<TripDocument>>;
}

/// Storage for detection events, replace-all-per-trip on re-ingest.
pub trait DetectionStore {
    /// Atomically replace all detections recorded for a trip.
    fn replace_trip_detections(&mut self, trip_id: &str, events: &[DetectionEvent]) -> Result<()>;

    /// All stored detections. Reads a consistent snapshot.
    fn scan_all(&self) -> Result<Vec<DetectionEvent>>;

    /// One page of detections, newest wall time first.
    fn page(&self, limit: u32, offset: u32) -> Result<Vec<DetectionEvent>>;

    /// Total stored detection count.
    fn count(&self) -> Result<u64>;
}

/// SQLite-backed implementation of both stores.
pub struct SqliteStore {
    db: Connection,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let db = Connection::open(path)?;
        Self::init_schema(&db)?;
        Ok(Self { db })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::init_schema(&db)?;
        Ok(Self { db })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            -- Raw trips, one row per upload, payload kept for reprocessing
            CREATE TABLE IF NOT EXISTS trips (
                trip_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                start_time INTEGER,
                end_time INTEGER,
                sample_count INTEGER NOT NULL,
                payload TEXT NOT NULL
            );

            -- Per-event bump evidence, replaced wholesale per trip
            CREATE TABLE IF NOT EXISTS detections (
                trip_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                intensity REAL NOT NULL,
                stability REAL NOT NULL,
                speed_mps REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detections_trip ON detections(trip_id);
            CREATE INDEX IF NOT EXISTS idx_detections_ts ON detections(ts);
        "#,
        )
    }

    fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<DetectionEvent> {
        let ts_ms: i64 = row.get(2)?;
        Ok(DetectionEvent {
            trip_id: row.get(0)?,
            user_id: row.get(1)?,
            wall_time: DateTime::from_timestamp_millis(ts_ms)
                .unwrap_or(DateTime::UNIX_EPOCH),
            latitude: row.get(3)?,
            longitude: row.get(4)?,
            intensity: row.get(5)?,
            stability: row.get(6)?,
            speed_mps: row.get(7)?,
        })
    }
}

const SELECT_EVENT_COLUMNS: &str =
    "trip_id, user_id, ts, latitude, longitude, intensity, stability, speed_mps";

impl TripStore for SqliteStore {
    fn put_trip(&mut self, doc: &TripDocument) -> Result<()> {
        let payload = serde_json::to_string(doc).map_err(|e| {
            crate::error::PipelineError::StoreUnavailable {
                message: format!("trip serialization failed: {}", e),
            }
        })?;
        let start_ms = doc
            .start_time
            .as_ref()
            .and_then(|t| t.to_utc())
            .map(|t| t.timestamp_millis());
        let end_ms = doc
            .end_time
            .as_ref()
            .and_then(|t| t.to_utc())
            .map(|t| t.timestamp_millis());

        self.db.execute(
            "INSERT INTO trips (trip_id, user_id, start_time, end_time, sample_count, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(trip_id) DO UPDATE SET
                 user_id = excluded.user_id,
                 start_time = excluded.start_time,
                 end_time = excluded.end_time,
                 sample_count = excluded.sample_count,
                 payload = excluded.payload",
            params![
                doc.trip_id,
                doc.user_id,
                start_ms,
                end_ms,
                doc.samples.len() as i64,
                payload
            ],
        )?;
        Ok(())
    }

    fn get_trip(&self, trip_id: &str) -> Result<Option<TripDocument>> {
        let mut stmt = self
            .db
            .prepare("SELECT payload FROM trips WHERE trip_id = ?1")?;
        let mut rows = stmt.query(params![trip_id])?;
        match rows.next()? {
            Some(row) => {
                let payload: String = row.get(0)?;
                Ok(Some(TripDocument::from_json(&payload)?))
            }
            None => Ok(None),
        }
    }
}

impl DetectionStore for SqliteStore {
    fn replace_trip_detections(&mut self, trip_id: &str, events: &[DetectionEvent]) -> Result<()> {
        let tx = self.db.transaction()?;
        tx.execute("DELETE FROM detections WHERE trip_id = ?1", params![trip_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO detections
                     (trip_id, user_id, ts, latitude, longitude, intensity, stability, speed_mps)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for e in events {
                stmt.execute(params![
                    e.trip_id,
                    e.user_id,
                    e.wall_time.timestamp_millis(),
                    e.latitude,
                    e.longitude,
                    e.intensity,
                    e.stability,
                    e.speed_mps
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn scan_all(&self) -> Result<Vec<DetectionEvent>> {
        let mut stmt = self.db.prepare(&format!(
            "SELECT {} FROM detections ORDER BY ts, trip_id",
            SELECT_EVENT_COLUMNS
        ))?;
        let events = stmt
            .query_map([], Self::row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn page(&self, limit: u32, offset: u32) -> Result<Vec<DetectionEvent>> {
        let mut stmt = self.db.prepare(&format!(
            "SELECT {} FROM detections ORDER BY ts DESC, trip_id LIMIT ?1 OFFSET ?2",
            SELECT_EVENT_COLUMNS
        ))?;
        let events = stmt
            .query_map(params![limit, offset], Self::row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn count(&self) -> Result<u64> {
        let count: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
