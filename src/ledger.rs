// 📒 Ledger - SQLite side store next to the registry file
//
// Three tables:
//   events         append-only audit trail (merges, enrichment commits,
//                  rejected regressions, ambiguous merges)
//   batch_cursors  first uncommitted offset per (step, offset, limit) window
//   geocode_cache  reverse-geocode answers keyed by micro-degrees

use crate::error::Result;
use crate::geo::GeoPoint;
use crate::sources::AddressLookup;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// EVENT
// ============================================================================

/// Event for the audit trail
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub park_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        park_id: &str,
        data: serde_json::Value,
        actor: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            event_type: event_type.to_string(),
            park_id: park_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Batch window progress as stored
#[derive(Debug, Clone, PartialEq)]
pub struct CursorState {
    pub next_offset: usize,
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// LEDGER
// ============================================================================

pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        // WAL for crash recovery
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        setup_database(&conn)?;
        Ok(Ledger { conn })
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    pub fn record(&self, event: &Event) -> Result<()> {
        let data_json = serde_json::to_string(&event.data)?;
        self.conn.execute(
            "INSERT INTO events (event_id, timestamp, event_type, park_id, data, actor)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.event_id,
                event.timestamp.to_rfc3339(),
                event.event_type,
                event.park_id,
                data_json,
                event.actor,
            ],
        )?;
        Ok(())
    }

    pub fn events_for_park(&self, park_id: &str) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, timestamp, event_type, park_id, data, actor
             FROM events
             WHERE park_id = ?1
             ORDER BY id ASC",
        )?;

        let events = stmt
            .query_map(params![park_id], |row| {
                let timestamp_str: String = row.get(1)?;
                let data_json: String = row.get(4)?;

                Ok(Event {
                    event_id: row.get(0)?,
                    timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
                        })?
                        .with_timezone(&Utc),
                    event_type: row.get(2)?,
                    park_id: row.get(3)?,
                    data: serde_json::from_str(&data_json).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
                    })?,
                    actor: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }

    pub fn count_events(&self, event_type: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE event_type = ?1",
            params![event_type],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ------------------------------------------------------------------------
    // Batch cursors
    // ------------------------------------------------------------------------

    pub fn cursor(&self, step: &str, offset: usize, limit: usize) -> Result<Option<CursorState>> {
        let row: Option<(i64, i64, String)> = self
            .conn
            .query_row(
                "SELECT next_offset, completed, updated_at FROM batch_cursors
                 WHERE step = ?1 AND window_offset = ?2 AND window_limit = ?3",
                params![step, offset as i64, limit as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        Ok(row.map(|(next, completed, updated)| CursorState {
            next_offset: next.max(0) as usize,
            completed: completed != 0,
            updated_at: DateTime::parse_from_rfc3339(&updated)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_default(),
        }))
    }

    pub fn advance_cursor(
        &self,
        step: &str,
        offset: usize,
        limit: usize,
        next_offset: usize,
        completed: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO batch_cursors (step, window_offset, window_limit, next_offset, completed, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(step, window_offset, window_limit)
             DO UPDATE SET next_offset = excluded.next_offset,
                           completed = excluded.completed,
                           updated_at = excluded.updated_at",
            params![
                step,
                offset as i64,
                limit as i64,
                next_offset as i64,
                completed as i64,
                at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Forget a window so it starts from the top again
    pub fn reset_cursor(&self, step: &str, offset: usize, limit: usize) -> Result<()> {
        self.conn.execute(
            "DELETE FROM batch_cursors WHERE step = ?1 AND window_offset = ?2 AND window_limit = ?3",
            params![step, offset as i64, limit as i64],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Geocode cache
    // ------------------------------------------------------------------------

    /// Some(None) = cached "not found"; None = never asked
    pub fn cached_address(&self, point: GeoPoint) -> Result<Option<Option<AddressLookup>>> {
        let (lat, lon) = point.micro_degrees();
        let row: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT response FROM geocode_cache WHERE lat_e6 = ?1 AND lon_e6 = ?2",
                params![lat, lon],
                |row| row.get(0),
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some(None) => Ok(Some(None)),
            Some(Some(json)) => Ok(Some(Some(serde_json::from_str(&json)?))),
        }
    }

    pub fn cache_address(&self, point: GeoPoint, lookup: Option<&AddressLookup>, at: DateTime<Utc>) -> Result<()> {
        let (lat, lon) = point.micro_degrees();
        let json = lookup.map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT OR REPLACE INTO geocode_cache (lat_e6, lon_e6, response, fetched_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![lat, lon, json, at.to_rfc3339()],
        )?;
        Ok(())
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            park_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS batch_cursors (
            step TEXT NOT NULL,
            window_offset INTEGER NOT NULL,
            window_limit INTEGER NOT NULL,
            next_offset INTEGER NOT NULL,
            completed INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (step, window_offset, window_limit)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS geocode_cache (
            lat_e6 INTEGER NOT NULL,
            lon_e6 INTEGER NOT NULL,
            response TEXT,
            fetched_at TEXT NOT NULL,
            PRIMARY KEY (lat_e6, lon_e6)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_park ON events(park_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type)",
        [],
    )?;

    Ok(())
}
