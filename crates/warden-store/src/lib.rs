//! warden-store: Relational store for the biometric engine.
//!
//! SQLite through `tokio-rusqlite`: every call runs on the connection's
//! dedicated thread, so each method is an async suspension point. Multi-row
//! writes that must be all-or-nothing run inside a single transaction.

mod audit;
mod consent;
mod keys;
mod schema;
mod templates;
mod watchlist;

pub use audit::{chain_hash, ChainReport};
pub use keys::KeyRow;
pub use watchlist::WatchlistCounts;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(tokio_rusqlite::Error),
    #[error("constraint violation: {0}")]
    Conflict(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit chain broken at entry {id}")]
    ChainBroken { id: String },
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        if let tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(err, msg)) = &e {
            if err.code == rusqlite::ErrorCode::ConstraintViolation {
                return StoreError::Conflict(msg.clone().unwrap_or_else(|| err.to_string()));
            }
        }
        StoreError::Database(e)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::from(tokio_rusqlite::Error::from(e))
    }
}

/// Handle to the relational store. Clones share one connection thread.
#[derive(Clone)]
pub struct Store {
    conn: tokio_rusqlite::Connection,
}

impl Store {
    /// Open (or create) the database file and apply the schema.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = tokio_rusqlite::Connection::open(&path).await?;
        let store = Self { conn };
        store.init(true).await?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// In-memory database, used by tests and dry runs.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init(false).await?;
        Ok(store)
    }

    async fn init(&self, file_backed: bool) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                if file_backed {
                    conn.execute_batch(schema::PRAGMAS)?;
                } else {
                    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
                }
                conn.execute_batch(schema::SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &tokio_rusqlite::Connection {
        &self.conn
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

/// RFC 3339 with nanoseconds and `Z`: lossless and lexicographically ordered.
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, s)).transpose()
}

pub(crate) fn parse_text<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = warden_core::records::ParseEnumError>,
{
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
