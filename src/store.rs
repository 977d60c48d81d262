//! Local SQLite corpus of extracted sessions, facts and conversions.
//!
//! Columns are nullable on purpose: rows written by an upstream extractor are
//! validated on load and rejected with the offending row named.

use std::collections::HashMap;
use std::path::Path;

use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::info;

use crate::fact::{
    validate_conversion, validate_session, Conversion, Fact, IngestError, Scalar, Session,
    Timestamp,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("malformed input: {0}")]
    Ingest(#[from] IngestError),
    #[error("failed to encode scalar: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Corpus {
    pub sessions: Vec<Session>,
    pub conversions: Vec<Conversion>,
}

pub fn create_corpus_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT,
            entity_id TEXT,
            session_ts_ms INTEGER
        );
        CREATE TABLE IF NOT EXISTS facts (
            session_id TEXT,
            name TEXT,
            value_json TEXT,
            ts_ms INTEGER
        );
        CREATE TABLE IF NOT EXISTS conversions (
            entity_id TEXT,
            conversion_ts_ms INTEGER,
            label_json TEXT
        );
        CREATE INDEX IF NOT EXISTS facts_session_idx ON facts (session_id);
        ",
    )?;
    Ok(())
}

pub fn insert_session(conn: &Connection, session: &Session) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO sessions (session_id, entity_id, session_ts_ms) VALUES (?1, ?2, ?3)",
        params![
            session.session_id,
            session.entity_id,
            session.session_ts.timestamp_millis()
        ],
    )?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO facts (session_id, name, value_json, ts_ms) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (name, facts) in &session.facts {
        for fact in facts {
            stmt.execute(params![
                session.session_id,
                name,
                serde_json::to_string(&fact.value)?,
                fact.timestamp.timestamp_millis()
            ])?;
        }
    }
    Ok(())
}

pub fn insert_conversion(conn: &Connection, conversion: &Conversion) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO conversions (entity_id, conversion_ts_ms, label_json) VALUES (?1, ?2, ?3)",
        params![
            conversion.entity_id,
            conversion.conversion_ts.timestamp_millis(),
            serde_json::to_string(&conversion.label)?
        ],
    )?;
    Ok(())
}

pub struct CorpusStore {
    conn: Connection,
}

impl CorpusStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            conn: Connection::open(path)?,
        })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn load_corpus(&self) -> Result<Corpus, StoreError> {
        let corpus = Corpus {
            sessions: self.load_sessions()?,
            conversions: self.load_conversions()?,
        };
        info!(
            component = "store",
            event = "store.load.finish",
            sessions = corpus.sessions.len(),
            conversions = corpus.conversions.len()
        );
        Ok(corpus)
    }

    pub fn load_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT rowid, session_id, entity_id, session_ts_ms
            FROM sessions
            ORDER BY session_ts_ms ASC, rowid ASC
            ",
        )?;
        let mut rows = stmt.query([])?;

        let mut sessions = Vec::new();
        let mut index_by_id: HashMap<String, usize> = HashMap::new();
        while let Some(row) = rows.next()? {
            let rowid: i64 = row.get(0)?;
            let record = format!("sessions row {rowid}");
            let session_id = required(row.get::<_, Option<String>>(1)?, &record, "session_id")?;
            let entity_id = required(row.get::<_, Option<String>>(2)?, &record, "entity_id")?;
            let session_ts_ms = required(row.get::<_, Option<i64>>(3)?, &record, "session_ts")?;

            let session = Session::new(
                entity_id,
                session_id.clone(),
                millis_to_ts(session_ts_ms, &record, "session_ts")?,
            );
            validate_session(&session)?;
            if index_by_id.insert(session_id.clone(), sessions.len()).is_some() {
                return Err(IngestError::InvalidField {
                    record,
                    field: "session_id",
                    reason: format!("duplicate session id `{session_id}`"),
                }
                .into());
            }
            sessions.push(session);
        }

        let mut stmt = self.conn.prepare(
            "
            SELECT rowid, session_id, name, value_json, ts_ms
            FROM facts
            ORDER BY ts_ms ASC, rowid ASC
            ",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let rowid: i64 = row.get(0)?;
            let record = format!("facts row {rowid}");
            let session_id = required(row.get::<_, Option<String>>(1)?, &record, "session_id")?;
            let name = required(row.get::<_, Option<String>>(2)?, &record, "name")?;
            if name.trim().is_empty() {
                return Err(IngestError::MissingField {
                    record,
                    field: "name",
                }
                .into());
            }
            let value = parse_scalar(row.get::<_, Option<String>>(3)?, &record, "value")?;
            let ts_ms = required(row.get::<_, Option<i64>>(4)?, &record, "timestamp")?;
            let timestamp = millis_to_ts(ts_ms, &record, "timestamp")?;

            let idx = *index_by_id
                .get(&session_id)
                .ok_or(IngestError::UnknownSession { session_id })?;
            sessions[idx].push_fact(name, Fact { value, timestamp });
        }

        Ok(sessions)
    }

    pub fn load_conversions(&self) -> Result<Vec<Conversion>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT rowid, entity_id, conversion_ts_ms, label_json
            FROM conversions
            ORDER BY conversion_ts_ms ASC, rowid ASC
            ",
        )?;
        let mut rows = stmt.query([])?;

        let mut conversions = Vec::new();
        while let Some(row) = rows.next()? {
            let rowid: i64 = row.get(0)?;
            let record = format!("conversions row {rowid}");
            let entity_id = required(row.get::<_, Option<String>>(1)?, &record, "entity_id")?;
            let ts_ms = required(row.get::<_, Option<i64>>(2)?, &record, "conversion_ts")?;
            let conversion = Conversion {
                entity_id,
                conversion_ts: millis_to_ts(ts_ms, &record, "conversion_ts")?,
                label: parse_scalar(row.get::<_, Option<String>>(3)?, &record, "label")?,
            };
            validate_conversion(&conversion)?;
            conversions.push(conversion);
        }
        Ok(conversions)
    }
}

fn required<T>(value: Option<T>, record: &str, field: &'static str) -> Result<T, IngestError> {
    value.ok_or_else(|| IngestError::MissingField {
        record: record.to_string(),
        field,
    })
}

fn millis_to_ts(ms: i64, record: &str, field: &'static str) -> Result<Timestamp, IngestError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| IngestError::InvalidField {
            record: record.to_string(),
            field,
            reason: format!("timestamp {ms}ms out of range"),
        })
}

fn parse_scalar(
    raw: Option<String>,
    record: &str,
    field: &'static str,
) -> Result<Scalar, IngestError> {
    match raw {
        None => Ok(Scalar::Null),
        Some(raw) => serde_json::from_str(&raw).map_err(|err| IngestError::InvalidField {
            record: record.to_string(),
            field,
            reason: err.to_string(),
        }),
    }
}
