//! SQLite-backed store.
//!
//! Restriction definitions are stored as JSON documents alongside the
//! indexed `zone` and `resource` columns. Acquisition records keep their
//! `tokenized` array as its canonical JSON serialization, which doubles as
//! the optimistic-write precondition comparand: conditional writes match on
//! `acquirer_id` and the exact stored string. The TTL sweep deletes rows
//! whose `expires` has passed.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tollgate_core::acquisition::{
    AcquisitionRecord, EpochMillis, RecordMeta, TokenizedGroup,
};
use tollgate_core::policy::Restriction;

use super::{
    AcquisitionState, AcquisitionStore, RestrictionQuery, RestrictionRecord, RestrictionStore,
    StoreError, WriteOutcome, RESTRICTIONS,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS restrictions (
    id       TEXT PRIMARY KEY,
    zone     TEXT NOT NULL,
    resource TEXT NOT NULL,
    doc      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS restrictions_zone_idx ON restrictions(zone);
CREATE TABLE IF NOT EXISTS acquisitions (
    acquirer_id TEXT PRIMARY KEY,
    tokenized   TEXT NOT NULL,
    expires     INTEGER NOT NULL,
    ttl         INTEGER NOT NULL,
    created     INTEGER NOT NULL,
    updated     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS acquisitions_expires_idx ON acquisitions(expires);
";

/// A SQLite implementation of both stores.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (and initializes) a store at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] when the database cannot be opened
    /// or the schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(Connection::open(path).map_err(backend)?)
    }

    /// Opens an in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] when the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
}

fn canonical(groups: &[TokenizedGroup]) -> Result<String, StoreError> {
    // Token maps are ordered, so this serialization is deterministic and
    // usable as the precondition comparand.
    serde_json::to_string(groups).map_err(|e| StoreError::Backend(e.to_string()))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

#[async_trait]
impl RestrictionStore for SqliteStore {
    async fn insert(&self, record: RestrictionRecord) -> Result<(), StoreError> {
        let doc = serde_json::to_string(&record).map_err(|e| StoreError::Backend(e.to_string()))?;
        let conn = self.lock();
        match conn.execute(
            "INSERT INTO restrictions (id, zone, resource, doc) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.restriction.id,
                record.restriction.zone,
                record.restriction.resource,
                doc
            ],
        ) {
            Ok(_) => Ok(()),
            Err(e) if is_constraint(&e) => Err(StoreError::Duplicate {
                collection: RESTRICTIONS,
                id: record.restriction.id.clone(),
            }),
            Err(e) => Err(backend(e)),
        }
    }

    async fn update(&self, restriction: Restriction, now: EpochMillis) -> Result<(), StoreError> {
        let conn = self.lock();
        let existing: Option<String> = conn
            .query_row(
                "SELECT doc FROM restrictions WHERE id = ?1",
                params![restriction.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        let Some(doc) = existing else {
            return Err(StoreError::NotFound {
                collection: RESTRICTIONS,
                id: restriction.id,
            });
        };
        let mut record: RestrictionRecord =
            serde_json::from_str(&doc).map_err(|e| StoreError::Backend(e.to_string()))?;
        record.restriction = restriction;
        record.meta.updated = now;
        let doc = serde_json::to_string(&record).map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute(
            "UPDATE restrictions SET zone = ?2, resource = ?3, doc = ?4 WHERE id = ?1",
            params![
                record.restriction.id,
                record.restriction.zone,
                record.restriction.resource,
                doc
            ],
        )
        .map_err(backend)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<RestrictionRecord, StoreError> {
        let conn = self.lock();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM restrictions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        let Some(doc) = doc else {
            return Err(StoreError::NotFound {
                collection: RESTRICTIONS,
                id: id.to_string(),
            });
        };
        serde_json::from_str(&doc).map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn get_all(
        &self,
        query: &RestrictionQuery,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RestrictionRecord>, StoreError> {
        let mut sql = String::from("SELECT doc FROM restrictions");
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(zone) = &query.zone {
            clauses.push("zone = ?");
            args.push(rusqlite::types::Value::Text(zone.clone()));
        }
        if let Some(resource) = &query.resource {
            clauses.push("resource = ?");
            args.push(rusqlite::types::Value::Text(resource.clone()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id LIMIT ? OFFSET ?");
        args.push(rusqlite::types::Value::Integer(to_i64(limit as u64)));
        args.push(rusqlite::types::Value::Integer(to_i64(offset as u64)));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let docs = stmt
            .query_map(params_from_iter(args), |row| row.get::<_, String>(0))
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        docs.iter()
            .map(|doc| serde_json::from_str(doc).map_err(|e| StoreError::Backend(e.to_string())))
            .collect()
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let removed = self
            .lock()
            .execute("DELETE FROM restrictions WHERE id = ?1", params![id])
            .map_err(backend)?;
        if removed == 0 {
            return Err(StoreError::NotFound {
                collection: RESTRICTIONS,
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn remove_all(&self, zone: &str, resource: &str) -> Result<u64, StoreError> {
        let removed = self
            .lock()
            .execute(
                "DELETE FROM restrictions WHERE zone = ?1 AND resource = ?2",
                params![zone, resource],
            )
            .map_err(backend)?;
        Ok(removed as u64)
    }

    async fn find_matching(
        &self,
        zones: &[String],
        resources: &[String],
    ) -> Result<Vec<RestrictionRecord>, StoreError> {
        if zones.is_empty() || resources.is_empty() {
            return Ok(Vec::new());
        }
        let zone_marks = vec!["?"; zones.len()].join(", ");
        let resource_marks = vec!["?"; resources.len()].join(", ");
        let sql = format!(
            "SELECT doc FROM restrictions WHERE zone IN ({zone_marks}) \
             AND resource IN ({resource_marks})"
        );
        let conn = self.lock();
        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let docs = stmt
            .query_map(params_from_iter(zones.iter().chain(resources.iter())), |row| {
                row.get::<_, String>(0)
            })
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        docs.iter()
            .map(|doc| serde_json::from_str(doc).map_err(|e| StoreError::Backend(e.to_string())))
            .collect()
    }
}

#[async_trait]
impl AcquisitionStore for SqliteStore {
    async fn get(&self, acquirer_id: &str) -> Result<Option<AcquisitionRecord>, StoreError> {
        let conn = self.lock();
        let row: Option<(String, i64, i64, i64, i64)> = conn
            .query_row(
                "SELECT tokenized, expires, ttl, created, updated \
                 FROM acquisitions WHERE acquirer_id = ?1",
                params![acquirer_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()
            .map_err(backend)?;
        let Some((tokenized, expires, ttl, created, updated)) = row else {
            return Ok(None);
        };
        let tokenized: Vec<TokenizedGroup> =
            serde_json::from_str(&tokenized).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Some(AcquisitionRecord {
            acquirer_id: acquirer_id.to_string(),
            tokenized,
            ttl: to_u64(ttl),
            expires: to_u64(expires),
            meta: Some(RecordMeta {
                created: to_u64(created),
                updated: to_u64(updated),
            }),
        }))
    }

    async fn upsert(
        &self,
        acquirer_id: &str,
        expected: &[TokenizedGroup],
        state: AcquisitionState,
        now: EpochMillis,
    ) -> Result<WriteOutcome, StoreError> {
        let new_tokenized = canonical(&state.tokenized)?;
        let expected_tokenized = canonical(expected)?;
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE acquisitions SET tokenized = ?1, expires = ?2, ttl = ?3, updated = ?4 \
                 WHERE acquirer_id = ?5 AND tokenized = ?6",
                params![
                    new_tokenized,
                    to_i64(state.expires),
                    to_i64(state.ttl),
                    to_i64(now),
                    acquirer_id,
                    expected_tokenized
                ],
            )
            .map_err(backend)?;
        if changed == 1 {
            return Ok(WriteOutcome::Applied);
        }
        match conn.execute(
            "INSERT INTO acquisitions (acquirer_id, tokenized, expires, ttl, created, updated) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                acquirer_id,
                new_tokenized,
                to_i64(state.expires),
                to_i64(state.ttl),
                to_i64(now),
                to_i64(now)
            ],
        ) {
            Ok(_) => Ok(WriteOutcome::Applied),
            // The record exists with a different tokenized value: another
            // writer interleaved.
            Err(e) if is_constraint(&e) => Ok(WriteOutcome::Conflict),
            Err(e) => Err(backend(e)),
        }
    }

    async fn update(
        &self,
        acquirer_id: &str,
        expected: &[TokenizedGroup],
        state: AcquisitionState,
        now: EpochMillis,
    ) -> Result<WriteOutcome, StoreError> {
        let new_tokenized = canonical(&state.tokenized)?;
        let expected_tokenized = canonical(expected)?;
        let changed = self
            .lock()
            .execute(
                "UPDATE acquisitions SET tokenized = ?1, expires = ?2, ttl = ?3, updated = ?4 \
                 WHERE acquirer_id = ?5 AND tokenized = ?6",
                params![
                    new_tokenized,
                    to_i64(state.expires),
                    to_i64(state.ttl),
                    to_i64(now),
                    acquirer_id,
                    expected_tokenized
                ],
            )
            .map_err(backend)?;
        Ok(if changed == 1 {
            WriteOutcome::Applied
        } else {
            WriteOutcome::Conflict
        })
    }

    async fn delete(
        &self,
        acquirer_id: &str,
        expected: &[TokenizedGroup],
    ) -> Result<WriteOutcome, StoreError> {
        let expected_tokenized = canonical(expected)?;
        let removed = self
            .lock()
            .execute(
                "DELETE FROM acquisitions WHERE acquirer_id = ?1 AND tokenized = ?2",
                params![acquirer_id, expected_tokenized],
            )
            .map_err(backend)?;
        Ok(if removed == 1 {
            WriteOutcome::Applied
        } else {
            WriteOutcome::Conflict
        })
    }

    async fn sweep_expired(&self, now: EpochMillis) -> Result<u64, StoreError> {
        let removed = self
            .lock()
            .execute(
                "DELETE FROM acquisitions WHERE expires <= ?1",
                params![to_i64(now)],
            )
            .map_err(backend)?;
        Ok(removed as u64)
    }
}
