// Durable trace store. Single writer behind a connection mutex; every
// trace commits atomically with its rounds or not at all.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ToSql};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

const SCHEMA_VERSION: u32 = 1;

/// Quality threshold for fine-tune candidates.
pub const DEFAULT_CANDIDATE_THRESHOLD: u8 = 8;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub round: u32,
    pub proposer_text: String,
    pub skeptic_text: String,
    pub proposer_duration_ms: u64,
    pub skeptic_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSet {
    pub proposer: String,
    pub skeptic: String,
    pub synthesizer: String,
    pub embedding: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub total_ms: u64,
    pub rag_ms: u64,
    pub rounds_ms: Vec<u64>,
    pub synthesis_ms: u64,
}

/// The durable record of one completed debate. `user_rating` is the only
/// field mutable after persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DebateTrace {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub query: String,
    pub templates_used: Vec<String>,
    pub rounds: Vec<Round>,
    pub final_answer: String,
    pub total_rounds: u32,
    pub early_stopped: bool,
    pub auto_score: Option<u8>,
    pub user_rating: Option<u8>,
    pub models: ModelSet,
    pub timing: Timing,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub query: String,
    pub total_rounds: u32,
    pub early_stopped: bool,
    pub auto_score: Option<u8>,
    pub user_rating: Option<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct TraceQuery {
    pub limit: usize,
    pub offset: usize,
    pub min_quality: Option<u8>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub count: u64,
    pub mean_quality: Option<f64>,
    pub candidates_count: u64,
}

pub struct TraceStore {
    conn: Mutex<Connection>,
}

impl TraceStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).with_context(|| {
            format!("opening trace store at {}", path.as_ref().display())
        })?;

        // WAL keeps the save transaction atomic across a process crash.
        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .context("enabling WAL journal mode")?;
        conn.execute("PRAGMA foreign_keys=ON", [])
            .context("enabling foreign keys")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema().context("ensuring trace schema")?;
        Ok(store)
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| {
            StoreError::Invalid("trace store lock poisoned".to_string())
        })
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("trace store lock poisoned"))?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS schema_meta (
                version INTEGER NOT NULL
            )"#,
            [],
        )?;
        conn.execute(
            "INSERT INTO schema_meta (version)
             SELECT ?1 WHERE NOT EXISTS (SELECT 1 FROM schema_meta)",
            params![SCHEMA_VERSION],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS traces (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                query TEXT NOT NULL,
                templates_used TEXT NOT NULL,
                final_answer TEXT NOT NULL,
                total_rounds INTEGER NOT NULL,
                early_stopped INTEGER NOT NULL,
                auto_score INTEGER,
                user_rating INTEGER,
                proposer_model TEXT NOT NULL,
                skeptic_model TEXT NOT NULL,
                synthesizer_model TEXT NOT NULL,
                embedding_model TEXT NOT NULL,
                total_ms INTEGER NOT NULL,
                rag_ms INTEGER NOT NULL,
                rounds_ms TEXT NOT NULL,
                synthesis_ms INTEGER NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS rounds (
                trace_id TEXT NOT NULL REFERENCES traces(id) ON DELETE CASCADE,
                round INTEGER NOT NULL,
                proposer_text TEXT NOT NULL,
                skeptic_text TEXT NOT NULL,
                proposer_duration_ms INTEGER NOT NULL,
                skeptic_duration_ms INTEGER NOT NULL,
                PRIMARY KEY (trace_id, round)
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_traces_created_at ON traces(created_at DESC)",
            [],
        )?;

        Ok(())
    }

    /// Persist a trace and its rounds in one transaction.
    pub fn save(&self, trace: &DebateTrace) -> Result<(), StoreError> {
        validate_trace(trace)?;

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM traces WHERE id = ?1)",
                params![trace.id],
                |row| row.get(0),
            )?;
        if exists {
            return Err(StoreError::Duplicate(trace.id.clone()));
        }

        tx.execute(
            r#"INSERT INTO traces
               (id, created_at, query, templates_used, final_answer, total_rounds,
                early_stopped, auto_score, user_rating, proposer_model, skeptic_model,
                synthesizer_model, embedding_model, total_ms, rag_ms, rounds_ms, synthesis_ms)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"#,
            params![
                trace.id,
                trace.created_at.to_rfc3339(),
                trace.query,
                serde_json::to_string(&trace.templates_used)?,
                trace.final_answer,
                trace.total_rounds,
                trace.early_stopped,
                trace.auto_score,
                trace.user_rating,
                trace.models.proposer,
                trace.models.skeptic,
                trace.models.synthesizer,
                trace.models.embedding,
                trace.timing.total_ms as i64,
                trace.timing.rag_ms as i64,
                serde_json::to_string(&trace.timing.rounds_ms)?,
                trace.timing.synthesis_ms as i64,
            ],
        )?;

        for round in &trace.rounds {
            tx.execute(
                r#"INSERT INTO rounds
                   (trace_id, round, proposer_text, skeptic_text,
                    proposer_duration_ms, skeptic_duration_ms)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
                params![
                    trace.id,
                    round.round,
                    round.proposer_text,
                    round.skeptic_text,
                    round.proposer_duration_ms as i64,
                    round.skeptic_duration_ms as i64,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<DebateTrace>, StoreError> {
        let conn = self.lock_conn()?;

        let trace = conn
            .query_row(
                r#"SELECT id, created_at, query, templates_used, final_answer, total_rounds,
                          early_stopped, auto_score, user_rating, proposer_model, skeptic_model,
                          synthesizer_model, embedding_model, total_ms, rag_ms, rounds_ms, synthesis_ms
                   FROM traces WHERE id = ?1"#,
                params![id],
                row_to_trace,
            );
        let mut trace = match trace {
            Ok(trace) => trace?,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut stmt = conn.prepare(
            r#"SELECT round, proposer_text, skeptic_text,
                      proposer_duration_ms, skeptic_duration_ms
               FROM rounds WHERE trace_id = ?1 ORDER BY round"#,
        )?;
        let rounds = stmt
            .query_map(params![id], |row| {
                Ok(Round {
                    round: row.get(0)?,
                    proposer_text: row.get(1)?,
                    skeptic_text: row.get(2)?,
                    proposer_duration_ms: row.get::<_, i64>(3)? as u64,
                    skeptic_duration_ms: row.get::<_, i64>(4)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        trace.rounds = rounds;
        Ok(Some(trace))
    }

    pub fn list(&self, query: &TraceQuery) -> Result<Vec<TraceSummary>, StoreError> {
        let conn = self.lock_conn()?;

        let mut sql = String::from(
            "SELECT id, created_at, query, total_rounds, early_stopped, auto_score, user_rating
             FROM traces",
        );
        let mut clauses: Vec<&str> = Vec::new();
        let min_quality = query.min_quality.map(i64::from);
        let search = query.search.clone();
        let limit = query.limit as i64;
        let offset = query.offset as i64;

        let mut bind: Vec<&dyn ToSql> = Vec::new();
        if let Some(ref q) = min_quality {
            clauses.push("(auto_score >= ? OR user_rating >= ?)");
            bind.push(q);
            bind.push(q);
        }
        if let Some(ref text) = search {
            clauses.push("query LIKE '%' || ? || '%'");
            bind.push(text);
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");
        bind.push(&limit);
        bind.push(&offset);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(bind.as_slice(), row_to_summary)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    /// Set the user rating for a persisted trace.
    pub fn rate(&self, id: &str, score: u8) -> Result<(), StoreError> {
        if !(1..=10).contains(&score) {
            return Err(StoreError::Invalid(format!(
                "rating must be in 1..=10, got {score}"
            )));
        }

        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE traces SET user_rating = ?1 WHERE id = ?2",
            params![score, id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Traces whose best available quality score meets the threshold.
    pub fn finetune_candidates(&self, threshold: u8) -> Result<Vec<TraceSummary>, StoreError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, created_at, query, total_rounds, early_stopped, auto_score, user_rating
             FROM traces
             WHERE auto_score >= ?1 OR user_rating >= ?1
             ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![threshold], row_to_summary)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.lock_conn()?;
        let stats = conn.query_row(
            "SELECT COUNT(*),
                    AVG(CASE WHEN auto_score IS NULL AND user_rating IS NULL THEN NULL
                        ELSE MAX(COALESCE(auto_score, 0), COALESCE(user_rating, 0)) END),
                    COALESCE(SUM(CASE WHEN COALESCE(auto_score, 0) >= ?1
                                        OR COALESCE(user_rating, 0) >= ?1
                                      THEN 1 ELSE 0 END), 0)
             FROM traces",
            params![DEFAULT_CANDIDATE_THRESHOLD],
            |row| {
                Ok(StoreStats {
                    count: row.get::<_, i64>(0)? as u64,
                    mean_quality: row.get(1)?,
                    candidates_count: row.get::<_, i64>(2)? as u64,
                })
            },
        )?;
        Ok(stats)
    }
}

// Template ids are deliberately not checked against the template index:
// they are copied from retrieval hits at debate time, and the referenced
// templates may legally be removed later.
fn validate_trace(trace: &DebateTrace) -> Result<(), StoreError> {
    if trace.total_rounds as usize != trace.rounds.len() {
        return Err(StoreError::Invalid(format!(
            "total_rounds {} does not match rounds length {}",
            trace.total_rounds,
            trace.rounds.len()
        )));
    }
    for (index, round) in trace.rounds.iter().enumerate() {
        let expected = index as u32 + 1;
        if round.round != expected {
            return Err(StoreError::Invalid(format!(
                "round numbers must be contiguous from 1, found {} at position {}",
                round.round, index
            )));
        }
    }
    if trace.timing.rounds_ms.len() != trace.rounds.len() {
        return Err(StoreError::Invalid(format!(
            "rounds_ms length {} does not match rounds length {}",
            trace.timing.rounds_ms.len(),
            trace.rounds.len()
        )));
    }
    for score in [trace.auto_score, trace.user_rating].into_iter().flatten() {
        if !(1..=10).contains(&score) {
            return Err(StoreError::Invalid(format!(
                "scores must be in 1..=10, got {score}"
            )));
        }
    }
    Ok(())
}

type TraceRowResult = rusqlite::Result<Result<DebateTrace, StoreError>>;

fn row_to_trace(row: &rusqlite::Row<'_>) -> TraceRowResult {
    let created_at_raw: String = row.get(1)?;
    let templates_raw: String = row.get(3)?;
    let rounds_ms_raw: String = row.get(15)?;

    Ok((|| {
        let created_at = DateTime::parse_from_rfc3339(&created_at_raw)
            .map_err(|err| StoreError::Invalid(format!("bad created_at: {err}")))?
            .with_timezone(&Utc);
        let templates_used: Vec<String> = serde_json::from_str(&templates_raw)?;
        let rounds_ms: Vec<u64> = serde_json::from_str(&rounds_ms_raw)?;

        Ok(DebateTrace {
            id: row.get(0).map_err(StoreError::from)?,
            created_at,
            query: row.get(2).map_err(StoreError::from)?,
            templates_used,
            rounds: Vec::new(),
            final_answer: row.get(4).map_err(StoreError::from)?,
            total_rounds: row.get(5).map_err(StoreError::from)?,
            early_stopped: row.get(6).map_err(StoreError::from)?,
            auto_score: row.get(7).map_err(StoreError::from)?,
            user_rating: row.get(8).map_err(StoreError::from)?,
            models: ModelSet {
                proposer: row.get(9).map_err(StoreError::from)?,
                skeptic: row.get(10).map_err(StoreError::from)?,
                synthesizer: row.get(11).map_err(StoreError::from)?,
                embedding: row.get(12).map_err(StoreError::from)?,
            },
            timing: Timing {
                total_ms: row.get::<_, i64>(13).map_err(StoreError::from)? as u64,
                rag_ms: row.get::<_, i64>(14).map_err(StoreError::from)? as u64,
                rounds_ms,
                synthesis_ms: row.get::<_, i64>(16).map_err(StoreError::from)? as u64,
            },
        })
    })())
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<TraceSummary, StoreError>> {
    let created_at_raw: String = row.get(1)?;
    Ok((|| {
        let created_at = DateTime::parse_from_rfc3339(&created_at_raw)
            .map_err(|err| StoreError::Invalid(format!("bad created_at: {err}")))?
            .with_timezone(&Utc);
        Ok(TraceSummary {
            id: row.get(0).map_err(StoreError::from)?,
            created_at,
            query: row.get(2).map_err(StoreError::from)?,
            total_rounds: row.get(3).map_err(StoreError::from)?,
            early_stopped: row.get(4).map_err(StoreError::from)?,
            auto_score: row.get(5).map_err(StoreError::from)?,
            user_rating: row.get(6).map_err(StoreError::from)?,
        })
    })())
}
