//! Execution table operations.
//!
//! The execution row is single-writer: every mutation goes through
//! [`Store::update_execution`], a read-modify-write inside one transaction,
//! so concurrent updaters serialize at the store.

use super::{opt_ts_from_sql, ts_from_sql, ts_to_sql, Store, StoreError};
use ap_protocol::{ExecutionRecord, ExecutionStatus, ExecutionTarget, TargetKind};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

// ---------------------------------------------------------------------------
// Query types
// ---------------------------------------------------------------------------

/// Sortable columns for execution queries, named as the API exposes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionSort {
    #[default]
    StartedAt,
    Status,
    DurationMs,
    ReasonerId,
    AgentNodeId,
    RunId,
    ExecutionId,
}

impl ExecutionSort {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started_at" => Some(Self::StartedAt),
            "status" => Some(Self::Status),
            "duration_ms" => Some(Self::DurationMs),
            "reasoner_id" => Some(Self::ReasonerId),
            "agent_node_id" => Some(Self::AgentNodeId),
            "run_id" => Some(Self::RunId),
            "execution_id" => Some(Self::ExecutionId),
            _ => None,
        }
    }

    fn column(self) -> &'static str {
        match self {
            Self::StartedAt => "started_at",
            Self::Status => "status",
            Self::DurationMs => "duration_ms",
            Self::ReasonerId => "capability_id",
            Self::AgentNodeId => "node_id",
            Self::RunId => "run_id",
            Self::ExecutionId => "execution_id",
        }
    }
}

/// Filter and page parameters for execution queries.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub node_id: Option<String>,
    pub run_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub session_id: Option<String>,
    pub actor_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub sort: ExecutionSort,
    pub sort_descending: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ExecutionFilter {
    /// WHERE clause and its positional parameters (all TEXT).
    fn where_clause(&self) -> (String, Vec<String>) {
        let mut clauses: Vec<&'static str> = Vec::new();
        let mut params: Vec<String> = Vec::new();
        if let Some(node_id) = &self.node_id {
            clauses.push("node_id = ?");
            params.push(node_id.clone());
        }
        if let Some(run_id) = &self.run_id {
            clauses.push("run_id = ?");
            params.push(run_id.clone());
        }
        if let Some(status) = self.status {
            clauses.push("status = ?");
            params.push(status.as_str().to_owned());
        }
        if let Some(session_id) = &self.session_id {
            clauses.push("session_id = ?");
            params.push(session_id.clone());
        }
        if let Some(actor_id) = &self.actor_id {
            clauses.push("actor_id = ?");
            params.push(actor_id.clone());
        }
        if let Some(start) = self.start_time {
            clauses.push("started_at >= ?");
            params.push(ts_to_sql(start));
        }
        if let Some(end) = self.end_time {
            clauses.push("started_at <= ?");
            params.push(ts_to_sql(end));
        }
        let sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (sql, params)
    }
}

/// Aggregate counts and durations over the executions table.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ExecutionStats {
    pub total: i64,
    pub pending: i64,
    pub queued: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub avg_duration_ms: Option<f64>,
    pub max_duration_ms: Option<i64>,
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

const EXECUTION_COLUMNS: &str = "execution_id, run_id, parent_execution_id, node_id, target_kind, \
     capability_id, session_id, actor_id, input_payload, input_uri, result_payload, result_uri, \
     status, started_at, completed_at, duration_ms, error_message, retry_count, \
     webhook_registered, webhook_error";

impl Store {
    /// Insert a fresh execution record.  A duplicate `execution_id` is a conflict.
    pub fn create_execution(&mut self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.with_retry(|store| {
            let result = store.conn().execute(
                &format!("INSERT INTO executions ({EXECUTION_COLUMNS}) \
                          VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"),
                params![
                    record.execution_id,
                    record.run_id,
                    record.parent_execution_id,
                    record.target.node_id,
                    target_kind_to_sql(record.target.kind),
                    record.target.capability_id,
                    record.session_id,
                    record.actor_id,
                    record.input_payload,
                    record.input_uri,
                    record.result_payload,
                    record.result_uri,
                    record.status.as_str(),
                    ts_to_sql(record.started_at),
                    record.completed_at.map(ts_to_sql),
                    record.duration_ms,
                    record.error_message,
                    record.retry_count,
                    record.webhook_registered,
                    record.webhook_error,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Conflict(format!(
                        "execution '{}' already exists",
                        record.execution_id
                    )))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord, StoreError> {
        let result = self.conn().query_row(
            &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE execution_id = ?1"),
            params![execution_id],
            map_execution_row,
        );
        match result {
            Ok(record) => record,
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(StoreError::NotFound(format!(
                "execution '{execution_id}'"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write one execution row inside a transaction.
    ///
    /// The mutator may be re-run if the transaction hits a transient
    /// busy/locked failure, so it must be a pure function of the row.
    pub fn update_execution(
        &mut self,
        execution_id: &str,
        mutate: impl Fn(&mut ExecutionRecord) -> Result<(), StoreError>,
    ) -> Result<ExecutionRecord, StoreError> {
        self.with_retry(|store| {
            let tx = store.conn_mut().transaction()?;
            let result = tx.query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE execution_id = ?1"),
                params![execution_id],
                map_execution_row,
            );
            let mut record = match result {
                Ok(record) => record?,
                Err(rusqlite::Error::QueryReturnedNoRows) => {
                    return Err(StoreError::NotFound(format!("execution '{execution_id}'")))
                }
                Err(e) => return Err(e.into()),
            };
            mutate(&mut record)?;
            tx.execute(
                "UPDATE executions SET \
                     result_payload = ?2, result_uri = ?3, status = ?4, completed_at = ?5, \
                     duration_ms = ?6, error_message = ?7, retry_count = ?8, \
                     webhook_registered = ?9, webhook_error = ?10 \
                 WHERE execution_id = ?1",
                params![
                    execution_id,
                    record.result_payload,
                    record.result_uri,
                    record.status.as_str(),
                    record.completed_at.map(ts_to_sql),
                    record.duration_ms,
                    record.error_message,
                    record.retry_count,
                    record.webhook_registered,
                    record.webhook_error,
                ],
            )?;
            tx.commit()?;
            Ok(record)
        })
    }

    pub fn query_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let (where_sql, where_params) = filter.where_clause();
        let order = if filter.sort_descending { "DESC" } else { "ASC" };
        let mut sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions{where_sql} \
             ORDER BY {} {order}, execution_id {order}",
            filter.sort.column()
        );
        match (filter.limit, filter.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            // SQLite requires a LIMIT clause to apply an OFFSET.
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(where_params.iter()),
            map_execution_row,
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    /// Total rows matching `filter`, ignoring its page parameters.
    pub fn count_executions(&self, filter: &ExecutionFilter) -> Result<i64, StoreError> {
        let (where_sql, where_params) = filter.where_clause();
        let count: i64 = self.conn().query_row(
            &format!("SELECT COUNT(*) FROM executions{where_sql}"),
            rusqlite::params_from_iter(where_params.iter()),
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn execution_stats(&self) -> Result<ExecutionStats, StoreError> {
        let mut stats = ExecutionStats {
            total: 0,
            pending: 0,
            queued: 0,
            running: 0,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            avg_duration_ms: None,
            max_duration_ms: None,
        };
        let mut stmt = self
            .conn()
            .prepare("SELECT status, COUNT(*) FROM executions GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            stats.total += count;
            match status.as_str() {
                "pending" => stats.pending = count,
                "queued" => stats.queued = count,
                "running" => stats.running = count,
                "succeeded" => stats.succeeded = count,
                "failed" => stats.failed = count,
                "cancelled" => stats.cancelled = count,
                other => {
                    return Err(StoreError::Corrupt(format!(
                        "unknown execution status '{other}' in store"
                    )))
                }
            }
        }
        let (avg, max) = self.conn().query_row(
            "SELECT AVG(duration_ms), MAX(duration_ms) FROM executions WHERE duration_ms IS NOT NULL",
            [],
            |row| Ok((row.get::<_, Option<f64>>(0)?, row.get::<_, Option<i64>>(1)?)),
        )?;
        stats.avg_duration_ms = avg;
        stats.max_duration_ms = max;
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn target_kind_to_sql(kind: TargetKind) -> &'static str {
    kind.path_segment()
}

fn target_kind_from_sql(text: &str) -> Result<TargetKind, StoreError> {
    match text {
        "reasoners" => Ok(TargetKind::Reasoner),
        "skills" => Ok(TargetKind::Skill),
        other => Err(StoreError::Corrupt(format!("unknown target kind '{other}'"))),
    }
}

/// Maps one row to a record.  Returns a nested result: the outer error is
/// rusqlite's (column access), the inner is ours (decode).
fn map_execution_row(row: &Row<'_>) -> Result<Result<ExecutionRecord, StoreError>, rusqlite::Error> {
    let target_kind: String = row.get(4)?;
    let status_text: String = row.get(12)?;
    let started_at: String = row.get(13)?;
    let completed_at: Option<String> = row.get(14)?;
    Ok((|| {
        Ok(ExecutionRecord {
            execution_id: row.get(0).map_err(StoreError::from)?,
            run_id: row.get(1).map_err(StoreError::from)?,
            parent_execution_id: row.get(2).map_err(StoreError::from)?,
            target: ExecutionTarget {
                node_id: row.get(3).map_err(StoreError::from)?,
                kind: target_kind_from_sql(&target_kind)?,
                capability_id: row.get(5).map_err(StoreError::from)?,
            },
            session_id: row.get(6).map_err(StoreError::from)?,
            actor_id: row.get(7).map_err(StoreError::from)?,
            input_payload: row.get(8).map_err(StoreError::from)?,
            input_uri: row.get(9).map_err(StoreError::from)?,
            result_payload: row.get(10).map_err(StoreError::from)?,
            result_uri: row.get(11).map_err(StoreError::from)?,
            status: ExecutionStatus::parse(&status_text)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown status '{status_text}'")))?,
            started_at: ts_from_sql(&started_at)?,
            completed_at: opt_ts_from_sql(completed_at)?,
            duration_ms: row.get(15).map_err(StoreError::from)?,
            error_message: row.get(16).map_err(StoreError::from)?,
            retry_count: row.get(17).map_err(StoreError::from)?,
            webhook_registered: row.get(18).map_err(StoreError::from)?,
            webhook_error: row.get(19).map_err(StoreError::from)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(id: &str, run: &str, status: ExecutionStatus) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: id.to_owned(),
            run_id: run.to_owned(),
            parent_execution_id: None,
            target: ExecutionTarget {
                node_id: "node-1".to_owned(),
                kind: TargetKind::Reasoner,
                capability_id: "reasoner-a".to_owned(),
            },
            session_id: None,
            actor_id: None,
            input_payload: Some(b"{\"foo\":\"bar\"}".to_vec()),
            input_uri: None,
            result_payload: None,
            result_uri: None,
            status,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error_message: None,
            retry_count: 0,
            webhook_registered: false,
            webhook_error: None,
        }
    }

    #[test]
    fn create_then_get_round_trips() {
        let mut store = Store::open_in_memory().unwrap();
        let record = make_record("exec-1", "run-1", ExecutionStatus::Pending);
        store.create_execution(&record).unwrap();

        let loaded = store.get_execution("exec-1").unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn duplicate_execution_id_is_a_conflict() {
        let mut store = Store::open_in_memory().unwrap();
        let record = make_record("exec-1", "run-1", ExecutionStatus::Pending);
        store.create_execution(&record).unwrap();
        assert!(matches!(
            store.create_execution(&record),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn get_unknown_execution_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.get_execution("nope"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn update_execution_applies_the_mutator_transactionally() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .create_execution(&make_record("exec-1", "run-1", ExecutionStatus::Running))
            .unwrap();

        let completed = Utc::now();
        let updated = store
            .update_execution("exec-1", |record| {
                record.status = ExecutionStatus::Succeeded;
                record.completed_at = Some(completed);
                record.duration_ms = Some(42);
                record.result_payload = Some(b"{\"result\":\"ok\"}".to_vec());
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.status, ExecutionStatus::Succeeded);

        let loaded = store.get_execution("exec-1").unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Succeeded);
        assert_eq!(loaded.duration_ms, Some(42));
        assert_eq!(loaded.result_payload, Some(b"{\"result\":\"ok\"}".to_vec()));
    }

    #[test]
    fn update_mutator_error_leaves_the_row_unchanged() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .create_execution(&make_record("exec-1", "run-1", ExecutionStatus::Running))
            .unwrap();

        let result = store.update_execution("exec-1", |_record| {
            Err(StoreError::Validation("refused".to_owned()))
        });
        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert_eq!(
            store.get_execution("exec-1").unwrap().status,
            ExecutionStatus::Running
        );
    }

    #[test]
    fn query_filters_by_run_and_status() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .create_execution(&make_record("exec-1", "run-1", ExecutionStatus::Succeeded))
            .unwrap();
        store
            .create_execution(&make_record("exec-2", "run-1", ExecutionStatus::Failed))
            .unwrap();
        store
            .create_execution(&make_record("exec-3", "run-2", ExecutionStatus::Succeeded))
            .unwrap();

        let filter = ExecutionFilter {
            run_id: Some("run-1".to_owned()),
            status: Some(ExecutionStatus::Succeeded),
            ..Default::default()
        };
        let records = store.query_executions(&filter).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].execution_id, "exec-1");
        assert_eq!(store.count_executions(&filter).unwrap(), 1);
    }

    #[test]
    fn query_sorts_and_pages() {
        let mut store = Store::open_in_memory().unwrap();
        for i in 1..=5 {
            store
                .create_execution(&make_record(
                    &format!("exec-{i}"),
                    "run-1",
                    ExecutionStatus::Pending,
                ))
                .unwrap();
        }

        let filter = ExecutionFilter {
            sort: ExecutionSort::ExecutionId,
            sort_descending: true,
            limit: Some(2),
            offset: Some(1),
            ..Default::default()
        };
        let records = store.query_executions(&filter).unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.execution_id.as_str()).collect();
        assert_eq!(ids, vec!["exec-4", "exec-3"]);
    }

    #[test]
    fn stats_aggregate_counts_and_durations() {
        let mut store = Store::open_in_memory().unwrap();
        let mut done = make_record("exec-1", "run-1", ExecutionStatus::Succeeded);
        done.duration_ms = Some(100);
        store.create_execution(&done).unwrap();
        let mut slow = make_record("exec-2", "run-1", ExecutionStatus::Succeeded);
        slow.duration_ms = Some(300);
        store.create_execution(&slow).unwrap();
        store
            .create_execution(&make_record("exec-3", "run-1", ExecutionStatus::Running))
            .unwrap();

        let stats = store.execution_stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.avg_duration_ms, Some(200.0));
        assert_eq!(stats.max_duration_ms, Some(300));
    }
}
