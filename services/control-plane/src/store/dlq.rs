//! Dead-letter queue rows.
//!
//! Appended by the observability forwarder when webhook delivery exhausts
//! all retries; consumed (and deleted) by redrive, oldest first.

use super::{ts_from_sql, ts_to_sql, Store, StoreError};
use ap_protocol::{DeadLetterEntry, EventSource, ObservabilityEvent};
use chrono::Utc;
use rusqlite::{params, Row};

impl Store {
    /// Append one failed event to the dead-letter queue.
    pub fn add_to_dlq(
        &mut self,
        event: &ObservabilityEvent,
        error_message: &str,
        retry_count: i64,
    ) -> Result<i64, StoreError> {
        let payload = event.data.to_string();
        self.with_retry(|store| {
            store.conn().execute(
                "INSERT INTO dead_letters \
                     (event_type, event_source, event_timestamp, payload, error_message, \
                      retry_count, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.event_type,
                    event.event_source.as_str(),
                    ts_to_sql(event.timestamp),
                    payload,
                    error_message,
                    retry_count,
                    ts_to_sql(Utc::now()),
                ],
            )?;
            Ok(store.conn().last_insert_rowid())
        })
    }

    pub fn count_dlq(&self) -> Result<i64, StoreError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
        Ok(count)
    }

    /// List entries oldest-first for FIFO redrive.
    pub fn list_dlq(&self, limit: i64, offset: i64) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT id, event_type, event_source, event_timestamp, payload, error_message, \
                    retry_count, created_at \
             FROM dead_letters ORDER BY created_at ASC, id ASC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], map_dlq_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row??);
        }
        Ok(entries)
    }

    /// Delete the given entries.  Returns the number of rows removed.
    pub fn delete_dlq(&mut self, ids: &[i64]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        self.with_retry(|store| {
            let deleted = store.conn().execute(
                &format!("DELETE FROM dead_letters WHERE id IN ({placeholders})"),
                rusqlite::params_from_iter(ids.iter()),
            )?;
            Ok(deleted)
        })
    }

    /// Delete every entry.  Returns the number of rows removed.
    pub fn clear_dlq(&mut self) -> Result<usize, StoreError> {
        self.with_retry(|store| {
            let deleted = store.conn().execute("DELETE FROM dead_letters", [])?;
            Ok(deleted)
        })
    }
}

fn map_dlq_row(row: &Row<'_>) -> Result<Result<DeadLetterEntry, StoreError>, rusqlite::Error> {
    let source: String = row.get(2)?;
    let event_timestamp: String = row.get(3)?;
    let created_at: String = row.get(7)?;
    Ok((|| {
        Ok(DeadLetterEntry {
            id: row.get(0).map_err(StoreError::from)?,
            event_type: row.get(1).map_err(StoreError::from)?,
            event_source: EventSource::parse(&source)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown event source '{source}'")))?,
            event_timestamp: ts_from_sql(&event_timestamp)?,
            payload: row.get(4).map_err(StoreError::from)?,
            error_message: row.get(5).map_err(StoreError::from)?,
            retry_count: row.get(6).map_err(StoreError::from)?,
            created_at: ts_from_sql(&created_at)?,
        })
    })())
}
