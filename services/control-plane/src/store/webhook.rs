//! Webhook configuration rows: the global observability webhook (singleton)
//! and per-execution webhook registrations.

use super::{ts_from_sql, ts_to_sql, Store, StoreError};
use ap_protocol::WebhookConfig;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::BTreeMap;

/// Singleton row id for the global observability webhook.
pub const GLOBAL_WEBHOOK_ID: &str = "global";

/// A per-execution webhook registration, consumed by the external webhook
/// dispatcher collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionWebhook {
    pub execution_id: String,
    pub url: String,
    pub secret: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Store {
    pub fn get_webhook(&self) -> Result<Option<WebhookConfig>, StoreError> {
        let result = self
            .conn()
            .query_row(
                "SELECT url, secret, headers, enabled, created_at, updated_at \
                 FROM webhook_config WHERE id = ?1",
                params![GLOBAL_WEBHOOK_ID],
                map_webhook_row,
            )
            .optional()?;
        result.transpose()
    }

    /// Upsert the singleton webhook config.  An existing row keeps its
    /// original `created_at`.
    pub fn set_webhook(&mut self, config: &WebhookConfig) -> Result<WebhookConfig, StoreError> {
        validate_webhook_url(&config.url)?;
        let headers = serde_json::to_string(&config.headers)
            .map_err(|e| StoreError::Validation(format!("headers not serializable: {e}")))?;
        let existing_created_at = self.get_webhook()?.map(|cfg| cfg.created_at);
        let stored = WebhookConfig {
            created_at: existing_created_at.unwrap_or(config.created_at),
            ..config.clone()
        };
        self.with_retry(|store| {
            store.conn().execute(
                "INSERT INTO webhook_config (id, url, secret, headers, enabled, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT (id) DO UPDATE SET \
                     url = excluded.url, \
                     secret = excluded.secret, \
                     headers = excluded.headers, \
                     enabled = excluded.enabled, \
                     updated_at = excluded.updated_at",
                params![
                    GLOBAL_WEBHOOK_ID,
                    stored.url,
                    stored.secret,
                    headers,
                    stored.enabled,
                    ts_to_sql(stored.created_at),
                    ts_to_sql(stored.updated_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(stored)
    }

    /// Delete the singleton webhook config.  Returns true if a row existed.
    pub fn delete_webhook(&mut self) -> Result<bool, StoreError> {
        self.with_retry(|store| {
            let deleted = store.conn().execute(
                "DELETE FROM webhook_config WHERE id = ?1",
                params![GLOBAL_WEBHOOK_ID],
            )?;
            Ok(deleted > 0)
        })
    }

    pub fn register_execution_webhook(
        &mut self,
        webhook: &ExecutionWebhook,
    ) -> Result<(), StoreError> {
        validate_webhook_url(&webhook.url)?;
        let headers = serde_json::to_string(&webhook.headers)
            .map_err(|e| StoreError::Validation(format!("headers not serializable: {e}")))?;
        self.with_retry(|store| {
            store.conn().execute(
                "INSERT INTO execution_webhooks (execution_id, url, secret, headers, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (execution_id) DO UPDATE SET \
                     url = excluded.url, \
                     secret = excluded.secret, \
                     headers = excluded.headers",
                params![
                    webhook.execution_id,
                    webhook.url,
                    webhook.secret,
                    headers,
                    ts_to_sql(webhook.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn has_execution_webhook(&self, execution_id: &str) -> Result<bool, StoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM execution_webhooks WHERE execution_id = ?1",
            params![execution_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

// ---------------------------------------------------------------------------
// Validation and row mapping
// ---------------------------------------------------------------------------

fn validate_webhook_url(url: &str) -> Result<(), StoreError> {
    if url.is_empty() {
        return Err(StoreError::Validation("webhook url must not be empty".to_owned()));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(StoreError::Validation(
            "webhook url scheme must be http or https".to_owned(),
        ));
    }
    Ok(())
}

fn map_webhook_row(row: &Row<'_>) -> Result<Result<WebhookConfig, StoreError>, rusqlite::Error> {
    let headers_text: String = row.get(2)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok((|| {
        Ok(WebhookConfig {
            url: row.get(0).map_err(StoreError::from)?,
            secret: row.get(1).map_err(StoreError::from)?,
            headers: serde_json::from_str(&headers_text)
                .map_err(|e| StoreError::Corrupt(format!("bad webhook headers: {e}")))?,
            enabled: row.get(3).map_err(StoreError::from)?,
            created_at: ts_from_sql(&created_at)?,
            updated_at: ts_from_sql(&updated_at)?,
        })
    })())
}
