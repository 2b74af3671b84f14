//! Agent node table operations.
//!
//! Registration is an idempotent upsert; heartbeat/health/lifecycle columns
//! are updated independently by the status manager and heartbeat handler.

use super::{ts_from_sql, ts_to_sql, Store, StoreError};
use ap_protocol::{AgentNode, CapabilityDescriptor, HealthStatus, LifecycleStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

const AGENT_COLUMNS: &str =
    "node_id, team_id, base_url, version, last_heartbeat, health_status, lifecycle_status, \
     reasoners, skills";

impl Store {
    /// Register (or re-register) an agent node.
    pub fn register_agent(&mut self, node: &AgentNode) -> Result<(), StoreError> {
        if node.node_id.is_empty() {
            return Err(StoreError::Validation("node_id must not be empty".to_owned()));
        }
        if node.base_url.is_empty() {
            return Err(StoreError::Validation("base_url must not be empty".to_owned()));
        }
        let reasoners = encode_capabilities(&node.reasoners)?;
        let skills = encode_capabilities(&node.skills)?;
        self.with_retry(|store| {
            store.conn().execute(
                "INSERT INTO agents (node_id, team_id, base_url, version, last_heartbeat, \
                                     health_status, lifecycle_status, reasoners, skills) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT (node_id) DO UPDATE SET \
                     team_id = excluded.team_id, \
                     base_url = excluded.base_url, \
                     version = excluded.version, \
                     last_heartbeat = excluded.last_heartbeat, \
                     health_status = excluded.health_status, \
                     lifecycle_status = excluded.lifecycle_status, \
                     reasoners = excluded.reasoners, \
                     skills = excluded.skills",
                params![
                    node.node_id,
                    node.team_id,
                    node.base_url,
                    node.version,
                    ts_to_sql(node.last_heartbeat),
                    node.health_status.as_str(),
                    node.lifecycle_status.as_str(),
                    reasoners,
                    skills,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_agent(&self, node_id: &str) -> Result<AgentNode, StoreError> {
        let result = self.conn().query_row(
            &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE node_id = ?1"),
            params![node_id],
            map_agent_row,
        );
        match result {
            Ok(node) => node,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(StoreError::NotFound(format!("agent node '{node_id}'")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_agents(&self, team_id: Option<&str>) -> Result<Vec<AgentNode>, StoreError> {
        let (sql, params): (String, Vec<String>) = match team_id {
            Some(team) => (
                format!("SELECT {AGENT_COLUMNS} FROM agents WHERE team_id = ?1 ORDER BY node_id"),
                vec![team.to_owned()],
            ),
            None => (
                format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY node_id"),
                Vec::new(),
            ),
        };
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), map_agent_row)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row??);
        }
        Ok(nodes)
    }

    pub fn update_agent_heartbeat(
        &mut self,
        node_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_retry(|store| {
            let changed = store.conn().execute(
                "UPDATE agents SET last_heartbeat = ?2 WHERE node_id = ?1",
                params![node_id, ts_to_sql(at)],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("agent node '{node_id}'")));
            }
            Ok(())
        })
    }

    pub fn update_agent_health(
        &mut self,
        node_id: &str,
        health: HealthStatus,
    ) -> Result<(), StoreError> {
        self.with_retry(|store| {
            let changed = store.conn().execute(
                "UPDATE agents SET health_status = ?2 WHERE node_id = ?1",
                params![node_id, health.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("agent node '{node_id}'")));
            }
            Ok(())
        })
    }

    pub fn update_agent_lifecycle_status(
        &mut self,
        node_id: &str,
        lifecycle: LifecycleStatus,
    ) -> Result<(), StoreError> {
        self.with_retry(|store| {
            let changed = store.conn().execute(
                "UPDATE agents SET lifecycle_status = ?2 WHERE node_id = ?1",
                params![node_id, lifecycle.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("agent node '{node_id}'")));
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn encode_capabilities(caps: &[CapabilityDescriptor]) -> Result<String, StoreError> {
    serde_json::to_string(caps)
        .map_err(|e| StoreError::Validation(format!("capability descriptors not serializable: {e}")))
}

fn decode_capabilities(text: &str) -> Result<Vec<CapabilityDescriptor>, StoreError> {
    serde_json::from_str(text)
        .map_err(|e| StoreError::Corrupt(format!("bad capability descriptors: {e}")))
}

fn map_agent_row(row: &Row<'_>) -> Result<Result<AgentNode, StoreError>, rusqlite::Error> {
    let last_heartbeat: String = row.get(4)?;
    let health: String = row.get(5)?;
    let lifecycle: String = row.get(6)?;
    let reasoners: String = row.get(7)?;
    let skills: String = row.get(8)?;
    Ok((|| {
        Ok(AgentNode {
            node_id: row.get(0).map_err(StoreError::from)?,
            team_id: row.get(1).map_err(StoreError::from)?,
            base_url: row.get(2).map_err(StoreError::from)?,
            version: row.get(3).map_err(StoreError::from)?,
            last_heartbeat: ts_from_sql(&last_heartbeat)?,
            health_status: HealthStatus::parse(&health)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown health status '{health}'")))?,
            lifecycle_status: LifecycleStatus::parse(&lifecycle).ok_or_else(|| {
                StoreError::Corrupt(format!("unknown lifecycle status '{lifecycle}'"))
            })?,
            reasoners: decode_capabilities(&reasoners)?,
            skills: decode_capabilities(&skills)?,
        })
    })())
}
