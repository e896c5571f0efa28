use std::path::Path;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::{Client, GenericClient, NoTls};
use tracing::{debug, error, info};

use crate::error::{EtlError, Result};
use crate::store::{CursorUpdate, EventStore, IngestedEvent, InsertOutcome};

/// Built-in bootstrap script, used unless `postgres.schema` points elsewhere.
pub const INIT_SQL: &str = include_str!("../init.sql");

const INSERT_EVENT: &str = r#"
    INSERT INTO onchain_events (
        contract_name,
        contract_address,
        event_name,
        tx_hash,
        block_number,
        log_index,
        payload
    ) VALUES ($1, $2, $3, $4, $5, $6, $7::jsonb)
    ON CONFLICT ON CONSTRAINT uq_onchain_events_tx_logindex DO NOTHING
"#;

const UPSERT_CURSOR: &str = r#"
    INSERT INTO ingestion_cursors (name, block_number, updated_at)
    VALUES ($1, $2, NOW())
    ON CONFLICT (name) DO UPDATE
        SET block_number = EXCLUDED.block_number,
            updated_at = NOW()
"#;

const SELECT_CURSOR: &str = "SELECT block_number FROM ingestion_cursors WHERE name = $1";

/// Postgres-backed [`EventStore`] over a single connection.
pub struct PgEventStore {
    client: Mutex<Client>,
}

impl PgEventStore {
    pub async fn connect(dsn: &str, statement_timeout_secs: u64) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(dsn, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Postgres connection error: {:?}", e);
            }
        });

        client.execute("SELECT 1", &[]).await?;
        if statement_timeout_secs > 0 {
            client
                .batch_execute(&format!(
                    "SET statement_timeout = {}",
                    statement_timeout_secs.saturating_mul(1000)
                ))
                .await?;
        }

        info!("PostgreSQL connection ready");
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Runs the bootstrap script, or the script at `override_path`.
    pub async fn ensure_schema(&self, override_path: Option<&Path>) -> Result<()> {
        let script = match override_path {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                EtlError::Config(format!("schema script {}: {e}", path.display()))
            })?,
            None => INIT_SQL.to_string(),
        };

        self.client.lock().await.batch_execute(&script).await?;
        info!(
            script = %override_path.map(|p| p.display().to_string()).unwrap_or_else(|| "built-in".into()),
            "Schema ready"
        );
        Ok(())
    }
}

/// Column values that don't fit the table types are row failures, not
/// store failures.
fn row_params(event: &IngestedEvent) -> std::result::Result<(i64, i32), String> {
    let block_number = i64::try_from(event.block_number)
        .map_err(|_| format!("block_number {} exceeds BIGINT", event.block_number))?;
    let log_index = i32::try_from(event.log_index)
        .map_err(|_| format!("log_index {} exceeds INTEGER", event.log_index))?;
    Ok((block_number, log_index))
}

async fn insert_row<C>(client: &C, event: &IngestedEvent) -> Result<InsertOutcome>
where
    C: GenericClient + Sync,
{
    let (block_number, log_index) = match row_params(event) {
        Ok(params) => params,
        Err(reason) => return Ok(InsertOutcome::Failed(reason)),
    };

    let result = client
        .execute(
            INSERT_EVENT,
            &[
                &event.contract_name,
                &event.contract_address,
                &event.event_name,
                &event.tx_hash,
                &block_number,
                &log_index,
                &event.payload,
            ],
        )
        .await;

    match result {
        Ok(0) => Ok(InsertOutcome::Duplicate),
        Ok(_) => Ok(InsertOutcome::Inserted),
        // The server refused this row; the connection is still usable
        Err(e) if e.as_db_error().is_some() => Ok(InsertOutcome::Failed(e.to_string())),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn commit_range(
        &self,
        events: &[IngestedEvent],
        cursor: Option<CursorUpdate>,
    ) -> Result<Vec<InsertOutcome>> {
        let mut client = self.client.lock().await;
        let mut tx = client.transaction().await?;

        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            // Savepoint per row so one rejected row leaves the rest intact
            let savepoint = tx.transaction().await?;
            let outcome = insert_row(&savepoint, event).await?;
            match outcome {
                InsertOutcome::Failed(_) => savepoint.rollback().await?,
                _ => savepoint.commit().await?,
            }
            outcomes.push(outcome);
        }

        if let Some(cursor) = cursor {
            let block_number = i64::try_from(cursor.block_number).map_err(|_| {
                EtlError::Config(format!("cursor {} out of range", cursor.block_number))
            })?;
            tx.execute(UPSERT_CURSOR, &[&cursor.name, &block_number]).await?;
            debug!(cursor = %cursor.name, block = cursor.block_number, "Cursor staged");
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    async fn load_cursor(&self, name: &str) -> Result<Option<u64>> {
        let client = self.client.lock().await;
        let row = client.query_opt(SELECT_CURSOR, &[&name]).await?;
        Ok(row
            .map(|r| r.get::<_, i64>(0))
            .and_then(|block| u64::try_from(block).ok()))
    }
}
