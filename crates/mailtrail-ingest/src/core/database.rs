use anyhow::{Context, Result};
use sqlx::MySqlPool;
use sqlx::mysql::MySqlPoolOptions;
use tracing::{debug, info};

use super::event::EpochMillis;
use super::guard::TableName;
use super::store::{EventStore, StoreError, StoredEvent};

#[derive(Debug, Clone)]
pub struct Database {
    pool: MySqlPool,
}

impl Database {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("failed to open mysql pool")?;

        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&pool)
            .await
            .context("database ping failed")?;

        Ok(Self { pool })
    }

    /// Creates the event table when it does not exist yet.
    pub async fn ensure_table(
        &self,
        table: &TableName,
    ) -> Result<()> {
        sqlx::query(&create_table_sql(table))
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to create table {table}"))?;

        info!("event table ready: table={table}");
        Ok(())
    }
}

fn create_table_sql(table: &TableName) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS `{table}` (\
            message_id VARCHAR(255) NOT NULL, \
            sent_at BIGINT NOT NULL, \
            event_type VARCHAR(32) NOT NULL, \
            from_address VARCHAR(320) NOT NULL, \
            to_addresses JSON NOT NULL, \
            subject TEXT NOT NULL, \
            additional_data MEDIUMTEXT NOT NULL, \
            created_at BIGINT NOT NULL, \
            expires_at BIGINT NOT NULL, \
            PRIMARY KEY (message_id, sent_at), \
            KEY idx_expires_at (expires_at)\
        )"
    )
}

fn put_sql(table: &TableName) -> String {
    format!(
        "REPLACE INTO `{table}` (message_id, sent_at, event_type, from_address, to_addresses, subject, additional_data, created_at, expires_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
    )
}

fn purge_sql(table: &TableName) -> String {
    format!("DELETE FROM `{table}` WHERE expires_at <= ? ORDER BY expires_at LIMIT ?")
}

impl EventStore for Database {
    async fn put(
        &self,
        table: &TableName,
        event: &StoredEvent,
    ) -> Result<(), StoreError> {
        let to_addresses = serde_json::to_string(&event.to).map_err(|source| {
            StoreError::Encode { column: "to_addresses", source }
        })?;

        let result = sqlx::query(&put_sql(table))
            .bind(&event.message_id)
            .bind(event.sent_at)
            .bind(event.event_type)
            .bind(&event.from)
            .bind(to_addresses)
            .bind(&event.subject)
            .bind(&event.additional_data)
            .bind(event.created_at)
            .bind(event.expires_at)
            .execute(&self.pool)
            .await?;

        debug!(
            "db put: table={}, message_id={}, sent_at={}, rows_affected={}",
            table,
            event.message_id,
            event.sent_at,
            result.rows_affected()
        );
        Ok(())
    }

    async fn purge_expired(
        &self,
        table: &TableName,
        now: EpochMillis,
        limit: u32,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(&purge_sql(table))
            .bind(now.as_millis())
            .bind(limit)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
