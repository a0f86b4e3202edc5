use std::future::Future;

use serde::Serialize;
use thiserror::Error;

use super::event::EpochMillis;
use super::guard::TableName;

/// The persisted item, one per successfully processed notification.
///
/// Keyed by (`message_id`, `sent_at`); `expires_at` is the ttl bound the
/// janitor purges on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub message_id: String,
    pub sent_at: i64,
    pub event_type: &'static str,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub additional_data: String,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode column `{column}`: {source}")]
    Encode {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable keyed store the pipeline writes into.
///
/// Writes are independent puts; a second put with the same key replaces the
/// first. No operation spans more than one record.
pub trait EventStore: Send + Sync + 'static {
    fn put(
        &self,
        table: &TableName,
        event: &StoredEvent,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Deletes up to `limit` records with `expires_at <= now`, returning the
    /// number removed.
    fn purge_expired(
        &self,
        table: &TableName,
        now: EpochMillis,
        limit: u32,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;
}
