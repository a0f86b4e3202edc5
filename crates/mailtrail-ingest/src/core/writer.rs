use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use super::event::EpochMillis;
use super::guard::TableName;
use super::normalizer::EventRecord;
use super::store::{EventStore, StoreError, StoredEvent};

/// Every record expires this long after it was written.
pub const RETENTION: Duration = Duration::from_secs(90 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to serialize additional data: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("store rejected write: table={table}, message_id={message_id}, sent_at={sent_at}: {source}")]
    Store {
        table: TableName,
        message_id: String,
        sent_at: i64,
        #[source]
        source: StoreError,
    },
}

/// Stamps records with creation and expiry times and issues one put each.
pub struct RecordWriter<S> {
    store: Arc<S>,
    table: TableName,
}

impl<S: EventStore> RecordWriter<S> {
    pub fn new(
        store: Arc<S>,
        table: TableName,
    ) -> Self {
        Self { store, table }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub async fn write(
        &self,
        record: EventRecord,
    ) -> Result<StoredEvent, WriteError> {
        self.write_at(record, EpochMillis::now()).await
    }

    pub async fn write_at(
        &self,
        record: EventRecord,
        created_at: EpochMillis,
    ) -> Result<StoredEvent, WriteError> {
        let stored = stamp(record, created_at)?;

        self.store.put(&self.table, &stored).await.map_err(|source| {
            WriteError::Store {
                table: self.table.clone(),
                message_id: stored.message_id.clone(),
                sent_at: stored.sent_at,
                source,
            }
        })?;

        debug!(
            "record written: table={}, message_id={}, event_type={}, sent_at={}",
            self.table, stored.message_id, stored.event_type, stored.sent_at
        );
        Ok(stored)
    }
}

fn stamp(
    record: EventRecord,
    created_at: EpochMillis,
) -> Result<StoredEvent, WriteError> {
    let additional_data = serde_json::to_string(&record.additional_data)
        .map_err(WriteError::Serialize)?;

    Ok(StoredEvent {
        message_id: record.message_id,
        sent_at: record.sent_at.as_millis(),
        event_type: record.event_type.as_str(),
        from: record.from,
        to: record.to.into_iter().collect(),
        subject: record.subject,
        additional_data,
        created_at: created_at.as_millis(),
        expires_at: created_at.saturating_add(RETENTION).as_millis(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::*;
    use crate::core::event::EventType;
    use crate::core::normalizer::{AdditionalData, RejectData};
    use crate::core::store::memory::MemoryEventStore;

    const NINETY_DAYS_MS: i64 = 90 * 24 * 60 * 60 * 1000;

    fn record(message_id: &str) -> EventRecord {
        EventRecord {
            message_id: message_id.to_string(),
            event_type: EventType::Reject,
            from: "sender@example.com".to_string(),
            to: BTreeSet::from(["b@example.net".to_string(), "a@example.net".to_string()]),
            subject: String::new(),
            sent_at: EpochMillis::from_millis(1_000),
            additional_data: AdditionalData::Reject(RejectData {
                reason: Some("Bad content".to_string()),
            }),
        }
    }

    fn writer(store: &Arc<MemoryEventStore>) -> RecordWriter<MemoryEventStore> {
        RecordWriter::new(store.clone(), TableName::parse("email_events").unwrap())
    }

    #[tokio::test]
    async fn stamps_ttl_and_serializes_additional_data_once() {
        let store = Arc::new(MemoryEventStore::new());
        let created_at = EpochMillis::from_millis(1_700_000_000_000);

        let stored = writer(&store).write_at(record("m-1"), created_at).await.unwrap();

        assert_eq!(stored.created_at, 1_700_000_000_000);
        assert_eq!(stored.expires_at - stored.created_at, NINETY_DAYS_MS);
        assert_eq!(stored.sent_at, 1_000);
        assert_eq!(stored.event_type, "Reject");
        assert_eq!(stored.to, vec!["a@example.net", "b@example.net"]);
        assert_eq!(stored.additional_data, r#"{"reason":"Bad content"}"#);
        assert_eq!(store.events(), vec![stored]);
        assert_eq!(store.tables(), vec!["email_events"]);
    }

    #[tokio::test]
    async fn created_at_is_the_write_time_not_sent_at() {
        let store = Arc::new(MemoryEventStore::new());
        let before = EpochMillis::now().as_millis();

        let stored = writer(&store).write(record("m-2")).await.unwrap();

        assert!(stored.created_at >= before);
        assert_ne!(stored.created_at, stored.sent_at);
        assert_eq!(stored.expires_at - stored.created_at, NINETY_DAYS_MS);
    }

    #[tokio::test]
    async fn store_failure_names_the_message() {
        let store = Arc::new(MemoryEventStore::new());
        store.fail_message_id("m-3");

        let err = writer(&store).write(record("m-3")).await.unwrap_err();

        assert!(matches!(&err, WriteError::Store { message_id, .. } if message_id == "m-3"));
        assert!(err.to_string().contains("message_id=m-3"));
        assert_eq!(store.len(), 0);
    }
}
