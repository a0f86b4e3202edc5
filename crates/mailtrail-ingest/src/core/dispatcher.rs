use std::fmt;

use futures_util::StreamExt;
use futures_util::stream;
use mailtrail_proto::{BatchItemFailure, BatchResponse, QueueBatch, QueueMessage};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::envelope::{ParseError, parse_envelope};
use super::normalizer::{NormalizeError, normalize_raw};
use super::store::{EventStore, StoredEvent};
use super::writer::{RecordWriter, WriteError};

/// Pipeline step a message failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Parse,
    Normalize,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(match self {
            Self::Parse => "parse",
            Self::Normalize => "normalize",
            Self::Write => "write",
        })
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Write(#[from] WriteError),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Parse(_) => Stage::Parse,
            Self::Normalize(_) => Stage::Normalize,
            Self::Write(_) => Stage::Write,
        }
    }
}

/// Result of one message's pass through parse, normalize and write.
#[derive(Debug)]
pub struct MessageOutcome {
    pub queue_message_id: String,
    /// Email message id, known once the envelope parsed.
    pub message_id: Option<String>,
    pub result: Result<StoredEvent, PipelineError>,
}

impl MessageOutcome {
    pub fn is_written(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-message outcomes of one batch, in batch order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<MessageOutcome>,
}

impl BatchReport {
    pub fn written(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_written()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.written()
    }

    pub fn failures(&self) -> impl Iterator<Item = &MessageOutcome> {
        self.outcomes.iter().filter(|o| !o.is_written())
    }

    /// Email message ids of the failed messages, `-` where the body never
    /// parsed far enough to have one.
    pub fn failed_message_ids(&self) -> Vec<&str> {
        self.failures()
            .map(|o| o.message_id.as_deref().unwrap_or("-"))
            .collect()
    }

    /// Per-message failures never change the status code. They are only
    /// listed, and only when `report_item_failures` is set.
    pub fn to_response(
        &self,
        report_item_failures: bool,
    ) -> BatchResponse {
        let mut response = BatchResponse::ok();
        if report_item_failures {
            response.batch_item_failures = self
                .failures()
                .map(|o| BatchItemFailure {
                    item_identifier: o.queue_message_id.clone(),
                })
                .collect();
        }
        response
    }
}

/// Runs every message of a batch through the pipeline, isolating failures.
pub struct BatchDispatcher<S> {
    writer: RecordWriter<S>,
    concurrency: usize,
}

impl<S: EventStore> BatchDispatcher<S> {
    pub fn new(
        writer: RecordWriter<S>,
        concurrency: usize,
    ) -> Self {
        Self { writer, concurrency: concurrency.max(1) }
    }

    /// Attempts every message exactly once. Up to `concurrency` messages are
    /// in flight; outcomes keep batch order.
    pub async fn dispatch(
        &self,
        batch: &QueueBatch,
    ) -> BatchReport {
        let pending: Vec<_> = batch
            .records
            .iter()
            .enumerate()
            .map(|(index, message)| self.process(index, message))
            .collect();
        let outcomes: Vec<MessageOutcome> =
            stream::iter(pending).buffered(self.concurrency).collect().await;

        let report = BatchReport { outcomes };
        info!(
            "batch processed: table={}, received={}, written={}, failed={}",
            self.writer.table(),
            batch.len(),
            report.written(),
            report.failed()
        );
        if report.failed() > 0 {
            warn!(
                "batch dropped messages: table={}, message_ids={}",
                self.writer.table(),
                report.failed_message_ids().join(",")
            );
        }
        report
    }

    async fn process(
        &self,
        index: usize,
        message: &QueueMessage,
    ) -> MessageOutcome {
        let mut message_id = None;

        let result = async {
            let envelope = parse_envelope(&message.body)?;
            message_id = Some(envelope.detail.mail.message_id.clone());
            debug!(
                "message parsed: index={}, queue_message_id={}, envelope={}, event_type={}",
                index,
                message.message_id,
                envelope.kind.as_str(),
                envelope.detail.event_type
            );

            let record = normalize_raw(envelope.detail)?;
            let stored = self.writer.write(record).await?;
            Ok::<_, PipelineError>(stored)
        }
        .await;

        if let Err(err) = &result {
            error!(
                "message failed: stage={}, index={}, queue_message_id={}, message_id={}, error={}",
                err.stage(),
                index,
                message.message_id,
                message_id.as_deref().unwrap_or("-"),
                err
            );
        }

        MessageOutcome {
            queue_message_id: message.message_id.clone(),
            message_id,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use mailtrail_proto::{QueueBatch, QueueMessage};
    use serde_json::Value;

    use super::*;
    use crate::core::guard::TableName;
    use crate::core::normalizer::samples;
    use crate::core::store::memory::MemoryEventStore;

    fn dispatcher(
        store: &Arc<MemoryEventStore>,
        concurrency: usize,
    ) -> BatchDispatcher<MemoryEventStore> {
        let table = TableName::parse("email_events").unwrap();
        BatchDispatcher::new(RecordWriter::new(store.clone(), table), concurrency)
    }

    fn batch(bodies: &[String]) -> QueueBatch {
        QueueBatch::new(
            bodies
                .iter()
                .enumerate()
                .map(|(i, body)| QueueMessage::new(format!("q-{i}"), body.clone()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn unparseable_message_does_not_block_the_batch() {
        let store = Arc::new(MemoryEventStore::new());
        let batch = batch(&[samples::body("Send", "msg-send"), "{{not json".to_string()]);

        let report = dispatcher(&store, 1).dispatch(&batch).await;

        assert_eq!(store.len(), 1);
        assert_eq!(store.events()[0].message_id, "msg-send");
        assert_eq!(report.written(), 1);
        assert_eq!(report.failed(), 1);

        let failure = report.failures().next().unwrap();
        assert_eq!(failure.queue_message_id, "q-1");
        assert_eq!(failure.message_id, None);
        assert!(matches!(&failure.result, Err(e) if e.stage() == Stage::Parse));

        assert!(report.to_response(false).is_success());
    }

    #[tokio::test]
    async fn three_kinds_produce_three_independent_writes() {
        let store = Arc::new(MemoryEventStore::new());
        let batch = batch(&[
            samples::body("Bounce", "msg-a"),
            samples::body("Click", "msg-b"),
            samples::body("Delivery", "msg-c"),
        ]);

        let report = dispatcher(&store, 3).dispatch(&batch).await;
        assert_eq!(report.written(), 3);

        let events = store.events();
        assert_eq!(events.len(), 3);
        let keys: HashSet<(String, i64)> =
            events.iter().map(|e| (e.message_id.clone(), e.sent_at)).collect();
        assert_eq!(keys.len(), 3);

        for event in &events {
            let data: Value = serde_json::from_str(&event.additional_data).unwrap();
            match event.message_id.as_str() {
                "msg-a" => {
                    assert_eq!(event.event_type, "Bounce");
                    assert_eq!(data["bounceType"], "Permanent");
                    assert!(data.get("link").is_none());
                }
                "msg-b" => {
                    assert_eq!(event.event_type, "Click");
                    assert_eq!(data["link"], "https://example.com/offer");
                    assert!(data.get("bounceType").is_none());
                }
                "msg-c" => {
                    assert_eq!(event.event_type, "Delivery");
                    assert_eq!(data["processingTimeMillis"], 546);
                    assert!(data.get("link").is_none());
                }
                other => panic!("unexpected record {other}"),
            }
        }
    }

    #[tokio::test]
    async fn every_kind_gets_ninety_day_ttl() {
        let store = Arc::new(MemoryEventStore::new());
        let bodies: Vec<String> = crate::core::event::EventType::ALL
            .iter()
            .map(|kind| samples::body(kind.as_str(), &format!("msg-{kind}")))
            .collect();

        let report = dispatcher(&store, 4).dispatch(&batch(&bodies)).await;
        assert_eq!(report.written(), 10);

        for event in store.events() {
            assert_eq!(event.expires_at - event.created_at, 90 * 24 * 60 * 60 * 1000);
        }
    }

    #[tokio::test]
    async fn delivery_is_keyed_by_delivery_timestamp() {
        let store = Arc::new(MemoryEventStore::new());
        dispatcher(&store, 1)
            .dispatch(&batch(&[samples::body("Delivery", "msg-d")]))
            .await;

        let event = &store.events()[0];
        assert_eq!(event.sent_at, samples::EVENT_TS_MILLIS);
        assert_ne!(event.sent_at, samples::MAIL_TS_MILLIS);
    }

    #[tokio::test]
    async fn store_and_normalize_failures_are_isolated_and_reported() {
        let store = Arc::new(MemoryEventStore::new());
        store.fail_message_id("msg-throttled");
        let batch = batch(&[
            samples::body("Open", "msg-throttled"),
            r#"{"eventType":"Unsubscribe","mail":{"messageId":"msg-unknown"}}"#.to_string(),
            samples::body("Send", "msg-ok"),
        ]);

        let report = dispatcher(&store, 2).dispatch(&batch).await;

        assert_eq!(store.len(), 1);
        assert_eq!(store.events()[0].message_id, "msg-ok");

        let stages: Vec<(String, Option<String>, Stage)> = report
            .failures()
            .map(|o| {
                let stage = o.result.as_ref().map(|_| ()).unwrap_err().stage();
                (o.queue_message_id.clone(), o.message_id.clone(), stage)
            })
            .collect();
        assert_eq!(
            stages,
            vec![
                ("q-0".to_string(), Some("msg-throttled".to_string()), Stage::Write),
                ("q-1".to_string(), Some("msg-unknown".to_string()), Stage::Normalize),
            ]
        );

        let silent = report.to_response(false);
        assert_eq!(silent.status_code, 200);
        assert!(silent.batch_item_failures.is_empty());

        let listed = report.to_response(true);
        assert_eq!(listed.status_code, 200);
        let ids: Vec<&str> = listed
            .batch_item_failures
            .iter()
            .map(|f| f.item_identifier.as_str())
            .collect();
        assert_eq!(ids, vec!["q-0", "q-1"]);
    }

    #[tokio::test]
    async fn failed_message_ids_name_the_dropped_mail() {
        let store = Arc::new(MemoryEventStore::new());
        store.fail_message_id("msg-lost");
        let batch = batch(&[
            samples::body("Click", "msg-lost"),
            "garbage".to_string(),
            samples::body("Delivery", "msg-kept"),
        ]);

        let report = dispatcher(&store, 3).dispatch(&batch).await;

        assert_eq!(report.failed_message_ids(), vec!["msg-lost", "-"]);
    }

    #[tokio::test]
    async fn outcomes_keep_batch_order_under_concurrency() {
        let store = Arc::new(MemoryEventStore::new());
        let bodies: Vec<String> =
            (0..12).map(|i| samples::body("Send", &format!("msg-{i}"))).collect();

        let report = dispatcher(&store, 5).dispatch(&batch(&bodies)).await;

        let order: Vec<String> =
            report.outcomes.iter().map(|o| o.queue_message_id.clone()).collect();
        let expected: Vec<String> = (0..12).map(|i| format!("q-{i}")).collect();
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn redelivered_notification_is_written_again() {
        let store = Arc::new(MemoryEventStore::new());
        let body = samples::body("Bounce", "msg-dup");

        let report = dispatcher(&store, 1)
            .dispatch(&batch(&[body.clone(), body]))
            .await;

        assert_eq!(report.written(), 2);
        assert_eq!(store.len(), 1);
    }
}
