use std::sync::Arc;

use mailtrail_proto::{BatchResponse, QueueBatch};
use tracing::error;

use super::dispatcher::{BatchDispatcher, BatchReport};
use super::guard::{ConfigError, TableName, require_table_name};
use super::store::EventStore;
use super::writer::RecordWriter;

/// Operating parameters of an invocation.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub table_name: Option<String>,
    pub concurrency: usize,
    pub report_batch_item_failures: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self { table_name: None, concurrency: 8, report_batch_item_failures: false }
    }
}

/// One invocation entry point: guard, then dispatch the whole batch.
pub struct Pipeline<S> {
    store: Arc<S>,
    settings: PipelineSettings,
}

impl<S: EventStore> Pipeline<S> {
    pub fn new(
        store: Arc<S>,
        settings: PipelineSettings,
    ) -> Self {
        Self { store, settings }
    }

    /// Fails only when the guard rejects the configuration, in which case no
    /// message is touched. Otherwise the response is always a success.
    pub async fn invoke(
        &self,
        batch: &QueueBatch,
    ) -> Result<BatchResponse, ConfigError> {
        let report = self.invoke_with_report(batch).await?;
        Ok(report.to_response(self.settings.report_batch_item_failures))
    }

    pub async fn invoke_with_report(
        &self,
        batch: &QueueBatch,
    ) -> Result<BatchReport, ConfigError> {
        let table = self.guard(batch)?;
        let writer = RecordWriter::new(self.store.clone(), table);
        let dispatcher = BatchDispatcher::new(writer, self.settings.concurrency);
        Ok(dispatcher.dispatch(batch).await)
    }

    /// The guard on its own, for callers that want to fail before reading a
    /// batch at all.
    pub fn check_config(&self) -> Result<TableName, ConfigError> {
        require_table_name(self.settings.table_name.as_deref())
    }

    fn guard(
        &self,
        batch: &QueueBatch,
    ) -> Result<TableName, ConfigError> {
        self.check_config().inspect_err(|err| {
            error!(
                "invocation rejected: messages={}, error={}",
                batch.len(),
                err
            );
        })
    }
}
