mod database;
mod dispatcher;
mod envelope;
mod event;
mod guard;
mod janitor;
pub(crate) mod normalizer;
mod pipeline;
mod server;
pub(crate) mod store;
mod writer;

pub use database::Database;
pub use guard::{TableName, require_table_name};
pub use janitor::run_purge_loop;
pub use pipeline::{Pipeline, PipelineSettings};
pub use server::run_tcp_server;
pub use store::EventStore;
