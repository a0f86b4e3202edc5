mod app;
mod args;
mod config;
mod core;
mod invoke;

use std::sync::Arc;

use anyhow::{Context, Result};
use app::AppState;
use args::{IngestArgs, Mode};
use config::Config;
use mailtrail_helpers::{logging, shutdown};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::{
    Database, Pipeline, TableName, require_table_name, run_purge_loop,
    run_tcp_server,
};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    logging::init_logging(
        "mailtrail_ingest=info,sqlx=warn,tokio=warn",
        "MAILTRAIL_LOG",
        "mailtrail-ingest",
    );

    let args = IngestArgs::parse(std::env::args().skip(1))?;
    let config =
        Config::load(args.config_path).context("failed to load configuration")?;
    let table = require_table_name(config.table_name.as_deref())
        .context("refusing to start")?;

    let db = Arc::new(
        Database::connect(&config.database_url, config.max_connections)
            .await
            .context("failed to connect database")?,
    );

    if config.create_table {
        db.ensure_table(&table).await?;
    }

    let pipeline = Arc::new(Pipeline::new(db.clone(), config.pipeline_settings()));

    match args.mode {
        Mode::Invoke(source) => {
            let response =
                invoke::run_invocation(&pipeline, &source, config.max_batch_bytes)
                    .await?;
            info!(
                "invocation finished: status={}, item_failures={}",
                response.status_code,
                response.batch_item_failures.len()
            );
            Ok(())
        }
        Mode::Serve => serve(config, table, db, pipeline).await,
    }
}

async fn serve(
    config: Config,
    table: TableName,
    db: Arc<Database>,
    pipeline: Arc<Pipeline<Database>>,
) -> Result<()> {
    let state = AppState {
        pipeline,
        max_batch_bytes: config.max_batch_bytes,
        shutdown: CancellationToken::new(),
    };

    info!(
        "server starting: listen={}, table={}, concurrency={}, report_batch_item_failures={}",
        config.listen, table, config.concurrency, config.report_batch_item_failures
    );

    tokio::spawn(shutdown::listen_shutdown(state.shutdown.clone()));
    if config.purge.enabled {
        tokio::spawn(run_purge_loop(
            db,
            table,
            config.purge.interval,
            config.purge.batch_size,
            state.shutdown.clone(),
        ));
    } else {
        info!("purge loop disabled");
    }

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;

    run_tcp_server(listener, state).await
}
