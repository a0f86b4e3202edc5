use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event::EpochMillis;
use super::guard::TableName;
use super::store::{EventStore, StoreError};

/// Deletes records whose `expires_at` has passed, since the mysql backend has
/// no native ttl.
pub async fn run_purge_loop<S: EventStore>(
    store: Arc<S>,
    table: TableName,
    every: Duration,
    batch_size: u32,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(every.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "purge loop started: table={}, interval={:?}, batch_size={}",
        table, every, batch_size
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("purge loop stopping");
                break;
            }
            _ = ticker.tick() => {
                match purge_once(store.as_ref(), &table, EpochMillis::now(), batch_size, &shutdown).await {
                    Ok(0) => debug!("purge pass: table={table}, removed=0"),
                    Ok(removed) => info!("purge pass: table={table}, removed={removed}"),
                    Err(err) => warn!("purge pass failed: table={table}, error={err}"),
                }
            }
        }
    }
}

/// Purges in chunks of `batch_size` until a chunk comes back short.
pub async fn purge_once<S: EventStore>(
    store: &S,
    table: &TableName,
    now: EpochMillis,
    batch_size: u32,
    shutdown: &CancellationToken,
) -> Result<u64, StoreError> {
    let batch_size = batch_size.max(1);
    let mut total = 0_u64;

    loop {
        let removed = store.purge_expired(table, now, batch_size).await?;
        total += removed;
        if removed < u64::from(batch_size) || shutdown.is_cancelled() {
            return Ok(total);
        }
    }
}
