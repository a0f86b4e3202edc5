use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Waits for SIGTERM or SIGINT (ctrl-c elsewhere) and cancels `token`.
///
/// Returns immediately if the token is cancelled by someone else first.
pub async fn listen_shutdown(token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        signal = wait_for_signal() => {
            warn!("shutdown signal received: {signal}");
            token.cancel();
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(err), _) | (_, Err(err)) => {
            warn!("failed to install unix signal handlers: error={err}");
            return ctrl_c().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: error={err}");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    use super::listen_shutdown;

    #[tokio::test]
    async fn returns_when_token_cancelled_elsewhere() {
        let token = CancellationToken::new();
        let join = tokio::spawn(listen_shutdown(token.clone()));

        token.cancel();
        let finished = timeout(Duration::from_secs(2), join).await;
        assert!(finished.is_ok());
    }
}
