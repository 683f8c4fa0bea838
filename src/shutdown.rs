use tokio_util::sync::CancellationToken;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

/// Returns a token that is cancelled on Ctrl-C (and SIGTERM on Unix).
///
/// Must be called from inside a tokio runtime.
pub fn install_interrupt_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_interrupt().await;
        trigger.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_interrupt() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            log_error!("failed to listen for SIGTERM: {err}");
            return wait_for_ctrl_c().await;
        }
    };

    tokio::select! {
        _ = wait_for_ctrl_c() => {}
        _ = terminate.recv() => log_info!("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_interrupt() {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log_info!("interrupt received"),
        Err(err) => {
            // Without a handler the default disposition still kills us.
            log_error!("failed to listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    }
}
