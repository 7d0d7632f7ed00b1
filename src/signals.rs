/// Signal handling for graceful shutdown.
///
/// First SIGINT or SIGTERM: stop waiting and tear the remote processes down.
/// Second SIGINT: exit immediately, leaving cleanup to `kill_on_drop`.
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

/// Exit status used when a second interrupt cuts teardown short.
const FORCED_EXIT_CODE: i32 = 130;

/// Install the handlers. The returned receiver flips to `true` once.
pub fn install() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(error = %e, "could not install SIGTERM handler");
                None
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupt received, tearing down (press Ctrl-C again to force)");
            }
            _ = async {
                match terminate.as_mut() {
                    Some(s) => { s.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                tracing::warn!("SIGTERM received, tearing down");
            }
        }
        tx.send_replace(true);

        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::error!("second interrupt, exiting without cleanup");
            std::process::exit(FORCED_EXIT_CODE);
        }
    });
    rx
}

/// Resolves once shutdown was requested; never if there is no receiver.
pub async fn requested(shutdown: Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(mut rx) => {
            let outcome = rx.wait_for(|flag| *flag).await.map(|_| ());
            if outcome.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}
