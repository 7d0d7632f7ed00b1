use crate::buffer::OutputBuffer;
use crate::supervisor::Liveness;
use std::time::Duration;
use tokio::time::Instant;

/// Wait until `buffer` contains `needle` (literal, case-sensitive).
///
/// Returns `false` when `timeout` elapses first, or as soon as `liveness`
/// reports the process gone while the needle is still absent. Wakes on
/// buffer growth and liveness changes rather than polling on a timer.
pub async fn wait_for(
    buffer: &OutputBuffer,
    needle: &str,
    timeout: Duration,
    liveness: Option<&Liveness>,
) -> bool {
    let deadline = Instant::now() + timeout;
    let mut changes = buffer.subscribe();
    let mut liveness = liveness.cloned();

    loop {
        changes.borrow_and_update();
        if buffer.contains(needle) {
            return true;
        }
        if liveness.as_ref().is_some_and(|l| !l.is_running()) {
            tracing::debug!(needle, "process exited before marker appeared");
            return false;
        }

        tokio::select! {
            changed = changes.changed() => {
                // Every buffer handle keeps the sender alive, ours included.
                if changed.is_err() {
                    return buffer.contains(needle);
                }
            }
            _ = stopped(&mut liveness) => {}
            _ = tokio::time::sleep_until(deadline) => {
                return buffer.contains(needle);
            }
        }
    }
}

/// Resolves when the process is gone; never, if there is nothing to watch.
pub(crate) async fn stopped(liveness: &mut Option<Liveness>) {
    match liveness {
        Some(l) => l.stopped().await,
        None => std::future::pending().await,
    }
}
