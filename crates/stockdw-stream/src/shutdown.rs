//! Cooperative shutdown for the polling loops.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Sender side handed to the host process; `true` requests shutdown.
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

pub(crate) fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Sleeps for `duration` unless shutdown is requested first; returns `true` on shutdown.
///
/// A dropped sender never requests shutdown.
pub(crate) async fn sleep_or_shutdown(
    shutdown: &mut watch::Receiver<bool>,
    duration: Duration,
) -> bool {
    if is_shutdown(shutdown) {
        return true;
    }
    let deadline = Instant::now() + duration;
    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => return false,
            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow_and_update() => return true,
                Ok(()) => {}
                Err(_) => {
                    tokio::time::sleep_until(deadline).await;
                    return false;
                }
            },
        }
    }
}
