//! Helpers for the `watch::Receiver<bool>` shutdown signal used by every background task.

use tokio::sync::watch;

/// Resolve once the shutdown flag is set to `true`.
///
/// If the sender is dropped without ever signalling, this never resolves:
/// a dropped sender means nobody can request shutdown any more.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Non-blocking check of the shutdown flag.
pub fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}
