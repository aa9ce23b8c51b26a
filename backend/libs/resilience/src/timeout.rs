/// Time limits for single operations and for groups of background tasks
use futures::future::join_all;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum TimeoutError {
    #[error("Operation timed out after {0:?}")]
    Elapsed(Duration),
}

/// Execute a future with a time limit
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    timeout(duration, future)
        .await
        .map_err(|_| TimeoutError::Elapsed(duration))
}

/// Wait for every task to finish within `grace`.
///
/// Panicked tasks are logged and count as finished. On timeout the remaining
/// tasks are aborted so nothing keeps running behind the caller's back.
pub async fn join_within(
    grace: Duration,
    handles: Vec<(&'static str, JoinHandle<()>)>,
) -> Result<(), TimeoutError> {
    let aborts: Vec<_> = handles.iter().map(|(_, h)| h.abort_handle()).collect();

    let joined = join_all(handles.into_iter().map(|(name, handle)| async move {
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                warn!(task = name, error = %e, "Background task terminated abnormally");
            }
        }
    }));

    match timeout(grace, joined).await {
        Ok(_) => Ok(()),
        Err(_) => {
            for abort in aborts {
                abort.abort();
            }
            Err(TimeoutError::Elapsed(grace))
        }
    }
}
