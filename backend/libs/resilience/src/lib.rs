/// Resilience primitives shared by the pipeline services
///
/// This library provides:
/// - **Retry**: bounded exponential backoff with jitter, driven by an error classifier
/// - **Timeout**: time limits on single operations and on groups of background tasks
/// - **Shutdown**: helpers around the `watch::Receiver<bool>` cancellation signal
///
/// # Example: retrying a flaky call
///
/// ```rust,no_run
/// use resilience::{ErrorClass, RetryExecutor, RetryPolicy};
/// use tokio::sync::watch;
///
/// #[tokio::main]
/// async fn main() {
///     let (_tx, mut shutdown) = watch::channel(false);
///     let executor = RetryExecutor::new(RetryPolicy::default());
///
///     let result = executor
///         .execute(
///             || async { Ok::<_, String>(()) },
///             |_err: &String| ErrorClass::Transient,
///             &mut shutdown,
///         )
///         .await;
///     assert!(result.is_ok());
/// }
/// ```

pub mod class;
pub mod retry;
pub mod shutdown;
pub mod timeout;

// Re-export main types for convenience
pub use class::ErrorClass;
pub use retry::{RetryError, RetryExecutor, RetryPolicy};
pub use shutdown::wait_for_shutdown;
pub use timeout::{join_within, with_timeout, TimeoutError};
