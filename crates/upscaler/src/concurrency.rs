//! Structured waiting on groups of concurrent operations.

use std::future::Future;
use tokio::task::JoinSet;

/// Run every future concurrently and wait for all of them.
///
/// Returns the first error in completion order. The remaining operations are
/// still driven to completion before returning, so nothing is left running
/// in the background; callers that need the others to stop early arrange
/// that themselves (for example by cancelling a shared token on failure).
/// A panic in any operation is propagated after the others have finished.
pub async fn await_all<I, F, E>(operations: I) -> Result<(), E>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Send + 'static,
{
    let mut set = JoinSet::new();
    for operation in operations {
        set.spawn(operation);
    }

    let mut first_error = None;
    let mut panic = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(join_err) => {
                if join_err.is_panic() && panic.is_none() {
                    panic = Some(join_err.into_panic());
                }
            }
        }
    }

    if let Some(payload) = panic {
        std::panic::resume_unwind(payload);
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
