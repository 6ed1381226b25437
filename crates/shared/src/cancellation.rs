use thiserror::Error;
pub use tokio_util::sync::CancellationToken;

/// Checking a token between steps of a blocking operation.
pub trait CheckCancelled {
    /// Returns `Err(Cancelled)` if cancellation was requested on the token or
    /// any of its parents.
    fn check(&self) -> Result<(), Cancelled>;
}

impl CheckCancelled for CancellationToken {
    fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The operation observed a cancelled token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("The operation was cancelled")]
pub struct Cancelled;
