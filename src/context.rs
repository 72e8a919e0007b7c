//! Call context with cancellation support.

use tokio_util::sync::CancellationToken;

/// Cancellation context for an RPC call.
///
/// Wraps a [`CancellationToken`]. A call made with a context returns early
/// once the context is cancelled; derived child contexts are cancelled along
/// with their parent, which is how a broadcast aborts its remaining targets.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives a context that is cancelled when this one is, but can also be
    /// cancelled on its own without affecting the parent.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
