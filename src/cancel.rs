//! Cooperative cancellation shared by every suspension point.

use std::sync::Arc;
use tokio::sync::watch;

/// Clonable cancellation flag.
///
/// All clones observe the same state; once cancelled it stays cancelled.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as any clone of `self`, so this only ends
        // when the flag flips.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Run `future` unless cancellation wins the race.
    pub async fn run<F, T>(&self, future: F) -> Result<T, crate::ConvertError>
    where
        F: std::future::Future<Output = T>,
    {
        if self.is_cancelled() {
            return Err(crate::ConvertError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(crate::ConvertError::Cancelled),
            value = future => Ok(value),
        }
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}
