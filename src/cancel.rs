// Shared cancellation signal
//
// A single token is cloned into every task; tasks select on `cancelled()`
// at each suspension point and release their resources before exiting.

use tokio::sync::watch;

/// The owning side of the cancellation signal. Held by the binary; firing
/// it (once) routes every task to its teardown path.
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// Cloneable read side handed to tasks.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub fn cancellation() -> (CancelSource, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelSource { tx }, CancelToken { rx })
}

impl CancelSource {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes when cancellation fires. Never completes otherwise.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                // source dropped without firing; treat as cancelled so
                // orphaned tasks still unwind
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let (source, token) = cancellation();
        let mut waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        assert!(!token.is_cancelled());
        source.cancel();
        assert!(handle.await.unwrap());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_source_unblocks() {
        let (source, mut token) = cancellation();
        drop(source);
        token.cancelled().await;
    }
}
