use std::sync::Arc;

use tokio::sync::watch;

use crate::connection::TopologyError;

#[derive(Debug, Clone)]
enum LatchState {
    Pending,
    Ready,
    Failed(TopologyError),
}

/// A one-shot readiness signal with any number of waiters.
///
/// A latch settles at most once: the first `resolve` or `reject` wins and
/// later transitions are ignored. Entities replace their latch on every
/// rebuild; clones handed out earlier keep observing the incarnation they
/// belong to.
#[derive(Debug, Clone)]
pub(crate) struct Latch {
    tx: Arc<watch::Sender<LatchState>>,
}

impl Latch {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(LatchState::Pending);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn resolve(&self) {
        self.tx.send_if_modified(|state| match state {
            LatchState::Pending => {
                *state = LatchState::Ready;
                true
            }
            _ => false,
        });
    }

    pub(crate) fn reject(&self, err: TopologyError) {
        self.tx.send_if_modified(|state| match state {
            LatchState::Pending => {
                *state = LatchState::Failed(err);
                true
            }
            _ => false,
        });
    }

    /// Waits until the latch settles.
    pub(crate) async fn wait(&self) -> Result<(), TopologyError> {
        let mut rx = self.tx.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                LatchState::Ready => return Ok(()),
                LatchState::Failed(err) => return Err(err),
                LatchState::Pending => {
                    // `self` keeps the sender alive, so this cannot fail.
                    let _ = rx.changed().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_every_waiter() {
        let latch = Latch::new();
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };
        latch.resolve();
        assert!(waiter.await.unwrap().is_ok());
        // Late waiters observe the settled state immediately.
        assert!(latch.wait().await.is_ok());
    }

    #[tokio::test]
    async fn rejects_with_the_first_error() {
        let latch = Latch::new();
        latch.reject(TopologyError::RpcInterrupted);
        // A latch settles once; the resolve is ignored.
        latch.resolve();
        assert!(matches!(
            latch.wait().await,
            Err(TopologyError::RpcInterrupted)
        ));
    }
}
