//! Cooperative batch cancellation over a `watch` channel.

use std::time::Duration;

use tokio::sync::watch;

/// Fires cancellation for every [`CancelSignal`] cloned from its pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        cancellation().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `delay` unless cancelled first. Returns `false` when the
    /// sleep was cut short.
    pub async fn sleep(&mut self, delay: Duration) -> bool {
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);

        loop {
            if self.is_cancelled() {
                return false;
            }
            tokio::select! {
                _ = &mut deadline => return true,
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        // Handle dropped: nobody can cancel any more.
                        (&mut deadline).await;
                        return true;
                    }
                }
            }
        }
    }
}
