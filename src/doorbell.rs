//! Cross-domain doorbell abstraction
//!
//! A doorbell carries no payload; it only tells the remote side that shared
//! state changed. Each ring direction uses two: one rung by the producer when
//! data was published, one rung by the consumer when it drained past the
//! producer's requested watermark.

use crate::error::{ChannelError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Outbound half of a doorbell.
///
/// Real ports implement this over the platform's mailbox/IPI primitive; the
/// in-process implementation from [`doorbell_pair`] is used for loopback
/// links and tests. Signals are allowed to coalesce: ringing an already rung
/// doorbell is a no-op.
pub trait Doorbell: Send + Sync {
    /// Wake the remote side
    fn ring(&self);
}

/// Inbound half of a doorbell: the wait primitive released by the remote ring
pub struct DoorbellWaiter {
    notify: Arc<Notify>,
}

impl DoorbellWaiter {
    /// Wait until the doorbell is rung.
    ///
    /// A ring that happened before the wait is not lost; it is consumed by
    /// the next call.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Wait with a deadline
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .map_err(|_| ChannelError::Timeout(timeout))
    }

}

struct LocalDoorbell {
    notify: Arc<Notify>,
}

impl Doorbell for LocalDoorbell {
    fn ring(&self) {
        self.notify.notify_one();
    }
}

/// Create an in-process doorbell: the returned [`Doorbell`] releases the
/// returned [`DoorbellWaiter`].
pub fn doorbell_pair() -> (Arc<dyn Doorbell>, DoorbellWaiter) {
    let notify = Arc::new(Notify::new());
    (
        Arc::new(LocalDoorbell {
            notify: Arc::clone(&notify),
        }),
        DoorbellWaiter { notify },
    )
}
