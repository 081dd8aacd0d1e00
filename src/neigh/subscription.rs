use std::net::Ipv4Addr;
use std::time::Instant;

use ipnet::Ipv4Net;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::neigh::state::NeighborUpdate;

/// Inbox depth per subscription. Deliveries beyond this fall back to a
/// short-lived helper task so the hub never blocks on a slow reader.
pub(crate) const INBOX_CAPACITY: usize = 256;

/// Caller half of a per-IP subscription. Dropping it raises the close
/// flag, so every exit path of a waiter releases its registration; the
/// hub garbage-collects the other half on its next pass.
pub struct Subscription {
    target: Ipv4Net,
    inbox: mpsc::Receiver<NeighborUpdate>,
    close_flag: CancellationToken,
}

impl Subscription {
    pub fn target(&self) -> Ipv4Net {
        self.target
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.target.addr()
    }

    /// Next update for this IP. `None` means the hub has dropped its
    /// half: the subscription was closed, or the hub shut down.
    pub async fn recv(&mut self) -> Option<NeighborUpdate> {
        self.inbox.recv().await
    }

    pub fn close(&self) {
        self.close_flag.cancel();
    }

    pub(crate) fn close_flag(&self) -> CancellationToken {
        self.close_flag.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close_flag.cancel();
    }
}

/// Hub half: the delivery side plus the bookkeeping the hub needs to
/// decide replay and garbage collection.
pub(crate) struct SubscriptionHandle {
    pub(crate) ip: Ipv4Addr,
    pub(crate) created_at: Instant,
    tx: mpsc::Sender<NeighborUpdate>,
    close_flag: CancellationToken,
}

impl SubscriptionHandle {
    pub(crate) fn is_closed(&self) -> bool {
        self.close_flag.is_cancelled()
    }

    /// Lossy, non-blocking delivery. A full inbox degrades to a helper
    /// task; a closed inbox drops the update. Dropped updates are
    /// resynchronized by the ticker-driven refresh and re-probing.
    pub(crate) fn deliver(&self, update: NeighborUpdate) {
        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(update)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(update).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

pub(crate) fn subscription_pair(target: Ipv4Net) -> (Subscription, SubscriptionHandle) {
    let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
    let close_flag = CancellationToken::new();
    let sub = Subscription {
        target,
        inbox,
        close_flag: close_flag.clone(),
    };
    let handle = SubscriptionHandle {
        ip: target.addr(),
        created_at: Instant::now(),
        tx,
        close_flag,
    };
    (sub, handle)
}
