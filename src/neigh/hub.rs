//! The subscription hub: a single task that owns the observed-state
//! map and the per-IP subscriber index. Everything else talks to it
//! through bounded channels, so no lock guards the neighbor state.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::Ipv4Net;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::neigh::netlink::{NeighborView, EVENT_QUEUE_LEN};
use crate::neigh::state::NeighborUpdate;
use crate::neigh::subscription::{subscription_pair, Subscription, SubscriptionHandle};

/// Cadence of the full neighbor-table refresh. The first tick fires
/// immediately, which doubles as the startup table load.
pub(crate) const REFRESH_INTERVAL: Duration = Duration::from_secs(3);

const COMMAND_QUEUE_LEN: usize = 256;

enum HubCommand {
    Subscribe(SubscriptionHandle),
    Query {
        ip: Ipv4Addr,
        reply: oneshot::Sender<Option<NeighborUpdate>>,
    },
}

/// Cheap cloneable front to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    cmd_tx: mpsc::Sender<HubCommand>,
    quit: CancellationToken,
}

impl HubHandle {
    /// Register interest in one IP. The returned subscription starts
    /// receiving updates once the hub processes the registration; if a
    /// state change for the IP raced the registration, the hub replays
    /// it.
    pub async fn subscribe(&self, target: Ipv4Net) -> Subscription {
        let (sub, handle) = subscription_pair(target);
        // A failed send means the hub is gone; the subscription then
        // reads EOF immediately, which callers treat as shutdown.
        let _ = self.cmd_tx.send(HubCommand::Subscribe(handle)).await;
        sub
    }

    /// Point-in-time snapshot of the hub's latest knowledge of `ip`.
    pub async fn query(&self, ip: Ipv4Addr) -> Option<NeighborUpdate> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HubCommand::Query { ip, reply })
            .await
            .ok()?;
        reply_rx.await.ok().flatten()
    }

    pub fn quit(&self) -> &CancellationToken {
        &self.quit
    }
}

pub struct NeighborHub {
    table: Arc<dyn NeighborView>,
    observed: HashMap<Ipv4Addr, NeighborUpdate>,
    subscribers: HashMap<Ipv4Addr, Vec<SubscriptionHandle>>,
    cmd_rx: mpsc::Receiver<HubCommand>,
    event_rx: mpsc::Receiver<Vec<NeighborUpdate>>,
    quit: CancellationToken,
}

impl NeighborHub {
    /// Build the hub and its endpoints: the handle for subscribers and
    /// the bounded input queue the netlink receiver feeds.
    pub fn new(
        table: Arc<dyn NeighborView>,
        quit: CancellationToken,
    ) -> (Self, HubHandle, mpsc::Sender<Vec<NeighborUpdate>>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_LEN);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_LEN);
        let hub = Self {
            table,
            observed: HashMap::new(),
            subscribers: HashMap::new(),
            cmd_rx,
            event_rx,
            quit: quit.clone(),
        };
        let handle = HubHandle { cmd_tx, quit };
        (hub, handle, event_tx)
    }

    pub async fn run(mut self) {
        let mut refresh = tokio::time::interval(REFRESH_INTERVAL);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = self.quit.cancelled() => {
                    debug!("neighbor hub shutting down");
                    self.subscribers.clear();
                    return;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(HubCommand::Subscribe(handle)) => self.add_subscription(handle),
                    Some(HubCommand::Query { ip, reply }) => {
                        let _ = reply.send(self.observed.get(&ip).copied());
                    }
                    None => {
                        debug!("all hub handles dropped, stopping");
                        self.subscribers.clear();
                        return;
                    }
                },
                batch = self.event_rx.recv() => match batch {
                    Some(batch) => {
                        for update in batch {
                            self.apply_update(update);
                        }
                    }
                    None => {
                        debug!("neighbor event source closed, stopping");
                        self.subscribers.clear();
                        return;
                    }
                },
                _ = refresh.tick() => self.full_refresh().await,
            }
        }
    }

    fn add_subscription(&mut self, handle: SubscriptionHandle) {
        if let Some(update) = self.observed.get(&handle.ip) {
            // A state change that raced the registration is replayed
            // once; knowledge older than the subscription is not.
            if update.observed_at > handle.created_at {
                handle.deliver(*update);
            }
        }
        self.subscribers.entry(handle.ip).or_default().push(handle);
    }

    /// Monotonic state advancement: only a strictly newer observation
    /// with a different state replaces the stored entry and reaches
    /// subscribers.
    fn apply_update(&mut self, update: NeighborUpdate) {
        if let Some(prev) = self.observed.get(&update.ip) {
            if prev.state == update.state || prev.observed_at >= update.observed_at {
                return;
            }
        }
        self.observed.insert(update.ip, update);
        self.fan_out(update);
    }

    fn fan_out(&mut self, update: NeighborUpdate) {
        let Some(subs) = self.subscribers.get_mut(&update.ip) else {
            return;
        };
        for i in (0..subs.len()).rev() {
            if subs[i].is_closed() {
                // Dropping the handle closes the inbox: EOF for readers.
                subs.swap_remove(i);
            } else {
                subs[i].deliver(update);
            }
        }
        if subs.is_empty() {
            self.subscribers.remove(&update.ip);
        }
    }

    /// List the whole table and run each row through the advancement
    /// rule. Covers subscriptions established after a terminal state
    /// was already written, and resynchronizes after dropped updates.
    async fn full_refresh(&mut self) {
        let table = Arc::clone(&self.table);
        let entries = match tokio::task::spawn_blocking(move || table.list()).await {
            Ok(Ok(entries)) => entries,
            Ok(Err(err)) => {
                warn!(error = %err, "error refreshing neighbor table");
                self.sweep();
                return;
            }
            Err(err) => {
                warn!(error = %err, "neighbor table refresh task failed");
                return;
            }
        };
        let observed_at = Instant::now();
        for entry in entries {
            self.apply_update(NeighborUpdate::new(entry.ip, entry.state, observed_at));
        }
        self.sweep();
    }

    fn sweep(&mut self) {
        self.subscribers.retain(|_, subs| {
            for i in (0..subs.len()).rev() {
                if subs[i].is_closed() {
                    subs.swap_remove(i);
                }
            }
            !subs.is_empty()
        });
    }
}
