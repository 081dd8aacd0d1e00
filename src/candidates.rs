//! Per-subnet candidate pools. Each subnet gets a fixed-size list of
//! pre-vetted random addresses kept warm by background refills and
//! revalidation, so the common random-address request returns without
//! waiting on a probe cycle.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

use ipnet::Ipv4Net;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::neigh::hub::HubHandle;
use crate::neigh::probe_wait::probe_and_wait;
use crate::neigh::state::NeighborUpdate;
use crate::net_util;

pub(crate) const CANDIDATE_SIZE: usize = 3;

const REVALIDATE_INTERVAL: Duration = Duration::from_secs(3);
const REVALIDATE_TIMEOUT: Duration = Duration::from_secs(15);
const REFILL_TIMEOUT: Duration = Duration::from_secs(15);
const POP_FALLBACK_TIMEOUT: Duration = Duration::from_secs(8);
const CHANNEL_LEN: usize = 16;

type PopReply = oneshot::Sender<Result<Ipv4Net>>;

/// Process-wide map from subnet to candidate list, lazily populated on
/// the first request for a subnet. The mutex covers only create-or-get;
/// all further interaction with a list is channel-based.
pub struct CandidatePools {
    hub: HubHandle,
    exclude_first: u32,
    exclude_last: u32,
    pools: Mutex<HashMap<Ipv4Net, CandidateListHandle>>,
}

impl CandidatePools {
    pub fn new(hub: HubHandle, exclude_first: u32, exclude_last: u32) -> Self {
        Self {
            hub,
            exclude_first,
            exclude_last,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, subnet: Ipv4Net) -> CandidateListHandle {
        let mut pools = self.pools.lock().unwrap();
        pools
            .entry(subnet)
            .or_insert_with(|| {
                CandidateList::spawn(
                    subnet,
                    self.hub.clone(),
                    self.exclude_first,
                    self.exclude_last,
                )
            })
            .clone()
    }
}

#[derive(Clone)]
pub struct CandidateListHandle {
    pop_tx: mpsc::Sender<PopReply>,
    add_tx: mpsc::Sender<Ipv4Addr>,
    del_tx: mpsc::Sender<Ipv4Addr>,
}

impl CandidateListHandle {
    /// Take a pre-vetted address, or fall back to a fresh random
    /// search when no candidate is ready. Shutdown surfaces as
    /// `RequestTimeout`, which the façade reports for any request it
    /// could not finish.
    pub async fn pop(&self) -> Result<Ipv4Net> {
        let (reply, rx) = oneshot::channel();
        self.pop_tx
            .send(reply)
            .await
            .map_err(|_| Error::RequestTimeout)?;
        rx.await.map_err(|_| Error::RequestTimeout)?
    }
}

struct Slot {
    addr: Ipv4Net,
    close_flag: CancellationToken,
}

struct CandidateList {
    subnet: Ipv4Net,
    hub: HubHandle,
    exclude_first: u32,
    exclude_last: u32,
    slots: [Option<Slot>; CANDIDATE_SIZE],
    pop_rx: mpsc::Receiver<PopReply>,
    add_rx: mpsc::Receiver<Ipv4Addr>,
    del_rx: mpsc::Receiver<Ipv4Addr>,
    add_tx: mpsc::Sender<Ipv4Addr>,
    del_tx: mpsc::Sender<Ipv4Addr>,
    update_tx: mpsc::Sender<NeighborUpdate>,
    update_rx: mpsc::Receiver<NeighborUpdate>,
}

impl CandidateList {
    fn new(
        subnet: Ipv4Net,
        hub: HubHandle,
        exclude_first: u32,
        exclude_last: u32,
    ) -> (Self, CandidateListHandle) {
        let (pop_tx, pop_rx) = mpsc::channel(CHANNEL_LEN);
        let (add_tx, add_rx) = mpsc::channel(CHANNEL_LEN);
        let (del_tx, del_rx) = mpsc::channel(CHANNEL_LEN);
        let (update_tx, update_rx) = mpsc::channel(CHANNEL_LEN);
        let list = Self {
            subnet,
            hub,
            exclude_first,
            exclude_last,
            slots: Default::default(),
            pop_rx,
            add_rx,
            del_rx,
            add_tx: add_tx.clone(),
            del_tx: del_tx.clone(),
            update_tx,
            update_rx,
        };
        let handle = CandidateListHandle {
            pop_tx,
            add_tx,
            del_tx,
        };
        (list, handle)
    }

    fn spawn(
        subnet: Ipv4Net,
        hub: HubHandle,
        exclude_first: u32,
        exclude_last: u32,
    ) -> CandidateListHandle {
        let (list, handle) = Self::new(subnet, hub, exclude_first, exclude_last);
        tokio::spawn(list.run());
        handle
    }

    /// The list's event loop is the only mutator of the slot array;
    /// pops, adds, deletes, revalidation and shutdown all arrive as
    /// messages or timer ticks.
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(REVALIDATE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        for _ in 0..CANDIDATE_SIZE {
            self.spawn_refill();
        }
        loop {
            tokio::select! {
                biased;
                _ = self.hub.quit().cancelled() => {
                    self.close_all();
                    return;
                }
                Some(reply) = self.pop_rx.recv() => self.handle_pop(reply),
                Some(ip) = self.add_rx.recv() => self.handle_add(ip).await,
                Some(ip) = self.del_rx.recv() => self.handle_delete(ip),
                Some(_) = self.update_rx.recv() => self.maintain_slots(),
                _ = ticker.tick() => self.maintain_slots(),
            }
        }
    }

    fn handle_pop(&mut self, reply: PopReply) {
        for i in 0..self.slots.len() {
            if self.slots[i].is_none() {
                self.spawn_refill();
                continue;
            }
            if let Some(slot) = self.slots[i].take() {
                debug!(ip = %slot.addr, "popping address from candidates");
                slot.close_flag.cancel();
                let _ = reply.send(Ok(slot.addr));
                self.spawn_refill();
                return;
            }
        }

        // Nothing vetted right now; search on the caller's behalf.
        let hub = self.hub.clone();
        let subnet = self.subnet;
        let (exclude_first, exclude_last) = (self.exclude_first, self.exclude_last);
        tokio::spawn(async move {
            let result =
                fresh_random_addr(&hub, subnet, POP_FALLBACK_TIMEOUT, exclude_first, exclude_last)
                    .await;
            let _ = reply.send(result);
        });
    }

    async fn handle_add(&mut self, ip: Ipv4Addr) {
        if self
            .slots
            .iter()
            .flatten()
            .any(|slot| slot.addr.addr() == ip)
        {
            debug!(ip = %ip, "candidate already held, dropping duplicate");
            return;
        }
        let Some(empty) = self.slots.iter().position(Option::is_none) else {
            debug!(ip = %ip, "candidate list full, dropping");
            return;
        };

        let addr = net_util::host(self.subnet, ip);
        let mut sub = self.hub.subscribe(addr).await;
        let close_flag = sub.close_flag();
        let update_tx = self.update_tx.clone();
        let forward_flag = close_flag.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = forward_flag.cancelled() => return,
                    update = sub.recv() => match update {
                        Some(update) => {
                            if update_tx.send(update).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    },
                }
            }
        });
        self.slots[empty] = Some(Slot { addr, close_flag });
    }

    fn handle_delete(&mut self, ip: Ipv4Addr) {
        for i in 0..self.slots.len() {
            let matched = self.slots[i]
                .as_ref()
                .is_some_and(|slot| slot.addr.addr() == ip);
            if !matched {
                continue;
            }
            if let Some(slot) = self.slots[i].take() {
                slot.close_flag.cancel();
            }
            self.spawn_refill();
            return;
        }
    }

    /// Revalidate every occupied slot in the background and refill the
    /// empty ones. Reachable or errored verdicts come back through the
    /// delete channel.
    fn maintain_slots(&self) {
        for slot in &self.slots {
            let Some(slot) = slot else {
                self.spawn_refill();
                continue;
            };
            let hub = self.hub.clone();
            let del_tx = self.del_tx.clone();
            let addr = slot.addr;
            tokio::spawn(async move {
                match probe_and_wait(&hub, addr, REVALIDATE_TIMEOUT).await {
                    Ok(false) => {}
                    Ok(true) => {
                        debug!(ip = %addr, "candidate in use, discarding");
                        let _ = del_tx.send(addr.addr()).await;
                    }
                    Err(err) if err.is_probe_timeout() => {
                        debug!(ip = %addr, "timed out probing candidate, trying another");
                        let _ = del_tx.send(addr.addr()).await;
                    }
                    Err(err) => {
                        warn!(ip = %addr, error = %err, "error probing candidate");
                        let _ = del_tx.send(addr.addr()).await;
                    }
                }
            });
        }
    }

    fn spawn_refill(&self) {
        let hub = self.hub.clone();
        let add_tx = self.add_tx.clone();
        let subnet = self.subnet;
        let (exclude_first, exclude_last) = (self.exclude_first, self.exclude_last);
        tokio::spawn(async move {
            match fresh_random_addr(&hub, subnet, REFILL_TIMEOUT, exclude_first, exclude_last).await
            {
                Ok(addr) => {
                    let _ = add_tx.send(addr.addr()).await;
                }
                Err(err) => {
                    debug!(subnet = %subnet, error = %err, "error refilling candidate")
                }
            }
        });
    }

    fn close_all(&mut self) {
        for slot in self.slots.iter_mut().filter_map(Option::take) {
            slot.close_flag.cancel();
        }
    }
}

/// Search the subnet for an address nobody answers for. The network
/// and broadcast addresses are excluded when the subnet has more than
/// two addresses, along with the configured head and tail
/// reservations. A reachable verdict excludes the address for the rest
/// of the search; a probe error does not, so a transiently unresolved
/// address may be revisited.
pub(crate) async fn fresh_random_addr(
    hub: &HubHandle,
    subnet: Ipv4Net,
    timeout: Duration,
    exclude_first: u32,
    exclude_last: u32,
) -> Result<Ipv4Net> {
    let total = net_util::total_addresses(subnet);
    let mut excluded: HashSet<Ipv4Addr> = HashSet::new();
    if total > 2 {
        excluded.insert(net_util::first_addr(subnet));
        excluded.insert(net_util::last_addr(subnet));
    }
    for i in 1..=i64::from(exclude_first) {
        excluded.insert(net_util::ip_add(net_util::first_addr(subnet), i));
    }
    for i in 1..=i64::from(exclude_last) {
        excluded.insert(net_util::ip_add(net_util::last_addr(subnet), -i));
    }

    while (excluded.len() as u64) < total {
        let ip = net_util::random_addr(subnet);
        if excluded.contains(&ip) {
            continue;
        }
        let addr = net_util::host(subnet, ip);
        match probe_and_wait(hub, addr, timeout).await {
            Ok(false) => {
                debug!(ip = %ip, "returning random address");
                return Ok(addr);
            }
            Ok(true) => {
                debug!(ip = %ip, "random address reachable, retrying");
                excluded.insert(ip);
            }
            Err(err) => {
                debug!(ip = %ip, error = %err, "error probing random address");
            }
        }
    }
    Err(Error::PoolExhausted)
}
