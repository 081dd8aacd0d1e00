use std::time::Duration;

use ipnet::Ipv4Net;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::{Error, Result};
use crate::neigh::hub::HubHandle;
use crate::probe;

pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Decide whether `addr` is occupied by a live host.
///
/// Snapshot first; if the hub already holds a terminal verdict the
/// answer is immediate. Otherwise register a subscription, emit a
/// probe, and wait for the first of: quit (treated as "free" so
/// in-flight requests unwind), a matching update, or the 1 s ticker.
/// Every wake re-checks the snapshot and the deadline; running out of
/// budget yields `ProbeTimeout`, which callers classify as "assume in
/// use" because binding a possibly-live address is worse than
/// retrying.
pub async fn probe_and_wait(hub: &HubHandle, addr: Ipv4Net, timeout: Duration) -> Result<bool> {
    let ip = addr.addr();
    if let Some(update) = hub.query(ip).await {
        if update.known() {
            return Ok(update.reachable());
        }
    }

    let start = Instant::now();
    let deadline = start + timeout;
    let mut sub = hub.subscribe(addr).await;
    let mut ticker = interval_at(start + PROBE_INTERVAL, PROBE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    probe::send(ip).await;
    loop {
        tokio::select! {
            biased;
            _ = hub.quit().cancelled() => return Ok(false),
            update = sub.recv() => match update {
                Some(update) if update.ip != ip => continue,
                Some(_) => {}
                // EOF: the hub is gone, shutting down.
                None => return Ok(false),
            },
            _ = ticker.tick() => {}
        }

        if let Some(update) = hub.query(ip).await {
            if update.known() {
                return Ok(update.reachable());
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::ProbeTimeout(ip));
        }
        probe::send(ip).await;
    }
    // The subscription's close flag is raised by Drop on every path.
}
