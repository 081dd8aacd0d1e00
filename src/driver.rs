//! The IPAM façade: wires the hub, the netlink receiver and the
//! candidate pools together and implements the plugin operations.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::candidates::CandidatePools;
use crate::error::{Error, Result};
use crate::neigh::hub::{HubHandle, NeighborHub};
use crate::neigh::netlink::{spawn_receiver, KernelNeighbors, NeighborEvents, NeighborView};
use crate::neigh::probe_wait::probe_and_wait;
use crate::net_util;
use crate::plugin::{
    AddressSpacesResponse, CapabilitiesResponse, Ipam, ReleaseAddressRequest, ReleasePoolRequest,
    RequestAddressRequest, RequestAddressResponse, RequestPoolRequest, RequestPoolResponse,
    DEFAULT_ADDRESS_SPACE, GATEWAY_ADDRESS_TYPE, REQUEST_ADDRESS_TYPE_OPTION,
};

/// Outer budget for a single address request.
pub(crate) const REQUEST_DEADLINE: Duration = Duration::from_secs(10);
/// Probe-and-wait budget for a specifically requested address.
pub(crate) const VET_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    pub exclude_first: u32,
    pub exclude_last: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DriverConfigBuilder {
    exclude_first: u32,
    exclude_last: u32,
}

impl DriverConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve this many addresses after the network address.
    pub fn with_exclude_first(mut self, exclude_first: u32) -> Self {
        self.exclude_first = exclude_first;
        self
    }

    /// Reserve this many addresses before the broadcast address.
    pub fn with_exclude_last(mut self, exclude_last: u32) -> Self {
        self.exclude_last = exclude_last;
        self
    }

    pub fn build(self) -> DriverConfig {
        DriverConfig {
            exclude_first: self.exclude_first,
            exclude_last: self.exclude_last,
        }
    }
}

/// Long-lived tasks the driver owns. Cancelling the shared token asks
/// every task to stop; `shutdown` then joins them so nothing is left
/// mid-write at exit.
pub struct BackgroundTasks {
    quit: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    fn new(quit: CancellationToken) -> Self {
        Self {
            quit,
            handles: Vec::new(),
        }
    }

    fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    pub async fn shutdown(self) {
        self.quit.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

pub struct Driver {
    hub: HubHandle,
    table: Arc<dyn NeighborView>,
    candidates: CandidatePools,
}

impl Driver {
    /// Construct the driver and start its background tasks: the hub
    /// loop and the netlink receiver. A netlink subscription failure
    /// here is fatal; the process has nothing to serve without it.
    pub fn new(config: DriverConfig, quit: CancellationToken) -> Result<(Self, BackgroundTasks)> {
        let table: Arc<dyn NeighborView> = Arc::new(KernelNeighbors);
        let events = NeighborEvents::new()?;

        let (hub, hub_handle, event_tx) = NeighborHub::new(Arc::clone(&table), quit.clone());
        let mut tasks = BackgroundTasks::new(quit.clone());
        tasks.push(tokio::spawn(hub.run()));
        tasks.push(spawn_receiver(events, event_tx, quit));

        let candidates = CandidatePools::new(
            hub_handle.clone(),
            config.exclude_first,
            config.exclude_last,
        );
        let driver = Self {
            hub: hub_handle,
            table,
            candidates,
        };
        Ok((driver, tasks))
    }

    #[cfg(test)]
    fn with_parts(hub: HubHandle, table: Arc<dyn NeighborView>, config: DriverConfig) -> Self {
        let candidates =
            CandidatePools::new(hub.clone(), config.exclude_first, config.exclude_last);
        Self {
            hub,
            table,
            candidates,
        }
    }

    async fn request_address_inner(&self, req: &RequestAddressRequest) -> Result<String> {
        let pool = parse_pool(&req.pool_id)?;
        verify_local_net(pool)?;

        if !req.address.is_empty() {
            debug!(address = %req.address, "specific address requested");
            let ip: Ipv4Addr = req.address.parse().map_err(|_| {
                Error::InvalidInput(format!("unable to parse address: {}", req.address))
            })?;
            let addr = net_util::host(pool, ip);

            if req.options.get(REQUEST_ADDRESS_TYPE_OPTION).map(String::as_str)
                == Some(GATEWAY_ADDRESS_TYPE)
            {
                debug!(address = %addr, "gateway requested, approving without probe");
                return Ok(addr.to_string());
            }

            return match probe_and_wait(&self.hub, addr, VET_TIMEOUT).await {
                Ok(false) => Ok(addr.to_string()),
                Ok(true) => Err(Error::AddressInUse(ip)),
                // No verdict within budget: assume the address is in
                // use rather than risk binding a live one.
                Err(err) if err.is_probe_timeout() => Err(Error::AddressInUse(ip)),
                Err(err) => Err(err),
            };
        }

        debug!(pool = %pool, "random address requested");
        let list = self.candidates.get_or_create(pool);
        let addr = list.pop().await?;
        Ok(addr.to_string())
    }
}

#[async_trait]
impl Ipam for Driver {
    async fn get_capabilities(&self) -> Result<CapabilitiesResponse> {
        debug!("get capabilities");
        Ok(CapabilitiesResponse {
            requires_mac_address: false,
        })
    }

    async fn get_default_address_spaces(&self) -> Result<AddressSpacesResponse> {
        debug!("get default address spaces");
        Ok(AddressSpacesResponse {
            local_default_address_space: DEFAULT_ADDRESS_SPACE.to_string(),
            global_default_address_space: DEFAULT_ADDRESS_SPACE.to_string(),
        })
    }

    async fn request_pool(&self, req: RequestPoolRequest) -> Result<RequestPoolResponse> {
        debug!(pool = %req.pool, "request pool");
        if req.pool.is_empty() {
            return Err(Error::InvalidInput(
                "automatic pool assignment not supported".to_string(),
            ));
        }
        if req.v6 {
            return Err(Error::InvalidInput(
                "automatic v6 pool assignment not supported".to_string(),
            ));
        }
        if !req.sub_pool.is_empty() {
            return Err(Error::InvalidInput("subpool not supported".to_string()));
        }
        let pool = parse_pool(&req.pool)?;
        verify_local_net(pool)?;
        Ok(RequestPoolResponse {
            pool_id: req.pool.clone(),
            pool: req.pool,
        })
    }

    async fn release_pool(&self, req: ReleasePoolRequest) -> Result<()> {
        debug!(pool_id = %req.pool_id, "release pool");
        Ok(())
    }

    async fn request_address(&self, req: RequestAddressRequest) -> Result<RequestAddressResponse> {
        let started = Instant::now();
        match tokio::time::timeout(REQUEST_DEADLINE, self.request_address_inner(&req)).await {
            Ok(Ok(address)) => {
                debug!(
                    address = %address,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request address served"
                );
                Ok(RequestAddressResponse { address })
            }
            Ok(Err(err)) => {
                error!(
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "error serving request address"
                );
                Err(err)
            }
            Err(_) => {
                error!("request address timed out");
                Err(Error::RequestTimeout)
            }
        }
    }

    /// Best-effort cleanup: drop the neighbor-table entry the ARP
    /// exchange may have created, so a released address does not look
    /// occupied to the next request. A missing entry is not an error.
    async fn release_address(&self, req: ReleaseAddressRequest) -> Result<()> {
        debug!(address = %req.address, "release address");
        let ip: Ipv4Addr = req.address.parse().map_err(|_| {
            Error::InvalidInput(format!("unable to parse address: {}", req.address))
        })?;

        let table = Arc::clone(&self.table);
        let result = tokio::task::spawn_blocking(move || -> io::Result<()> {
            let neighbors = table.list()?;
            match neighbors.iter().find(|entry| entry.ip == ip) {
                Some(entry) => table.delete(entry),
                None => Ok(()),
            }
        })
        .await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(err) => Err(io::Error::new(io::ErrorKind::Other, err.to_string()).into()),
        }
    }
}

fn parse_pool(pool: &str) -> Result<Ipv4Net> {
    match pool.parse::<IpNet>() {
        Ok(IpNet::V4(net)) => Ok(net),
        Ok(IpNet::V6(_)) => Err(Error::InvalidInput(format!(
            "pool must be an IPv4 network: {pool}"
        ))),
        Err(_) => Err(Error::InvalidInput(format!("unable to parse pool: {pool}"))),
    }
}

/// A pool is usable only when it overlaps an address configured on a
/// local interface; the ARP view is meaningless otherwise.
fn verify_local_net(pool: Ipv4Net) -> Result<()> {
    let overlaps = pnet::datalink::interfaces()
        .iter()
        .flat_map(|iface| iface.ips.iter())
        .any(|ip| match ip.ip() {
            IpAddr::V4(v4) => pool.contains(&v4),
            IpAddr::V6(_) => false,
        });
    if overlaps {
        Ok(())
    } else {
        Err(Error::NotLocal(pool))
    }
}
