//! An IPAM plugin for Docker that hands out IPv4 addresses from
//! locally-attached subnets, using the kernel's neighbor (ARP) table
//! as the source of truth for address occupancy.
//!
//! There is no allocation database. An address is "in use" exactly
//! when the kernel reports a reachable neighbor for it, so allocation
//! becomes a reachability question: send a UDP datagram at the
//! candidate to force ARP resolution, then watch the neighbor table
//! through a netlink subscription until the kernel reaches a verdict.
//!
//! The moving parts, bottom up:
//!
//! - [`neigh::NeighborEvents`] subscribes to kernel neighbor changes;
//! - [`neigh::NeighborHub`] fans those updates out to per-IP
//!   subscriptions and answers point-in-time state queries;
//! - [`neigh::probe_and_wait`] decides whether one address is free,
//!   combining a snapshot, active probes and a bounded wait;
//! - [`candidates`] keeps a small pool of pre-vetted random addresses
//!   per subnet so the common request path returns immediately;
//! - [`driver::Driver`] implements the plugin operations on top, and
//!   [`plugin`] serves them over the Docker remote IPAM protocol.

pub mod candidates;
pub mod driver;
pub mod error;
pub mod neigh;
pub mod net_util;
pub mod plugin;
pub mod probe;

pub use driver::{Driver, DriverConfig, DriverConfigBuilder};
pub use error::{Error, Result};
pub use neigh::{probe_and_wait, HubHandle, NeighborHub, NeighborUpdate, NudState};
pub use plugin::Ipam;
