//! Neighbor observation: the netlink event source, the subscription
//! hub, and the probe-and-wait decision procedure built on them.

pub mod hub;
pub mod netlink;
pub mod probe_wait;
pub mod state;
pub mod subscription;

pub use hub::{HubHandle, NeighborHub};
pub use netlink::{KernelNeighbors, NeighborEvents, NeighborView};
pub use probe_wait::probe_and_wait;
pub use state::{NeighborEntry, NeighborUpdate, NudState};
pub use subscription::Subscription;
