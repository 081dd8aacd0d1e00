//! Kernel surface: the RTNLGRP_NEIGH multicast subscription, the
//! synchronous neighbor-table dump, and the neighbor delete used by
//! address release.

use std::io;
use std::time::Instant;

use netlink_packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST,
};
use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::neigh::state::{NeighborEntry, NeighborUpdate, NudState};

/// rtnetlink multicast group for neighbor notifications (RTNLGRP_NEIGH = 3).
const RTNLGRP_NEIGH: u32 = 3;

const RECV_BUF_LEN: usize = 64 * 1024;

/// Capacity of the hub's event input queue.
pub(crate) const EVENT_QUEUE_LEN: usize = 256;

/// Read access to the kernel neighbor table, plus the one write the
/// plugin performs (deleting an entry on address release). The hub and
/// the façade go through this seam so tests can substitute a fake.
pub trait NeighborView: Send + Sync {
    fn list(&self) -> io::Result<Vec<NeighborEntry>>;
    fn delete(&self, entry: &NeighborEntry) -> io::Result<()>;
}

/// Long-lived subscription to kernel neighbor-change events.
pub struct NeighborEvents {
    fd: AsyncFd<Socket>,
    buffer: Vec<u8>,
}

impl NeighborEvents {
    pub fn new() -> io::Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        let groups = 1 << (RTNLGRP_NEIGH - 1);
        socket.bind(&SocketAddr::new(0, groups))?;
        socket.set_non_blocking(true)?;
        Ok(Self {
            fd: AsyncFd::new(socket)?,
            buffer: vec![0u8; RECV_BUF_LEN],
        })
    }

    /// Receive one datagram's worth of neighbor messages. The whole
    /// batch shares a single `observed_at`.
    pub async fn recv_batch(&mut self) -> io::Result<Vec<NeighborUpdate>> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| inner.get_ref().recv(&mut &mut self.buffer[..], 0)) {
                Ok(Ok(len)) => return Ok(parse_batch(&self.buffer[..len])),
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Forward event batches to the hub until quit. Receive errors during
/// steady state are logged and retried; the subscription socket itself
/// was validated at startup.
pub fn spawn_receiver(
    mut events: NeighborEvents,
    hub_tx: mpsc::Sender<Vec<NeighborUpdate>>,
    quit: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = quit.cancelled() => return,
                batch = events.recv_batch() => match batch {
                    Ok(batch) => {
                        if batch.is_empty() {
                            continue;
                        }
                        if hub_tx.send(batch).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!(error = %err, "error receiving neighbor update"),
                },
            }
        }
    })
}

fn parse_batch(bytes: &[u8]) -> Vec<NeighborUpdate> {
    let observed_at = Instant::now();
    let mut updates = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let msg = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&bytes[offset..]) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(error = %err, "skipping undecodable neighbor message");
                // Step over the record by its raw length so one bad
                // message does not poison the rest of the batch.
                match raw_message_len(&bytes[offset..]) {
                    Some(len) => {
                        offset += nlmsg_align(len);
                        continue;
                    }
                    None => break,
                }
            }
        };
        let msg_len = msg.header.length as usize;
        if msg_len == 0 {
            break;
        }
        offset += nlmsg_align(msg_len);

        let neigh = match &msg.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewNeighbour(n))
            | NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelNeighbour(n)) => n,
            _ => continue,
        };
        if let Some(entry) = entry_from_message(neigh) {
            updates.push(NeighborUpdate::new(entry.ip, entry.state, observed_at));
        }
    }
    updates
}

fn entry_from_message(msg: &NeighbourMessage) -> Option<NeighborEntry> {
    if msg.header.family != AddressFamily::Inet {
        return None;
    }
    let state = NudState::from_kernel(u16::from(msg.header.state));
    msg.attributes.iter().find_map(|attr| match attr {
        NeighbourAttribute::Destination(NeighbourAddress::Inet(ip)) => Some(NeighborEntry {
            ip: *ip,
            ifindex: msg.header.ifindex,
            state,
        }),
        _ => None,
    })
}

const fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Length field of a raw netlink message header, host byte order. A
/// length shorter than the header itself cannot be stepped over.
fn raw_message_len(bytes: &[u8]) -> Option<usize> {
    let len = u32::from_ne_bytes(bytes.get(..4)?.try_into().ok()?) as usize;
    (len >= 16).then_some(len)
}

/// The real kernel table. All calls are blocking request/response
/// exchanges on a throwaway socket; async paths wrap them in
/// `spawn_blocking`.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelNeighbors;

impl KernelNeighbors {
    fn request_socket() -> io::Result<Socket> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        socket.bind(&SocketAddr::new(0, 0))?;
        Ok(socket)
    }
}

impl NeighborView for KernelNeighbors {
    fn list(&self) -> io::Result<Vec<NeighborEntry>> {
        let socket = Self::request_socket()?;

        let mut header = NetlinkHeader::default();
        header.flags = NLM_F_REQUEST | NLM_F_DUMP;
        header.sequence_number = 1;
        let payload = RouteNetlinkMessage::GetNeighbour(NeighbourMessage::default());
        let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
        packet.finalize();
        let mut buf = vec![0u8; packet.buffer_len()];
        packet.serialize(&mut buf);
        socket.send(&buf, 0)?;

        let mut entries = Vec::new();
        let mut rbuf = vec![0u8; RECV_BUF_LEN];
        'recv: loop {
            let len = socket.recv(&mut &mut rbuf[..], 0)?;
            let mut offset = 0;
            while offset < len {
                let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&rbuf[offset..len])
                    .map_err(|err| {
                        io::Error::new(io::ErrorKind::InvalidData, err.to_string())
                    })?;
                let msg_len = msg.header.length as usize;
                if msg_len == 0 {
                    break 'recv;
                }
                offset += nlmsg_align(msg_len);
                match &msg.payload {
                    NetlinkPayload::Done(_) => break 'recv,
                    NetlinkPayload::Error(err) if err.code.is_some() => {
                        return Err(io::Error::new(
                            io::ErrorKind::Other,
                            format!("neighbor dump failed: {err:?}"),
                        ));
                    }
                    NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewNeighbour(n)) => {
                        if let Some(entry) = entry_from_message(n) {
                            entries.push(entry);
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(entries)
    }

    fn delete(&self, entry: &NeighborEntry) -> io::Result<()> {
        let socket = Self::request_socket()?;

        let mut neigh = NeighbourMessage::default();
        neigh.header.family = AddressFamily::Inet;
        neigh.header.ifindex = entry.ifindex;
        neigh
            .attributes
            .push(NeighbourAttribute::Destination(NeighbourAddress::Inet(
                entry.ip,
            )));

        let mut header = NetlinkHeader::default();
        header.flags = NLM_F_REQUEST | NLM_F_ACK;
        header.sequence_number = 1;
        let payload = RouteNetlinkMessage::DelNeighbour(neigh);
        let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
        packet.finalize();
        let mut buf = vec![0u8; packet.buffer_len()];
        packet.serialize(&mut buf);
        socket.send(&buf, 0)?;

        let mut rbuf = vec![0u8; RECV_BUF_LEN];
        let len = socket.recv(&mut &mut rbuf[..], 0)?;
        let mut offset = 0;
        while offset < len {
            let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&rbuf[offset..len])
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
            let msg_len = msg.header.length as usize;
            if msg_len == 0 {
                break;
            }
            offset += nlmsg_align(msg_len);
            if let NetlinkPayload::Error(err) = &msg.payload {
                if err.code.is_some() {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("neighbor delete failed: {err:?}"),
                    ));
                }
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlink_packet_route::neighbour::NeighbourState;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn neighbour(ip: Ipv4Addr, state: u16, ifindex: u32) -> NeighbourMessage {
        let mut msg = NeighbourMessage::default();
        msg.header.family = AddressFamily::Inet;
        msg.header.ifindex = ifindex;
        msg.header.state = NeighbourState::from(state);
        msg.attributes
            .push(NeighbourAttribute::Destination(NeighbourAddress::Inet(ip)));
        msg
    }

    #[test]
    fn entry_extraction() {
        let msg = neighbour(Ipv4Addr::new(10, 1, 6, 50), 0x02, 7);
        let entry = entry_from_message(&msg).unwrap();
        assert_eq!(entry.ip, Ipv4Addr::new(10, 1, 6, 50));
        assert_eq!(entry.ifindex, 7);
        assert_eq!(entry.state, NudState::Reachable);
    }

    #[test]
    fn non_ipv4_is_skipped() {
        let mut msg = NeighbourMessage::default();
        msg.header.family = AddressFamily::Inet6;
        msg.attributes
            .push(NeighbourAttribute::Destination(NeighbourAddress::Inet6(
                Ipv6Addr::LOCALHOST,
            )));
        assert!(entry_from_message(&msg).is_none());
    }

    #[test]
    fn missing_destination_is_skipped() {
        let mut msg = NeighbourMessage::default();
        msg.header.family = AddressFamily::Inet;
        assert!(entry_from_message(&msg).is_none());
    }

    #[test]
    fn a_bad_record_does_not_poison_the_batch() {
        // A record with a plausible length but a message type the
        // route protocol cannot decode...
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&20u32.to_ne_bytes());
        bytes.extend_from_slice(&0xfffeu16.to_ne_bytes());
        bytes.extend_from_slice(&0u16.to_ne_bytes());
        bytes.extend_from_slice(&0u32.to_ne_bytes());
        bytes.extend_from_slice(&0u32.to_ne_bytes());
        bytes.extend_from_slice(&[0u8; 4]);

        // ...followed by a decodable neighbor message.
        let header = NetlinkHeader::default();
        let payload =
            RouteNetlinkMessage::NewNeighbour(neighbour(Ipv4Addr::new(10, 1, 6, 50), 0x02, 2));
        let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
        packet.finalize();
        let mut buf = vec![0u8; packet.buffer_len()];
        packet.serialize(&mut buf);
        bytes.extend_from_slice(&buf);

        let updates = parse_batch(&bytes);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].ip, Ipv4Addr::new(10, 1, 6, 50));
    }

    #[test]
    fn batch_parsing_walks_aligned_messages() {
        let mut bytes = Vec::new();
        for (ip, state) in [
            (Ipv4Addr::new(10, 1, 6, 50), 0x20u16),
            (Ipv4Addr::new(10, 1, 6, 51), 0x02u16),
        ] {
            let mut header = NetlinkHeader::default();
            header.sequence_number = 1;
            let payload = RouteNetlinkMessage::NewNeighbour(neighbour(ip, state, 2));
            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
            packet.finalize();
            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);
            bytes.extend_from_slice(&buf);
        }

        let updates = parse_batch(&bytes);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].ip, Ipv4Addr::new(10, 1, 6, 50));
        assert_eq!(updates[0].state, NudState::Failed);
        assert_eq!(updates[1].ip, Ipv4Addr::new(10, 1, 6, 51));
        assert_eq!(updates[1].state, NudState::Reachable);
        assert_eq!(updates[0].observed_at, updates[1].observed_at);
    }
}
