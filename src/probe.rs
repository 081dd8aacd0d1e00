use std::io;
use std::net::Ipv4Addr;

use tokio::net::UdpSocket;
use tracing::debug;

/// Port the probe datagram is aimed at. Nothing is expected to listen
/// there; the send exists to force the kernel into neighbor resolution.
pub const PROBE_PORT: u16 = 8765;

const PROBE_PAYLOAD: &[u8] = b"probe";

/// Fire one UDP datagram at `ip` to elicit an ARP resolution. A failed
/// probe carries no information, so errors are logged and swallowed.
pub async fn send(ip: Ipv4Addr) {
    if let Err(err) = try_send(ip).await {
        debug!(ip = %ip, error = %err, "probe send failed");
    }
}

async fn try_send(ip: Ipv4Addr) -> io::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect((ip, PROBE_PORT)).await?;
    socket.send(PROBE_PAYLOAD).await?;
    Ok(())
}
