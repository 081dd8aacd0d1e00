use std::io;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("{0}")]
    InvalidInput(String),

    #[error("pool is not a local network: {0}")]
    NotLocal(Ipv4Net),

    #[error("address already in use: {0}")]
    AddressInUse(Ipv4Addr),

    #[error("all available addresses are in use")]
    PoolExhausted,

    #[error("timed out determining reachability for {0}")]
    ProbeTimeout(Ipv4Addr),

    #[error("request address timed out")]
    RequestTimeout,

    #[error("netlink error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The verdict probe-and-wait hands back when the kernel never
    /// reached a terminal state within the per-address budget.
    pub fn is_probe_timeout(&self) -> bool {
        matches!(self, Error::ProbeTimeout(_))
    }
}
