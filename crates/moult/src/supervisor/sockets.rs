//! Listening sockets held by the supervisor for its children.

use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::error::Error;
use crate::listener::normalize_address;
use crate::sys;

/// One bound socket per configured address, in configuration order.
///
/// The descriptors are close-on-exec copies parked in the high range; each
/// child gets them placed at 3, 4, ... right before exec.
#[derive(Debug)]
pub(crate) struct SocketSet {
    held: Vec<OwnedFd>,
}

impl SocketSet {
    pub(crate) fn bind(addresses: &[String]) -> Result<Self, Error> {
        let mut held = Vec::with_capacity(addresses.len());
        for address in addresses {
            let resolved = resolve(address)?;
            let listener = TcpListener::bind(resolved).map_err(|source| Error::Bind {
                address: address.clone(),
                source,
            })?;
            let fd = sys::dup_high(listener.as_raw_fd()).map_err(|source| Error::Descriptor {
                address: address.clone(),
                source,
            })?;
            held.push(fd);
        }
        Ok(Self { held })
    }

    pub(crate) fn len(&self) -> usize {
        self.held.len()
    }

    pub(crate) fn raw_fds(&self) -> Vec<RawFd> {
        self.held.iter().map(AsRawFd::as_raw_fd).collect()
    }

    #[cfg(test)]
    fn local_addrs(&self) -> Vec<SocketAddr> {
        self.held
            .iter()
            .filter_map(|fd| socket2::SockRef::from(fd).local_addr().ok())
            .filter_map(|addr| addr.as_socket())
            .collect()
    }
}

fn resolve(address: &str) -> Result<SocketAddr, Error> {
    let invalid = |reason: String| Error::InvalidAddress {
        address: address.to_string(),
        reason,
    };
    normalize_address(address)
        .to_socket_addrs()
        .map_err(|err| invalid(err.to_string()))?
        .next()
        .ok_or_else(|| invalid("no addresses resolved".into()))
}
