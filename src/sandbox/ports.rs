//! Exclusive host-port allocation.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Hands out host ports from a fixed range.
///
/// A port is reserved from the moment it is selected until its
/// [`PortLease`] is dropped, so two concurrent creations can never pick the
/// same port even before either container has bound it.
#[derive(Clone)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    /// Creates an allocator probing `start..end`.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            reserved: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Reserves the first port that is neither leased nor bound on the host.
    pub fn allocate(&self) -> Result<PortLease> {
        let mut reserved = self.reserved.lock();
        for port in self.start..self.end {
            if reserved.contains(&port) {
                continue;
            }
            if TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok() {
                reserved.insert(port);
                tracing::debug!(port, "reserved host port");
                return Ok(PortLease {
                    port,
                    reserved: self.reserved.clone(),
                });
            }
        }

        Err(Error::PortExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Number of ports currently leased.
    pub fn in_use(&self) -> usize {
        self.reserved.lock().len()
    }
}

/// A reserved port; released back to the allocator on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.reserved.lock().remove(&self.port);
        tracing::debug!(port = self.port, "released host port");
    }
}
