//! Outbound TCP for guests
//!
//! The host opens connections on the guest's behalf and hands out small
//! integer handles. Every resolved address goes through the instance's
//! [`Capabilities`] before a connection is attempted. Failures are returned
//! to the guest as negative codes, never as traps.

use std::collections::HashMap;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::Capabilities;

/// Network access disabled, or no resolved address is allowed
pub const ERR_DENIED: i32 = -1;
/// Target is not a resolvable `host:port`
pub const ERR_ADDRESS: i32 = -2;
/// Every allowed address refused the connection
pub const ERR_CONNECT: i32 = -3;
/// Handle does not name an open socket
pub const ERR_HANDLE: i32 = -4;
/// Read or write on an open socket failed
pub const ERR_IO: i32 = -5;
/// Too many sockets open in one instance
pub const ERR_LIMIT: i32 = -6;

/// Sockets a single instance may hold at once
const MAX_SOCKETS: usize = 16;

/// Largest transfer of one `net_read`/`net_write`
pub const MAX_TRANSFER: usize = 64 * 1024;

/// Open sockets of one instance; dropped with the store
#[derive(Debug, Default)]
pub struct SocketTable {
    next: i32,
    open: HashMap<i32, TcpStream>,
}

impl SocketTable {
    /// Connect to `address` (`host:port`), returning a handle or an error code
    pub async fn connect(&mut self, capabilities: &Capabilities, address: &str) -> i32 {
        if !capabilities.network_enabled {
            return ERR_DENIED;
        }
        if self.open.len() >= MAX_SOCKETS {
            return ERR_LIMIT;
        }

        let resolved: Vec<_> = match tokio::net::lookup_host(address).await {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                debug!(address, error = %e, "Guest connect: address lookup failed");
                return ERR_ADDRESS;
            }
        };
        let allowed: Vec<_> = resolved
            .into_iter()
            .filter(|addr| capabilities.permits(addr))
            .collect();
        if allowed.is_empty() {
            debug!(address, "Guest connect: address not allowed");
            return ERR_DENIED;
        }

        let stream = match TcpStream::connect(allowed.as_slice()).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(address, error = %e, "Guest connect failed");
                return ERR_CONNECT;
            }
        };

        let handle = self.next;
        self.next = self.next.wrapping_add(1) & i32::MAX;
        self.open.insert(handle, stream);
        handle
    }

    /// Read up to `buf.len()` bytes; `Ok(0)` is end of stream
    pub async fn read(&mut self, handle: i32, buf: &mut [u8]) -> Result<usize, i32> {
        let stream = self.open.get_mut(&handle).ok_or(ERR_HANDLE)?;
        stream.read(buf).await.map_err(io_code)
    }

    /// Write all of `data`
    pub async fn write(&mut self, handle: i32, data: &[u8]) -> Result<(), i32> {
        let stream = self.open.get_mut(&handle).ok_or(ERR_HANDLE)?;
        stream.write_all(data).await.map_err(io_code)
    }

    pub fn close(&mut self, handle: i32) -> Result<(), i32> {
        self.open.remove(&handle).map(drop).ok_or(ERR_HANDLE)
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

fn io_code(e: io::Error) -> i32 {
    debug!(error = %e, "Guest socket I/O failed");
    ERR_IO
}
