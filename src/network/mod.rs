//! Link layer
//!
//! A [`Connector`] turns a relay descriptor into a [`Link`]: an owned
//! reader half for the channel's reader thread, a writer half guarded by
//! the channel's write lock, and a control handle used to apply read
//! timeouts and to shut the connection down.

mod tls;

pub use tls::TlsConnector;

use crate::error::Result;
use crate::protocol::Relay;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// An established connection to a relay, split into halves
pub struct Link {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub control: LinkControl,
}

/// Socket-level control shared by both halves
#[derive(Debug)]
pub struct LinkControl {
    socket: TcpStream,
}

impl LinkControl {
    pub fn new(socket: TcpStream) -> Self {
        Self { socket }
    }

    /// Bound blocking reads (used during the link handshake)
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Close both directions; wakes a reader blocked on the socket
    pub fn shutdown(&self) {
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            log::trace!("link shutdown: {}", e);
        }
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.socket.peer_addr().ok()
    }
}

/// Opens links to relays
pub trait Connector: Send + Sync {
    fn connect(&self, relay: &Relay, timeout: Duration) -> Result<Link>;
}

/// Plain TCP links, for local test networks and pluggable setups that
/// provide their own transport security
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, relay: &Relay, timeout: Duration) -> Result<Link> {
        let socket = TcpStream::connect_timeout(&relay.socket_addr(), timeout)?;
        socket.set_nodelay(true)?;
        Ok(Link {
            reader: Box::new(socket.try_clone()?),
            writer: Box::new(socket.try_clone()?),
            control: LinkControl::new(socket),
        })
    }
}
