//! Outbound network operations of a server, behind a trait so that the server logic can be
//! tested against an in-memory network.

use crate::config::Config;
use protocol::{net, Audience, Envelope, MulticastError, NodeAddress, UnicastError};
use std::{
    io,
    net::{SocketAddrV4, UdpSocket},
    sync::Mutex,
    time::Duration,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Unicast(#[from] UnicastError),
    #[error(transparent)]
    Multicast(#[from] MulticastError),
    #[error("Discovery broadcast failed")]
    Discovery(#[source] io::Error),
}

pub trait Transport: Send + Sync + 'static {
    /// Deliver one envelope to `to`.
    fn send(&self, to: &NodeAddress, envelope: &Envelope) -> Result<(), TransportError>;

    /// Deliver one envelope to `to` and wait for its reply.
    fn request(&self, to: &NodeAddress, envelope: &Envelope) -> Result<Envelope, TransportError>;

    /// Send a clocked envelope to the group of `audience`. Returns the number of
    /// acknowledgements collected.
    fn multicast(&self, audience: Audience, envelope: &Envelope) -> Result<usize, TransportError>;

    /// Ask the LAN for the current leader.
    fn discover(&self) -> Result<Option<NodeAddress>, TransportError>;
}

/// [`Transport`] over TCP, UDP multicast and UDP broadcast
#[derive(Debug)]
pub struct NetTransport {
    connect_timeout: Duration,
    ack_window: Duration,
    discovery_timeout: Duration,
    broadcast_port: u16,
    server_group: SocketAddrV4,
    client_group: SocketAddrV4,
    // One send at a time, acks of concurrent sends would be counted twice
    sender: Mutex<UdpSocket>,
}

impl NetTransport {
    pub fn new(config: &Config) -> io::Result<Self> {
        Ok(Self {
            connect_timeout: config.connect_timeout,
            ack_window: config.ack_window,
            discovery_timeout: config.discovery_timeout,
            broadcast_port: config.broadcast_port,
            server_group: config.server_group,
            client_group: config.client_group,
            sender: Mutex::new(net::multicast_sender()?),
        })
    }
}

impl Transport for NetTransport {
    fn send(&self, to: &NodeAddress, envelope: &Envelope) -> Result<(), TransportError> {
        Ok(net::send_to(to, envelope, self.connect_timeout)?)
    }

    fn request(&self, to: &NodeAddress, envelope: &Envelope) -> Result<Envelope, TransportError> {
        Ok(net::request(to, envelope, self.connect_timeout)?)
    }

    fn multicast(&self, audience: Audience, envelope: &Envelope) -> Result<usize, TransportError> {
        let group = match audience {
            Audience::Servers => self.server_group,
            Audience::Clients => self.client_group,
        };
        let socket = crate::lock(&self.sender);
        Ok(net::multicast(&socket, group, envelope, self.ack_window)?)
    }

    fn discover(&self) -> Result<Option<NodeAddress>, TransportError> {
        net::solicit(self.broadcast_port, self.discovery_timeout).map_err(TransportError::Discovery)
    }
}
