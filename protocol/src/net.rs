//! Socket helpers shared by servers and clients.
//!
//! Unicast traffic uses one short-lived TCP connection per envelope: connect, send, and
//! optionally wait for a single reply envelope, then close. Nothing here retries.
//! Failures are returned to the caller, which decides whether the peer is gone.

use crate::{
    address::NodeAddress,
    codec::{
        decode_datagram, encode_datagram, Ack, Beacon, CborRecvError, CborSendError,
        DatagramError,
    },
    message::Envelope,
    RecvCbor, SendCbor,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    io::{self, ErrorKind},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream, ToSocketAddrs, UdpSocket},
    time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UnicastError {
    #[error("Can't resolve {address}")]
    Resolve {
        address: NodeAddress,
        source: io::Error,
    },
    #[error("{address} resolved to 0 addresses, can't reach it")]
    Unreachable { address: NodeAddress },
    #[error("Can't establish stream to {address}")]
    Connect {
        address: NodeAddress,
        source: io::Error,
    },
    #[error("Can't set timeouts on stream to {address}")]
    Configure {
        address: NodeAddress,
        source: io::Error,
    },
    #[error("Failed to send to {address}")]
    Send {
        address: NodeAddress,
        source: CborSendError,
    },
    #[error("No reply from {address}")]
    Recv {
        address: NodeAddress,
        source: CborRecvError,
    },
}

#[derive(Error, Debug)]
pub enum MulticastError {
    #[error("Can't encode envelope for {group}")]
    Encode {
        group: SocketAddrV4,
        source: DatagramError,
    },
    #[error("Failed to send datagram to {group}")]
    Send {
        group: SocketAddrV4,
        source: io::Error,
    },
    #[error("Failed to collect acknowledgements from {group}")]
    Collect {
        group: SocketAddrV4,
        source: io::Error,
    },
}

/// Connect to `address` with a connect timeout, and set the same timeout for reads and writes.
pub fn connect(address: &NodeAddress, timeout: Duration) -> Result<TcpStream, UnicastError> {
    let mut addrs = address
        .to_socket_addrs()
        .map_err(|e| UnicastError::Resolve {
            address: address.clone(),
            source: e,
        })?
        .peekable();

    // Try every result
    while let Some(addr) = addrs.next() {
        let stream = match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => stream,
            Err(e) => match addrs.peek() {
                Some(_) => continue,
                None => {
                    return Err(UnicastError::Connect {
                        address: address.clone(),
                        source: e,
                    })
                }
            },
        };
        stream
            .set_read_timeout(Some(timeout))
            .and_then(|()| stream.set_write_timeout(Some(timeout)))
            .map_err(|e| UnicastError::Configure {
                address: address.clone(),
                source: e,
            })?;
        return Ok(stream);
    }
    Err(UnicastError::Unreachable {
        address: address.clone(),
    })
}

/// Connect, send one envelope and close.
pub fn send_to(
    address: &NodeAddress,
    envelope: &Envelope,
    timeout: Duration,
) -> Result<(), UnicastError> {
    let mut stream = connect(address, timeout)?;
    stream.send(envelope).map_err(|e| UnicastError::Send {
        address: address.clone(),
        source: e,
    })
}

/// Connect, send one envelope and wait for the reply.
pub fn request(
    address: &NodeAddress,
    envelope: &Envelope,
    timeout: Duration,
) -> Result<Envelope, UnicastError> {
    let mut stream = connect(address, timeout)?;
    stream.send(envelope).map_err(|e| UnicastError::Send {
        address: address.clone(),
        source: e,
    })?;
    stream.recv().map_err(|e| UnicastError::Recv {
        address: address.clone(),
        source: e,
    })
}

#[must_use]
pub fn is_timeout(error: &io::Error) -> bool {
    matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Bind a UDP socket on all interfaces, allowing other processes on this host to bind the same port.
pub fn bind_reusable_udp(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    Ok(socket.into())
}

/// Bind to the port of a multicast group and join the group on the default interface.
pub fn join_group(group: SocketAddrV4, read_timeout: Duration) -> io::Result<UdpSocket> {
    let socket = bind_reusable_udp(group.port())?;
    socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
    socket.set_read_timeout(Some(read_timeout))?;
    Ok(socket)
}

/// Ephemeral socket for sending to multicast groups, restricted to the local network.
pub fn multicast_sender() -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_multicast_ttl_v4(1)?;
    Ok(socket)
}

/// Send a clocked envelope to `group` from `socket`, then count the [`Ack`]s for its clock
/// arriving on the same socket within `ack_window`.
///
/// Acks for other clocks, left over from earlier sends, are ignored.
pub fn multicast(
    socket: &UdpSocket,
    group: SocketAddrV4,
    envelope: &Envelope,
    ack_window: Duration,
) -> Result<usize, MulticastError> {
    let datagram =
        encode_datagram(envelope).map_err(|e| MulticastError::Encode { group, source: e })?;
    socket
        .send_to(&datagram, group)
        .map_err(|e| MulticastError::Send { group, source: e })?;
    let Some(clock) = envelope.clock else {
        return Ok(0);
    };

    let collect = |e| MulticastError::Collect { group, source: e };
    let deadline = Instant::now() + ack_window;
    let mut acks = 0;
    let mut buf = [0; 64];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(acks);
        }
        socket.set_read_timeout(Some(remaining)).map_err(collect)?;
        match socket.recv_from(&mut buf) {
            Ok((len, _)) => {
                if decode_datagram::<Ack>(&buf[..len]).is_ok_and(|ack| ack.clock == clock) {
                    acks += 1;
                }
            }
            Err(e) if is_timeout(&e) => return Ok(acks),
            Err(e) => return Err(collect(e)),
        }
    }
}

/// Acknowledge a multicast envelope to the socket it was sent from.
pub fn send_ack(socket: &UdpSocket, to: SocketAddr, clock: u64) -> io::Result<()> {
    let ack = encode_datagram(&Ack { clock })
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    socket.send_to(&ack, to).map(|_| ())
}

/// Broadcast a [`Beacon::Solicit`] and wait for the leader's advertisement.
///
/// Returns `Ok(None)` if nobody answered within `timeout`.
pub fn solicit(broadcast_port: u16, timeout: Duration) -> io::Result<Option<NodeAddress>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_broadcast(true)?;
    let solicit = encode_datagram(&Beacon::solicit())
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    socket.send_to(&solicit, (Ipv4Addr::BROADCAST, broadcast_port))?;

    let deadline = Instant::now() + timeout;
    let mut buf = [0; 512];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        socket.set_read_timeout(Some(remaining))?;
        match socket.recv_from(&mut buf) {
            Ok((len, source)) => {
                if let Ok(beacon @ Beacon::Advertise { port, .. }) = decode_datagram(&buf[..len]) {
                    if beacon.is_genuine() {
                        return Ok(Some(NodeAddress::new(source.ip().to_string(), port)));
                    }
                }
            }
            Err(e) if is_timeout(&e) => return Ok(None),
            Err(e) => return Err(e),
        }
    }
}

/// IP address of the interface used for outbound traffic, or the loopback address.
#[must_use]
pub fn local_ip() -> String {
    // Connecting a UDP socket sends nothing, the target doesn't even have to be reachable
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(10, 255, 255, 255), 1))?;
            socket.local_addr()
        })
        .map_or_else(
            |_| Ipv4Addr::LOCALHOST.to_string(),
            |addr| addr.ip().to_string(),
        )
}
