#![deny(clippy::unwrap_used, clippy::allow_attributes_without_reason)]
#![warn(clippy::perf, clippy::complexity, clippy::pedantic, clippy::suspicious)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    reason = "We're not going to write comprehensive docs"
)]
#![allow(
    clippy::module_name_repetitions,
    reason = "Types are re-exported at the crate root"
)]

//! This crate defines the wire protocol shared by chat servers and chat clients.
//!
//! Every message on the wire is an [`Envelope`], carrying one [`Command`].
//! Envelopes travel as CBOR, either over a short-lived [`std::net::TcpStream`]
//! (see [`net::send_to`] and [`net::request`]) or as a UDP datagram to a multicast group.
//!
//! Ordered delivery over multicast is implemented by [`ReliableChannel`], which both
//! servers and clients use to follow a channel.

pub mod address;
pub mod channel;
pub mod codec;
pub mod message;
pub mod net;

pub use address::{AddressParseError, NodeAddress};
pub use channel::{Arrival, ChannelState, ReliableChannel};
pub use codec::{
    decode_datagram, encode_datagram, Ack, Beacon, CborRecvError, CborSendError, DatagramError,
    RecvCbor, SendCbor,
};
pub use message::{Audience, Command, Envelope, NodeKind, QuitReason, Snapshot};
pub use net::{MulticastError, UnicastError};

/// Random code a discovering node broadcasts, to filter out other traffic on the port.
pub const BROADCAST_CODE: &str = "9310e231f20a07cb53d96b90a978163d";

/// Random code the leader answers a discovery broadcast with.
pub const RESPONSE_CODE: &str = "f56ddd73d577e38c45769dcd09dc9d99";

/// Number of multicast messages each channel retains for retransmission.
pub const DEFAULT_LOG_CAPACITY: usize = 5;
