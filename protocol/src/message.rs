//! # Chat Fabric Messages
//!
//! Every message exchanged between servers and clients is an [`Envelope`].
//! The envelope's [`Command`] is a closed set of variants, each carrying its own payload.
//!
//! The `clock` of an envelope is set only when it was sent through a multicast channel.
//! Unicast control messages, and replays answering a [`Command::Msg`] request, carry no clock.

use crate::{address::NodeAddress, channel::ChannelState};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
};

/// The group a multicast channel targets
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    Servers,
    Clients,
}

impl Display for Audience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Audience::Servers => write!(f, "servers"),
            Audience::Clients => write!(f, "clients"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Server,
    Client,
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Server => write!(f, "server"),
            NodeKind::Client => write!(f, "client"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitReason {
    /// The node asked to leave
    Left,
    /// The node stopped answering pings
    Unreachable,
}

/// Full membership and replication state, handed to a joining node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub servers: BTreeSet<NodeAddress>,
    pub clients: BTreeSet<NodeAddress>,
    pub nicknames: BTreeMap<NodeAddress, String>,
    pub leader: Option<NodeAddress>,
    pub server_channel: ChannelState,
    pub client_channel: ChannelState,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Command {
    /// Chat text. `sender` is the client that wrote it, not the relaying server.
    Chat {
        sender: NodeAddress,
        nickname: Option<String>,
        text: String,
    },
    Join {
        node_type: NodeKind,
        inform_others: bool,
        address: NodeAddress,
        nickname: Option<String>,
    },
    Quit {
        node_type: NodeKind,
        inform_others: bool,
        address: NodeAddress,
        reason: QuitReason,
    },
    State(Box<Snapshot>),
    Vote {
        candidate: NodeAddress,
        leader_elected: bool,
    },
    Lead {
        leader: NodeAddress,
    },
    /// Retransmission request for one clock of a channel
    Msg {
        channel: Audience,
        clock: u64,
    },
    Ping,
    Down {
        inform_others: bool,
    },
}

impl Command {
    /// Wire tag of the command, for logging
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Command::Chat { .. } => "CHAT",
            Command::Join { .. } => "JOIN",
            Command::Quit { .. } => "QUIT",
            Command::State(_) => "STATE",
            Command::Vote { .. } => "VOTE",
            Command::Lead { .. } => "LEAD",
            Command::Msg { .. } => "MSG",
            Command::Ping => "PING",
            Command::Down { .. } => "DOWN",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub command: Command,
    pub sender: NodeAddress,
    pub clock: Option<u64>,
}

impl Envelope {
    /// An envelope for point-to-point delivery, without a clock
    #[must_use]
    pub fn unicast(command: Command, sender: NodeAddress) -> Self {
        Self {
            command,
            sender,
            clock: None,
        }
    }

    /// An envelope stamped with a channel clock
    #[must_use]
    pub fn multicast(command: Command, sender: NodeAddress, clock: u64) -> Self {
        Self {
            command,
            sender,
            clock: Some(clock),
        }
    }
}

impl Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} from {}", self.command.tag(), self.sender)?;
        if let Some(clock) = self.clock {
            write!(f, " @{clock}")?;
        }
        Ok(())
    }
}
