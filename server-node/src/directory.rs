//! # Membership Directory
//!
//! Known servers, known clients and client nicknames, together with this server's ring
//! neighbor. The neighbor is recomputed on every change of the server set, so that it is
//! never observed out of date.

use protocol::{Audience, NodeAddress, NodeKind};
use std::collections::{BTreeMap, BTreeSet};

/// Successor of `local` on the ring formed by `servers` in ascending address order.
///
/// The ring wraps around from the greatest address to the smallest one. Returns `None` when
/// `local` is the only member. `local` doesn't have to be part of `servers`.
#[must_use]
pub fn successor(servers: &BTreeSet<NodeAddress>, local: &NodeAddress) -> Option<NodeAddress> {
    use std::ops::Bound::{Excluded, Unbounded};
    servers
        .range((Excluded(local), Unbounded))
        .chain(servers.iter())
        .find(|address| *address != local)
        .cloned()
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeDirectory {
    local: NodeAddress,
    servers: BTreeSet<NodeAddress>,
    clients: BTreeSet<NodeAddress>,
    nicknames: BTreeMap<NodeAddress, String>,
    neighbor: Option<NodeAddress>,
}

impl NodeDirectory {
    /// A directory containing only the local server
    #[must_use]
    pub fn new(local: NodeAddress) -> Self {
        Self {
            servers: BTreeSet::from([local.clone()]),
            local,
            clients: BTreeSet::new(),
            nicknames: BTreeMap::new(),
            neighbor: None,
        }
    }

    #[must_use]
    pub fn servers(&self) -> &BTreeSet<NodeAddress> {
        &self.servers
    }

    #[must_use]
    pub fn clients(&self) -> &BTreeSet<NodeAddress> {
        &self.clients
    }

    #[must_use]
    pub fn nicknames(&self) -> &BTreeMap<NodeAddress, String> {
        &self.nicknames
    }

    #[must_use]
    pub fn nickname(&self, address: &NodeAddress) -> Option<&str> {
        self.nicknames.get(address).map(String::as_str)
    }

    #[must_use]
    pub fn neighbor(&self) -> Option<&NodeAddress> {
        self.neighbor.as_ref()
    }

    #[must_use]
    pub fn contains(&self, kind: NodeKind, address: &NodeAddress) -> bool {
        match kind {
            NodeKind::Server => self.servers.contains(address),
            NodeKind::Client => self.clients.contains(address),
        }
    }

    /// Number of other nodes expected to receive a multicast to `audience`
    #[must_use]
    pub fn audience_size(&self, audience: Audience) -> usize {
        match audience {
            Audience::Servers => self.servers.len().saturating_sub(1),
            Audience::Clients => self.clients.len(),
        }
    }

    /// Returns `false` if the node was already known.
    pub fn add(&mut self, kind: NodeKind, address: NodeAddress) -> bool {
        let added = match kind {
            NodeKind::Server => self.servers.insert(address),
            NodeKind::Client => self.clients.insert(address),
        };
        if added && kind == NodeKind::Server {
            self.update_neighbor();
        }
        added
    }

    /// Returns `false` if the node wasn't known, or is the local server, which is never removed.
    pub fn remove(&mut self, kind: NodeKind, address: &NodeAddress) -> bool {
        match kind {
            NodeKind::Server if *address == self.local => false,
            NodeKind::Server => {
                let removed = self.servers.remove(address);
                if removed {
                    self.update_neighbor();
                }
                removed
            }
            NodeKind::Client => {
                self.nicknames.remove(address);
                self.clients.remove(address)
            }
        }
    }

    pub fn set_nickname(&mut self, address: NodeAddress, nickname: String) {
        self.nicknames.insert(address, nickname);
    }

    /// Replace the whole membership with a transferred one. The local server stays a member.
    pub fn replace(
        &mut self,
        mut servers: BTreeSet<NodeAddress>,
        clients: BTreeSet<NodeAddress>,
        nicknames: BTreeMap<NodeAddress, String>,
    ) {
        servers.insert(self.local.clone());
        self.servers = servers;
        self.clients = clients;
        self.nicknames = nicknames;
        self.update_neighbor();
    }

    fn update_neighbor(&mut self) {
        self.neighbor = successor(&self.servers, &self.local);
    }
}
