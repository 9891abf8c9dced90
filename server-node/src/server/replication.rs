//! Sending on and following the two multicast channels, and state transfer to joining nodes.

use super::{Route, Server};
use crate::{console, lock, transport::Transport};
use protocol::{
    Arrival, Audience, Command, Envelope, NodeAddress, NodeKind, QuitReason, Snapshot,
};

impl<T: Transport> Server<T> {
    /// Stamp `command` on the channel of `audience` and multicast it.
    ///
    /// Nothing is stamped while the audience is empty. Clients that don't acknowledge are
    /// swept out of the directory.
    pub(crate) fn multicast(&self, audience: Audience, command: Command) {
        if self.send_on_channel(audience, command) && audience == Audience::Clients {
            self.sweep_clients();
        }
    }

    /// Stamp and send without acting on missing acks. Returns `true` if acks were missing.
    fn send_on_channel(&self, audience: Audience, command: Command) -> bool {
        let expected = lock(&self.directory).audience_size(audience);
        if expected == 0 {
            console::debug!("No {audience} to send {} to", command.tag());
            return false;
        }

        let envelope = self.channel(audience).stamp(command);
        match self.transport.multicast(audience, &envelope) {
            Ok(acks) => {
                console::debug!("Multicast {envelope} to {audience}, {acks}/{expected} acks");
                acks < expected
            }
            Err(e) => {
                console::error!(&e, "Multicast of {envelope} to {audience} failed");
                false
            }
        }
    }

    /// Multicast `command` to servers and clients alike.
    pub(crate) fn announce(&self, command: &Command) {
        self.multicast(Audience::Servers, command.clone());
        self.multicast(Audience::Clients, command.clone());
    }

    /// Ping every known client once, remove the ones that can't be reached and announce
    /// their removal.
    ///
    /// The announcements don't sweep again, even if more acks go missing.
    pub(crate) fn sweep_clients(&self) {
        let clients: Vec<NodeAddress> = lock(&self.directory).clients().iter().cloned().collect();
        let ping = Envelope::unicast(Command::Ping, self.local.clone());
        let unreachable: Vec<NodeAddress> = clients
            .into_iter()
            .filter(|client| match self.transport.send(client, &ping) {
                Ok(()) => false,
                Err(e) => {
                    console::error!(&e, "Client {client} missed an acknowledgement and a ping");
                    true
                }
            })
            .collect();

        let mut removed = unreachable;
        let mut directory = lock(&self.directory);
        removed.retain(|client| directory.remove(NodeKind::Client, client));
        drop(directory);

        for client in removed {
            console::warning!("Removed unreachable client {client}");
            let quit = Command::Quit {
                node_type: NodeKind::Client,
                inform_others: false,
                address: client,
                reason: QuitReason::Unreachable,
            };
            self.send_on_channel(Audience::Servers, quit.clone());
            self.send_on_channel(Audience::Clients, quit);
        }
        self.render();
    }

    /// Deliver an envelope from the group of `audience` in channel order.
    ///
    /// Missing clocks are requested from the envelope's sender first.
    pub fn receive_multicast(&self, audience: Audience, envelope: Envelope) -> Arrival {
        let sender = envelope.sender.clone();
        let arrival = self.channel(audience).receive(
            envelope,
            |clock| self.fetch(audience, &sender, clock),
            |clock, command| {
                let envelope = Envelope::multicast(command, sender.clone(), clock);
                // Replies only exist for unicast requests
                let _ = self.dispatch(envelope, Route::Multicast(audience));
            },
        );

        match &arrival {
            Arrival::Delivered {
                clock,
                recovered,
                lost,
                evicted,
            } => {
                if !recovered.is_empty() {
                    console::log!("Recovered {audience} clocks {recovered:?} from {sender}");
                }
                if !evicted.is_empty() {
                    console::warning!(
                        "Skipped {audience} clocks {evicted:?}, {sender} no longer has them"
                    );
                }
                if !lost.is_empty() {
                    console::warning!("Lost {audience} clocks {lost:?} before clock {clock}");
                }
            }
            Arrival::Stale { clock, local } => {
                console::debug!("Ignoring {audience} clock {clock} from {sender}, at {local}");
            }
            Arrival::Loopback | Arrival::Unclocked => {}
            Arrival::Inconsistent(mismatch) => {
                console::error!(mismatch, "Skipping {audience} envelope from {sender}");
            }
        }
        arrival
    }

    fn fetch(&self, audience: Audience, from: &NodeAddress, clock: u64) -> Option<Command> {
        let request = Envelope::unicast(
            Command::Msg {
                channel: audience,
                clock,
            },
            self.local.clone(),
        );
        match self.transport.request(from, &request) {
            Ok(reply) => Some(reply.command),
            Err(e) => {
                console::error!(&e, "Can't recover {audience} clock {clock} from {from}");
                None
            }
        }
    }

    /// Answer a retransmission request from the channel log.
    pub(crate) fn retransmit(
        &self,
        audience: Audience,
        clock: u64,
        requester: &NodeAddress,
    ) -> Option<Envelope> {
        let replay = self.channel(audience).replay(clock);
        if replay.is_none() {
            console::warning!("{requester} asked for {audience} clock {clock}, no longer logged");
        }
        replay
    }

    /// Membership, leader and both channel states
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let directory = self.directory();
        Snapshot {
            servers: directory.servers().clone(),
            clients: directory.clients().clone(),
            nicknames: directory.nicknames().clone(),
            leader: self.leader(),
            server_channel: self.server_channel.state(),
            client_channel: self.client_channel.state(),
        }
    }

    /// Send the full state to a joining node.
    pub(crate) fn transmit_state(&self, to: &NodeAddress) {
        let state = Envelope::unicast(
            Command::State(Box::new(self.snapshot())),
            self.local.clone(),
        );
        match self.transport.send(to, &state) {
            Ok(()) => console::log!("Transferred state to {to}"),
            Err(e) => console::error!(&e, "State transfer to {to} failed"),
        }
    }

    /// Take over a transferred state. Applying the same state twice has no further effect.
    pub(crate) fn receive_state(&self, snapshot: Snapshot) {
        let Snapshot {
            servers,
            clients,
            nicknames,
            leader,
            server_channel,
            client_channel,
        } = snapshot;

        lock(&self.directory).replace(servers, clients, nicknames);
        for (channel, state) in [
            (&self.server_channel, server_channel),
            (&self.client_channel, client_channel),
        ] {
            if !channel.restore(state) {
                let audience = channel.audience();
                console::debug!("Kept the {audience} channel, it is already past the state");
            }
        }
        if let Some(leader) = leader {
            lock(&self.election).adopt(leader);
        }
        console::log!(
            "Received state, {} servers, {} clients, leader {}",
            self.directory().servers().len(),
            self.directory().clients().len(),
            self.leader()
                .map_or_else(|| "unknown".to_owned(), |leader| leader.to_string())
        );
    }
}
