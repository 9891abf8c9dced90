use super::{Route, Server};
use crate::{console, lock, transport::Transport};
use protocol::{Audience, Command, Envelope, NodeAddress, NodeKind, QuitReason};
use std::sync::atomic::Ordering;

impl<T: Transport> Server<T> {
    /// Handle one envelope, delivered either directly or in order by a channel.
    ///
    /// Returns the reply to write back on the connection, only retransmission requests have one.
    pub fn dispatch(&self, envelope: Envelope, route: Route) -> Option<Envelope> {
        let Envelope {
            command, sender, ..
        } = envelope;
        console::debug!("{} from {sender} via {route}", command.tag());

        let mut reply = None;
        match command {
            Command::Chat {
                sender: author,
                nickname,
                text,
            } => self.handle_chat(author, nickname, text, route),
            Command::Join {
                node_type,
                inform_others,
                address,
                nickname,
            } => self.handle_join(node_type, inform_others, address, nickname),
            Command::Quit {
                node_type,
                inform_others,
                address,
                reason,
            } => self.handle_quit(node_type, inform_others, &address, reason),
            Command::State(snapshot) => self.receive_state(*snapshot),
            Command::Vote {
                candidate,
                leader_elected: false,
            } => self.handle_vote(&candidate),
            Command::Vote {
                candidate,
                leader_elected: true,
            } => self.handle_lead(candidate, route),
            Command::Lead { leader } => self.handle_lead(leader, route),
            Command::Msg { channel, clock } => reply = self.retransmit(channel, clock, &sender),
            Command::Ping => {}
            Command::Down { inform_others } => self.handle_down(inform_others),
        }
        self.render();
        reply
    }

    /// Chat text sent to us by a client goes out on the client channel. Chat arriving on the
    /// channel has already been shown to the clients.
    fn handle_chat(
        &self,
        author: NodeAddress,
        nickname: Option<String>,
        text: String,
        route: Route,
    ) {
        match route {
            Route::Unicast => {
                let nickname = nickname.or_else(|| {
                    lock(&self.directory)
                        .nickname(&author)
                        .map(ToOwned::to_owned)
                });
                self.multicast(
                    Audience::Clients,
                    Command::Chat {
                        sender: author,
                        nickname,
                        text,
                    },
                );
            }
            Route::Multicast(_) => {
                let name = nickname.unwrap_or_else(|| author.to_string());
                console::debug!("{name}: {text}");
            }
        }
    }

    fn handle_join(
        &self,
        node_type: NodeKind,
        inform_others: bool,
        address: NodeAddress,
        nickname: Option<String>,
    ) {
        let added = {
            let mut directory = lock(&self.directory);
            let added = directory.add(node_type, address.clone());
            if let Some(nickname) = &nickname {
                directory.set_nickname(address.clone(), nickname.clone());
            }
            added
        };
        if added {
            console::log!("New {node_type} {address}");
        } else {
            console::debug!("{node_type} {address} was already known");
        }

        if inform_others {
            self.transmit_state(&address);
            self.announce(&Command::Join {
                node_type,
                inform_others: false,
                address,
                nickname,
            });
        }
    }

    fn handle_quit(
        &self,
        node_type: NodeKind,
        inform_others: bool,
        address: &NodeAddress,
        reason: QuitReason,
    ) {
        if node_type == NodeKind::Server && *address == self.local {
            console::warning!("Told that we quit ({reason:?}), staying");
            return;
        }
        if !lock(&self.directory).remove(node_type, address) {
            console::debug!("{node_type} {address} quit, but wasn't known");
            return;
        }
        match reason {
            QuitReason::Left => console::log!("{node_type} {address} left"),
            QuitReason::Unreachable => console::warning!("{node_type} {address} is unreachable"),
        }

        if inform_others {
            self.announce(&Command::Quit {
                node_type,
                inform_others: false,
                address: address.clone(),
                reason,
            });
        }

        let was_leader = node_type == NodeKind::Server && self.leader().as_ref() == Some(address);
        if was_leader {
            self.start_election();
        }
    }

    fn handle_down(&self, inform_others: bool) {
        console::warning!("Shutdown requested");
        if inform_others {
            self.multicast(Audience::Clients, Command::Down { inform_others: false });
            self.multicast(Audience::Servers, Command::Down { inform_others: false });
        }
        self.active.store(false, Ordering::SeqCst);
    }
}
