#![deny(clippy::unwrap_used, clippy::allow_attributes_without_reason)]
#![warn(clippy::perf, clippy::complexity, clippy::pedantic, clippy::suspicious)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    reason = "We're not going to write comprehensive docs"
)]

//! Chat client: finds the leader, joins the chat and follows the client channel.
//!
//! Everything the client sends goes by unicast to the leader, which relays it to everyone
//! on the client multicast channel.

use crate::config::Config;
use protocol::{
    codec::MAX_DATAGRAM_SIZE, decode_datagram, net, Arrival, Audience, Command, Envelope,
    NodeAddress, NodeKind, QuitReason, RecvCbor, ReliableChannel, Snapshot, UnicastError,
};
use std::{
    collections::BTreeMap,
    error::Error as StdError,
    fmt::Display,
    io::{self, ErrorKind},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;

pub mod config;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("No leader answered after {0} attempts")]
    NoLeader(u32),
    #[error("Discovery broadcast failed")]
    Discovery(#[source] io::Error),
    #[error(transparent)]
    Unicast(#[from] UnicastError),
    #[error("Can't bind {what}")]
    Bind {
        what: &'static str,
        source: io::Error,
    },
    #[error("Can't spawn {name}")]
    Spawn { name: String, source: io::Error },
}

/// Something the user should see
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Chat {
        name: String,
        text: String,
    },
    /// State received from the leader after joining
    Welcome {
        leader: Option<NodeAddress>,
        servers: usize,
        clients: usize,
    },
    Joined {
        node_type: NodeKind,
        name: String,
    },
    Left {
        node_type: NodeKind,
        name: String,
        reason: QuitReason,
    },
    Leader(NodeAddress),
    /// Messages that couldn't be recovered
    Lost(usize),
    Shutdown,
}

impl Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::Chat { name, text } => write!(f, "{name}: {text}"),
            Notice::Welcome {
                leader,
                servers,
                clients,
            } => {
                write!(f, "* Connected, {servers} servers and {clients} clients online")?;
                if let Some(leader) = leader {
                    write!(f, ", leader {leader}")?;
                }
                Ok(())
            }
            Notice::Joined {
                node_type: NodeKind::Client,
                name,
            } => write!(f, "* {name} joined the chat"),
            Notice::Joined { name, .. } => write!(f, "* Server {name} joined"),
            Notice::Left {
                node_type,
                name,
                reason,
            } => {
                let who = match node_type {
                    NodeKind::Client => name.clone(),
                    NodeKind::Server => format!("Server {name}"),
                };
                match reason {
                    QuitReason::Left => write!(f, "* {who} left"),
                    QuitReason::Unreachable => write!(f, "* {who} is unreachable"),
                }
            }
            Notice::Leader(leader) => write!(f, "* Leader is now {leader}"),
            Notice::Lost(1) => write!(f, "* Missed a message"),
            Notice::Lost(count) => write!(f, "* Missed {count} messages"),
            Notice::Shutdown => write!(f, "* The chat is shutting down"),
        }
    }
}

/// Print an error with its chain of sources
pub fn report(e: &dyn StdError, context: &str) {
    println!("! {context}: {e}");
    let mut source = e.source();
    while let Some(e) = source {
        println!("!   caused by: {e}");
        source = e.source();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Client {
    config: Config,
    local: NodeAddress,
    leader: Mutex<Option<NodeAddress>>,
    nicknames: Mutex<BTreeMap<NodeAddress, String>>,
    channel: ReliableChannel,
    active: AtomicBool,
}

impl Client {
    #[must_use]
    pub fn new(config: Config, local: NodeAddress) -> Self {
        let channel = ReliableChannel::new(Audience::Clients, local.clone(), config.log_capacity);
        Self {
            config,
            local,
            leader: Mutex::new(None),
            nicknames: Mutex::new(BTreeMap::new()),
            channel,
            active: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn nickname(&self) -> &str {
        &self.config.nickname
    }

    #[must_use]
    pub fn leader(&self) -> Option<NodeAddress> {
        lock(&self.leader).clone()
    }

    /// Use a known leader instead of broadcasting for one
    pub fn set_leader(&self, leader: NodeAddress) {
        *lock(&self.leader) = Some(leader);
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn clock(&self) -> u64 {
        self.channel.clock()
    }

    /// Broadcast for the leader until one answers.
    pub fn discover(&self) -> Result<NodeAddress, ClientError> {
        let attempts = self.config.discovery_attempts;
        for _ in 0..attempts {
            let answer = net::solicit(self.config.broadcast_port, self.config.discovery_timeout)
                .map_err(ClientError::Discovery)?;
            if let Some(leader) = answer {
                *lock(&self.leader) = Some(leader.clone());
                return Ok(leader);
            }
        }
        Err(ClientError::NoLeader(attempts))
    }

    /// Ask the leader to let us in, looking for it first unless it is already known. The
    /// state arrives on the unicast listener.
    pub fn join(&self) -> Result<NodeAddress, ClientError> {
        self.send_to_leader(&Command::Join {
            node_type: NodeKind::Client,
            inform_others: true,
            address: self.local.clone(),
            nickname: Some(self.config.nickname.clone()),
        })
    }

    pub fn send_chat(&self, text: &str) -> Result<(), ClientError> {
        self.send_to_leader(&Command::Chat {
            sender: self.local.clone(),
            nickname: Some(self.config.nickname.clone()),
            text: text.to_owned(),
        })
        .map(|_| ())
    }

    /// Leave the chat. The listeners stop whether or not the leader heard about it.
    pub fn quit(&self) -> Result<(), ClientError> {
        self.stop();
        self.send_to_leader(&Command::Quit {
            node_type: NodeKind::Client,
            inform_others: true,
            address: self.local.clone(),
            reason: QuitReason::Left,
        })
        .map(|_| ())
    }

    /// Let the listener threads finish
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Ask the leader to shut down every server. We stop once the announcement arrives.
    pub fn shutdown(&self) -> Result<(), ClientError> {
        self.send_to_leader(&Command::Down {
            inform_others: true,
        })
        .map(|_| ())
    }

    /// Send to the current leader. If it can't be reached, look for the leader again and
    /// retry once.
    fn send_to_leader(&self, command: &Command) -> Result<NodeAddress, ClientError> {
        let envelope = Envelope::unicast(command.clone(), self.local.clone());
        let timeout = self.config.connect_timeout;
        if let Some(leader) = self.leader() {
            match net::send_to(&leader, &envelope, timeout) {
                Ok(()) => return Ok(leader),
                Err(e) => report(&e, &format!("Leader {leader} can't be reached, searching again")),
            }
            lock(&self.leader).take_if(|current| *current == leader);
        }
        let leader = self.discover()?;
        net::send_to(&leader, &envelope, timeout)?;
        Ok(leader)
    }

    /// Handle an envelope a server sent to us directly.
    pub fn handle_unicast(&self, envelope: Envelope) -> Vec<Notice> {
        match envelope.command {
            Command::State(snapshot) => vec![self.receive_state(*snapshot)],
            command @ (Command::Lead { .. }
            | Command::Vote {
                leader_elected: true,
                ..
            }
            | Command::Down { .. }) => self.apply(command).into_iter().collect(),
            // Pings only check that we're still here
            _ => Vec::new(),
        }
    }

    fn receive_state(&self, snapshot: Snapshot) -> Notice {
        let Snapshot {
            servers,
            clients,
            nicknames,
            leader,
            client_channel,
            ..
        } = snapshot;
        // Announcements may have overtaken the state, those stay
        if self.channel.restore(client_channel) {
            *lock(&self.nicknames) = nicknames;
        } else {
            let mut known = lock(&self.nicknames);
            for (address, nickname) in nicknames {
                known.entry(address).or_insert(nickname);
            }
        }
        if leader.is_some() {
            *lock(&self.leader) = leader.clone();
        }
        Notice::Welcome {
            leader,
            servers: servers.len(),
            clients: clients.len(),
        }
    }

    /// Deliver an envelope from the client group in channel order.
    ///
    /// Missing clocks are requested with `fetch` from the envelope's sender.
    pub fn receive_multicast<F>(&self, envelope: Envelope, mut fetch: F) -> (Arrival, Vec<Notice>)
    where
        F: FnMut(&NodeAddress, u64) -> Option<Command>,
    {
        let sender = envelope.sender.clone();
        let mut notices = Vec::new();
        let arrival = self.channel.receive(
            envelope,
            |clock| fetch(&sender, clock),
            |_, command| notices.extend(self.apply(command)),
        );
        if let Arrival::Delivered { lost, evicted, .. } = &arrival {
            let evicted = usize::try_from(evicted.end - evicted.start).unwrap_or(usize::MAX);
            let missed = lost.len().saturating_add(evicted);
            if missed > 0 {
                notices.push(Notice::Lost(missed));
            }
        }
        (arrival, notices)
    }

    fn name_of(&self, address: &NodeAddress) -> String {
        lock(&self.nicknames)
            .get(address)
            .cloned()
            .unwrap_or_else(|| address.to_string())
    }

    /// Apply a delivered command to our view of the chat.
    fn apply(&self, command: Command) -> Option<Notice> {
        match command {
            Command::Chat {
                sender,
                nickname,
                text,
            } => Some(Notice::Chat {
                name: nickname.unwrap_or_else(|| self.name_of(&sender)),
                text,
            }),
            Command::Join {
                node_type,
                address,
                nickname,
                ..
            } => {
                if let Some(nickname) = nickname {
                    lock(&self.nicknames).insert(address.clone(), nickname);
                }
                Some(Notice::Joined {
                    node_type,
                    name: self.name_of(&address),
                })
            }
            Command::Quit {
                node_type,
                address,
                reason,
                ..
            } => {
                let name = self.name_of(&address);
                lock(&self.nicknames).remove(&address);
                if node_type == NodeKind::Server {
                    lock(&self.leader).take_if(|leader| *leader == address);
                }
                Some(Notice::Left {
                    node_type,
                    name,
                    reason,
                })
            }
            Command::Lead { leader }
            | Command::Vote {
                candidate: leader,
                leader_elected: true,
            } => {
                let previous = lock(&self.leader).replace(leader.clone());
                (previous.as_ref() != Some(&leader)).then_some(Notice::Leader(leader))
            }
            Command::Down { .. } => {
                self.active.store(false, Ordering::SeqCst);
                Some(Notice::Shutdown)
            }
            Command::State(_)
            | Command::Vote { .. }
            | Command::Msg { .. }
            | Command::Ping => None,
        }
    }

    fn fetch(&self, from: &NodeAddress, clock: u64) -> Option<Command> {
        let request = Envelope::unicast(
            Command::Msg {
                channel: Audience::Clients,
                clock,
            },
            self.local.clone(),
        );
        match net::request(from, &request, self.config.connect_timeout) {
            Ok(reply) => Some(reply.command),
            Err(e) => {
                report(&e, &format!("Can't recover message {clock}"));
                None
            }
        }
    }

    /// Spawn the listeners for unicast connections and for the client group.
    pub fn start(
        self: &Arc<Self>,
        listener: TcpListener,
        group: UdpSocket,
    ) -> Result<Vec<JoinHandle<()>>, ClientError> {
        Ok(vec![
            self.spawn("unicast_thread", move |client| client.listen_unicast(&listener))?,
            self.spawn("multicast_thread", move |client| client.listen_multicast(&group))?,
        ])
    }

    fn spawn<F>(self: &Arc<Self>, name: &str, f: F) -> Result<JoinHandle<()>, ClientError>
    where
        F: FnOnce(Arc<Self>) + Send + 'static,
    {
        let client = Arc::clone(self);
        thread::Builder::new()
            .name(format!("{}::{name}", module_path!()))
            .spawn(move || f(client))
            .map_err(|e| ClientError::Spawn {
                name: name.to_owned(),
                source: e,
            })
    }

    fn listen_unicast(&self, listener: &TcpListener) {
        if let Err(e) = listener.set_nonblocking(true) {
            report(&e, "Can't poll the unicast listener");
            return;
        }
        while self.is_active() {
            match listener.accept() {
                Ok((stream, _)) => {
                    for notice in self.serve_connection(stream) {
                        println!("{notice}");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
                Err(e) => report(&e, "Accepting a connection failed"),
            }
        }
    }

    fn serve_connection(&self, mut stream: TcpStream) -> Vec<Notice> {
        let configured = stream
            .set_nonblocking(false)
            .and_then(|()| stream.set_read_timeout(Some(self.config.listen_timeout)));
        if let Err(e) = configured {
            report(&e, "Can't configure an incoming connection");
            return Vec::new();
        }
        match stream.recv() {
            Ok(envelope) => self.handle_unicast(envelope),
            Err(e) => {
                report(&e, "Dropping malformed envelope");
                Vec::new()
            }
        }
    }

    fn listen_multicast(&self, socket: &UdpSocket) {
        let mut buf = vec![0; MAX_DATAGRAM_SIZE];
        while self.is_active() {
            let (len, source) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if net::is_timeout(&e) => continue,
                Err(e) => {
                    report(&e, "Client group listener failed to receive");
                    continue;
                }
            };
            let Ok(envelope) = decode_datagram::<Envelope>(&buf[..len]) else {
                continue;
            };

            let (arrival, notices) =
                self.receive_multicast(envelope, |from, clock| self.fetch(from, clock));
            for notice in notices {
                println!("{notice}");
            }
            match arrival {
                Arrival::Delivered { clock, .. } => {
                    if let Err(e) = net::send_ack(socket, source, clock) {
                        report(&e, &format!("Can't acknowledge message {clock}"));
                    }
                }
                Arrival::Inconsistent(mismatch) => report(&mismatch, "Skipping a message"),
                Arrival::Loopback | Arrival::Unclocked | Arrival::Stale { .. } => {}
            }
        }
    }
}

/// Bind the unicast listener and join the client group.
pub fn bind(config: &Config) -> Result<(TcpListener, UdpSocket), ClientError> {
    let listener =
        TcpListener::bind(("0.0.0.0", config.port)).map_err(|e| ClientError::Bind {
            what: "unicast listener",
            source: e,
        })?;
    let group = net::join_group(config.client_group, config.listen_timeout).map_err(|e| {
        ClientError::Bind {
            what: "client group",
            source: e,
        }
    })?;
    Ok((listener, group))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Unwrap is ok in test code")]
mod tests {
    use super::*;
    use protocol::{ChannelState, SendCbor};
    use std::collections::BTreeSet;

    fn server(n: u8) -> NodeAddress {
        NodeAddress::new(format!("10.0.0.{n}"), 10001)
    }

    fn peer(n: u8) -> NodeAddress {
        NodeAddress::new(format!("10.0.1.{n}"), 20000)
    }

    fn client() -> Client {
        let config = Config {
            nickname: "ada".to_owned(),
            discovery_attempts: 0,
            connect_timeout: Duration::from_millis(200),
            ..Config::default()
        };
        Client::new(config, peer(1))
    }

    fn chat(from: u8, text: &str) -> Command {
        Command::Chat {
            sender: peer(from),
            nickname: None,
            text: text.to_owned(),
        }
    }

    fn join(n: u8, nickname: &str) -> Command {
        Command::Join {
            node_type: NodeKind::Client,
            inform_others: false,
            address: peer(n),
            nickname: Some(nickname.to_owned()),
        }
    }

    fn no_fetch(_: &NodeAddress, _: u64) -> Option<Command> {
        panic!("nothing should be missing");
    }

    #[test]
    fn chat_is_shown_with_the_nickname_from_the_join() {
        let client = client();
        let (_, notices) =
            client.receive_multicast(Envelope::multicast(join(2, "bob"), server(1), 1), no_fetch);
        assert_eq!(
            notices,
            vec![Notice::Joined {
                node_type: NodeKind::Client,
                name: "bob".to_owned()
            }]
        );
        let (arrival, notices) =
            client.receive_multicast(Envelope::multicast(chat(2, "hi"), server(1), 2), no_fetch);
        assert!(matches!(arrival, Arrival::Delivered { clock: 2, .. }));
        assert_eq!(notices[0].to_string(), "bob: hi");
    }

    #[test]
    fn gap_is_fetched_from_the_sender_in_order() {
        let client = client();
        let mut asked = Vec::new();
        let (arrival, notices) = client.receive_multicast(
            Envelope::multicast(chat(2, "third"), server(3), 3),
            |from, clock| {
                asked.push((from.clone(), clock));
                (clock == 2).then(|| chat(2, "second"))
            },
        );
        assert_eq!(asked, vec![(server(3), 1), (server(3), 2)]);
        assert_eq!(
            arrival,
            Arrival::Delivered {
                clock: 3,
                recovered: vec![2],
                lost: vec![1],
                evicted: 1..1,
            }
        );
        let lines: Vec<String> = notices.iter().map(ToString::to_string).collect();
        assert_eq!(lines, ["10.0.1.2:20000: second", "10.0.1.2:20000: third", "* Missed a message"]);
        assert_eq!(client.clock(), 3);
    }

    #[test]
    fn duplicate_is_not_shown_twice() {
        let client = client();
        let envelope = Envelope::multicast(chat(2, "once"), server(1), 1);
        client.receive_multicast(envelope.clone(), no_fetch);
        let (arrival, notices) = client.receive_multicast(envelope, no_fetch);
        assert_eq!(arrival, Arrival::Stale { clock: 1, local: 1 });
        assert!(notices.is_empty());
    }

    #[test]
    fn state_restores_channel_nicknames_and_leader() {
        let client = client();
        let mut client_channel = ChannelState::new(5);
        client_channel.stamp(chat(2, "before we joined"));
        client_channel.stamp(chat(2, "still before"));
        let snapshot = Snapshot {
            servers: BTreeSet::from([server(1), server(2)]),
            clients: BTreeSet::from([peer(1), peer(2)]),
            nicknames: BTreeMap::from([(peer(2), "bob".to_owned())]),
            leader: Some(server(2)),
            server_channel: ChannelState::new(5),
            client_channel,
        };
        let notices = client.handle_unicast(Envelope::unicast(
            Command::State(Box::new(snapshot)),
            server(2),
        ));
        assert_eq!(
            notices,
            vec![Notice::Welcome {
                leader: Some(server(2)),
                servers: 2,
                clients: 2
            }]
        );
        assert_eq!(client.leader(), Some(server(2)));
        assert_eq!(client.clock(), 2);

        // The next message continues after the transferred clock
        let (_, notices) =
            client.receive_multicast(Envelope::multicast(chat(2, "hello"), server(2), 3), no_fetch);
        assert_eq!(notices[0].to_string(), "bob: hello");
    }

    #[test]
    fn leader_changes_are_announced_once() {
        let client = client();
        let lead = Envelope::unicast(Command::Lead { leader: server(4) }, server(4));
        assert_eq!(client.handle_unicast(lead.clone()), vec![Notice::Leader(server(4))]);
        assert!(client.handle_unicast(lead).is_empty());

        let quit = Command::Quit {
            node_type: NodeKind::Server,
            inform_others: false,
            address: server(4),
            reason: QuitReason::Unreachable,
        };
        let (_, notices) =
            client.receive_multicast(Envelope::multicast(quit, server(3), 1), no_fetch);
        assert_eq!(notices[0].to_string(), "* Server 10.0.0.4:10001 is unreachable");
        assert_eq!(client.leader(), None);
    }

    #[test]
    fn down_stops_the_client() {
        let client = client();
        assert!(client.is_active());
        let down = Envelope::multicast(Command::Down { inform_others: false }, server(1), 1);
        let (_, notices) = client.receive_multicast(down, no_fetch);
        assert_eq!(notices, vec![Notice::Shutdown]);
        assert!(!client.is_active());
    }

    #[test]
    fn state_arriving_after_own_join_changes_nothing() {
        let client = client();
        // The announcement of our join overtakes the state sent before it
        let own_join = Envelope::multicast(join(1, "ada"), server(1), 3);
        let (_, notices) = client.receive_multicast(own_join, |_, clock| {
            Some(chat(2, &format!("old {clock}")))
        });
        assert_eq!(notices.len(), 3);
        assert_eq!(client.clock(), 3);

        let mut client_channel = ChannelState::new(5);
        client_channel.stamp(chat(2, "old 1"));
        client_channel.stamp(chat(2, "old 2"));
        let snapshot = Snapshot {
            servers: BTreeSet::from([server(1)]),
            clients: BTreeSet::from([peer(2)]),
            nicknames: BTreeMap::from([(peer(2), "bob".to_owned())]),
            leader: Some(server(1)),
            server_channel: ChannelState::new(5),
            client_channel,
        };
        let state = Envelope::unicast(Command::State(Box::new(snapshot)), server(1));
        assert_eq!(client.handle_unicast(state).len(), 1);
        assert_eq!(client.clock(), 3);
        assert_eq!(client.leader(), Some(server(1)));

        let welcome = Envelope::multicast(chat(2, "welcome"), server(1), 4);
        let (_, notices) = client.receive_multicast(welcome, no_fetch);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].to_string(), "bob: welcome");
        assert_eq!(client.clock(), 4);
    }

    #[test]
    fn quit_stops_listeners_even_without_leader() {
        let client = client();
        assert!(client.quit().is_err());
        assert!(!client.is_active());
    }

    #[test]
    fn known_leader_is_joined_without_discovery() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = client();
        client.set_leader(format!("127.0.0.1:{port}").parse().unwrap());

        assert_eq!(client.join().unwrap(), NodeAddress::new("127.0.0.1", port));
        let (mut stream, _) = listener.accept().unwrap();
        let envelope: Envelope = stream.recv().unwrap();
        assert_eq!(
            envelope.command,
            Command::Join {
                node_type: NodeKind::Client,
                inform_others: true,
                address: peer(1),
                nickname: Some("ada".to_owned()),
            }
        );
    }

    #[test]
    fn ping_needs_no_answer() {
        let client = client();
        assert!(client
            .handle_unicast(Envelope::unicast(Command::Ping, server(1)))
            .is_empty());
    }

    #[test]
    fn chat_goes_to_the_leader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let leader = NodeAddress::from(listener.local_addr().unwrap());
        let client = client();
        *lock(&client.leader) = Some(leader);

        client.send_chat("hello").unwrap();
        let (mut stream, _) = listener.accept().unwrap();
        let envelope: Envelope = stream.recv().unwrap();
        assert_eq!(envelope.sender, peer(1));
        assert_eq!(
            envelope.command,
            Command::Chat {
                sender: peer(1),
                nickname: Some("ada".to_owned()),
                text: "hello".to_owned()
            }
        );
    }

    #[test]
    fn unreachable_leader_is_forgotten() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let leader = NodeAddress::from(listener.local_addr().unwrap());
        drop(listener);
        let client = client();
        *lock(&client.leader) = Some(leader);

        // Without discovery attempts left, the retry has nobody to go to
        let result = client.send_chat("anyone?");
        assert!(matches!(result, Err(ClientError::NoLeader(0))));
        assert_eq!(client.leader(), None);
    }

    #[test]
    fn unicast_reply_roundtrip_for_fetch() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let sender = NodeAddress::from(listener.local_addr().unwrap());
        let responder = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request: Envelope = stream.recv().unwrap();
            assert_eq!(
                request.command,
                Command::Msg {
                    channel: Audience::Clients,
                    clock: 1
                }
            );
            stream
                .send(&Envelope::unicast(chat(2, "replayed"), request.sender))
                .unwrap();
        });

        let client = client();
        assert_eq!(client.fetch(&sender, 1), Some(chat(2, "replayed")));
        responder.join().unwrap();
    }
}
