use crate::{
    config::Config,
    console,
    directory::NodeDirectory,
    election::{Election, Role},
    heartbeat::Detector,
    lock, panic_message,
    transport::{NetTransport, Transport},
    ThreadJoin,
};
use protocol::{
    codec::MAX_DATAGRAM_SIZE, decode_datagram, encode_datagram, net, Arrival, Audience, Beacon,
    Envelope, NodeAddress, RecvCbor, ReliableChannel, SendCbor,
};
use std::{
    fmt::Display,
    io::{self, ErrorKind},
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, SystemTime},
};
use thiserror::Error;
use thread_pool::ThreadPool;

mod dispatch;
mod replication;
mod ring;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How an envelope reached the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Unicast,
    /// Delivered in order by the channel of the audience
    Multicast(Audience),
}

impl Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Unicast => write!(f, "unicast"),
            Route::Multicast(audience) => write!(f, "{audience} channel"),
        }
    }
}

#[derive(Error, Debug)]
pub enum StartError {
    #[error("Can't bind {what}")]
    Bind {
        what: &'static str,
        source: io::Error,
    },
    #[error("Can't spawn {name}")]
    Spawn { name: String, source: io::Error },
}

/// Sockets a server listens on, bound before the server starts so that the unicast port is
/// known in advance.
#[derive(Debug)]
pub struct Sockets {
    pub unicast: TcpListener,
    pub broadcast: UdpSocket,
    pub server_group: UdpSocket,
    pub client_group: UdpSocket,
}

impl Sockets {
    pub fn bind(config: &Config) -> Result<Self, StartError> {
        let bind = |what| move |e| StartError::Bind { what, source: e };
        let unicast = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port))
            .map_err(bind("unicast listener"))?;
        let broadcast = net::bind_reusable_udp(config.broadcast_port)
            .and_then(|socket| {
                socket.set_read_timeout(Some(config.listen_timeout))?;
                Ok(socket)
            })
            .map_err(bind("discovery listener"))?;
        let server_group = net::join_group(config.server_group, config.listen_timeout)
            .map_err(bind("server multicast group"))?;
        let client_group = net::join_group(config.client_group, config.listen_timeout)
            .map_err(bind("client multicast group"))?;
        Ok(Self {
            unicast,
            broadcast,
            server_group,
            client_group,
        })
    }

    /// Port of the unicast listener, resolved if the configured port was 0
    pub fn unicast_port(&self) -> io::Result<u16> {
        Ok(self.unicast.local_addr()?.port())
    }
}

/// A chat server
///
/// Shared between all server threads. Each piece of state sits behind its own lock, and no lock
/// is held while talking to the network.
pub struct Server<T: Transport = NetTransport> {
    pub start_time: SystemTime,
    config: Config,
    local: NodeAddress,
    transport: T,
    directory: Mutex<NodeDirectory>,
    election: Mutex<Election>,
    detector: Mutex<Detector>,
    server_channel: ReliableChannel,
    client_channel: ReliableChannel,
    active: AtomicBool,
}

impl<T: Transport> Server<T> {
    /// A server knowing only itself. Call [`Server::start`] to join or found a cluster.
    pub fn new(config: Config, local: NodeAddress, transport: T) -> Self {
        Self {
            start_time: SystemTime::now(),
            directory: Mutex::new(NodeDirectory::new(local.clone())),
            election: Mutex::new(Election::new(local.clone(), config.election_rule)),
            detector: Mutex::new(Detector::new(config.heartbeat_threshold)),
            server_channel: ReliableChannel::new(
                Audience::Servers,
                local.clone(),
                config.log_capacity,
            ),
            client_channel: ReliableChannel::new(
                Audience::Clients,
                local.clone(),
                config.log_capacity,
            ),
            active: AtomicBool::new(true),
            local,
            transport,
            config,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        lock(&self.election).is_leader()
    }

    #[must_use]
    pub fn leader(&self) -> Option<NodeAddress> {
        lock(&self.election).leader().cloned()
    }

    #[must_use]
    pub fn role(&self) -> Role {
        lock(&self.election).role()
    }

    #[must_use]
    pub fn neighbor(&self) -> Option<NodeAddress> {
        lock(&self.directory).neighbor().cloned()
    }

    /// Copy of the membership directory
    #[must_use]
    pub fn directory(&self) -> NodeDirectory {
        lock(&self.directory).clone()
    }

    #[must_use]
    pub fn channel(&self, audience: Audience) -> &ReliableChannel {
        match audience {
            Audience::Servers => &self.server_channel,
            Audience::Clients => &self.client_channel,
        }
    }

    /// Start listening on `sockets`, join the cluster or found one, and serve until shut down.
    ///
    /// Blocks until a shutdown was requested and every thread has stopped.
    pub fn start(self: Arc<Self>, sockets: Sockets) -> Result<(), StartError> {
        let Sockets {
            unicast,
            broadcast,
            server_group,
            client_group,
        } = sockets;

        let pool = ThreadPool::new(
            &format!("{}::unicast_worker", module_path!()),
            self.config.thread_count,
            |name, payload| console::warning!("{name} panicked: {}", panic_message(&*payload)),
        )
        .map_err(|e| StartError::Spawn {
            name: "unicast workers".to_owned(),
            source: e,
        })?;

        let mut threads = vec![
            self.spawn("unicast_listener_thread", move |server| {
                server.listen_unicast(&unicast, &pool);
            })?,
            self.spawn("broadcast_listener_thread", move |server| {
                server.listen_broadcast(&broadcast);
            })?,
            self.spawn("server_group_listener_thread", move |server| {
                server.listen_multicast(&server_group, Audience::Servers);
            })?,
            self.spawn("client_group_listener_thread", move |server| {
                server.listen_multicast(&client_group, Audience::Clients);
            })?,
        ];

        // Prevent program seemingly hanging during discovery
        self.render();
        self.join_cluster();
        threads.push(self.spawn("heartbeat_thread", |server| server.run_heartbeat())?);
        self.render();

        for thread in threads {
            if let Err(msg) = thread.join_and_format_error() {
                console::warning!("{msg}");
            }
        }
        console::log!("Server {} stopped", self.local);
        Ok(())
    }

    fn spawn<F>(self: &Arc<Self>, name: &str, f: F) -> Result<JoinHandle<()>, StartError>
    where
        F: FnOnce(Arc<Self>) + Send + 'static,
    {
        let server = Arc::clone(self);
        thread::Builder::new()
            .name(format!("{}::{name}", module_path!()))
            .spawn(move || f(server))
            .map_err(|e| StartError::Spawn {
                name: name.to_owned(),
                source: e,
            })
    }

    fn listen_unicast(self: &Arc<Self>, listener: &TcpListener, pool: &ThreadPool) {
        // Polled, so that the thread notices a shutdown
        if let Err(e) = listener.set_nonblocking(true) {
            console::error!(&e, "Can't poll the unicast listener");
            return;
        }
        while self.is_active() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let server = Arc::clone(self);
                    if let Err(e) = pool.execute(move || server.serve_connection(stream, peer)) {
                        console::error!(&e, "Can't hand connection from {peer} to a worker");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
                Err(e) => console::error!(&e, "Accepting a connection failed"),
            }
        }
    }

    /// Read one envelope from an accepted connection, and write back the reply if there is one.
    fn serve_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        let configured = stream
            .set_nonblocking(false)
            .and_then(|()| stream.set_read_timeout(Some(self.config.listen_timeout)))
            .and_then(|()| stream.set_write_timeout(Some(self.config.connect_timeout)));
        if let Err(e) = configured {
            console::error!(&e, "Can't configure connection from {peer}");
            return;
        }

        let envelope: Envelope = match stream.recv() {
            Ok(envelope) => envelope,
            Err(e) => {
                console::error!(&e, "Dropping malformed envelope from {peer}");
                return;
            }
        };
        if let Some(reply) = self.dispatch(envelope, Route::Unicast) {
            if let Err(e) = stream.send(&reply) {
                console::error!(&e, "Can't reply to {peer}");
            }
        }
    }

    /// Answer discovery broadcasts while we're the leader.
    fn listen_broadcast(&self, socket: &UdpSocket) {
        let mut buf = [0; 512];
        while self.is_active() {
            let (len, source) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if net::is_timeout(&e) => continue,
                Err(e) => {
                    console::error!(&e, "Discovery listener failed to receive");
                    continue;
                }
            };
            match decode_datagram::<Beacon>(&buf[..len]) {
                Ok(beacon @ Beacon::Solicit { .. }) if beacon.is_genuine() => {
                    if self.is_leader() {
                        self.advertise(socket, source);
                    }
                }
                _ => console::debug!("Ignoring stray datagram from {source}"),
            }
        }
    }

    fn advertise(&self, socket: &UdpSocket, to: SocketAddr) {
        let sent = encode_datagram(&Beacon::advertise(self.local.port))
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
            .and_then(|datagram| socket.send_to(&datagram, to));
        match sent {
            Ok(_) => console::debug!("Answered discovery from {to}"),
            Err(e) => console::error!(&e, "Can't answer discovery from {to}"),
        }
    }

    /// Follow the channel of `audience`. Only the server channel is acknowledged, clients
    /// acknowledge the client channel.
    fn listen_multicast(&self, socket: &UdpSocket, audience: Audience) {
        let mut buf = vec![0; MAX_DATAGRAM_SIZE];
        while self.is_active() {
            let (len, source) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if net::is_timeout(&e) => continue,
                Err(e) => {
                    console::error!(&e, "Listener of the {audience} group failed to receive");
                    continue;
                }
            };
            let envelope: Envelope = match decode_datagram(&buf[..len]) {
                Ok(envelope) => envelope,
                Err(e) => {
                    console::error!(&e, "Dropping malformed datagram from {source}");
                    continue;
                }
            };

            if let Arrival::Delivered { clock, .. } = self.receive_multicast(audience, envelope) {
                if audience == Audience::Servers {
                    if let Err(e) = net::send_ack(socket, source, clock) {
                        console::error!(&e, "Can't acknowledge clock {clock} to {source}");
                    }
                }
            }
        }
    }

    fn run_heartbeat(&self) {
        while self.is_active() {
            thread::sleep(self.config.heartbeat_interval);
            self.heartbeat();
        }
    }

    /// Push the status summary to the terminal UI
    pub(crate) fn render(&self) {
        if console::is_terminal() {
            console::update_state(format!("{self}"));
        }
    }
}

impl<T: Transport> Display for Server<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let write_label = |f: &mut std::fmt::Formatter<'_>, label| write!(f, "    {label:<16} ");

        let directory = self.directory();
        let (role, leader) = (self.role(), self.leader());

        let title = format!("Chat server {}", self.local);
        let mut hline = title.chars().map(|_| '-').collect::<String>();
        hline = format!("\x1B[90m{hline}\x1B[0m");
        writeln!(f, "{hline}\n{title}\n")?;

        write_label(f, "Uptime")?;
        match self.start_time.elapsed() {
            Ok(uptime) => writeln!(f, "{}s", uptime.as_secs())?,
            Err(_) => writeln!(f, "Unknown")?,
        }

        write_label(f, "Current role")?;
        writeln!(f, "{role}")?;

        write_label(f, "Leader")?;
        match leader {
            Some(leader) => writeln!(f, "{leader}")?,
            None => writeln!(f, "Unknown")?,
        }

        write_label(f, "Ring neighbor")?;
        match directory.neighbor() {
            Some(neighbor) => writeln!(f, "{neighbor}")?,
            None => writeln!(f, "None")?,
        }

        write_label(f, "Servers")?;
        write!(f, "[ ")?;
        for (i, server) in directory.servers().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if *server == self.local {
                write!(f, "\x1B[1m{server}\x1B[0m")?;
            } else {
                write!(f, "{server}")?;
            }
        }
        writeln!(f, " ]")?;

        write_label(f, "Clients")?;
        write!(f, "[ ")?;
        for (i, client) in directory.clients().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match directory.nickname(client) {
                Some(nickname) => write!(f, "{nickname} ({client})")?,
                None => write!(f, "{client}")?,
            }
        }
        writeln!(f, " ]")?;

        write_label(f, "Channel clocks")?;
        writeln!(
            f,
            "servers {}, clients {}",
            self.server_channel.clock(),
            self.client_channel.clock()
        )?;

        writeln!(f, "{hline}")
    }
}
