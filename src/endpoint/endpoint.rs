use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use bytes::BytesMut;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::{ConnectionConfig, TransportMode};
use crate::endpoint::io::{bind_tcp_listener, bind_udp, connect_udp, local_ip_towards, rendezvous_request, IoEvent, PendingConnect, RendezvousRequest, WaitTarget};
use crate::endpoint::EndpointStatus;
use crate::error::BusError;
use crate::log::message_log::{LogFilter, MessageLog};
use crate::log::LogMode;
use crate::registry::translation::TranslationTable;
use crate::registry::type_registry::TypeRegistry;
use crate::wire::codec::{encode, encoded_len, try_split_frame, decode_datagram};
use crate::wire::cookie::{check_cookie, requested_log_mode, write_cookie, COOKIE_LEN};
use crate::wire::message::{ClassOfService, Message, SenderId, Timestamp, TypeId};
use crate::wire::system::{Description, LogDescription, SystemMessage, SystemMessageType, UdpDescription};

/// upper bound for a single incoming frame - peers may grow their send buffers, so this is not
///  tied to our own configuration
pub const MAX_FRAME_LEN: usize = 16*1024*1024;

const MAX_DATAGRAM_LEN: usize = 65536;
const READ_CHUNK_LEN: usize = 8192;
const MAX_READS_PER_STEP: usize = 64;

/// A message the connection has to dispatch after a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// translated to local ids
    User(Message),
    /// as received, i.e. with the peer's ids
    System(SystemMessageType, Message),
}

#[derive(Debug, Default)]
pub struct StepOutcome {
    pub deliveries: Vec<Delivery>,
    pub became_connected: bool,
    /// names that were registered locally because the peer described them
    pub new_types: Vec<TypeId>,
    pub new_senders: Vec<SenderId>,
}

struct ClientRendezvous {
    listener: Rc<TcpListener>,
    udp: Rc<UdpSocket>,
    request: bytes::Bytes,
}

enum Role {
    Client {
        remote: SocketAddr,
        /// `None` for TCP-only clients
        rendezvous: Option<ClientRendezvous>,
    },
    /// the server side of a session: either accepted, or calling back a client that sent a
    ///  rendezvous request
    Server {
        callback: Option<SocketAddr>,
    },
    LoggingOnly,
}

pub struct Endpoint {
    seq: usize,
    status: EndpointStatus,
    config: Rc<ConnectionConfig>,
    role: Role,

    peer: Option<SocketAddr>,
    tcp: Option<Rc<TcpStream>>,
    udp_in: Option<Rc<UdpSocket>>,
    udp_out: Option<Rc<UdpSocket>>,
    pending_connect: Option<PendingConnect>,
    last_attempt: Option<Instant>,

    tcp_out: Vec<u8>,
    /// the send buffer's size limit - it only ever grows, and only on request
    tcp_out_capacity: usize,
    udp_out_buf: BytesMut,
    tcp_in: BytesMut,
    udp_in_buf: Vec<u8>,
    tcp_seq: u32,
    udp_seq: u32,

    remote_types: TranslationTable,
    remote_senders: TranslationTable,

    in_log: Option<MessageLog>,
    out_log: Option<MessageLog>,
    log_filters: Vec<LogFilter>,
    peer_log_mode: LogMode,

    /// set by the connection once it reported this endpoint as connected
    pub(crate) connected_reported: bool,
}

impl Endpoint {
    fn new(seq: usize, config: Rc<ConnectionConfig>, role: Role, status: EndpointStatus, tcp_buffer_len: usize) -> Result<Endpoint, BusError> {
        let mut tcp_out = Vec::new();
        tcp_out.try_reserve_exact(tcp_buffer_len)
            .map_err(|e| BusError::Allocation(format!("TCP send buffer of {} bytes: {}", tcp_buffer_len, e)))?;

        Ok(Endpoint {
            seq,
            status,
            role,
            peer: None,
            tcp: None,
            udp_in: None,
            udp_out: None,
            pending_connect: None,
            last_attempt: None,
            tcp_out,
            tcp_out_capacity: tcp_buffer_len,
            udp_out_buf: BytesMut::with_capacity(config.udp_buffer_len),
            tcp_in: BytesMut::with_capacity(READ_CHUNK_LEN),
            udp_in_buf: vec![0; MAX_DATAGRAM_LEN],
            tcp_seq: 0,
            udp_seq: 0,
            remote_types: TranslationTable::new(config.max_types),
            remote_senders: TranslationTable::new(config.max_senders),
            in_log: None,
            out_log: None,
            log_filters: Vec::new(),
            peer_log_mode: LogMode::empty(),
            connected_reported: false,
            config,
        })
    }

    /// A client endpoint for `remote`. With UDP rendezvous, this binds the callback listener and
    ///  the socket for sending requests right away.
    pub fn client(seq: usize, config: Rc<ConnectionConfig>, remote: SocketAddr, tcp_buffer_len: usize) -> Result<Endpoint, BusError> {
        let rendezvous = match config.transport {
            TransportMode::TcpOnly => None,
            TransportMode::UdpRendezvous => {
                let local_ip = local_ip_towards(remote)?;
                let listener = bind_tcp_listener(SocketAddr::new(local_ip, 0))?;
                let udp = connect_udp(local_ip, remote)?;
                let request = rendezvous_request(listener.local_addr()?);
                Some(ClientRendezvous {
                    listener: Rc::new(listener),
                    udp: Rc::new(udp),
                    request,
                })
            }
        };

        let mut result = Self::new(seq, config, Role::Client { remote, rendezvous }, EndpointStatus::TryingToConnect, tcp_buffer_len)?;
        result.peer = Some(remote);
        result.open_local_logs()?;
        Ok(result)
    }

    /// A server endpoint for a TCP connection the peer initiated
    pub fn accepted(seq: usize, config: Rc<ConnectionConfig>, stream: TcpStream, tcp_buffer_len: usize) -> Result<Endpoint, BusError> {
        let mut result = Self::new(seq, config, Role::Server { callback: None }, EndpointStatus::TryingToConnect, tcp_buffer_len)?;
        result.open_local_logs()?;
        result.begin_session(stream)?;
        Ok(result)
    }

    /// A server endpoint that calls back a client which sent a rendezvous request
    pub fn callback(seq: usize, config: Rc<ConnectionConfig>, client: SocketAddr, tcp_buffer_len: usize) -> Result<Endpoint, BusError> {
        let mut result = Self::new(seq, config, Role::Server { callback: Some(client) }, EndpointStatus::TryingToConnect, tcp_buffer_len)?;
        result.peer = Some(client);
        result.open_local_logs()?;
        Ok(result)
    }

    /// An endpoint that only writes an outgoing log. All names registered so far are logged
    ///  right away so the log can be replayed.
    pub fn logging_only(seq: usize, config: Rc<ConnectionConfig>, path: &Path, registry: &TypeRegistry) -> Result<Endpoint, BusError> {
        let tcp_buffer_len = config.tcp_buffer_len;
        let mut result = Self::new(seq, config, Role::LoggingOnly, EndpointStatus::LoggingOnly, tcp_buffer_len)?;
        result.out_log = Some(MessageLog::open(path, LogMode::OUTGOING, &result.config.magic, &result.config.emergency_log_path)?);
        result.queue_descriptions(registry)?;
        Ok(result)
    }

    pub fn status(&self) -> EndpointStatus {
        self.status
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_client(&self) -> bool {
        matches!(self.role, Role::Client { .. })
    }

    pub fn remote_types(&self) -> &TranslationTable {
        &self.remote_types
    }

    pub fn remote_senders(&self) -> &TranslationTable {
        &self.remote_senders
    }

    /// the log mode the peer asked for in its cookie
    pub fn peer_log_mode(&self) -> LogMode {
        self.peer_log_mode
    }

    pub fn tcp_buffer_len(&self) -> usize {
        self.tcp_out_capacity
    }

    /// bytes framed for TCP but not yet written to the socket
    pub fn pending_tcp_bytes(&self) -> usize {
        self.tcp_out.len()
    }

    pub fn mark_broken(&mut self, reason: &BusError) {
        if self.status != EndpointStatus::Broken {
            warn!("dropping connection to {:?}: {}", self.peer, reason);
            self.status = EndpointStatus::Broken;
        }
    }

    fn close(&mut self, reason: &str) {
        info!("connection to {:?} closed: {}", self.peer, reason);
        self.status = EndpointStatus::Broken;
    }

    fn log_path(&self, base: &Path) -> PathBuf {
        if self.seq == 0 {
            return base.to_path_buf();
        }
        let mut name = base.file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!("-{}", self.seq));
        base.with_file_name(name)
    }

    fn open_local_logs(&mut self) -> Result<(), BusError> {
        if let Some(path) = self.config.local_log.incoming.clone() {
            let path = self.log_path(&path);
            self.in_log = Some(self.open_log(&path, LogMode::INCOMING)?);
        }
        if let Some(path) = self.config.local_log.outgoing.clone() {
            let path = self.log_path(&path);
            self.out_log = Some(self.open_log(&path, LogMode::OUTGOING)?);
        }
        Ok(())
    }

    fn open_log(&self, path: &Path, mode: LogMode) -> Result<MessageLog, BusError> {
        let mut log = MessageLog::open(path, mode, &self.config.magic, &self.config.emergency_log_path)?;
        for filter in &self.log_filters {
            log.add_filter(filter.clone());
        }
        Ok(log)
    }

    pub fn add_log_filter(&mut self, filter: LogFilter) {
        for log in self.in_log.iter_mut().chain(self.out_log.iter_mut()) {
            log.add_filter(filter.clone());
        }
        self.log_filters.push(filter);
    }

    /// Writes buffered log entries of both logs, returning the number of entries written
    pub fn flush_logs(&mut self) -> Result<usize, BusError> {
        let mut num_written = 0;
        for log in self.in_log.iter_mut().chain(self.out_log.iter_mut()) {
            num_written += log.flush()?;
        }
        Ok(num_written)
    }

    fn attempt_due(&self, now: Instant) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => now.duration_since(last) >= self.config.reconnect_interval,
        }
    }

    /// What the connection should wait for on behalf of this endpoint
    pub(crate) fn wait_target(&mut self, now: Instant) -> WaitTarget {
        match self.status {
            EndpointStatus::TryingToConnect => self.connect_target(now),
            EndpointStatus::CookiePending | EndpointStatus::Connected => {
                let Some(tcp) = self.tcp.clone() else {
                    return WaitTarget::Idle;
                };
                let udp_in = match self.status {
                    EndpointStatus::Connected => self.udp_in.clone(),
                    _ => None,
                };
                let udp_out = if self.udp_out_buf.is_empty() {
                    None
                }
                else {
                    self.udp_out.clone()
                };
                WaitTarget::Stream {
                    tcp,
                    udp_in,
                    udp_out,
                    want_write: !self.tcp_out.is_empty(),
                }
            }
            EndpointStatus::Broken | EndpointStatus::Listening | EndpointStatus::LoggingOnly => WaitTarget::Idle,
        }
    }

    fn connect_target(&mut self, now: Instant) -> WaitTarget {
        if let Some(pending) = self.pending_connect.take() {
            return WaitTarget::Connect(pending);
        }

        let due = self.attempt_due(now);
        let target = match &self.role {
            Role::Client { rendezvous: Some(r), .. } => {
                let request = due.then(|| RendezvousRequest {
                    udp: r.udp.clone(),
                    payload: r.request.clone(),
                });
                WaitTarget::Accept {
                    listener: r.listener.clone(),
                    request,
                }
            }
            Role::Client { remote, rendezvous: None } if due => {
                debug!("connecting to {}", remote);
                WaitTarget::Connect(PendingConnect::start(*remote, self.config.connect_timeout))
            }
            // a call back is attempted once - the client repeats its request if it fails
            Role::Server { callback: Some(client) } if self.last_attempt.is_none() => {
                debug!("calling back {}", client);
                WaitTarget::Connect(PendingConnect::start(*client, self.config.connect_timeout))
            }
            _ => WaitTarget::Idle,
        };

        if due && !matches!(target, WaitTarget::Idle) {
            self.last_attempt = Some(now);
        }
        target
    }

    /// Advances the state machine after a wait. Failures demote the endpoint to
    ///  [EndpointStatus::Broken] rather than being returned.
    pub(crate) fn step(&mut self, event: IoEvent, registry: &mut TypeRegistry) -> StepOutcome {
        let mut outcome = StepOutcome::default();
        let result = match self.status {
            EndpointStatus::TryingToConnect => self.step_connecting(event),
            EndpointStatus::CookiePending => self.step_cookie_pending(registry, &mut outcome),
            EndpointStatus::Connected => self.step_connected(registry, &mut outcome),
            EndpointStatus::Broken | EndpointStatus::Listening | EndpointStatus::LoggingOnly => Ok(()),
        };
        if let Err(e) = result {
            self.mark_broken(&e);
        }
        outcome
    }

    fn step_connecting(&mut self, event: IoEvent) -> Result<(), BusError> {
        match event {
            IoEvent::Accepted(stream) | IoEvent::Connected(stream) => self.begin_session(stream),
            IoEvent::ConnectPending(pending) => {
                self.pending_connect = Some(pending);
                Ok(())
            }
            IoEvent::ConnectFailed(addr, e) => match self.role {
                Role::Client { .. } => {
                    debug!("connecting to {} failed, retrying in {:?}: {}", addr, self.config.reconnect_interval, e);
                    Ok(())
                }
                _ => Err(e.into()),
            },
            IoEvent::Ready | IoEvent::TimedOut => Ok(()),
        }
    }

    fn begin_session(&mut self, stream: TcpStream) -> Result<(), BusError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        debug!("TCP session with {} established, exchanging cookies", peer);

        self.peer = Some(peer);
        self.tcp = Some(Rc::new(stream));
        write_cookie(&mut self.tcp_out, &self.config.magic, self.config.remote_log.mode);
        self.status = EndpointStatus::CookiePending;
        Ok(())
    }

    fn step_cookie_pending(&mut self, registry: &mut TypeRegistry, outcome: &mut StepOutcome) -> Result<(), BusError> {
        self.flush_tcp()?;
        let eof = self.read_tcp()?;
        if self.tcp_in.len() < COOKIE_LEN {
            if eof {
                return Err(BusError::Handshake("peer closed the connection before sending its cookie".to_string()));
            }
            return Ok(());
        }

        let cookie = self.tcp_in.split_to(COOKIE_LEN);
        check_cookie(&self.config.magic, &cookie)?;
        self.peer_log_mode = requested_log_mode(&cookie)?;
        if !self.peer_log_mode.is_empty() {
            debug!("peer {:?} requests logging {:?}", self.peer, self.peer_log_mode);
        }

        self.finish_handshake(registry)?;
        outcome.became_connected = true;

        // whatever arrived after the cookie
        self.process_incoming(eof, registry, outcome)
    }

    fn finish_handshake(&mut self, registry: &TypeRegistry) -> Result<(), BusError> {
        // descriptions and the like may only be framed once connected
        self.status = EndpointStatus::Connected;

        if self.config.transport == TransportMode::UdpRendezvous {
            let local_ip = match &self.tcp {
                Some(tcp) => tcp.local_addr()?.ip(),
                None => return Err(BusError::Handshake("no TCP connection".to_string())),
            };
            let udp = bind_udp(local_ip)?;
            let port = udp.local_addr()?.port();
            self.udp_in = Some(Rc::new(udp));
            self.queue_system(&SystemMessage::UdpDescription(UdpDescription { port }))?;
        }

        self.queue_descriptions(registry)?;

        let remote_log = &self.config.remote_log;
        if !remote_log.mode.is_empty() {
            let request = SystemMessage::LogDescription(LogDescription {
                mode: remote_log.mode,
                incoming: remote_log.incoming.clone(),
                outgoing: remote_log.outgoing.clone(),
            });
            self.queue_system(&request)?;
        }

        self.flush_tcp()?;
        info!("connected to {:?}", self.peer);
        Ok(())
    }

    /// (re-)describes every registered name to the peer
    fn queue_descriptions(&mut self, registry: &TypeRegistry) -> Result<(), BusError> {
        for sys in local_descriptions(registry) {
            self.queue_system(&sys)?;
        }
        Ok(())
    }

    fn step_connected(&mut self, registry: &mut TypeRegistry, outcome: &mut StepOutcome) -> Result<(), BusError> {
        self.flush_tcp()?;
        self.flush_udp();
        let eof = self.read_tcp()?;
        self.process_incoming(eof, registry, outcome)
    }

    fn process_incoming(&mut self, eof: bool, registry: &mut TypeRegistry, outcome: &mut StepOutcome) -> Result<(), BusError> {
        let mut incoming = Vec::new();
        while let Some(msg) = try_split_frame(&mut self.tcp_in, MAX_FRAME_LEN)? {
            incoming.push(msg);
        }
        self.read_udp(&mut incoming);

        for msg in incoming {
            self.handle_incoming(msg, registry, outcome)?;
            if self.status == EndpointStatus::Broken {
                return Ok(());
            }
        }

        if eof {
            self.close("peer closed the TCP connection");
        }
        Ok(())
    }

    fn handle_incoming(&mut self, msg: Message, registry: &mut TypeRegistry, outcome: &mut StepOutcome) -> Result<(), BusError> {
        trace!("received {:?} from {:?}", msg, self.peer);
        if let Some(log) = &mut self.in_log {
            log.log(&msg, LogMode::INCOMING);
        }

        if msg.type_id.is_system() {
            let Some(kind) = SystemMessageType::of(msg.type_id) else {
                warn!("ignoring message of unknown system type {:?} from {:?}", msg.type_id, self.peer);
                return Ok(());
            };
            if let Some(sys) = SystemMessage::parse(&msg)? {
                self.handle_system(sys, msg.time, registry, outcome)?;
            }
            outcome.deliveries.push(Delivery::System(kind, msg));
            return Ok(());
        }

        match (self.remote_types.local_id(msg.type_id.0), self.remote_senders.local_id(msg.sender.0)) {
            (Some(type_id), Some(sender)) => {
                outcome.deliveries.push(Delivery::User(Message {
                    type_id: TypeId(type_id),
                    sender: SenderId(sender),
                    ..msg
                }));
            }
            _ => {
                trace!("dropping {:?} from {:?}: not described by the peer, or not registered locally", msg, self.peer);
            }
        }
        Ok(())
    }

    fn handle_system(&mut self, sys: SystemMessage, time: Timestamp, registry: &mut TypeRegistry, outcome: &mut StepOutcome) -> Result<(), BusError> {
        match sys {
            SystemMessage::SenderDescription(d) => {
                let local_id = match registry.sender_id(&d.name) {
                    Some(id) => Some(id.0),
                    None if self.config.auto_register_remote_names => {
                        let (id, _) = registry.register_sender(&d.name)?;
                        outcome.new_senders.push(id);
                        Some(id.0)
                    }
                    None => None,
                };
                self.remote_senders.describe(d.id, &d.name, local_id)
            }
            SystemMessage::TypeDescription(d) => {
                let local_id = match registry.type_id(&d.name) {
                    Some(id) => Some(id.0),
                    None if self.config.auto_register_remote_names => {
                        let (id, _) = registry.register_type(&d.name)?;
                        outcome.new_types.push(id);
                        Some(id.0)
                    }
                    None => None,
                };
                self.remote_types.describe(d.id, &d.name, local_id)
            }
            SystemMessage::UdpDescription(d) => {
                if self.config.transport == TransportMode::TcpOnly {
                    debug!("ignoring UDP port {} of {:?} in TCP-only mode", d.port, self.peer);
                    return Ok(());
                }
                let (Some(tcp), Some(peer)) = (&self.tcp, self.peer) else {
                    return Ok(());
                };
                let local_ip = tcp.local_addr()?.ip();
                let remote = SocketAddr::new(peer.ip(), d.port);
                self.udp_out = Some(Rc::new(connect_udp(local_ip, remote)?));
                debug!("sending unreliable messages to {}", remote);
                Ok(())
            }
            SystemMessage::LogDescription(d) => self.open_requested_logs(&d, time, registry),
            SystemMessage::Disconnect => {
                self.close("peer disconnected");
                Ok(())
            }
        }
    }

    /// The peer sends its request after both sides described their names, so a newly opened log
    ///  starts with those descriptions to make it replayable: the peer's as received (with
    ///  `time`, the request's timestamp) for the incoming log, ours for the outgoing log.
    fn open_requested_logs(&mut self, request: &LogDescription, time: Timestamp, registry: &TypeRegistry) -> Result<(), BusError> {
        if request.mode.contains(LogMode::INCOMING) && !request.incoming.is_empty() {
            if self.in_log.is_some() {
                warn!("peer {:?} requested an incoming log, but there is one already", self.peer);
            }
            else {
                let mut log = self.open_log(Path::new(&request.incoming), LogMode::INCOMING)?;
                for sys in peer_descriptions(&self.remote_senders, &self.remote_types) {
                    log.log(&sys.to_message(time), LogMode::INCOMING);
                }
                self.in_log = Some(log);
            }
        }
        if request.mode.contains(LogMode::OUTGOING) && !request.outgoing.is_empty() {
            if self.out_log.is_some() {
                warn!("peer {:?} requested an outgoing log, but there is one already", self.peer);
            }
            else {
                let mut log = self.open_log(Path::new(&request.outgoing), LogMode::OUTGOING)?;
                let now = Timestamp::now();
                for sys in local_descriptions(registry) {
                    log.log(&sys.to_message(now), LogMode::OUTGOING);
                }
                self.out_log = Some(log);
            }
        }
        Ok(())
    }

    /// reads all available data into the receive buffer, returning `true` on EOF
    fn read_tcp(&mut self) -> Result<bool, BusError> {
        let Some(tcp) = self.tcp.clone() else {
            return Ok(false);
        };

        for _ in 0..MAX_READS_PER_STEP {
            self.tcp_in.reserve(READ_CHUNK_LEN);
            match tcp.try_read_buf(&mut self.tcp_in) {
                Ok(0) => return Ok(true),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    /// Malformed datagrams are dropped - UDP is unreliable anyway
    fn read_udp(&mut self, incoming: &mut Vec<Message>) {
        let Some(udp) = self.udp_in.clone() else {
            return;
        };

        for _ in 0..MAX_READS_PER_STEP {
            match udp.try_recv_from(&mut self.udp_in_buf) {
                Ok((len, from)) => match decode_datagram(&self.udp_in_buf[..len]) {
                    Ok(messages) => incoming.extend(messages),
                    Err(e) => warn!("dropping malformed datagram from {}: {}", from, e),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!("error receiving datagram: {}", e);
                    return;
                }
            }
        }
    }

    fn flush_tcp(&mut self) -> Result<(), BusError> {
        let Some(tcp) = self.tcp.clone() else {
            return Ok(());
        };

        while !self.tcp_out.is_empty() {
            match tcp.try_write(&self.tcp_out) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.tcp_out.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Sends the pending datagram if the socket is ready, keeping it otherwise
    fn flush_udp(&mut self) {
        if self.udp_out_buf.is_empty() {
            return;
        }
        let Some(udp) = &self.udp_out else {
            self.udp_out_buf.clear();
            return;
        };

        match udp.try_send(&self.udp_out_buf) {
            Ok(_) => self.udp_out_buf.clear(),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!("dropping datagram to {:?}: {}", self.peer, e);
                self.udp_out_buf.clear();
            }
        }
    }

    /// Frames an outgoing message, logging it. This is a no-op unless the endpoint is connected
    ///  or logging only.
    pub fn queue(&mut self, msg: &Message, class: ClassOfService) -> Result<(), BusError> {
        match self.status {
            EndpointStatus::LoggingOnly => {
                self.log_outgoing(msg);
                Ok(())
            }
            EndpointStatus::Connected => {
                self.log_outgoing(msg);
                self.frame(msg, class)
            }
            _ => Ok(()),
        }
    }

    fn log_outgoing(&mut self, msg: &Message) {
        if let Some(log) = &mut self.out_log {
            log.log(msg, LogMode::OUTGOING);
        }
    }

    fn queue_system(&mut self, sys: &SystemMessage) -> Result<(), BusError> {
        let msg = sys.to_message(Timestamp::now());
        self.queue(&msg, ClassOfService::RELIABLE)
    }

    fn frame(&mut self, msg: &Message, class: ClassOfService) -> Result<(), BusError> {
        let len = encoded_len(msg.payload.len());
        let via_udp = !class.is_reliable()
            && self.udp_out.is_some()
            && len <= self.config.udp_buffer_len;

        if via_udp {
            if self.udp_out_buf.len() + len > self.config.udp_buffer_len {
                self.flush_udp();
                if !self.udp_out_buf.is_empty() {
                    debug!("UDP socket to {:?} not ready - dropping a datagram", self.peer);
                    self.udp_out_buf.clear();
                }
            }
            encode(&mut self.udp_out_buf, msg.time, msg.type_id, msg.sender, &msg.payload, self.udp_seq)?;
            self.udp_seq = self.udp_seq.wrapping_add(1);
            return Ok(());
        }

        if len > self.tcp_out_capacity {
            return Err(BusError::Framing(format!("message of {} bytes exceeds the TCP buffer of {} bytes", len, self.tcp_out_capacity)));
        }
        if self.tcp_out.len() + len > self.tcp_out_capacity {
            self.flush_tcp()?;
            if self.tcp_out.len() + len > self.tcp_out_capacity {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "TCP send buffer is full").into());
            }
        }
        encode(&mut self.tcp_out, msg.time, msg.type_id, msg.sender, &msg.payload, self.tcp_seq)?;
        self.tcp_seq = self.tcp_seq.wrapping_add(1);
        Ok(())
    }

    /// Describes a newly registered local sender to the peer, and maps any description the peer
    ///  sent for the same name before it was known locally
    pub fn announce_sender(&mut self, id: SenderId, name: &str) -> Result<(), BusError> {
        let fixed = self.remote_senders.resolve_name(name, id.0);
        if fixed > 0 {
            debug!("peer {:?} described sender {:?} before it was registered locally", self.peer, name);
        }
        self.queue_system(&SystemMessage::SenderDescription(Description { id: id.0, name: name.to_string() }))
    }

    /// see [Endpoint::announce_sender]
    pub fn announce_type(&mut self, id: TypeId, name: &str) -> Result<(), BusError> {
        let fixed = self.remote_types.resolve_name(name, id.0);
        if fixed > 0 {
            debug!("peer {:?} described type {:?} before it was registered locally", self.peer, name);
        }
        self.queue_system(&SystemMessage::TypeDescription(Description { id: id.0, name: name.to_string() }))
    }

    /// Grows the TCP send buffer. Shrinking is not supported.
    pub fn set_tcp_buffer_len(&mut self, len: usize) -> Result<(), BusError> {
        if len < self.tcp_out_capacity {
            return Err(BusError::Allocation(format!("TCP buffer can not shrink from {} to {} bytes", self.tcp_out_capacity, len)));
        }
        self.tcp_out.try_reserve_exact(len - self.tcp_out.len())
            .map_err(|e| BusError::Allocation(format!("TCP send buffer of {} bytes: {}", len, e)))?;
        self.tcp_out_capacity = len;
        Ok(())
    }

    /// Best effort notice to the peer that this side is going away
    pub fn send_disconnect(&mut self) {
        if self.status != EndpointStatus::Connected {
            return;
        }
        let result = self.queue_system(&SystemMessage::Disconnect)
            .and_then(|_| self.flush_tcp());
        if let Err(e) = result {
            debug!("could not send disconnect notice to {:?}: {}", self.peer, e);
        }
    }

    /// Brings a broken client endpoint back to the start of the handshake. Everything learned
    ///  about the peer is forgotten - it describes its names again after reconnecting.
    pub fn reset_for_reconnect(&mut self) {
        debug!("resetting connection to {:?} for reconnect", self.peer);

        self.status = EndpointStatus::TryingToConnect;
        self.tcp = None;
        self.udp_in = None;
        self.udp_out = None;
        self.pending_connect = None;
        self.tcp_out.clear();
        self.udp_out_buf.clear();
        self.tcp_in.clear();
        self.tcp_seq = 0;
        self.udp_seq = 0;
        self.remote_types.clear();
        self.remote_senders.clear();
        self.peer_log_mode = LogMode::empty();
        self.connected_reported = false;
        if let Role::Client { remote, .. } = &self.role {
            self.peer = Some(*remote);
        }
    }
}

fn local_descriptions(registry: &TypeRegistry) -> Vec<SystemMessage> {
    let senders = registry.senders()
        .map(|(id, name)| SystemMessage::SenderDescription(Description { id: id.0, name: name.to_string() }));
    let types = registry.types()
        .map(|(id, name)| SystemMessage::TypeDescription(Description { id: id.0, name: name.to_string() }));
    senders.chain(types).collect()
}

/// the peer's descriptions with its own ids, ordered by id
fn peer_descriptions(senders: &TranslationTable, types: &TranslationTable) -> Vec<SystemMessage> {
    let senders = senders.entries().into_iter()
        .map(|e| SystemMessage::SenderDescription(Description { id: e.remote_id, name: e.name.clone() }));
    let types = types.entries().into_iter()
        .map(|e| SystemMessage::TypeDescription(Description { id: e.remote_id, name: e.name.clone() }));
    senders.chain(types).collect()
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::log::record::LogContents;
    use crate::test_util::temp_log_path;
    use crate::wire::codec::decode;
    use crate::wire::cookie::cookie_bytes;

    fn config() -> Rc<ConnectionConfig> {
        Rc::new(ConnectionConfig::tcp_only())
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = bind_tcp_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    /// drives an endpoint with short waits until `cond` holds for the endpoint and everything
    ///  it delivered so far
    async fn drive(ep: &mut Endpoint, registry: &mut TypeRegistry, cond: impl Fn(&Endpoint, &[Delivery]) -> bool) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for _ in 0..200 {
            if cond(ep, &deliveries) {
                break;
            }
            let event = ep.wait_target(Instant::now()).wait(Duration::from_millis(10)).await;
            deliveries.extend(ep.step(event, registry).deliveries);
        }
        assert!(cond(ep, &deliveries), "condition not reached, status {:?}", ep.status());
        deliveries
    }

    async fn read_exactly(stream: &TcpStream, n: usize) -> Vec<u8> {
        let mut result = Vec::new();
        while result.len() < n {
            stream.readable().await.unwrap();
            let mut buf = vec![0; n - result.len()];
            match stream.try_read(&mut buf) {
                Ok(0) => panic!("EOF"),
                Ok(len) => result.extend_from_slice(&buf[..len]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("{}", e),
            }
        }
        result
    }

    async fn write_all(stream: &TcpStream, mut buf: &[u8]) {
        while !buf.is_empty() {
            stream.writable().await.unwrap();
            match stream.try_write(buf) {
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("{}", e),
            }
        }
    }

    fn framed(msg: &Message) -> Vec<u8> {
        let mut buf = Vec::new();
        encode(&mut buf, msg.time, msg.type_id, msg.sender, &msg.payload, 0).unwrap();
        buf
    }

    #[tokio::test]
    async fn test_handshake_and_translation() {
        let (ours, theirs) = tcp_pair().await;
        let mut registry = TypeRegistry::new(10, 10);
        registry.register_sender("S").unwrap();
        registry.register_type("T").unwrap();

        let mut ep = Endpoint::accepted(0, config(), ours, 1000).unwrap();
        assert_eq!(ep.status(), EndpointStatus::CookiePending);

        // the peer describes "T" as its type 5 and "S" as its sender 3, then sends a message
        let mut peer_data = cookie_bytes(&config().magic, LogMode::empty());
        peer_data.extend(framed(&SystemMessage::TypeDescription(Description { id: 5, name: "T".to_string() }).to_message(Timestamp::ZERO)));
        peer_data.extend(framed(&SystemMessage::SenderDescription(Description { id: 3, name: "S".to_string() }).to_message(Timestamp::ZERO)));
        peer_data.extend(framed(&Message::new(TypeId(5), SenderId(3), Timestamp::new(9, 0), vec![1, 2, 3])));
        write_all(&theirs, &peer_data).await;

        let expected = Delivery::User(Message::new(TypeId(0), SenderId(0), Timestamp::new(9, 0), vec![1, 2, 3]));
        drive(&mut ep, &mut registry, |_, deliveries| deliveries.contains(&expected)).await;
        assert_eq!(ep.status(), EndpointStatus::Connected);

        // our cookie, then our own descriptions
        let (received, _) = tokio::join!(
            read_exactly(&theirs, COOKIE_LEN + encoded_len(6)),
            drive(&mut ep, &mut registry, |ep, _| ep.pending_tcp_bytes() == 0),
        );
        assert_eq!(&received[..COOKIE_LEN], cookie_bytes(&config().magic, LogMode::empty()).as_slice());
        let (msg, _) = decode(&received[COOKIE_LEN..]).unwrap();
        assert_eq!(SystemMessage::parse(&msg).unwrap(), Some(SystemMessage::SenderDescription(Description { id: 0, name: "S".to_string() })));
    }

    #[tokio::test]
    async fn test_incompatible_cookie_breaks_endpoint() {
        let (ours, theirs) = tcp_pair().await;
        let mut registry = TypeRegistry::new(10, 10);

        let mut ep = Endpoint::accepted(0, config(), ours, 1000).unwrap();
        write_all(&theirs, &cookie_bytes("other: ver. 07.35", LogMode::empty())).await;

        drive(&mut ep, &mut registry, |ep, _| ep.status() == EndpointStatus::Broken).await;
    }

    #[tokio::test]
    async fn test_unmapped_message_is_dropped() {
        let (ours, theirs) = tcp_pair().await;
        let mut registry = TypeRegistry::new(10, 10);
        registry.register_sender("S").unwrap();
        registry.register_type("T").unwrap();

        let mut config = ConnectionConfig::tcp_only();
        config.auto_register_remote_names = false;
        let mut ep = Endpoint::accepted(0, Rc::new(config), ours, 1000).unwrap();

        let mut peer_data = cookie_bytes(&ConnectionConfig::new().magic, LogMode::empty());
        peer_data.extend(framed(&SystemMessage::TypeDescription(Description { id: 0, name: "unknown here".to_string() }).to_message(Timestamp::ZERO)));
        peer_data.extend(framed(&SystemMessage::SenderDescription(Description { id: 0, name: "S".to_string() }).to_message(Timestamp::ZERO)));
        peer_data.extend(framed(&Message::new(TypeId(0), SenderId(0), Timestamp::ZERO, vec![1])));
        peer_data.extend(framed(&SystemMessage::Disconnect.to_message(Timestamp::ZERO)));
        write_all(&theirs, &peer_data).await;

        let deliveries = drive(&mut ep, &mut registry, |ep, _| ep.status() == EndpointStatus::Broken).await;
        assert!(deliveries.iter().all(|d| matches!(d, Delivery::System(..))));
        assert_eq!(deliveries.len(), 3);
        assert_eq!(ep.remote_types().local_id(0), None);
        assert_eq!(registry.type_id("unknown here"), None);
    }

    #[tokio::test]
    async fn test_reset_for_reconnect_forgets_peer_ids() {
        let (ours, theirs) = tcp_pair().await;
        let mut registry = TypeRegistry::new(10, 10);
        registry.register_type("T").unwrap();

        let mut ep = Endpoint::accepted(0, config(), ours, 1000).unwrap();
        let mut peer_data = cookie_bytes(&config().magic, LogMode::empty());
        peer_data.extend(framed(&SystemMessage::TypeDescription(Description { id: 4, name: "T".to_string() }).to_message(Timestamp::ZERO)));
        write_all(&theirs, &peer_data).await;

        drive(&mut ep, &mut registry, |ep, _| ep.remote_types().local_id(4) == Some(0)).await;
        ep.reset_for_reconnect();
        assert_eq!(ep.status(), EndpointStatus::TryingToConnect);
        assert_eq!(ep.remote_types().local_id(4), None);
        assert_eq!(ep.pending_tcp_bytes(), 0);
    }

    #[tokio::test]
    async fn test_stale_remote_ids_are_not_delivered_after_reconnect() {
        let mut registry = TypeRegistry::new(10, 10);
        registry.register_sender("S").unwrap();
        registry.register_type("T").unwrap();

        let (ours, theirs) = tcp_pair().await;
        let mut ep = Endpoint::accepted(0, config(), ours, 1000).unwrap();
        let mut peer_data = cookie_bytes(&config().magic, LogMode::empty());
        peer_data.extend(framed(&SystemMessage::TypeDescription(Description { id: 4, name: "T".to_string() }).to_message(Timestamp::ZERO)));
        peer_data.extend(framed(&SystemMessage::SenderDescription(Description { id: 3, name: "S".to_string() }).to_message(Timestamp::ZERO)));
        write_all(&theirs, &peer_data).await;
        drive(&mut ep, &mut registry, |ep, _| ep.remote_types().local_id(4).is_some() && ep.remote_senders().local_id(3).is_some()).await;

        ep.reset_for_reconnect();
        drop(theirs);

        // a new session, and the peer uses its old ids before describing them again
        let (ours, theirs) = tcp_pair().await;
        let outcome = ep.step(IoEvent::Accepted(ours), &mut registry);
        assert!(outcome.deliveries.is_empty());
        assert_eq!(ep.status(), EndpointStatus::CookiePending);

        let stale = Message::new(TypeId(4), SenderId(3), Timestamp::new(1, 0), vec![1]);
        let mut peer_data = cookie_bytes(&config().magic, LogMode::empty());
        peer_data.extend(framed(&stale));
        peer_data.extend(framed(&SystemMessage::Disconnect.to_message(Timestamp::ZERO)));
        write_all(&theirs, &peer_data).await;

        let deliveries = drive(&mut ep, &mut registry, |ep, _| ep.status() == EndpointStatus::Broken).await;
        assert!(deliveries.iter().all(|d| !matches!(d, Delivery::User(_))));
        assert_eq!(deliveries.len(), 1);
    }

    #[tokio::test]
    async fn test_requested_logs_start_with_descriptions() {
        let in_path = temp_log_path("requested-in");
        let out_path = temp_log_path("requested-out");
        let mut registry = TypeRegistry::new(10, 10);
        registry.register_sender("S").unwrap();
        registry.register_type("T").unwrap();

        let (ours, theirs) = tcp_pair().await;
        let mut ep = Endpoint::accepted(0, config(), ours, 1000).unwrap();

        let mode = LogMode::INCOMING | LogMode::OUTGOING;
        let request = SystemMessage::LogDescription(LogDescription {
            mode,
            incoming: in_path.to_string_lossy().to_string(),
            outgoing: out_path.to_string_lossy().to_string(),
        });
        let mut peer_data = cookie_bytes(&config().magic, mode);
        peer_data.extend(framed(&SystemMessage::SenderDescription(Description { id: 3, name: "S".to_string() }).to_message(Timestamp::ZERO)));
        peer_data.extend(framed(&SystemMessage::TypeDescription(Description { id: 5, name: "T".to_string() }).to_message(Timestamp::ZERO)));
        peer_data.extend(framed(&request.to_message(Timestamp::new(7, 0))));
        peer_data.extend(framed(&Message::new(TypeId(5), SenderId(3), Timestamp::new(8, 0), vec![1, 2, 3])));
        write_all(&theirs, &peer_data).await;

        drive(&mut ep, &mut registry, |_, deliveries| deliveries.iter().any(|d| matches!(d, Delivery::User(_)))).await;
        assert_eq!(ep.peer_log_mode(), mode);
        ep.queue(&Message::new(TypeId(0), SenderId(0), Timestamp::new(9, 0), vec![4]), ClassOfService::RELIABLE).unwrap();
        drop(ep);

        let incoming = LogContents::read(&in_path).unwrap().records;
        assert_eq!(incoming, vec![
            SystemMessage::SenderDescription(Description { id: 3, name: "S".to_string() }).to_message(Timestamp::new(7, 0)),
            SystemMessage::TypeDescription(Description { id: 5, name: "T".to_string() }).to_message(Timestamp::new(7, 0)),
            Message::new(TypeId(5), SenderId(3), Timestamp::new(8, 0), vec![1, 2, 3]),
        ]);

        let outgoing = LogContents::read(&out_path).unwrap().records;
        let parsed = outgoing.iter()
            .map(|m| SystemMessage::parse(m).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(parsed, vec![
            Some(SystemMessage::SenderDescription(Description { id: 0, name: "S".to_string() })),
            Some(SystemMessage::TypeDescription(Description { id: 0, name: "T".to_string() })),
            None,
        ]);
        assert_eq!(outgoing[2].payload.as_ref(), &[4]);

        std::fs::remove_file(&in_path).ok();
        std::fs::remove_file(&out_path).ok();
    }

    #[tokio::test]
    async fn test_tcp_buffer_grows_but_never_shrinks() {
        let (ours, _theirs) = tcp_pair().await;
        let mut ep = Endpoint::accepted(0, config(), ours, 1000).unwrap();

        assert!(matches!(ep.set_tcp_buffer_len(500), Err(BusError::Allocation(_))));
        ep.set_tcp_buffer_len(5000).unwrap();
        assert_eq!(ep.tcp_buffer_len(), 5000);
    }

    #[test]
    fn test_log_path() {
        let mut ep = Endpoint::callback(0, config(), "127.0.0.1:1".parse().unwrap(), 1000).unwrap();
        assert_eq!(ep.log_path(Path::new("/tmp/session.vrpn")), PathBuf::from("/tmp/session.vrpn"));
        ep.seq = 3;
        assert_eq!(ep.log_path(Path::new("/tmp/session.vrpn")), PathBuf::from("/tmp/session.vrpn-3"));
    }
}
