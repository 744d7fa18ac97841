use std::cell::{Cell, RefCell};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::lookup_host;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, DEFAULT_PORT};
use crate::connection::control::{ControlEvent, ControlIds};
use crate::connection::listener::{Listener, ListenerEvent};
use crate::endpoint::endpoint::{Delivery, Endpoint, StepOutcome};
use crate::endpoint::EndpointStatus;
use crate::error::BusError;
use crate::log::message_log::LogFilter;
use crate::registry::type_registry::{dispatch, dispatch_system, Handler, TypeRegistry};
use crate::wire::codec::encoded_len;
use crate::wire::message::{ClassOfService, Message, SenderId, Timestamp, TypeId};
use crate::wire::system::SystemMessageType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Server,
    Client,
    LoggingOnly,
}

struct ConnectionInner {
    config: Rc<ConnectionConfig>,
    kind: ConnectionKind,
    listener: Option<Listener>,
    registry: RefCell<TypeRegistry>,
    endpoints: RefCell<Vec<Endpoint>>,
    next_endpoint_seq: Cell<usize>,
    tcp_buffer_len: Cell<usize>,
    control: ControlIds,
    log_filters: RefCell<Vec<LogFilter>>,
    servicing: Cell<bool>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        // the endpoints' logs flush when they are dropped
        for ep in self.endpoints.get_mut().iter_mut() {
            ep.send_disconnect();
        }
    }
}

/// A live connection: a server accepting any number of peers, a client with exactly one peer it
///  keeps reconnecting to, or a sink that only writes an outgoing log.
///
/// Handles are cheap to clone and share the connection. It is single-threaded: all work happens
///  in [Connection::service], which the application has to call regularly.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<ConnectionInner>,
}

/// A non-owning reference to a [Connection]
#[derive(Clone)]
pub struct WeakConnection(Weak<ConnectionInner>);

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|inner| Connection { inner })
    }
}

/// resets the re-entrancy flag even if a `service()` future is dropped half way
struct ServiceGuard<'a>(&'a Cell<bool>);

impl Drop for ServiceGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Connection {
    fn new(config: ConnectionConfig, kind: ConnectionKind, listener: Option<Listener>) -> Result<Connection, BusError> {
        config.validate()
            .map_err(|e| BusError::Config(format!("{:#}", e)))?;

        let mut registry = TypeRegistry::new(config.max_types, config.max_senders);
        let control = ControlIds::register(&mut registry)?;

        Ok(Connection {
            inner: Rc::new(ConnectionInner {
                tcp_buffer_len: Cell::new(config.tcp_buffer_len),
                config: Rc::new(config),
                kind,
                listener,
                registry: RefCell::new(registry),
                endpoints: RefCell::new(Vec::new()),
                next_endpoint_seq: Cell::new(0),
                control,
                log_filters: RefCell::new(Vec::new()),
                servicing: Cell::new(false),
            })
        })
    }

    /// A server accepting peers on `addr`. With UDP rendezvous, the same port is bound for UDP
    ///  to receive call back requests.
    pub fn listen(config: ConnectionConfig, addr: SocketAddr) -> Result<Connection, BusError> {
        config.validate()
            .map_err(|e| BusError::Config(format!("{:#}", e)))?;
        let listener = Listener::bind(addr, config.transport)?;
        info!("server listening on {}", listener.local_addr()?);
        Self::new(config, ConnectionKind::Server, Some(listener))
    }

    /// A client for a server at `target`, given as "host" or "host:port". The actual connecting
    ///  happens in [Connection::service].
    pub async fn connect(config: ConnectionConfig, target: &str) -> Result<Connection, BusError> {
        let remote = resolve(target).await?;
        Self::connect_to(config, remote)
    }

    pub fn connect_to(config: ConnectionConfig, remote: SocketAddr) -> Result<Connection, BusError> {
        let result = Self::new(config, ConnectionKind::Client, None)?;
        result.add_endpoint(|seq, config, tcp_buffer_len| Endpoint::client(seq, config, remote, tcp_buffer_len))?;
        Ok(result)
    }

    /// A connection without any peer: everything packed on it is written to the log at `path`
    pub fn logging_only(config: ConnectionConfig, path: &Path) -> Result<Connection, BusError> {
        let result = Self::new(config, ConnectionKind::LoggingOnly, None)?;
        let registry = result.inner.registry.borrow();
        result.add_endpoint(|seq, config, _| Endpoint::logging_only(seq, config, path, &registry))?;
        drop(registry);
        Ok(result)
    }

    fn add_endpoint(&self, create: impl FnOnce(usize, Rc<ConnectionConfig>, usize) -> Result<Endpoint, BusError>) -> Result<(), BusError> {
        let seq = self.inner.next_endpoint_seq.get();
        let mut ep = create(seq, self.inner.config.clone(), self.inner.tcp_buffer_len.get())?;
        self.inner.next_endpoint_seq.set(seq + 1);

        for filter in self.inner.log_filters.borrow().iter() {
            ep.add_log_filter(filter.clone());
        }
        self.inner.endpoints.borrow_mut().push(ep);
        Ok(())
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection(Rc::downgrade(&self.inner))
    }

    pub fn kind(&self) -> ConnectionKind {
        self.inner.kind
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// the number of handles sharing this connection
    pub fn handle_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    /// the server's listening address
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    pub fn register_sender(&self, name: &str) -> Result<SenderId, BusError> {
        let (id, added) = self.inner.registry.borrow_mut().register_sender(name)?;
        if added {
            self.for_each_endpoint(|ep| ep.announce_sender(id, name));
        }
        Ok(id)
    }

    pub fn register_type(&self, name: &str) -> Result<TypeId, BusError> {
        let (id, added) = self.inner.registry.borrow_mut().register_type(name)?;
        if added {
            self.for_each_endpoint(|ep| ep.announce_type(id, name));
        }
        Ok(id)
    }

    pub fn sender_id(&self, name: &str) -> Option<SenderId> {
        self.inner.registry.borrow().sender_id(name)
    }

    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        self.inner.registry.borrow().type_id(name)
    }

    pub fn sender_name(&self, id: SenderId) -> Option<String> {
        self.inner.registry.borrow().sender_name(id).map(|s| s.to_string())
    }

    pub fn type_name(&self, id: TypeId) -> Option<String> {
        self.inner.registry.borrow().type_name(id).map(|s| s.to_string())
    }

    /// Registers a callback for messages of `type_id` (or all types for [TypeId::ANY]) from
    ///  `sender` (or all senders for [SenderId::ANY])
    pub fn register_handler(&self, type_id: TypeId, sender: SenderId, handler: Handler) -> Result<(), BusError> {
        self.inner.registry.borrow_mut().add_handler(type_id, sender, handler)
    }

    pub fn remove_handler(&self, type_id: TypeId, sender: SenderId, handler: &Handler) -> Result<(), BusError> {
        self.inner.registry.borrow_mut().remove_handler(type_id, sender, handler)
    }

    /// Replaces the handler that is notified of a system message after it was processed
    pub fn set_system_handler(&self, kind: SystemMessageType, handler: Handler) {
        self.inner.registry.borrow_mut().set_system_handler(kind, handler)
    }

    /// Frames a message for every connected peer and logs it, and then dispatches it to local
    ///  handlers. Messages to a peer are sent in the order they are packed.
    pub fn pack(&self, type_id: TypeId, sender: SenderId, time: Timestamp, payload: &[u8], class: ClassOfService) -> Result<(), BusError> {
        self.inner.registry.borrow().check_ids(type_id, sender)?;

        let len = encoded_len(payload.len());
        if len > self.inner.tcp_buffer_len.get() {
            return Err(BusError::Framing(format!("message of {} bytes exceeds the TCP buffer of {} bytes", len, self.inner.tcp_buffer_len.get())));
        }

        let msg = Message::new(type_id, sender, time, Bytes::copy_from_slice(payload));
        self.for_each_endpoint(|ep| ep.queue(&msg, class));
        dispatch(&self.inner.registry, &msg)
    }

    fn for_each_endpoint(&self, mut f: impl FnMut(&mut Endpoint) -> Result<(), BusError>) {
        for ep in self.inner.endpoints.borrow_mut().iter_mut() {
            if let Err(e) = f(ep) {
                if e.is_fatal_for_endpoint() {
                    ep.mark_broken(&e);
                }
                else {
                    warn!("peer {:?}: {}", ep.peer(), e);
                }
            }
        }
    }

    /// Does all pending work: accepts and (re)connects peers, completes handshakes, sends what
    ///  was packed and dispatches what was received. This waits for I/O for at most `timeout`
    ///  in total.
    pub async fn service(&self, timeout: Duration) {
        let inner = &self.inner;
        if inner.servicing.replace(true) {
            warn!("service() is already running on this connection - ignoring");
            return;
        }
        let _guard = ServiceGuard(&inner.servicing);

        // give the I/O driver a chance to pick up readiness before anything else
        tokio::task::yield_now().await;

        // peers accepted during this call get a share of what is left, not an extra slice
        let deadline = Instant::now() + timeout;
        let num_wait_points = inner.endpoints.borrow().len() + usize::from(inner.listener.is_some());

        if let Some(listener) = &inner.listener {
            let budget = timeout / num_wait_points.max(1) as u32;
            let added = match listener.wait(budget).await {
                ListenerEvent::Accepted(stream) => self.add_endpoint(|seq, config, len| Endpoint::accepted(seq, config, stream, len)),
                ListenerEvent::CallbackRequested(client) if self.has_peer(client) => {
                    debug!("already calling back {} - ignoring repeated request", client);
                    Ok(())
                }
                ListenerEvent::CallbackRequested(client) => self.add_endpoint(|seq, config, len| Endpoint::callback(seq, config, client, len)),
                ListenerEvent::Idle => Ok(()),
            };
            if let Err(e) = added {
                warn!("could not set up a new peer: {}", e);
            }
        }

        let mut idx = 0;
        loop {
            let (target, num_left) = {
                let mut endpoints = inner.endpoints.borrow_mut();
                let num_left = endpoints.len().saturating_sub(idx);
                match endpoints.get_mut(idx) {
                    Some(ep) => (ep.wait_target(Instant::now()), num_left),
                    None => break,
                }
            };
            let budget = deadline.saturating_duration_since(Instant::now()) / num_left.max(1) as u32;
            let event = target.wait(budget).await;

            let outcome = {
                let mut endpoints = inner.endpoints.borrow_mut();
                let mut registry = inner.registry.borrow_mut();
                endpoints[idx].step(event, &mut registry)
            };
            self.on_step_outcome(idx, outcome);
            idx += 1;
        }

        self.reap();
    }

    fn has_peer(&self, addr: SocketAddr) -> bool {
        self.inner.endpoints.borrow().iter()
            .any(|ep| ep.peer() == Some(addr) && ep.status() != EndpointStatus::Broken)
    }

    fn on_step_outcome(&self, idx: usize, outcome: StepOutcome) {
        for id in outcome.new_senders {
            if let Some(name) = self.sender_name(id) {
                self.for_each_endpoint(|ep| ep.announce_sender(id, &name));
            }
        }
        for id in outcome.new_types {
            if let Some(name) = self.type_name(id) {
                self.for_each_endpoint(|ep| ep.announce_type(id, &name));
            }
        }

        if outcome.became_connected {
            let num_connected = {
                let mut endpoints = self.inner.endpoints.borrow_mut();
                endpoints[idx].connected_reported = true;
                endpoints.iter().filter(|ep| ep.connected_reported).count()
            };
            self.dispatch_control(&ControlEvent::for_connect(num_connected));
        }

        for delivery in outcome.deliveries {
            let result = match &delivery {
                Delivery::User(msg) => dispatch(&self.inner.registry, msg),
                Delivery::System(kind, msg) => dispatch_system(&self.inner.registry, *kind, msg),
            };
            if let Err(e) = result {
                self.inner.endpoints.borrow_mut()[idx].mark_broken(&e);
                break;
            }
        }
    }

    fn dispatch_control(&self, events: &[ControlEvent]) {
        for event in events {
            let msg = self.inner.control.message(*event, Timestamp::now());
            if let Err(e) = dispatch(&self.inner.registry, &msg) {
                warn!("handler for {:?} failed: {}", event, e);
            }
        }
    }

    /// Servers forget broken peers, clients start over
    fn reap(&self) {
        let (num_dropped, num_connected) = {
            let mut endpoints = self.inner.endpoints.borrow_mut();
            let mut num_dropped = 0;
            for ep in endpoints.iter_mut().filter(|ep| ep.status() == EndpointStatus::Broken) {
                if ep.connected_reported {
                    ep.connected_reported = false;
                    num_dropped += 1;
                }
                if ep.is_client() {
                    ep.reset_for_reconnect();
                }
            }
            endpoints.retain(|ep| ep.status() != EndpointStatus::Broken);
            (num_dropped, endpoints.iter().filter(|ep| ep.connected_reported).count())
        };

        for i in 0..num_dropped {
            let remaining = num_connected + num_dropped - i - 1;
            self.dispatch_control(&ControlEvent::for_drop(remaining));
        }
        if num_dropped > 0 {
            debug!("{} peer(s) dropped, {} still connected", num_dropped, num_connected);
        }
    }

    /// true if at least one peer completed the handshake
    pub fn connected(&self) -> bool {
        self.inner.endpoints.borrow().iter()
            .any(|ep| ep.status() == EndpointStatus::Connected)
    }

    pub fn doing_okay(&self) -> bool {
        match self.inner.kind {
            ConnectionKind::Server => self.inner.listener.is_some(),
            ConnectionKind::Client | ConnectionKind::LoggingOnly => self.inner.endpoints.borrow().iter()
                .all(|ep| ep.status() != EndpointStatus::Broken),
        }
    }

    pub fn status(&self) -> EndpointStatus {
        match self.inner.kind {
            ConnectionKind::Server => {
                if self.connected() {
                    EndpointStatus::Connected
                }
                else {
                    EndpointStatus::Listening
                }
            }
            ConnectionKind::Client | ConnectionKind::LoggingOnly => self.inner.endpoints.borrow().first()
                .map(|ep| ep.status())
                .unwrap_or(EndpointStatus::Broken),
        }
    }

    pub fn num_endpoints(&self) -> usize {
        self.inner.endpoints.borrow().len()
    }

    /// Adds a filter to all current and future logs. A filter returning true suppresses the
    ///  message in the log - it is still sent. Filters must not call back into this connection,
    ///  see [LogFilter].
    pub fn register_log_filter(&self, filter: LogFilter) {
        for ep in self.inner.endpoints.borrow_mut().iter_mut() {
            ep.add_log_filter(filter.clone());
        }
        self.inner.log_filters.borrow_mut().push(filter);
    }

    /// Writes all buffered log entries, returning how many were written
    pub fn flush_logs(&self) -> Result<usize, BusError> {
        let mut num_written = 0;
        for ep in self.inner.endpoints.borrow_mut().iter_mut() {
            num_written += ep.flush_logs()?;
        }
        Ok(num_written)
    }

    /// Grows the TCP send buffer of all current and future peers
    pub fn set_tcp_buffer_len(&self, len: usize) -> Result<(), BusError> {
        let current = self.inner.tcp_buffer_len.get();
        if len < current {
            return Err(BusError::Allocation(format!("TCP buffer can not shrink from {} to {} bytes", current, len)));
        }
        for ep in self.inner.endpoints.borrow_mut().iter_mut() {
            ep.set_tcp_buffer_len(len)?;
        }
        self.inner.tcp_buffer_len.set(len);
        Ok(())
    }
}

/// Resolves "host" or "host:port", defaulting to the well-known port
pub async fn resolve(target: &str) -> Result<SocketAddr, BusError> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>()
                .map_err(|_| BusError::Config(format!("invalid port in {:?}", target)))?;
            (host, port)
        }
        None => (target, DEFAULT_PORT),
    };
    if host.is_empty() {
        return Err(BusError::Config(format!("no host in {:?}", target)));
    }

    lookup_host((host, port)).await?
        .next()
        .ok_or_else(|| BusError::NotFound(format!("{:?} does not resolve", host)))
}

#[cfg(test)]
mod test {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::config::{RemoteLogRequest, TransportMode};
    use crate::connection::control::{CONTROL_SENDER, DROPPED_CONNECTION, DROPPED_LAST_CONNECTION, GOT_CONNECTION, GOT_FIRST_CONNECTION};
    use crate::connection::file_connection::{FileConnection, PlayOutcome};
    use crate::log::record::LogContents;
    use crate::log::LogMode;
    use crate::registry::type_registry::handler;
    use crate::test_util::{recording_handler, temp_log_path};

    fn server(transport: TransportMode) -> Connection {
        let mut config = ConnectionConfig::new();
        config.transport = transport;
        Connection::listen(config, "127.0.0.1:0".parse().unwrap()).unwrap()
    }

    fn client(server: &Connection, transport: TransportMode) -> Connection {
        let mut config = ConnectionConfig::new();
        config.transport = transport;
        config.reconnect_interval = Duration::from_millis(50);
        Connection::connect_to(config, server.local_addr().unwrap()).unwrap()
    }

    async fn service_until(connections: &[&Connection], cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            for c in connections {
                c.service(Duration::from_millis(2)).await;
            }
        }
        assert!(cond(), "condition not reached");
    }

    #[rstest]
    #[case::tcp_only(TransportMode::TcpOnly, ClassOfService::RELIABLE)]
    #[case::rendezvous(TransportMode::UdpRendezvous, ClassOfService::RELIABLE)]
    #[case::rendezvous_unreliable(TransportMode::UdpRendezvous, ClassOfService::LOW_LATENCY)]
    #[tokio::test]
    async fn test_client_server_roundtrip(#[case] transport: TransportMode, #[case] class: ClassOfService) {
        let server = server(transport);
        let client = client(&server, transport);

        // the server registers the names in a different order, so the ids differ
        let server_type = server.register_type("other").and_then(|_| server.register_type("T")).unwrap();
        let server_sender = server.register_sender("S").unwrap();
        let (received, h) = recording_handler();
        server.register_handler(server_type, server_sender, h).unwrap();

        let client_sender = client.register_sender("S").unwrap();
        let client_type = client.register_type("T").unwrap();
        assert_ne!(client_type, server_type);

        service_until(&[&server, &client], || server.connected() && client.connected()).await;
        // let the descriptions arrive before sending on a possibly unreliable channel
        for _ in 0..5 {
            server.service(Duration::from_millis(2)).await;
            client.service(Duration::from_millis(2)).await;
        }

        for _ in 0..20 {
            client.pack(client_type, client_sender, Timestamp::new(1, 2), &[1, 2, 3], class).unwrap();
            client.service(Duration::from_millis(2)).await;
            server.service(Duration::from_millis(5)).await;
            if !received.borrow().is_empty() {
                break;
            }
        }

        let received = received.borrow();
        assert!(!received.is_empty());
        assert_eq!(received[0].type_id, server_type);
        assert_eq!(received[0].sender, server_sender);
        assert_eq!(received[0].time, Timestamp::new(1, 2));
        assert_eq!(received[0].payload.as_ref(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_pack_is_local_dispatch_too() {
        let conn = Connection::logging_only(ConnectionConfig::new(), &temp_log_path("local")).unwrap();
        let t = conn.register_type("T").unwrap();
        let s = conn.register_sender("S").unwrap();
        let (received, h) = recording_handler();
        conn.register_handler(TypeId::ANY, SenderId::ANY, h).unwrap();

        conn.pack(t, s, Timestamp::ZERO, b"x", ClassOfService::RELIABLE).unwrap();
        assert_eq!(received.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_messages_packed_by_handlers_follow_the_trigger() {
        let server = server(TransportMode::TcpOnly);
        let client = client(&server, TransportMode::TcpOnly);

        let trigger = client.register_type("trigger").unwrap();
        let reaction = client.register_type("reaction").unwrap();
        let s = client.register_sender("S").unwrap();
        let weak = client.downgrade();
        client.register_handler(trigger, s, handler(move |msg| {
            if let Some(client) = weak.upgrade() {
                client.pack(reaction, msg.sender, msg.time, b"r", ClassOfService::RELIABLE)?;
            }
            Ok(())
        })).unwrap();

        let (received, h) = recording_handler();
        for name in ["trigger", "reaction"] {
            let type_id = server.register_type(name).unwrap();
            server.register_handler(type_id, SenderId::ANY, h.clone()).unwrap();
        }

        service_until(&[&server, &client], || server.connected() && client.connected()).await;
        client.pack(trigger, s, Timestamp::ZERO, b"t", ClassOfService::RELIABLE).unwrap();
        service_until(&[&client, &server], || received.borrow().len() >= 2).await;

        let names = received.borrow().iter()
            .map(|m| server.type_name(m.type_id).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["trigger".to_string(), "reaction".to_string()]);
    }

    #[tokio::test]
    async fn test_control_events() {
        let server = server(TransportMode::TcpOnly);
        let events = Rc::new(RefCell::new(Vec::new()));
        let control_sender = server.sender_id(CONTROL_SENDER).unwrap();
        for name in [GOT_FIRST_CONNECTION, GOT_CONNECTION, DROPPED_CONNECTION, DROPPED_LAST_CONNECTION] {
            let events = events.clone();
            server.register_handler(server.type_id(name).unwrap(), control_sender, handler(move |_| {
                events.borrow_mut().push(name);
                Ok(())
            })).unwrap();
        }

        let client_1 = client(&server, TransportMode::TcpOnly);
        service_until(&[&server, &client_1], || server.connected() && client_1.connected()).await;
        let client_2 = client(&server, TransportMode::TcpOnly);
        service_until(&[&server, &client_2], || client_2.connected() && server.num_endpoints() == 2).await;
        service_until(&[&server], || events.borrow().len() == 3).await;

        drop(client_1);
        drop(client_2);
        service_until(&[&server], || events.borrow().len() == 6).await;

        assert_eq!(*events.borrow(), vec![
            GOT_FIRST_CONNECTION,
            GOT_CONNECTION,
            GOT_CONNECTION,
            DROPPED_CONNECTION,
            DROPPED_CONNECTION,
            DROPPED_LAST_CONNECTION,
        ]);
        assert_eq!(server.num_endpoints(), 0);
        assert_eq!(server.status(), EndpointStatus::Listening);
    }

    #[tokio::test]
    async fn test_client_reconnects_with_fresh_translation() {
        let server_1 = server(TransportMode::TcpOnly);
        let addr = server_1.local_addr().unwrap();
        server_1.register_type("T").unwrap();
        let client = client(&server_1, TransportMode::TcpOnly);
        let t = client.register_type("T").unwrap();
        let s = client.register_sender("S").unwrap();

        service_until(&[&server_1, &client], || client.connected()).await;
        drop(server_1);
        service_until(&[&client], || !client.connected()).await;
        assert_eq!(client.status(), EndpointStatus::TryingToConnect);

        // a new server on the same port, with different ids for the same names
        let server_2 = Connection::listen(ConnectionConfig::tcp_only(), addr).unwrap();
        server_2.register_type("padding").unwrap();
        let server_t = server_2.register_type("T").unwrap();
        let server_s = server_2.register_sender("S").unwrap();
        let (received, h) = recording_handler();
        server_2.register_handler(server_t, server_s, h).unwrap();

        service_until(&[&server_2, &client], || client.connected() && server_2.connected()).await;
        client.pack(t, s, Timestamp::ZERO, b"again", ClassOfService::RELIABLE).unwrap();
        service_until(&[&client, &server_2], || !received.borrow().is_empty()).await;
        assert_eq!(received.borrow()[0].payload.as_ref(), b"again");
    }

    #[tokio::test]
    async fn test_service_with_a_peer_arriving_stays_within_timeout() {
        let server = server(TransportMode::TcpOnly);
        let client = client(&server, TransportMode::TcpOnly);
        service_until(&[&server, &client], || server.connected() && client.connected()).await;

        let addr = server.local_addr().unwrap();
        let start = Instant::now();
        let (_, late) = tokio::join!(
            server.service(Duration::from_millis(300)),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                tokio::net::TcpStream::connect(addr).await
            },
        );
        let _late = late.unwrap();

        assert_eq!(server.num_endpoints(), 2);
        assert!(start.elapsed() < Duration::from_millis(400), "service took {:?}", start.elapsed());
    }

    #[tokio::test]
    async fn test_failing_handler_drops_the_peer() {
        let server = server(TransportMode::TcpOnly);
        let t = server.register_type("T").unwrap();
        server.register_handler(t, SenderId::ANY, handler(|_| anyhow::bail!("rejected"))).unwrap();

        let client = client(&server, TransportMode::TcpOnly);
        let client_t = client.register_type("T").unwrap();
        let s = client.register_sender("S").unwrap();
        service_until(&[&server, &client], || server.connected() && client.connected()).await;

        client.pack(client_t, s, Timestamp::ZERO, b"", ClassOfService::RELIABLE).unwrap();
        service_until(&[&client, &server], || server.num_endpoints() == 0).await;
    }

    #[test]
    fn test_pack_validates() {
        let conn = Connection::logging_only(ConnectionConfig::new(), &temp_log_path("validate")).unwrap();
        let t = conn.register_type("T").unwrap();
        let s = conn.register_sender("S").unwrap();

        assert!(matches!(conn.pack(TypeId(-3), s, Timestamp::ZERO, b"", ClassOfService::RELIABLE), Err(BusError::InvalidId(_))));
        assert!(matches!(conn.pack(t, SenderId(99), Timestamp::ZERO, b"", ClassOfService::RELIABLE), Err(BusError::InvalidId(_))));
        let too_big = vec![0u8; conn.config().tcp_buffer_len];
        assert!(matches!(conn.pack(t, s, Timestamp::ZERO, &too_big, ClassOfService::RELIABLE), Err(BusError::Framing(_))));

        conn.set_tcp_buffer_len(2 * too_big.len()).unwrap();
        conn.pack(t, s, Timestamp::ZERO, &too_big, ClassOfService::RELIABLE).unwrap();
        assert!(matches!(conn.set_tcp_buffer_len(10), Err(BusError::Allocation(_))));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = ConnectionConfig::new();
        config.max_types = 0;
        assert!(matches!(Connection::logging_only(config, &temp_log_path("invalid")), Err(BusError::Config(_))));
    }

    #[test]
    fn test_logging_only_writes_names_and_messages() {
        let path = temp_log_path("logging-only");
        {
            let conn = Connection::logging_only(ConnectionConfig::new(), &path).unwrap();
            assert_eq!(conn.status(), EndpointStatus::LoggingOnly);
            let t = conn.register_type("T").unwrap();
            let s = conn.register_sender("S").unwrap();
            let suppressed = conn.register_type("suppressed").unwrap();
            conn.register_log_filter(Rc::new(move |msg: &Message| msg.type_id == suppressed));

            conn.pack(t, s, Timestamp::new(1, 0), b"a", ClassOfService::RELIABLE).unwrap();
            conn.pack(suppressed, s, Timestamp::new(2, 0), b"b", ClassOfService::RELIABLE).unwrap();
            conn.pack(t, s, Timestamp::new(3, 0), b"c", ClassOfService::RELIABLE).unwrap();
            assert!(conn.flush_logs().unwrap() > 0);
        }

        let contents = LogContents::read(&path).unwrap();
        let payloads = contents.records.iter()
            .filter(|m| !m.type_id.is_system())
            .map(|m| m.payload.clone())
            .collect::<Vec<_>>();
        assert_eq!(payloads, vec![Bytes::from_static(b"a"), Bytes::from_static(b"c")]);
        std::fs::remove_file(&path).ok();
    }

    fn replayed_payloads(path: &Path) -> Vec<Bytes> {
        let file = FileConnection::open(ConnectionConfig::new(), path).unwrap();
        let t = file.register_type("T").unwrap();
        let s = file.register_sender("S").unwrap();
        let (received, h) = recording_handler();
        file.register_handler(t, s, h).unwrap();
        while file.play_one().unwrap() != PlayOutcome::Eof {}

        let received = received.borrow();
        received.iter().map(|m| m.payload.clone()).collect()
    }

    #[tokio::test]
    async fn test_logs_requested_by_the_peer_can_be_replayed() {
        let in_path = temp_log_path("session-in");
        let out_path = temp_log_path("session-out");

        let server = server(TransportMode::TcpOnly);
        let mut config = ConnectionConfig::tcp_only();
        config.remote_log = RemoteLogRequest {
            mode: LogMode::INCOMING | LogMode::OUTGOING,
            incoming: in_path.to_string_lossy().to_string(),
            outgoing: out_path.to_string_lossy().to_string(),
        };
        let client = Connection::connect_to(config, server.local_addr().unwrap()).unwrap();

        let client_type = client.register_type("T").unwrap();
        let client_sender = client.register_sender("S").unwrap();
        let server_type = server.register_type("T").unwrap();
        let server_sender = server.register_sender("S").unwrap();
        let (received, h) = recording_handler();
        server.register_handler(server_type, server_sender, h).unwrap();

        service_until(&[&server, &client], || server.connected() && client.connected()).await;
        client.pack(client_type, client_sender, Timestamp::now(), &[1, 2, 3], ClassOfService::RELIABLE).unwrap();
        service_until(&[&client, &server], || !received.borrow().is_empty()).await;
        server.pack(server_type, server_sender, Timestamp::now(), &[4], ClassOfService::RELIABLE).unwrap();
        server.flush_logs().unwrap();

        assert_eq!(replayed_payloads(&in_path), vec![Bytes::from_static(&[1, 2, 3])]);
        assert_eq!(replayed_payloads(&out_path), vec![Bytes::from_static(&[4])]);
        std::fs::remove_file(&in_path).ok();
        std::fs::remove_file(&out_path).ok();
    }

    #[test]
    fn test_log_filter_follows_application_state() {
        let path = temp_log_path("filter-state");
        let paused = Rc::new(Cell::new(false));
        {
            let conn = Connection::logging_only(ConnectionConfig::new(), &path).unwrap();
            let t = conn.register_type("T").unwrap();
            let s = conn.register_sender("S").unwrap();
            let filter_paused = paused.clone();
            conn.register_log_filter(Rc::new(move |_: &Message| filter_paused.get()));

            for (i, pause) in [false, true, false].into_iter().enumerate() {
                paused.set(pause);
                conn.pack(t, s, Timestamp::new(i as u32, 0), &[i as u8], ClassOfService::RELIABLE).unwrap();
            }
        }

        let contents = LogContents::read(&path).unwrap();
        let payloads = contents.records.iter()
            .filter(|m| !m.type_id.is_system())
            .map(|m| m.payload.clone())
            .collect::<Vec<_>>();
        assert_eq!(payloads, vec![Bytes::from_static(&[0]), Bytes::from_static(&[2])]);
        std::fs::remove_file(&path).ok();
    }

    #[rstest]
    #[case::socket_addr("127.0.0.1:1234", "127.0.0.1:1234")]
    #[case::ip_only("127.0.0.1", "127.0.0.1:3883")]
    #[case::localhost("localhost:77", "127.0.0.1:77")]
    #[tokio::test]
    async fn test_resolve(#[case] target: &str, #[case] expected: &str) {
        let addr = resolve(target).await.unwrap();
        assert_eq!(addr.port(), expected.parse::<SocketAddr>().unwrap().port());
        assert!(addr.ip().is_loopback());
    }

    #[rstest]
    #[case::bad_port("localhost:x")]
    #[case::no_host(":77")]
    #[tokio::test]
    async fn test_resolve_invalid(#[case] target: &str) {
        assert!(matches!(resolve(target).await, Err(BusError::Config(_))));
    }
}
