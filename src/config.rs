use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;

use crate::log::LogMode;
use crate::wire::codec::HEADER_LEN;
use crate::wire::cookie::{validate_magic, DEFAULT_MAGIC};

/// The well-known port servers listen on (TCP and UDP) unless configured otherwise
pub const DEFAULT_PORT: u16 = 3883;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// A client asks the server via UDP to call it back over TCP, and both sides use UDP for
    ///  messages that do not require reliable delivery
    UdpRendezvous,
    /// A client connects directly via TCP, and all messages go through TCP. This works through
    ///  NAT and most firewalls.
    TcpOnly,
}

/// Paths for logging sessions locally. Each endpoint gets its own files: the second and later
///  endpoints of a connection append `-<n>` to the file name.
#[derive(Debug, Clone, Default)]
pub struct LocalLogConfig {
    pub incoming: Option<PathBuf>,
    pub outgoing: Option<PathBuf>,
}

/// Asks the peer to log the session on its side
#[derive(Debug, Clone, Default)]
pub struct RemoteLogRequest {
    pub mode: LogMode,
    pub incoming: String,
    pub outgoing: String,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Version string exchanged in the cookie. Peers must agree on everything up to and
    ///  including the last '.', i.e. the major version
    pub magic: String,

    /// initial capacity of each endpoint's TCP send buffer, see
    ///  [crate::connection::connection::Connection::set_tcp_buffer_len]
    pub tcp_buffer_len: usize,

    /// Maximum size of a UDP datagram's payload. With full Ethernet frames and no optional IP
    ///  headers, this is `1500 - 20 - 8 = 1472` for IPV4. Messages that do not fit go through TCP.
    pub udp_buffer_len: usize,

    pub max_senders: usize,
    pub max_types: usize,

    /// Minimum interval between reconnect attempts and between UDP rendezvous requests
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,

    pub transport: TransportMode,

    pub local_log: LocalLogConfig,
    pub remote_log: RemoteLogRequest,

    /// If `true`, a name described by a peer is registered locally if it is not known yet, so its
    ///  messages can be dispatched to [crate::wire::message::TypeId::ANY] handlers and logged
    ///  with local ids
    pub auto_register_remote_names: bool,

    /// where logs go if the configured log file can not be created
    pub emergency_log_path: PathBuf,
}

impl ConnectionConfig {
    pub fn new() -> ConnectionConfig {
        ConnectionConfig {
            magic: DEFAULT_MAGIC.to_string(),
            tcp_buffer_len: 64000,
            udp_buffer_len: 1472,
            max_senders: 2000,
            max_types: 2000,
            reconnect_interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            transport: TransportMode::UdpRendezvous,
            local_log: Default::default(),
            remote_log: Default::default(),
            auto_register_remote_names: true,
            emergency_log_path: std::env::temp_dir().join("vrpn_emergency_log"),
        }
    }

    pub fn tcp_only() -> ConnectionConfig {
        ConnectionConfig {
            transport: TransportMode::TcpOnly,
            ..Self::new()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_magic(&self.magic)?;

        if self.udp_buffer_len < HEADER_LEN {
            bail!("UDP buffer length {} can not hold a single message header", self.udp_buffer_len);
        }
        if self.tcp_buffer_len < HEADER_LEN {
            bail!("TCP buffer length {} can not hold a single message header", self.tcp_buffer_len);
        }
        if self.max_senders == 0 || self.max_types == 0 {
            bail!("registry capacities must be positive");
        }
        if self.max_senders > i32::MAX as usize || self.max_types > i32::MAX as usize {
            bail!("registry capacities must fit into an i32");
        }
        if self.reconnect_interval.is_zero() {
            bail!("reconnect interval must be positive");
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}
