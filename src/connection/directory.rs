use std::path::PathBuf;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::config::{ConnectionConfig, DEFAULT_PORT};
use crate::connection::bus::BusHandle;
use crate::connection::connection::{Connection, WeakConnection};
use crate::connection::file_connection::{FileConnection, WeakFileConnection};
use crate::error::BusError;

/// What a connection name refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    Live {
        host: String,
        port: u16,
    },
    File(PathBuf),
}

impl ConnectionTarget {
    /// Accepts "host", "host:port", "tcp://host[:port]", "file:path" and "file://path". A device
    ///  prefix as in "Tracker0@host" is ignored.
    pub fn parse(name: &str) -> Result<ConnectionTarget, BusError> {
        let name = match name.split_once('@') {
            Some((_device, location)) => location,
            None => name,
        };

        if let Some(path) = name.strip_prefix("file://").or_else(|| name.strip_prefix("file:")) {
            if path.is_empty() {
                return Err(BusError::Config(format!("no path in {:?}", name)));
            }
            return Ok(ConnectionTarget::File(PathBuf::from(path)));
        }

        let location = name.strip_prefix("tcp://").unwrap_or(name);
        let (host, port) = match location.rsplit_once(':') {
            // a bare IPv6 address has colons of its own
            Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
                let port = port.parse::<u16>()
                    .map_err(|_| BusError::Config(format!("invalid port in {:?}", name)))?;
                (host, port)
            }
            _ => (location, DEFAULT_PORT),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(BusError::Config(format!("no host in {:?}", name)));
        }

        Ok(ConnectionTarget::Live {
            host: host.to_string(),
            port,
        })
    }

    /// the name under which connections to this target are shared
    pub fn key(&self) -> String {
        match self {
            ConnectionTarget::Live { host, port } => format!("{}:{}", host, port),
            ConnectionTarget::File(path) => format!("file:{}", path.display()),
        }
    }

    fn address(host: &str, port: u16) -> String {
        if host.contains(':') {
            format!("[{}]:{}", host, port)
        }
        else {
            format!("{}:{}", host, port)
        }
    }
}

#[derive(Clone)]
enum WeakHandle {
    Live(WeakConnection),
    File(WeakFileConnection),
}

impl WeakHandle {
    fn of(handle: &BusHandle) -> WeakHandle {
        match handle {
            BusHandle::Live(c) => WeakHandle::Live(c.downgrade()),
            BusHandle::File(f) => WeakHandle::File(f.downgrade()),
        }
    }

    fn upgrade(&self) -> Option<BusHandle> {
        match self {
            WeakHandle::Live(c) => c.upgrade().map(BusHandle::Live),
            WeakHandle::File(f) => f.upgrade().map(BusHandle::File),
        }
    }
}

/// Shares connections by name. The directory holds connections weakly: a connection is reused
///  while anybody holds a handle to it, and goes away when the last handle is dropped.
pub struct ConnectionDirectory {
    config: ConnectionConfig,
    entries: FxHashMap<String, WeakHandle>,
}

impl ConnectionDirectory {
    /// `config` is used for every connection the directory opens
    pub fn new(config: ConnectionConfig) -> ConnectionDirectory {
        ConnectionDirectory {
            config,
            entries: FxHashMap::default(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<BusHandle> {
        let key = ConnectionTarget::parse(name).ok()?.key();
        self.entries.get(&key)?.upgrade()
    }

    /// Makes an existing connection available under `name`, replacing whatever was there
    pub fn insert(&mut self, name: &str, handle: &BusHandle) -> Result<(), BusError> {
        let key = ConnectionTarget::parse(name)?.key();
        self.entries.insert(key, WeakHandle::of(handle));
        Ok(())
    }

    /// Returns the connection for `name`, opening it if there is none
    pub async fn get_or_open(&mut self, name: &str) -> Result<BusHandle, BusError> {
        let target = ConnectionTarget::parse(name)?;
        let key = target.key();
        if let Some(existing) = self.entries.get(&key).and_then(|h| h.upgrade()) {
            return Ok(existing);
        }

        debug!("opening connection {:?}", key);
        let handle = match &target {
            ConnectionTarget::Live { host, port } => BusHandle::Live(
                Connection::connect(self.config.clone(), &ConnectionTarget::address(host, *port)).await?
            ),
            ConnectionTarget::File(path) => BusHandle::File(FileConnection::open(self.config.clone(), path)?),
        };
        self.entries.insert(key, WeakHandle::of(&handle));
        Ok(handle)
    }

    /// Forgets entries whose connection is gone, returning how many were removed
    pub fn prune(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, h| h.upgrade().is_some());
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
