//! One session with one peer: the handshake state machine, and moving messages between the
//!  sockets and the owning connection.

pub mod endpoint;
pub mod io;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointStatus {
    /// terminal - the owning connection drops or recycles the endpoint
    Broken,
    /// a server without peers
    Listening,
    TryingToConnect,
    /// cookies are being exchanged
    CookiePending,
    Connected,
    /// never does network I/O, only logs outgoing messages
    LoggingOnly,
}
