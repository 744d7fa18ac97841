//! Append-only message logs for one endpoint, and the on-disk record format they share with
//!  replay.

use bitflags::bitflags;

pub mod log_sink;
pub mod message_log;
pub mod record;

bitflags! {
    /// Which directions of a session are logged. The bits double as the digit in the cookie and
    ///  the mode in a log description message.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct LogMode: u8 {
        const INCOMING = 1;
        const OUTGOING = 2;
    }
}
