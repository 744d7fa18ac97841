use std::fmt::{Debug, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use bytes::Bytes;


/// A message type id, local to one process. Non-negative ids are user types handed out by the
///  registry, negative ids are the fixed system types (see [crate::wire::system]).
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TypeId(pub i32);

impl TypeId {
    /// wildcard for handler registration - never sent on the wire
    pub const ANY: TypeId = TypeId(-1);

    pub fn is_system(self) -> bool {
        self.0 < 0
    }

    pub(crate) fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl Debug for TypeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "T#{}", self.0)
    }
}

/// A sender id, local to one process
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SenderId(pub i32);

impl SenderId {
    /// wildcard for handler registration - never sent on the wire
    pub const ANY: SenderId = SenderId(-1);

    pub(crate) fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl Debug for SenderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "S#{}", self.0)
    }
}


/// Wall-clock time with microsecond resolution, as it is transmitted in message headers and log
///  records. `usecs` is always normalized to be below one million, so the derived ordering is
///  chronological.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Timestamp {
    pub secs: u32,
    pub usecs: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { secs: 0, usecs: 0 };
    pub const MAX: Timestamp = Timestamp { secs: u32::MAX, usecs: 999_999 };

    const USECS_PER_SEC: u32 = 1_000_000;

    pub fn new(secs: u32, usecs: u32) -> Timestamp {
        Timestamp {
            secs: secs.saturating_add(usecs / Self::USECS_PER_SEC),
            usecs: usecs % Self::USECS_PER_SEC,
        }
    }

    pub fn now() -> Timestamp {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::from_duration(since_epoch)
    }

    pub fn from_duration(d: Duration) -> Timestamp {
        Timestamp {
            secs: u32::try_from(d.as_secs()).unwrap_or(u32::MAX),
            usecs: d.subsec_micros(),
        }
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.secs.into()) + Duration::from_micros(self.usecs.into())
    }

    pub fn saturating_add(self, d: Duration) -> Timestamp {
        Self::from_duration(self.as_duration().saturating_add(d))
    }

    /// the time elapsed from `earlier` to `self`, or zero if `earlier` is actually later
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        self.as_duration().saturating_sub(earlier.as_duration())
    }
}


/// The atomic unit of communication. Ids are local to whichever side holds the message: incoming
///  messages are translated to local ids before they are dispatched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub type_id: TypeId,
    pub sender: SenderId,
    pub time: Timestamp,
    pub payload: Bytes,
}

impl Message {
    pub fn new(type_id: TypeId, sender: SenderId, time: Timestamp, payload: impl Into<Bytes>) -> Message {
        Message {
            type_id,
            sender,
            time,
            payload: payload.into(),
        }
    }
}


bitflags! {
    /// Requested delivery guarantees for a packed message. Only [ClassOfService::RELIABLE] makes a
    ///  difference at the moment: it forces TCP, everything else goes via UDP when the peer has
    ///  announced a UDP port.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ClassOfService: u32 {
        const RELIABLE = 1 << 0;
        const FIXED_LATENCY = 1 << 1;
        const LOW_LATENCY = 1 << 2;
        const FIXED_THROUGHPUT = 1 << 3;
        const HIGH_THROUGHPUT = 1 << 4;
    }
}

impl ClassOfService {
    pub fn is_reliable(self) -> bool {
        self.contains(ClassOfService::RELIABLE)
    }
}
