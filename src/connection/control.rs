//! Connection events reported to local handlers as messages. They are registered like any other
//!  name, but they are only ever dispatched locally, never sent to a peer.

use crate::error::BusError;
use crate::registry::type_registry::TypeRegistry;
use crate::wire::message::{Message, SenderId, Timestamp, TypeId};

pub const CONTROL_SENDER: &str = "VRPN Control";
pub const GOT_FIRST_CONNECTION: &str = "VRPN_Connection_Got_First_Connection";
pub const GOT_CONNECTION: &str = "VRPN_Connection_Got_Connection";
pub const DROPPED_CONNECTION: &str = "VRPN_Connection_Dropped_Connection";
pub const DROPPED_LAST_CONNECTION: &str = "VRPN_Connection_Dropped_Last_Connection";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    GotFirstConnection,
    GotConnection,
    DroppedConnection,
    DroppedLastConnection,
}

impl ControlEvent {
    /// The events for one more connected endpoint, in dispatch order
    pub fn for_connect(num_connected_after: usize) -> Vec<ControlEvent> {
        if num_connected_after == 1 {
            vec![ControlEvent::GotFirstConnection, ControlEvent::GotConnection]
        }
        else {
            vec![ControlEvent::GotConnection]
        }
    }

    /// The events for one less connected endpoint, in dispatch order
    pub fn for_drop(num_connected_after: usize) -> Vec<ControlEvent> {
        if num_connected_after == 0 {
            vec![ControlEvent::DroppedConnection, ControlEvent::DroppedLastConnection]
        }
        else {
            vec![ControlEvent::DroppedConnection]
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ControlIds {
    sender: SenderId,
    got_first_connection: TypeId,
    got_connection: TypeId,
    dropped_connection: TypeId,
    dropped_last_connection: TypeId,
}

impl ControlIds {
    pub fn register(registry: &mut TypeRegistry) -> Result<ControlIds, BusError> {
        Ok(ControlIds {
            sender: registry.register_sender(CONTROL_SENDER)?.0,
            got_first_connection: registry.register_type(GOT_FIRST_CONNECTION)?.0,
            got_connection: registry.register_type(GOT_CONNECTION)?.0,
            dropped_connection: registry.register_type(DROPPED_CONNECTION)?.0,
            dropped_last_connection: registry.register_type(DROPPED_LAST_CONNECTION)?.0,
        })
    }

    pub fn message(&self, event: ControlEvent, time: Timestamp) -> Message {
        let type_id = match event {
            ControlEvent::GotFirstConnection => self.got_first_connection,
            ControlEvent::GotConnection => self.got_connection,
            ControlEvent::DroppedConnection => self.dropped_connection,
            ControlEvent::DroppedLastConnection => self.dropped_last_connection,
        };
        Message::new(type_id, self.sender, time, bytes::Bytes::new())
    }
}
