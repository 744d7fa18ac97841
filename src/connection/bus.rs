use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::connection::connection::Connection;
use crate::connection::file_connection::FileConnection;
use crate::error::BusError;
use crate::registry::type_registry::Handler;
use crate::wire::message::{ClassOfService, SenderId, Timestamp, TypeId};

/// What application code sees of a connection, regardless of whether messages come from live
///  peers or from a log file
#[cfg_attr(test, automock)]
#[async_trait(?Send)]
pub trait MessageBus {
    fn register_sender(&self, name: &str) -> Result<SenderId, BusError>;
    fn register_type(&self, name: &str) -> Result<TypeId, BusError>;
    fn register_handler(&self, type_id: TypeId, sender: SenderId, handler: Handler) -> Result<(), BusError>;
    fn remove_handler(&self, type_id: TypeId, sender: SenderId, handler: &Handler) -> Result<(), BusError>;
    fn pack(&self, type_id: TypeId, sender: SenderId, time: Timestamp, payload: &[u8], class: ClassOfService) -> Result<(), BusError>;
    async fn service(&self, timeout: Duration);
    fn connected(&self) -> bool;
    fn doing_okay(&self) -> bool;
}

macro_rules! delegate_message_bus {
    ($ty:ty) => {
        #[async_trait(?Send)]
        impl MessageBus for $ty {
            fn register_sender(&self, name: &str) -> Result<SenderId, BusError> {
                <$ty>::register_sender(self, name)
            }
            fn register_type(&self, name: &str) -> Result<TypeId, BusError> {
                <$ty>::register_type(self, name)
            }
            fn register_handler(&self, type_id: TypeId, sender: SenderId, handler: Handler) -> Result<(), BusError> {
                <$ty>::register_handler(self, type_id, sender, handler)
            }
            fn remove_handler(&self, type_id: TypeId, sender: SenderId, handler: &Handler) -> Result<(), BusError> {
                <$ty>::remove_handler(self, type_id, sender, handler)
            }
            fn pack(&self, type_id: TypeId, sender: SenderId, time: Timestamp, payload: &[u8], class: ClassOfService) -> Result<(), BusError> {
                <$ty>::pack(self, type_id, sender, time, payload, class)
            }
            async fn service(&self, timeout: Duration) {
                <$ty>::service(self, timeout).await
            }
            fn connected(&self) -> bool {
                <$ty>::connected(self)
            }
            fn doing_okay(&self) -> bool {
                <$ty>::doing_okay(self)
            }
        }
    }
}

delegate_message_bus!(Connection);
delegate_message_bus!(FileConnection);

/// Either kind of connection, as handed out by a
///  [ConnectionDirectory](crate::connection::directory::ConnectionDirectory)
#[derive(Clone)]
pub enum BusHandle {
    Live(Connection),
    File(FileConnection),
}

impl BusHandle {
    fn bus(&self) -> &dyn MessageBus {
        match self {
            BusHandle::Live(c) => c as &dyn MessageBus,
            BusHandle::File(f) => f,
        }
    }

    pub fn as_live(&self) -> Option<&Connection> {
        match self {
            BusHandle::Live(c) => Some(c),
            BusHandle::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileConnection> {
        match self {
            BusHandle::Live(_) => None,
            BusHandle::File(f) => Some(f),
        }
    }

    /// the number of handles sharing the underlying connection
    pub fn handle_count(&self) -> usize {
        match self {
            BusHandle::Live(c) => c.handle_count(),
            BusHandle::File(f) => f.handle_count(),
        }
    }
}

#[async_trait(?Send)]
impl MessageBus for BusHandle {
    fn register_sender(&self, name: &str) -> Result<SenderId, BusError> {
        self.bus().register_sender(name)
    }
    fn register_type(&self, name: &str) -> Result<TypeId, BusError> {
        self.bus().register_type(name)
    }
    fn register_handler(&self, type_id: TypeId, sender: SenderId, handler: Handler) -> Result<(), BusError> {
        self.bus().register_handler(type_id, sender, handler)
    }
    fn remove_handler(&self, type_id: TypeId, sender: SenderId, handler: &Handler) -> Result<(), BusError> {
        self.bus().remove_handler(type_id, sender, handler)
    }
    fn pack(&self, type_id: TypeId, sender: SenderId, time: Timestamp, payload: &[u8], class: ClassOfService) -> Result<(), BusError> {
        self.bus().pack(type_id, sender, time, payload, class)
    }
    async fn service(&self, timeout: Duration) {
        self.bus().service(timeout).await
    }
    fn connected(&self) -> bool {
        self.bus().connected()
    }
    fn doing_okay(&self) -> bool {
        self.bus().doing_okay()
    }
}
