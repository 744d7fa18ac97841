use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::BusError;
use crate::util::safe_converter::PrecheckedCast;
use crate::wire::message::{Message, SenderId, TypeId};
use crate::wire::system::SystemMessageType;

/// A callback for incoming (or locally packed) messages. Ids in the message are local ids.
///
/// Returning an error aborts the dispatch pass, and the endpoint the message came from is
///  treated as broken.
pub type Handler = Rc<dyn Fn(&Message) -> anyhow::Result<()>>;

/// Wraps a closure as a [Handler]
pub fn handler(f: impl Fn(&Message) -> anyhow::Result<()> + 'static) -> Handler {
    Rc::new(f)
}

struct HandlerEntry {
    sender: SenderId,
    handler: Handler,
}

impl HandlerEntry {
    fn matches(&self, sender: SenderId) -> bool {
        self.sender == SenderId::ANY || self.sender == sender
    }
}

struct TypeEntry {
    name: String,
    /// append-only except for explicit removal, so iteration order is registration order
    handlers: Vec<HandlerEntry>,
}

/// The process-local table of type and sender names, and of the handlers listening to them.
///
/// Ids are dense and start at 0; an id, once handed out, refers to the same name for the lifetime
///  of the registry.
pub struct TypeRegistry {
    types: Vec<TypeEntry>,
    senders: Vec<String>,
    type_ids: FxHashMap<String, TypeId>,
    sender_ids: FxHashMap<String, SenderId>,
    generic_handlers: Vec<HandlerEntry>,
    system_handlers: FxHashMap<SystemMessageType, Handler>,
    max_types: usize,
    max_senders: usize,
}

impl TypeRegistry {
    pub fn new(max_types: usize, max_senders: usize) -> TypeRegistry {
        TypeRegistry {
            types: Default::default(),
            senders: Default::default(),
            type_ids: Default::default(),
            sender_ids: Default::default(),
            generic_handlers: Default::default(),
            system_handlers: Default::default(),
            max_types,
            max_senders,
        }
    }

    /// Returns the id for a type name, registering it if it is new. The flag is `true` if the
    ///  name was actually added.
    pub fn register_type(&mut self, name: &str) -> Result<(TypeId, bool), BusError> {
        if let Some(&id) = self.type_ids.get(name) {
            return Ok((id, false));
        }
        if self.types.len() >= self.max_types {
            return Err(BusError::TableFull(format!("too many types ({}) registering {:?}", self.max_types, name)));
        }

        let id = TypeId(self.types.len().prechecked_cast());
        trace!("registering type {:?} as {:?}", name, id);
        self.types.push(TypeEntry {
            name: name.to_string(),
            handlers: Vec::new(),
        });
        self.type_ids.insert(name.to_string(), id);
        Ok((id, true))
    }

    /// Returns the id for a sender name, registering it if it is new. The flag is `true` if the
    ///  name was actually added.
    pub fn register_sender(&mut self, name: &str) -> Result<(SenderId, bool), BusError> {
        if let Some(&id) = self.sender_ids.get(name) {
            return Ok((id, false));
        }
        if self.senders.len() >= self.max_senders {
            return Err(BusError::TableFull(format!("too many senders ({}) registering {:?}", self.max_senders, name)));
        }

        let id = SenderId(self.senders.len().prechecked_cast());
        trace!("registering sender {:?} as {:?}", name, id);
        self.senders.push(name.to_string());
        self.sender_ids.insert(name.to_string(), id);
        Ok((id, true))
    }

    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        self.type_ids.get(name).copied()
    }

    pub fn sender_id(&self, name: &str) -> Option<SenderId> {
        self.sender_ids.get(name).copied()
    }

    pub fn type_name(&self, id: TypeId) -> Option<&str> {
        id.index()
            .and_then(|idx| self.types.get(idx))
            .map(|e| e.name.as_str())
    }

    pub fn sender_name(&self, id: SenderId) -> Option<&str> {
        id.index()
            .and_then(|idx| self.senders.get(idx))
            .map(|s| s.as_str())
    }

    pub fn types(&self) -> impl Iterator<Item = (TypeId, &str)> {
        self.types.iter()
            .enumerate()
            .map(|(idx, e)| (TypeId(idx.prechecked_cast()), e.name.as_str()))
    }

    pub fn senders(&self) -> impl Iterator<Item = (SenderId, &str)> {
        self.senders.iter()
            .enumerate()
            .map(|(idx, name)| (SenderId(idx.prechecked_cast()), name.as_str()))
    }

    pub fn num_types(&self) -> usize {
        self.types.len()
    }

    pub fn num_senders(&self) -> usize {
        self.senders.len()
    }

    fn check_type(&self, type_id: TypeId) -> Result<(), BusError> {
        if type_id == TypeId::ANY || self.type_name(type_id).is_some() {
            Ok(())
        }
        else {
            Err(BusError::InvalidId(format!("no registered type {:?}", type_id)))
        }
    }

    fn check_sender(&self, sender: SenderId) -> Result<(), BusError> {
        if sender == SenderId::ANY || self.sender_name(sender).is_some() {
            Ok(())
        }
        else {
            Err(BusError::InvalidId(format!("no registered sender {:?}", sender)))
        }
    }

    /// Checks that both ids refer to registered names - wildcards are not accepted
    pub fn check_ids(&self, type_id: TypeId, sender: SenderId) -> Result<(), BusError> {
        if type_id.is_system() || sender == SenderId::ANY {
            return Err(BusError::InvalidId(format!("{:?} / {:?} is not a concrete user type and sender", type_id, sender)));
        }
        self.check_type(type_id)?;
        self.check_sender(sender)
    }

    /// Adds a handler for a type (or [TypeId::ANY]) and sender (or [SenderId::ANY]). Registering
    ///  the same handler several times is allowed, and it is then called several times.
    pub fn add_handler(&mut self, type_id: TypeId, sender: SenderId, handler: Handler) -> Result<(), BusError> {
        self.check_type(type_id)?;
        self.check_sender(sender)?;

        let entry = HandlerEntry { sender, handler };
        match type_id.index() {
            None => self.generic_handlers.push(entry),
            Some(idx) => self.types[idx].handlers.push(entry),
        }
        Ok(())
    }

    /// Removes the first registration of this exact handler for (type, sender)
    pub fn remove_handler(&mut self, type_id: TypeId, sender: SenderId, handler: &Handler) -> Result<(), BusError> {
        self.check_type(type_id)?;

        let list = match type_id.index() {
            None => &mut self.generic_handlers,
            Some(idx) => &mut self.types[idx].handlers,
        };

        let pos = list.iter()
            .position(|e| e.sender == sender && std::ptr::addr_eq(Rc::as_ptr(&e.handler), Rc::as_ptr(handler)))
            .ok_or_else(|| BusError::NotFound(format!("no such handler for {:?} / {:?}", type_id, sender)))?;
        list.remove(pos);
        Ok(())
    }

    /// The handlers a message of this (type, sender) is dispatched to, in dispatch order: generic
    ///  handlers first, then the type's own handlers, each in registration order.
    pub fn handlers_for(&self, type_id: TypeId, sender: SenderId) -> Vec<Handler> {
        let Some(entry) = type_id.index().and_then(|idx| self.types.get(idx)) else {
            return Vec::new();
        };

        self.generic_handlers.iter()
            .chain(entry.handlers.iter())
            .filter(|e| e.matches(sender))
            .map(|e| e.handler.clone())
            .collect()
    }

    /// System messages have at most one handler each, replacing whatever was there before
    pub fn set_system_handler(&mut self, kind: SystemMessageType, handler: Handler) {
        self.system_handlers.insert(kind, handler);
    }

    pub fn system_handler(&self, kind: SystemMessageType) -> Option<Handler> {
        self.system_handlers.get(&kind).cloned()
    }
}

/// Calls all handlers for a user message. The registry is not borrowed while the handlers run, so
///  they can register names and handlers themselves.
pub fn dispatch(registry: &RefCell<TypeRegistry>, msg: &Message) -> Result<(), BusError> {
    let handlers = registry.borrow().handlers_for(msg.type_id, msg.sender);
    for h in handlers {
        h(msg).map_err(BusError::Handler)?;
    }
    Ok(())
}

/// Calls the handler registered for a system message, if any
pub fn dispatch_system(registry: &RefCell<TypeRegistry>, kind: SystemMessageType, msg: &Message) -> Result<(), BusError> {
    let handler = registry.borrow().system_handler(kind);
    if let Some(h) = handler {
        h(msg).map_err(BusError::Handler)?;
    }
    Ok(())
}
