//! Utilities for testing code that uses the message bus. They are used by the crate's own tests,
//!  but they are also exported for application testing, which is why they are part of the
//!  regular (non-#[cfg(test)]) code.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use crate::registry::type_registry::{handler, Handler};
use crate::wire::message::Message;

/// A path in the system's temp directory that no other test uses
pub fn temp_log_path(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}-{}.vrpn", prefix, uuid::Uuid::new_v4()))
}

/// A handler that records every message it is called with
pub fn recording_handler() -> (Rc<RefCell<Vec<Message>>>, Handler) {
    let received = Rc::new(RefCell::new(Vec::new()));
    let cloned = received.clone();
    let h = handler(move |msg| {
        cloned.borrow_mut().push(msg.clone());
        Ok(())
    });
    (received, h)
}
