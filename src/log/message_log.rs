use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use bytes::BytesMut;
use tracing::{debug, error};

use crate::error::BusError;
use crate::log::log_sink::{FileSink, LogSink};
use crate::log::record::ser_record;
use crate::log::LogMode;
use crate::wire::cookie::cookie_bytes;
use crate::wire::message::Message;

/// Returns `true` to keep a message out of the log.
///
/// Filters run while the owning connection is busy sending or receiving, so they must not call
///  back into it (registering names, packing, ...). State a filter depends on has to live
///  outside the connection, e.g. in an `Rc<Cell<_>>` shared with the application.
pub type LogFilter = Rc<dyn Fn(&Message) -> bool>;

/// Messages are buffered in memory when they are logged, and written to the sink in batches by
///  [MessageLog::flush]. The cookie goes first, when the log is flushed for the first time.
pub struct MessageLog {
    path: PathBuf,
    mode: LogMode,
    cookie: Vec<u8>,
    cookie_written: bool,
    sink: Box<dyn LogSink>,
    /// oldest first
    pending: VecDeque<Message>,
    filters: Vec<LogFilter>,
}

impl MessageLog {
    /// Creates a new log file, falling back to the emergency path if the file can not be created
    ///  (e.g. because it exists already).
    pub fn open(path: &Path, mode: LogMode, magic: &str, emergency_path: &Path) -> Result<MessageLog, BusError> {
        let (sink, actual_path) = FileSink::create(path, emergency_path)?;
        debug!("logging {:?} to {:?}", mode, actual_path);
        Ok(Self::with_sink(actual_path, mode, magic, Box::new(sink)))
    }

    pub fn with_sink(path: PathBuf, mode: LogMode, magic: &str, sink: Box<dyn LogSink>) -> MessageLog {
        MessageLog {
            path,
            mode,
            cookie: cookie_bytes(magic, mode),
            cookie_written: false,
            sink,
            pending: Default::default(),
            filters: Default::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LogMode {
        self.mode
    }

    pub fn add_filter(&mut self, filter: LogFilter) {
        self.filters.push(filter);
    }

    /// Buffers a message if this log records its direction. Filters apply to user messages only,
    ///  system messages are needed to make sense of a log on replay.
    pub fn log(&mut self, msg: &Message, direction: LogMode) {
        if !self.mode.intersects(direction) {
            return;
        }
        if !msg.type_id.is_system() && self.filters.iter().any(|f| f(msg)) {
            return;
        }
        self.pending.push_back(msg.clone());
    }

    /// number of messages logged but not yet written
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Writes all buffered messages, returning how many were written. A message is removed from
    ///  the buffer only after it was written, so after a failure, the remaining messages are
    ///  still there for the next attempt.
    pub fn flush(&mut self) -> Result<usize, BusError> {
        if !self.cookie_written {
            self.sink.write_chunk(&self.cookie)?;
            self.cookie_written = true;
        }

        let mut buf = BytesMut::new();
        let mut num_written = 0;
        while let Some(msg) = self.pending.front() {
            buf.clear();
            ser_record(msg, &mut buf);
            self.sink.write_chunk(&buf)?;
            self.pending.pop_front();
            num_written += 1;
        }

        self.sink.sync()?;
        Ok(num_written)
    }
}

impl Drop for MessageLog {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("could not write log {:?}, {} messages lost: {}", self.path, self.pending.len(), e);
        }
    }
}
