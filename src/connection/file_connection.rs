use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use crate::config::ConnectionConfig;
use crate::endpoint::endpoint::Delivery;
use crate::error::BusError;
use crate::log::record::LogContents;
use crate::registry::translation::TranslationTable;
use crate::registry::type_registry::{dispatch, dispatch_system, handler, Handler, TypeRegistry};
use crate::util::buf_ext::BufExt;
use crate::wire::cookie::check_cookie;
use crate::wire::message::{ClassOfService, Message, SenderId, Timestamp, TypeId};
use crate::wire::system::{SystemMessage, SystemMessageType};

pub const FILE_CONTROLLER_SENDER: &str = "VRPN File Controller";
/// payload: the new rate as a big-endian f32
pub const SET_REPLAY_RATE: &str = "vrpn File set replay rate";
pub const RESET: &str = "vrpn File reset";
/// payload: seconds and microseconds since the start of the file, both as big-endian u32
pub const PLAY_TO_TIME: &str = "vrpn File play to time";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Played,
    /// the next record is later than the requested time
    AtTime,
    Eof,
}

struct ReplayState {
    cursor: usize,
    remote_types: TranslationTable,
    remote_senders: TranslationTable,
    /// the replay position, in file time
    now: Timestamp,
    rate: f32,
    last_wall: Instant,
}

impl ReplayState {
    /// Applies a record to the translation tables, returning what is to be dispatched for it
    fn translate(&mut self, msg: &Message, registry: &mut TypeRegistry, auto_register: bool) -> Result<Option<Delivery>, BusError> {
        if !msg.type_id.is_system() {
            return Ok(
                match (self.remote_types.local_id(msg.type_id.0), self.remote_senders.local_id(msg.sender.0)) {
                    (Some(type_id), Some(sender)) => Some(Delivery::User(Message {
                        type_id: TypeId(type_id),
                        sender: SenderId(sender),
                        ..msg.clone()
                    })),
                    _ => {
                        trace!("skipping {:?}: not described in the log or not registered locally", msg);
                        None
                    }
                }
            );
        }

        let Some(kind) = SystemMessageType::of(msg.type_id) else {
            warn!("skipping record of unknown system type {:?}", msg.type_id);
            return Ok(None);
        };
        match SystemMessage::parse(msg)? {
            Some(SystemMessage::SenderDescription(d)) => {
                let local_id = match registry.sender_id(&d.name) {
                    Some(id) => Some(id.0),
                    None if auto_register => Some(registry.register_sender(&d.name)?.0.0),
                    None => None,
                };
                self.remote_senders.describe(d.id, &d.name, local_id)?;
            }
            Some(SystemMessage::TypeDescription(d)) => {
                let local_id = match registry.type_id(&d.name) {
                    Some(id) => Some(id.0),
                    None if auto_register => Some(registry.register_type(&d.name)?.0.0),
                    None => None,
                };
                self.remote_types.describe(d.id, &d.name, local_id)?;
            }
            // transport and log requests of the recorded session have no meaning during replay
            _ => {}
        }
        Ok(Some(Delivery::System(kind, msg.clone())))
    }
}

struct FileInner {
    path: PathBuf,
    config: ConnectionConfig,
    registry: RefCell<TypeRegistry>,
    records: Vec<Message>,
    start: Timestamp,
    state: RefCell<ReplayState>,
}

/// Replays a message log as if its messages arrived from a live peer. Replay follows the wall
///  clock scaled by the replay rate, or is driven explicitly.
///
/// The whole log is read when opening. Control messages packed on the connection (see
///  [SET_REPLAY_RATE], [RESET], [PLAY_TO_TIME]) steer the replay the same way the methods do.
#[derive(Clone)]
pub struct FileConnection {
    inner: Rc<FileInner>,
}

/// A non-owning reference to a [FileConnection]
#[derive(Clone)]
pub struct WeakFileConnection(Weak<FileInner>);

impl WeakFileConnection {
    pub fn upgrade(&self) -> Option<FileConnection> {
        self.0.upgrade().map(|inner| FileConnection { inner })
    }
}

impl FileConnection {
    pub fn open(config: ConnectionConfig, path: &Path) -> Result<FileConnection, BusError> {
        config.validate()
            .map_err(|e| BusError::Config(format!("{:#}", e)))?;

        let contents = LogContents::read(path)?;
        check_cookie(&config.magic, &contents.cookie)?;
        let start = contents.records.first()
            .map(|m| m.time)
            .unwrap_or(Timestamp::ZERO);
        debug!("replaying {} records from {:?}", contents.records.len(), path);

        let result = FileConnection {
            inner: Rc::new(FileInner {
                path: path.to_path_buf(),
                registry: RefCell::new(TypeRegistry::new(config.max_types, config.max_senders)),
                records: contents.records,
                start,
                state: RefCell::new(ReplayState {
                    cursor: 0,
                    remote_types: TranslationTable::new(config.max_types),
                    remote_senders: TranslationTable::new(config.max_senders),
                    now: start,
                    rate: 1.0,
                    last_wall: Instant::now(),
                }),
                config,
            })
        };
        result.register_controls()?;
        Ok(result)
    }

    fn register_controls(&self) -> Result<(), BusError> {
        let sender = self.register_sender(FILE_CONTROLLER_SENDER)?;

        let weak = self.downgrade();
        let set_rate = handler(move |msg| {
            let mut payload = msg.payload.clone();
            let rate = payload.checked_f32()?;
            if let Some(file) = weak.upgrade() {
                file.set_replay_rate(rate)?;
            }
            Ok(())
        });
        self.register_handler(self.register_type(SET_REPLAY_RATE)?, sender, set_rate)?;

        let weak = self.downgrade();
        let reset = handler(move |_| {
            if let Some(file) = weak.upgrade() {
                file.reset();
            }
            Ok(())
        });
        self.register_handler(self.register_type(RESET)?, sender, reset)?;

        let weak = self.downgrade();
        let play_to = handler(move |msg| {
            let mut payload = msg.payload.clone();
            let secs = payload.checked_u32()?;
            let usecs = payload.checked_u32()?;
            if let Some(file) = weak.upgrade() {
                file.play_to_elapsed(Timestamp::new(secs, usecs).as_duration())?;
            }
            Ok(())
        });
        self.register_handler(self.register_type(PLAY_TO_TIME)?, sender, play_to)?;
        Ok(())
    }

    pub fn downgrade(&self) -> WeakFileConnection {
        WeakFileConnection(Rc::downgrade(&self.inner))
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// the number of handles sharing this connection
    pub fn handle_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    pub fn register_sender(&self, name: &str) -> Result<SenderId, BusError> {
        Ok(self.inner.registry.borrow_mut().register_sender(name)?.0)
    }

    pub fn register_type(&self, name: &str) -> Result<TypeId, BusError> {
        Ok(self.inner.registry.borrow_mut().register_type(name)?.0)
    }

    pub fn sender_id(&self, name: &str) -> Option<SenderId> {
        self.inner.registry.borrow().sender_id(name)
    }

    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        self.inner.registry.borrow().type_id(name)
    }

    pub fn register_handler(&self, type_id: TypeId, sender: SenderId, handler: Handler) -> Result<(), BusError> {
        self.inner.registry.borrow_mut().add_handler(type_id, sender, handler)
    }

    pub fn remove_handler(&self, type_id: TypeId, sender: SenderId, handler: &Handler) -> Result<(), BusError> {
        self.inner.registry.borrow_mut().remove_handler(type_id, sender, handler)
    }

    pub fn set_system_handler(&self, kind: SystemMessageType, handler: Handler) {
        self.inner.registry.borrow_mut().set_system_handler(kind, handler)
    }

    /// There is no peer to send to, so this only dispatches locally. That is how the replay
    ///  control messages take effect.
    pub fn pack(&self, type_id: TypeId, sender: SenderId, time: Timestamp, payload: &[u8], _class: ClassOfService) -> Result<(), BusError> {
        self.inner.registry.borrow().check_ids(type_id, sender)?;
        let msg = Message::new(type_id, sender, time, Bytes::copy_from_slice(payload));
        dispatch(&self.inner.registry, &msg)
    }

    /// Plays the next record if it is not later than `end`
    pub fn play_one_to(&self, end: Timestamp) -> Result<PlayOutcome, BusError> {
        let delivery = {
            let mut state = self.inner.state.borrow_mut();
            let Some(msg) = self.inner.records.get(state.cursor) else {
                return Ok(PlayOutcome::Eof);
            };
            if msg.time > end {
                return Ok(PlayOutcome::AtTime);
            }
            state.cursor += 1;
            state.now = state.now.max(msg.time);

            let mut registry = self.inner.registry.borrow_mut();
            state.translate(msg, &mut registry, self.inner.config.auto_register_remote_names)?
        };

        match delivery {
            Some(Delivery::User(msg)) => dispatch(&self.inner.registry, &msg)?,
            Some(Delivery::System(kind, msg)) => dispatch_system(&self.inner.registry, kind, &msg)?,
            None => {}
        }
        Ok(PlayOutcome::Played)
    }

    /// Plays the next record regardless of its time stamp
    pub fn play_one(&self) -> Result<PlayOutcome, BusError> {
        self.play_one_to(Timestamp::MAX)
    }

    /// Plays all records up to and including file time `end`, returning how many were played
    pub fn play_to_filetime(&self, end: Timestamp) -> Result<usize, BusError> {
        let mut num_played = 0;
        loop {
            match self.play_one_to(end)? {
                PlayOutcome::Played => num_played += 1,
                PlayOutcome::AtTime => {
                    let mut state = self.inner.state.borrow_mut();
                    state.now = state.now.max(end);
                    break;
                }
                PlayOutcome::Eof => {
                    let last = self.inner.records.last().map(|m| m.time).unwrap_or(self.inner.start);
                    let mut state = self.inner.state.borrow_mut();
                    state.now = state.now.max(end.min(last));
                    break;
                }
            }
        }
        Ok(num_played)
    }

    /// see [FileConnection::play_to_filetime], relative to the first record
    pub fn play_to_elapsed(&self, elapsed: Duration) -> Result<usize, BusError> {
        self.play_to_filetime(self.inner.start.saturating_add(elapsed))
    }

    /// Rewinds to the start of the file. Everything the log described is forgotten and gets
    ///  described again during replay.
    pub fn reset(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.cursor = 0;
        state.remote_types.clear();
        state.remote_senders.clear();
        state.now = self.inner.start;
        state.last_wall = Instant::now();
    }

    /// Moves the replay position without dispatching user messages. Descriptions along the way
    ///  are still applied.
    pub fn jump_to_elapsed(&self, elapsed: Duration) -> Result<(), BusError> {
        let target = self.inner.start.saturating_add(elapsed);
        if target < self.inner.state.borrow().now {
            self.reset();
        }

        let mut state = self.inner.state.borrow_mut();
        let mut registry = self.inner.registry.borrow_mut();
        while let Some(msg) = self.inner.records.get(state.cursor) {
            if msg.time >= target {
                break;
            }
            state.cursor += 1;
            if msg.type_id.is_system() {
                state.translate(msg, &mut registry, self.inner.config.auto_register_remote_names)?;
            }
        }
        state.now = target;
        state.last_wall = Instant::now();
        Ok(())
    }

    pub fn eof(&self) -> bool {
        self.inner.state.borrow().cursor >= self.inner.records.len()
    }

    /// the time span between the first and the last record
    pub fn length(&self) -> Duration {
        self.inner.records.last()
            .map(|m| m.time.saturating_duration_since(self.inner.start))
            .unwrap_or_default()
    }

    /// the replay position relative to the first record
    pub fn time_since_open(&self) -> Duration {
        self.inner.state.borrow().now.saturating_duration_since(self.inner.start)
    }

    /// the earliest time stamp of any user message in the log
    pub fn lowest_user_timestamp(&self) -> Option<Timestamp> {
        self.inner.records.iter()
            .filter(|m| !m.type_id.is_system())
            .map(|m| m.time)
            .min()
    }

    pub fn replay_rate(&self) -> f32 {
        self.inner.state.borrow().rate
    }

    /// Changes how fast replay follows the wall clock. 0 pauses replay.
    pub fn set_replay_rate(&self, rate: f32) -> Result<(), BusError> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(BusError::Config(format!("invalid replay rate {}", rate)));
        }
        // time played so far counts at the old rate
        let mut state = self.inner.state.borrow_mut();
        let wall_now = Instant::now();
        let advance = scaled(wall_now.duration_since(state.last_wall), state.rate);
        state.now = state.now.saturating_add(advance);
        state.last_wall = wall_now;
        state.rate = rate;
        Ok(())
    }

    fn play_due(&self) -> Result<usize, BusError> {
        let end = {
            let mut state = self.inner.state.borrow_mut();
            let wall_now = Instant::now();
            let advance = scaled(wall_now.duration_since(state.last_wall), state.rate);
            state.last_wall = wall_now;
            state.now.saturating_add(advance)
        };
        self.play_to_filetime(end)
    }

    /// wall clock time until the next record is due, if replay is running
    fn time_until_next(&self) -> Option<Duration> {
        let state = self.inner.state.borrow();
        if state.rate <= 0.0 {
            return None;
        }
        let next = self.inner.records.get(state.cursor)?;
        let file_gap = next.time.saturating_duration_since(state.now);
        Duration::try_from_secs_f64(file_gap.as_secs_f64() / f64::from(state.rate)).ok()
    }

    /// Plays everything that is due, waiting for at most `timeout` for further records to become
    ///  due. Errors from handlers are logged.
    pub async fn service(&self, timeout: Duration) {
        if let Err(e) = self.play_due() {
            warn!("replay of {:?} failed: {}", self.inner.path, e);
        }

        let wait = self.time_until_next()
            .map(|d| d.min(timeout))
            .unwrap_or(timeout);
        sleep(wait).await;

        if let Err(e) = self.play_due() {
            warn!("replay of {:?} failed: {}", self.inner.path, e);
        }
    }

    /// a file is always 'connected'
    pub fn connected(&self) -> bool {
        true
    }

    pub fn doing_okay(&self) -> bool {
        true
    }
}

fn scaled(wall: Duration, rate: f32) -> Duration {
    Duration::try_from_secs_f64(wall.as_secs_f64() * f64::from(rate))
        .unwrap_or(Duration::MAX)
}

/// the payload of a [PLAY_TO_TIME] control message
pub fn play_to_time_payload(elapsed: Duration) -> Vec<u8> {
    let t = Timestamp::from_duration(elapsed);
    let mut result = Vec::with_capacity(8);
    result.extend_from_slice(&t.secs.to_be_bytes());
    result.extend_from_slice(&t.usecs.to_be_bytes());
    result
}
