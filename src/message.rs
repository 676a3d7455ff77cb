//! Message bus: a single multi-producer queue feeding one dispatcher thread.
//!
//! Every child process streams `(source, cmd, data)` frames toward the
//! parent; per-child pump threads put them on the shared channel and the
//! dispatcher routes each frame to the handler registered for its source,
//! falling back to the default handler. The bus addresses control traffic
//! to itself under its own id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Command tags used on the wire.
pub mod cmd {
    /// Parent → child.
    pub const LOAD: &str = "LOAD";
    pub const TRAIN: &str = "TRAIN";
    pub const EXIT: &str = "EXIT";
    /// Child → parent.
    pub const UPDATE_STATUS: &str = "update_status";
    pub const SET_RESULT: &str = "set_result";
    pub const SET_ITEM: &str = "set_item";
    /// Bus → self.
    pub const STOP: &str = "STOP";
}

/// One IPC frame. `source` is the emitting task id (empty for parent
/// commands, the bus's own id for control frames).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub source: String,
    pub cmd: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(source: impl Into<String>, cmd: impl Into<String>, data: Value) -> Self {
        Frame {
            source: source.into(),
            cmd: cmd.into(),
            data,
        }
    }
}

/// A frame consumer. Handler errors are logged by the dispatcher; they never
/// stop it.
pub trait Handler: Send + Sync {
    fn handle(&self, source: &str, cmd: &str, data: Value) -> Result<()>;
}

#[derive(Default)]
struct HandlerTable {
    by_source: HashMap<String, Arc<dyn Handler>>,
    default: Option<Arc<dyn Handler>>,
}

pub struct MessageBus {
    self_id: String,
    sender: Sender<Frame>,
    receiver: Option<Receiver<Frame>>,
    table: Arc<Mutex<HandlerTable>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        MessageBus::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        MessageBus {
            self_id: Ulid::new().to_string(),
            sender,
            receiver: Some(receiver),
            table: Arc::new(Mutex::new(HandlerTable::default())),
            dispatcher: None,
        }
    }

    /// The producer end of the queue; clone one per frame source.
    pub fn sender(&self) -> Sender<Frame> {
        self.sender.clone()
    }

    /// Register a handler for one source. Refuses the bus's own id, and
    /// refuses to replace an existing registration unless `overwrite`.
    pub fn register_handler(
        &self,
        source: &str,
        handler: Arc<dyn Handler>,
        overwrite: bool,
    ) -> bool {
        if source == self.self_id {
            error!(source, "cannot register a handler under the bus id");
            return false;
        }
        let mut table = self.table.lock().expect("handler table poisoned");
        if !overwrite && table.by_source.contains_key(source) {
            warn!(source, "handler already registered");
            return false;
        }
        info!(source, "register handler");
        table.by_source.insert(source.to_string(), handler);
        true
    }

    /// Replace the fallback handler for frames with no per-source entry.
    pub fn register_default_handler(&self, handler: Arc<dyn Handler>) {
        info!("update default handler");
        self.table.lock().expect("handler table poisoned").default = Some(handler);
    }

    /// Start the dispatcher thread. Call once, before any child runs.
    pub fn start(&mut self) {
        let receiver = self
            .receiver
            .take()
            .expect("message bus already started");
        let self_id = self.self_id.clone();
        let table = Arc::clone(&self.table);
        self.dispatcher = Some(std::thread::spawn(move || {
            dispatch_loop(receiver, self_id, table);
        }));
    }

    /// Ask the dispatcher to drain and exit, then join it.
    pub fn stop(&mut self) {
        info!("attempt stop");
        let stop = Frame::new(self.self_id.clone(), cmd::STOP, Value::Null);
        if self.sender.send(stop).is_err() {
            warn!("dispatcher already gone");
        }
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }
}

fn dispatch_loop(receiver: Receiver<Frame>, self_id: String, table: Arc<Mutex<HandlerTable>>) {
    while let Ok(frame) = receiver.recv() {
        debug!(source = %frame.source, cmd = %frame.cmd, "receive message");
        if frame.source == self_id {
            if frame.cmd == cmd::STOP {
                info!("receive STOP signal");
                break;
            }
            // System frames carry nothing in this build.
            continue;
        }

        let handler = {
            let table = table.lock().expect("handler table poisoned");
            table
                .by_source
                .get(&frame.source)
                .cloned()
                .or_else(|| table.default.clone())
        };
        match handler {
            Some(handler) => {
                if let Err(e) = handler.handle(&frame.source, &frame.cmd, frame.data) {
                    error!(source = %frame.source, cmd = %frame.cmd, "handler failed: {e:#}");
                }
            }
            None => warn!(source = %frame.source, "no default handler"),
        }
    }
}
