use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;
use tokio::sync::mpsc;

const MIN_SUBSCRIBER_BUFFER: usize = 4;

/// Event kinds emitted by [`ClientState`] setters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateEventKind {
    PingUpdated,
    Connected,
    Disconnected,
    CurrentGameChanged,
    ReadyChanged,
    ScheduleChanged,
    LastErrorChanged,
}

/// Change notification carrying the old and new value of one field.
#[derive(Debug, Clone, Serialize)]
pub struct StateEvent {
    pub kind: StateEventKind,
    pub old: Value,
    pub new: Value,
    pub when: SystemTime,
}

/// Serializable point-in-time copy of all session fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSnapshot {
    pub ping: u32,
    pub connected: bool,
    pub current_game: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<SystemTime>,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<SystemTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Handle returned by [`ClientState::subscribe`]. Dropping the handle (or
/// calling `unsubscribe`) stops delivery.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<StateEvent>,
}

#[derive(Default)]
struct SubscriberTable {
    next_id: u64,
    senders: HashMap<u64, mpsc::Sender<StateEvent>>,
}

/// Concurrency-safe session state with change fan-out.
///
/// All mutation goes through the typed setters, each of which emits exactly
/// one [`StateEvent`]. Delivery to subscribers is best-effort: a full queue
/// drops the event rather than blocking the writer, so consumers that need
/// the current value must read it via the getters or [`ClientState::snapshot`].
pub struct ClientState {
    fields: Mutex<StateSnapshot>,
    subs: Mutex<SubscriberTable>,
}

impl ClientState {
    pub fn new() -> Self {
        Self {
            fields: Mutex::new(StateSnapshot::default()),
            subs: Mutex::new(SubscriberTable::default()),
        }
    }

    pub fn subscribe(&self, buffer: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(buffer.max(MIN_SUBSCRIBER_BUFFER));
        let mut subs = self.subs.lock().unwrap();
        let id = subs.next_id;
        subs.next_id += 1;
        subs.senders.insert(id, tx);
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subs.lock().unwrap().senders.remove(&id);
    }

    fn notify(&self, event: StateEvent) {
        let mut subs = self.subs.lock().unwrap();
        subs.senders.retain(|_, tx| {
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                // Slow subscriber: drop the event, keep the subscription.
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn emit(&self, kind: StateEventKind, old: Value, new: Value) {
        self.notify(StateEvent {
            kind,
            old,
            new,
            when: SystemTime::now(),
        });
    }

    /// Updates ping and stamps the heartbeat time as a derived field.
    pub fn set_ping(&self, ping: u32) {
        let old = {
            let mut f = self.fields.lock().unwrap();
            let old = f.ping;
            f.ping = ping;
            f.last_heartbeat = Some(SystemTime::now());
            old
        };
        self.emit(StateEventKind::PingUpdated, json!(old), json!(ping));
    }

    pub fn set_connected(&self, connected: bool) {
        let old = {
            let mut f = self.fields.lock().unwrap();
            let old = f.connected;
            f.connected = connected;
            old
        };
        let kind = if connected {
            StateEventKind::Connected
        } else {
            StateEventKind::Disconnected
        };
        self.emit(kind, json!(old), json!(connected));
    }

    pub fn set_current_game(&self, game: impl Into<String>) {
        let game = game.into();
        let old = {
            let mut f = self.fields.lock().unwrap();
            std::mem::replace(&mut f.current_game, game.clone())
        };
        self.emit(StateEventKind::CurrentGameChanged, json!(old), json!(game));
    }

    pub fn set_ready(&self, ready: bool) {
        let old = {
            let mut f = self.fields.lock().unwrap();
            let old = f.ready;
            f.ready = ready;
            old
        };
        self.emit(StateEventKind::ReadyChanged, json!(old), json!(ready));
    }

    /// Sets the upcoming phase ("start", "swap", "pause", ...) and the
    /// wall-clock instant it takes effect.
    pub fn set_schedule(&self, phase: impl Into<String>, at: SystemTime) {
        let phase = phase.into();
        let old = {
            let mut f = self.fields.lock().unwrap();
            let old = json!({
                "state": f.scheduled_state,
                "at": f.scheduled_at.map(epoch_secs),
            });
            f.scheduled_state = Some(phase.clone());
            f.scheduled_at = Some(at);
            old
        };
        let new = json!({ "state": phase, "at": epoch_secs(at) });
        self.emit(StateEventKind::ScheduleChanged, old, new);
    }

    pub fn set_last_error(&self, message: impl Into<String>) {
        let message = message.into();
        let old = {
            let mut f = self.fields.lock().unwrap();
            std::mem::replace(&mut f.last_error, Some(message.clone()))
        };
        self.emit(StateEventKind::LastErrorChanged, json!(old), json!(message));
    }

    pub fn ping(&self) -> u32 {
        self.fields.lock().unwrap().ping
    }

    pub fn connected(&self) -> bool {
        self.fields.lock().unwrap().connected
    }

    pub fn current_game(&self) -> String {
        self.fields.lock().unwrap().current_game.clone()
    }

    pub fn ready(&self) -> bool {
        self.fields.lock().unwrap().ready
    }

    pub fn schedule(&self) -> Option<(String, SystemTime)> {
        let f = self.fields.lock().unwrap();
        match (&f.scheduled_state, f.scheduled_at) {
            (Some(state), Some(at)) => Some((state.clone(), at)),
            _ => None,
        }
    }

    pub fn last_heartbeat(&self) -> Option<SystemTime> {
        self.fields.lock().unwrap().last_heartbeat
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.fields.lock().unwrap().clone()
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let snap = self.snapshot();
        let data = serde_json::to_vec_pretty(&snap)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        std::fs::write(path, data)
    }

    /// Best-effort restore: a missing or unparsable file is an error the
    /// caller may log, and leaves the defaults in place.
    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let raw = std::fs::read(path)?;
        let snap: StateSnapshot = serde_json::from_slice(&raw)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        *self.fields.lock().unwrap() = snap;
        Ok(())
    }
}

pub fn epoch_secs(t: SystemTime) -> i64 {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}
