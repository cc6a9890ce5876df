//! Session (spec.md §4.2): per-client state machine, debounced outbound
//! buffer, and the stable session-id/presence-id pairing that survives
//! reconnects.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::records::{RecordId, TypeName};
use crate::schema::SchemaVersions;
use crate::wire::ServerMessage;

/// Opaque, client-supplied, stable across reconnects (spec.md §4.2
/// "Session-id"). Not a server-minted UUID: the whole point is that the
/// same tab reconnecting presents the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The one presence-scope record-id a session owns, stable across
/// reconnects with the same `SessionId` (spec.md §4.2 "Presence-id").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PresenceId(pub RecordId);

impl PresenceId {
    pub fn for_session(session_id: &SessionId) -> Self {
        Self(RecordId::new(TypeName::InstancePresence, &session_id.0))
    }

    pub fn as_record_id(&self) -> &RecordId {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub enum SessionState {
    AwaitingConnectMessage,
    Connected { schema: SchemaVersions },
    AwaitingRemoval,
}

/// One connected client's lifecycle (spec.md §4.2). Lives entirely inside
/// its owning `Room`'s actor task; the room never hands out `&mut Session`
/// to anything else.
pub struct Session {
    pub id: SessionId,
    pub presence_id: PresenceId,
    pub state: SessionState,
    created_at: Instant,
    last_interaction: Instant,
    removal_started_at: Option<Instant>,
    sender: mpsc::UnboundedSender<ServerMessage>,
    buffer: Vec<ServerMessage>,
    debounce_deadline: Option<Instant>,
}

impl Session {
    pub fn new(
        id: SessionId,
        presence_id: PresenceId,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            presence_id,
            state: SessionState::AwaitingConnectMessage,
            created_at: now,
            last_interaction: now,
            removal_started_at: None,
            sender,
            buffer: Vec::new(),
            debounce_deadline: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_interaction = Instant::now();
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Connected { .. })
    }

    pub fn is_awaiting_removal(&self) -> bool {
        matches!(self.state, SessionState::AwaitingRemoval)
    }

    pub fn mark_connected(&mut self, schema: SchemaVersions) {
        self.state = SessionState::Connected { schema };
        self.touch();
    }

    pub fn declared_schema(&self) -> Option<&SchemaVersions> {
        match &self.state {
            SessionState::Connected { schema } => Some(schema),
            _ => None,
        }
    }

    /// Idempotent: re-entering `AwaitingRemoval` does not reset its timer.
    pub fn begin_removal(&mut self) {
        if !self.is_awaiting_removal() {
            self.state = SessionState::AwaitingRemoval;
            self.removal_started_at = Some(Instant::now());
        }
    }

    pub fn start_wait_expired(&self, start_wait: Duration) -> bool {
        matches!(self.state, SessionState::AwaitingConnectMessage)
            && self.created_at.elapsed() >= start_wait
    }

    pub fn idle_timeout_expired(&self, idle_timeout: Duration) -> bool {
        self.is_connected() && self.last_interaction.elapsed() >= idle_timeout
    }

    pub fn removal_wait_expired(&self, removal_wait: Duration) -> bool {
        self.removal_started_at
            .is_some_and(|t| t.elapsed() >= removal_wait)
    }

    /// Enqueue an outbound message (spec.md §4.2 "Contract to the room").
    /// `patch`/`push_result` are debounce-batched; everything else flushes
    /// the buffer first and is sent immediately.
    pub fn send(&mut self, message: ServerMessage, debounce: Duration) {
        match &message {
            ServerMessage::Patch { .. } | ServerMessage::PushResult { .. } => {
                self.buffer.push(message);
                self.debounce_deadline = Some(Instant::now() + debounce);
            }
            _ => {
                self.flush();
                let _ = self.sender.send(message);
            }
        }
    }

    /// Whether the debounce timer has fired and the room should call
    /// [`Session::flush`].
    pub fn debounce_due(&self) -> bool {
        self.debounce_deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Send everything buffered, as a single message if there's only one,
    /// or as a `data` envelope otherwise. A no-op on an empty buffer — per
    /// spec.md §5 "if the session is no longer Connected when the timer
    /// runs, the timer is a no-op", this is safe to call unconditionally.
    pub fn flush(&mut self) {
        self.debounce_deadline = None;
        if self.buffer.is_empty() {
            return;
        }
        if self.buffer.len() == 1 {
            let msg = self.buffer.remove(0);
            let _ = self.sender.send(msg);
        } else {
            let data = std::mem::take(&mut self.buffer);
            let _ = self.sender.send(ServerMessage::Data { data });
        }
    }
}
