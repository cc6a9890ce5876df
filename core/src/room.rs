//! The Room (spec.md §4.5): the in-memory, single-writer authoritative
//! replica of one document plus its session table and tombstone index.
//! Owns all state-modifying operations; concurrency section of this crate
//! (spec.md §5) gives each `Room` its own actor task so nothing outside
//! that task ever holds `&mut Room`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::config::{self, Config};
use crate::diff::{apply_record, deep_eq, diff as diff_records, RecordOp};
use crate::error::{Disposition, SyncError};
use crate::persistence::{migrate_legacy_snapshot, PersistenceAdapter, RoomSnapshot, SnapshotEntry};
use crate::records::{validate_record, Record, RecordId, Scope, TypeName};
use crate::schema::{Schema, SchemaVersions};
use crate::session::{PresenceId, Session, SessionId};
use crate::wire::{ClientMessage, HydrationType, PushAction, RecordOpMap, ServerMessage};

const PROTOCOL_VERSION: u32 = 6;
const LEGACY_PROTOCOL_VERSION_ALIAS: u32 = 5;

/// The in-memory, single-writer authoritative replica of one document
/// (spec.md §3 "Room State"). Never shared: lives entirely inside the
/// actor task spawned by [`spawn`].
pub struct Room {
    room_id: String,
    documents: IndexMap<RecordId, SnapshotEntry>,
    tombstones: IndexMap<RecordId, u64>,
    clock: u64,
    document_clock: u64,
    tombstone_history_starts_at_clock: u64,
    schema: Arc<Schema>,
    sessions: HashMap<SessionId, Session>,
    persistence: Arc<dyn PersistenceAdapter>,
    config: &'static Config,
    persist_deadline: Option<Instant>,
}

impl Room {
    pub async fn load_or_bootstrap(
        room_id: String,
        schema: Arc<Schema>,
        persistence: Arc<dyn PersistenceAdapter>,
    ) -> Self {
        let config = config::ensure_loaded();
        let loaded = match persistence.get(&room_id).await {
            Ok(Some(bytes)) => parse_snapshot_bytes(&bytes),
            Ok(None) => None,
            Err(e) => {
                tracing::error!(room_id = %room_id, error = %e, "failed to load snapshot, bootstrapping defaults");
                None
            }
        };
        match loaded {
            Some(snapshot) => Self::from_snapshot(room_id, schema, persistence, config, snapshot),
            None => Self::bootstrap_defaults(room_id, schema, persistence, config),
        }
    }

    fn from_snapshot(
        room_id: String,
        schema: Arc<Schema>,
        persistence: Arc<dyn PersistenceAdapter>,
        config: &'static Config,
        snapshot: RoomSnapshot,
    ) -> Self {
        let mut documents: IndexMap<RecordId, SnapshotEntry> = IndexMap::new();
        for entry in snapshot.documents {
            let id = entry.state.id().expect("snapshot records carry an id");
            documents.insert(id, entry);
        }
        if let Err(e) = schema.apply_store_migrations(&mut documents) {
            tracing::error!(room_id = %room_id, error = %e, "store migration failed while loading snapshot; bootstrapping defaults");
            return Self::bootstrap_defaults(room_id, schema, persistence, config);
        }
        Self {
            room_id,
            documents,
            tombstones: snapshot.tombstones,
            clock: snapshot.clock,
            document_clock: snapshot.clock,
            tombstone_history_starts_at_clock: snapshot.tombstone_history_starts_at_clock,
            schema,
            sessions: HashMap::new(),
            persistence,
            config,
            persist_deadline: None,
        }
    }

    fn bootstrap_defaults(
        room_id: String,
        schema: Arc<Schema>,
        persistence: Arc<dyn PersistenceAdapter>,
        config: &'static Config,
    ) -> Self {
        let mut documents = IndexMap::new();
        let doc = Record::from_value(json!({
            "id": "document:document", "typeName": "document",
            "gridSize": 10, "name": "Untitled", "version": 1,
        }))
        .expect("constructed value is always an object");
        let page = Record::from_value(json!({
            "id": "page:page1", "typeName": "page", "name": "Page 1", "index": "a1",
        }))
        .expect("constructed value is always an object");
        documents.insert(doc.id().unwrap(), SnapshotEntry { state: doc, last_changed_clock: 0 });
        documents.insert(page.id().unwrap(), SnapshotEntry { state: page, last_changed_clock: 0 });
        Self {
            room_id,
            documents,
            tombstones: IndexMap::new(),
            clock: 0,
            document_clock: 0,
            tombstone_history_starts_at_clock: 0,
            schema,
            sessions: HashMap::new(),
            persistence,
            config,
            persist_deadline: None,
        }
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn accept_session(
        &mut self,
        session_id: SessionId,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) -> PresenceId {
        let presence_id = match self.sessions.get(&session_id) {
            Some(existing) if existing.is_awaiting_removal() => existing.presence_id.clone(),
            _ => PresenceId::for_session(&session_id),
        };
        tracing::debug!(%session_id, "session accepted");
        let session = Session::new(session_id.clone(), presence_id.clone(), sender);
        self.sessions.insert(session_id, session);
        presence_id
    }

    pub fn handle_message(&mut self, session_id: &SessionId, message: ClientMessage) {
        match message {
            ClientMessage::Ping => {
                if let Some(session) = self.sessions.get_mut(session_id) {
                    session.touch();
                    session.send(ServerMessage::Pong, self.config.data_message_debounce);
                }
            }
            ClientMessage::Connect {
                connect_request_id,
                protocol_version,
                schema,
                last_server_clock,
            } => {
                if let Err(e) =
                    self.handle_connect(session_id, connect_request_id, protocol_version, schema, last_server_clock)
                {
                    self.reject_session(session_id, e);
                }
            }
            ClientMessage::Push { client_clock, diff, presence } => {
                let connected = self.sessions.get(session_id).is_some_and(Session::is_connected);
                if !connected {
                    tracing::debug!(%session_id, "push in non-connected state; dropping");
                    return;
                }
                if let Err(e) = self.handle_push(session_id, client_clock, diff, presence) {
                    self.reject_session(session_id, e);
                }
            }
        }
    }

    pub fn handle_close(&mut self, session_id: &SessionId) {
        self.cancel_session(session_id);
    }

    pub fn handle_error(&mut self, session_id: &SessionId) {
        self.cancel_session(session_id);
    }

    /// Filtered to document-scope records only (spec.md §4.5
    /// `get_snapshot`).
    pub fn get_snapshot(&self) -> RoomSnapshot {
        let documents = self
            .documents
            .values()
            .filter(|entry| entry.state.type_name().map(|t| t.scope()) == Some(Scope::Document))
            .map(|entry| SnapshotEntry {
                state: entry.state.clone(),
                last_changed_clock: entry.last_changed_clock,
            })
            .collect();
        RoomSnapshot {
            clock: self.clock,
            tombstones: self.tombstones.clone(),
            schema: self.schema.server_versions(),
            documents,
            tombstone_history_starts_at_clock: self.tombstone_history_starts_at_clock,
        }
    }

    /// Explicit restore/rollback (spec.md §4.5 `load_snapshot`). Presence
    /// records, which never appear in a snapshot, are carried over as-is;
    /// existing sessions are not disturbed.
    pub fn load_snapshot(&mut self, snapshot: RoomSnapshot) {
        let next_clock = self.clock + 1;

        let old_document_ids: HashSet<RecordId> = self
            .documents
            .iter()
            .filter(|(_, e)| e.state.type_name().map(|t| t.scope()) == Some(Scope::Document))
            .map(|(id, _)| id.clone())
            .collect();

        let mut new_documents: IndexMap<RecordId, SnapshotEntry> = IndexMap::new();
        for (id, entry) in self.documents.iter() {
            if entry.state.type_name().map(|t| t.scope()) == Some(Scope::Presence) {
                new_documents.insert(id.clone(), entry.clone());
            }
        }

        let mut new_ids = HashSet::new();
        for snap_entry in snapshot.documents {
            let id = snap_entry.state.id().expect("snapshot records carry an id");
            new_ids.insert(id.clone());
            new_documents.insert(
                id,
                SnapshotEntry { state: snap_entry.state, last_changed_clock: next_clock },
            );
        }

        let mut tombstones = snapshot.tombstones;
        for stale_id in old_document_ids.difference(&new_ids) {
            tombstones.insert(stale_id.clone(), next_clock);
        }

        self.documents = new_documents;
        self.tombstones = tombstones;
        self.clock = next_clock;
        self.tombstone_history_starts_at_clock = snapshot.tombstone_history_starts_at_clock;
    }

    /// Cancels the janitor (the caller's actor loop stops scheduling it)
    /// and flushes any pending write synchronously (spec.md §4.6). Actual
    /// socket closure happens as a side effect of dropping every session's
    /// sender.
    pub async fn close(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.flush();
        }
        let snapshot = self.get_snapshot();
        if let Ok(bytes) = serde_json::to_vec(&snapshot) {
            if let Err(e) = self.persistence.put(&self.room_id, bytes).await {
                tracing::error!(room_id = %self.room_id, error = %e, "failed to flush snapshot on close");
            }
        }
    }

    fn reject_session(&mut self, session_id: &SessionId, err: SyncError) {
        tracing::warn!(%session_id, error = %err, "rejecting session");
        match err.disposition() {
            Disposition::CloseSession | Disposition::CloseSocketOnly => {
                if let Some(session) = self.sessions.get_mut(session_id) {
                    let message = match err.incompatibility_reason() {
                        Some(reason) => ServerMessage::IncompatibilityError { reason },
                        None => ServerMessage::Error { error: err.to_string() },
                    };
                    session.send(message, self.config.data_message_debounce);
                }
                self.cancel_session(session_id);
            }
            Disposition::LogOnly => {}
        }
    }

    /// Idempotent (spec.md §4.5 "Cancellation semantics"). Broadcasts a
    /// `Remove` for the session's presence-id iff that record existed, then
    /// transitions the session to `AwaitingRemoval`; the janitor hard-drops
    /// it from the table once `SESSION_REMOVAL_WAIT` elapses.
    fn cancel_session(&mut self, session_id: &SessionId) {
        let Some(session) = self.sessions.get_mut(session_id) else { return };
        if session.is_awaiting_removal() {
            return;
        }
        session.begin_removal();
        let presence_record_id = session.presence_id.as_record_id().clone();
        if self.documents.shift_remove(&presence_record_id).is_some() {
            self.broadcast_presence_removal(session_id, &presence_record_id);
        }
    }

    fn broadcast_presence_removal(&mut self, originator: &SessionId, presence_record_id: &RecordId) {
        let mut diff = RecordOpMap::new();
        diff.insert(presence_record_id.clone(), RecordOp::Remove);
        for (id, session) in self.sessions.iter_mut() {
            if id == originator || !session.is_connected() {
                continue;
            }
            session.send(
                ServerMessage::Patch { diff: diff.clone(), server_clock: self.clock },
                self.config.data_message_debounce,
            );
        }
    }

    /// Called periodically by the actor loop (spec.md §4.2 "background
    /// janitor").
    pub fn run_janitor_sweep(&mut self) {
        let to_cancel: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| {
                s.start_wait_expired(self.config.session_start_wait)
                    || s.idle_timeout_expired(self.config.session_idle_timeout)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in to_cancel {
            self.cancel_session(&id);
        }

        let to_hard_remove: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.removal_wait_expired(self.config.session_removal_wait))
            .map(|(id, _)| id.clone())
            .collect();
        for id in to_hard_remove {
            self.sessions.remove(&id);
            tracing::debug!(%id, "session fully removed");
        }
    }

    /// Called periodically by the actor loop to flush any session whose
    /// `DATA_MESSAGE_DEBOUNCE` timer has fired.
    pub fn flush_due_debounces(&mut self) {
        for session in self.sessions.values_mut() {
            if session.debounce_due() {
                session.flush();
            }
        }
    }

    /// Called periodically by the actor loop. Writes are trailing-throttled
    /// (spec.md §4.6): at most one write per `PERSIST_THROTTLE` window.
    pub async fn maybe_flush_persistence(&mut self) {
        let Some(deadline) = self.persist_deadline else { return };
        if Instant::now() < deadline {
            return;
        }
        self.persist_deadline = None;
        let snapshot = self.get_snapshot();
        match serde_json::to_vec(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = self.persistence.put(&self.room_id, bytes).await {
                    tracing::error!(room_id = %self.room_id, error = %e, "persistence write failed");
                }
            }
            Err(e) => tracing::error!(room_id = %self.room_id, error = %e, "failed to serialize snapshot"),
        }
    }

    fn handle_connect(
        &mut self,
        session_id: &SessionId,
        connect_request_id: String,
        protocol_version: u32,
        client_schema: SchemaVersions,
        last_server_clock: u64,
    ) -> Result<(), SyncError> {
        let normalized_version = if protocol_version == LEGACY_PROTOCOL_VERSION_ALIAS {
            tracing::warn!(%session_id, "client used deprecated protocol version 5, treating as 6");
            PROTOCOL_VERSION
        } else {
            protocol_version
        };
        if normalized_version < PROTOCOL_VERSION {
            return Err(SyncError::ClientTooOld { sequence_id: "protocol_version".into() });
        }
        if normalized_version > PROTOCOL_VERSION {
            return Err(SyncError::ServerTooOld { sequence_id: "protocol_version".into() });
        }

        self.schema.check_client_compatible(&client_schema)?;

        let server_versions = self.schema.server_versions();
        let session_schema = if client_schema == server_versions {
            server_versions.clone()
        } else {
            client_schema
        };

        let presence_id = self
            .sessions
            .get(session_id)
            .map(|s| s.presence_id.clone())
            .ok_or_else(|| SyncError::InvalidOperation {
                reason: format!("no session {session_id} awaiting connect"),
            })?;

        let wipe_all = last_server_clock < self.tombstone_history_starts_at_clock
            || last_server_clock > self.clock;

        let mut raw_diff = RecordOpMap::new();
        if wipe_all {
            for (id, entry) in &self.documents {
                if *id == *presence_id.as_record_id() {
                    continue;
                }
                raw_diff.insert(id.clone(), RecordOp::Put(entry.state.clone()));
            }
        } else {
            for (id, entry) in &self.documents {
                if *id == *presence_id.as_record_id() {
                    continue;
                }
                match entry.state.type_name().map(|t| t.scope()) {
                    Some(Scope::Document) => {
                        if entry.last_changed_clock > last_server_clock {
                            raw_diff.insert(id.clone(), RecordOp::Put(entry.state.clone()));
                        }
                    }
                    Some(Scope::Presence) => {
                        raw_diff.insert(id.clone(), RecordOp::Put(entry.state.clone()));
                    }
                    _ => {}
                }
            }
            for (id, &deleted_at) in &self.tombstones {
                if deleted_at > last_server_clock {
                    raw_diff.insert(id.clone(), RecordOp::Remove);
                }
            }
        }

        let mut migrated_diff = RecordOpMap::new();
        for (id, op) in raw_diff {
            let migrated_op = match op {
                RecordOp::Put(record) => {
                    RecordOp::Put(self.schema.down_migrate_record(record, &session_schema)?)
                }
                other => other,
            };
            migrated_diff.insert(id, migrated_op);
        }

        let session = self.sessions.get_mut(session_id).ok_or_else(|| SyncError::InvalidOperation {
            reason: format!("session {session_id} vanished mid-connect"),
        })?;
        session.mark_connected(session_schema.clone());
        session.send(
            ServerMessage::Connect {
                connect_request_id,
                hydration_type: if wipe_all { HydrationType::WipeAll } else { HydrationType::WipePresence },
                protocol_version: PROTOCOL_VERSION,
                schema: server_versions,
                server_clock: self.clock,
                diff: migrated_diff,
            },
            self.config.data_message_debounce,
        );
        Ok(())
    }

    fn handle_push(
        &mut self,
        session_id: &SessionId,
        client_clock: u64,
        diff_param: Option<RecordOpMap>,
        presence_op: Option<RecordOp>,
    ) -> Result<(), SyncError> {
        let sender_schema = self
            .sessions
            .get(session_id)
            .and_then(|s| s.declared_schema().cloned())
            .ok_or_else(|| SyncError::InvalidOperation {
                reason: format!("push from non-connected session {session_id}"),
            })?;
        let presence_record_id = self.sessions[session_id].presence_id.as_record_id().clone();

        let mut documents = self.documents.clone();
        let mut tombstones = self.tombstones.clone();
        let clock = self.clock + 1;

        let mut document_logical: IndexMap<RecordId, (Option<Record>, Option<Record>)> = IndexMap::new();
        let mut presence_logical: IndexMap<RecordId, (Option<Record>, Option<Record>)> = IndexMap::new();

        let apply_all = || -> Result<(), SyncError> {
            if let Some(op) = presence_op {
                let change = apply_incoming_op(
                    &mut documents,
                    &mut tombstones,
                    &presence_record_id,
                    op,
                    &self.schema,
                    &sender_schema,
                    clock,
                    true,
                )?;
                presence_logical.insert(presence_record_id.clone(), change);
            }
            if let Some(diff_map) = diff_param.clone() {
                for (id, op) in diff_map {
                    let change = apply_incoming_op(
                        &mut documents,
                        &mut tombstones,
                        &id,
                        op,
                        &self.schema,
                        &sender_schema,
                        clock,
                        false,
                    )?;
                    document_logical.insert(id, change);
                }
            }
            Ok(())
        };
        apply_all()?;

        let mut document_changes_for_sender = RecordOpMap::new();
        for (id, (prev, next)) in &document_logical {
            if let Some(op) = down_migrate_change(&self.schema, &sender_schema, prev.as_ref(), next.as_ref())? {
                document_changes_for_sender.insert(id.clone(), op);
            }
        }

        let original_diff_empty = diff_param.as_ref().is_none_or(|d| d.is_empty());
        let action = if original_diff_empty {
            PushAction::Commit
        } else if record_op_maps_equal(&document_changes_for_sender, diff_param.as_ref().unwrap()) {
            PushAction::Commit
        } else if document_changes_for_sender.is_empty() {
            PushAction::Discard
        } else {
            PushAction::RebaseWithDiff(document_changes_for_sender.clone())
        };

        self.documents = documents;
        self.tombstones = tombstones;
        self.clock = clock;

        let mutated = document_logical
            .values()
            .any(|(p, n)| !option_records_deep_equal(p.as_ref(), n.as_ref()));
        if mutated {
            self.document_clock = self.clock;
            if self.persist_deadline.is_none() {
                self.persist_deadline = Some(Instant::now() + self.config.persist_throttle);
            }
            self.prune_tombstones_if_needed();
        }

        if let Some(session) = self.sessions.get_mut(session_id) {
            session.send(
                ServerMessage::PushResult { client_clock, server_clock: self.clock, action },
                self.config.data_message_debounce,
            );
        }

        let peer_ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(id, s)| *id != session_id && s.is_connected())
            .map(|(id, _)| id.clone())
            .collect();

        for peer_id in peer_ids {
            let Some(peer_schema) = self.sessions.get(&peer_id).and_then(|s| s.declared_schema().cloned()) else {
                continue;
            };
            let mut peer_diff = RecordOpMap::new();
            let mut migration_failed = false;
            for (id, (prev, next)) in document_logical.iter().chain(presence_logical.iter()) {
                match down_migrate_change(&self.schema, &peer_schema, prev.as_ref(), next.as_ref()) {
                    Ok(Some(op)) => {
                        peer_diff.insert(id.clone(), op);
                    }
                    Ok(None) => {}
                    Err(_) => {
                        migration_failed = true;
                        break;
                    }
                }
            }
            if migration_failed {
                self.reject_session(
                    &peer_id,
                    SyncError::ClientTooOld { sequence_id: "<broadcast-down-migration>".into() },
                );
                continue;
            }
            if !peer_diff.is_empty() {
                if let Some(session) = self.sessions.get_mut(&peer_id) {
                    session.send(
                        ServerMessage::Patch { diff: peer_diff, server_clock: self.clock },
                        self.config.data_message_debounce,
                    );
                }
            }
        }

        Ok(())
    }

    fn prune_tombstones_if_needed(&mut self) {
        if self.tombstones.len() <= self.config.max_tombstones {
            return;
        }
        let prune_count = self.config.tombstone_prune_buffer.min(self.tombstones.len());
        let mut entries: Vec<(RecordId, u64)> =
            self.tombstones.iter().map(|(id, &c)| (id.clone(), c)).collect();
        entries.sort_by_key(|(_, c)| *c);
        let mut new_floor = self.tombstone_history_starts_at_clock;
        for (id, deleted_at) in entries.into_iter().take(prune_count) {
            self.tombstones.shift_remove(&id);
            new_floor = new_floor.max(deleted_at + 1);
        }
        self.tombstone_history_starts_at_clock = new_floor;
    }
}

fn parse_snapshot_bytes(bytes: &[u8]) -> Option<RoomSnapshot> {
    serde_json::from_slice(bytes).ok().or_else(|| migrate_legacy_snapshot(bytes))
}

/// Applies one incoming record-op to the scratch transaction state
/// (spec.md §4.5 "Push handling" step 3). Returns the logical
/// before/after record, leaving the actual per-recipient down-migration to
/// the broadcast step ([`down_migrate_change`]).
#[allow(clippy::too_many_arguments)]
fn apply_incoming_op(
    documents: &mut IndexMap<RecordId, SnapshotEntry>,
    tombstones: &mut IndexMap<RecordId, u64>,
    id: &RecordId,
    op: RecordOp,
    schema: &Schema,
    sender_schema: &SchemaVersions,
    clock: u64,
    is_presence: bool,
) -> Result<(Option<Record>, Option<Record>), SyncError> {
    let prev = documents.get(id).map(|e| e.state.clone());
    match op {
        RecordOp::Put(record) => {
            let scope_ok = if is_presence {
                record.type_name() == Some(TypeName::InstancePresence)
            } else {
                record.type_name().map(|t| t.scope()) == Some(Scope::Document)
            };
            if !scope_ok {
                return Err(SyncError::InvalidRecord {
                    record_id: id.to_string(),
                    reason: "typeName does not match the expected scope for this op".into(),
                });
            }
            let migrated = schema.up_migrate_record(record, sender_schema)?;
            validate_record(&migrated)?;
            tombstones.shift_remove(id);
            documents.insert(id.clone(), SnapshotEntry { state: migrated.clone(), last_changed_clock: clock });
            Ok((prev, Some(migrated)))
        }
        RecordOp::Patch(incoming_diff) => {
            let scope_ok = if is_presence {
                id.type_name() == Some(TypeName::InstancePresence)
            } else {
                id.type_name().map(|t| t.scope()) == Some(Scope::Document)
            };
            if !scope_ok {
                return Err(SyncError::InvalidRecord {
                    record_id: id.to_string(),
                    reason: "typeName does not match the expected scope for this op".into(),
                });
            }
            let Some(current) = prev.clone() else {
                return Ok((None, None));
            };
            let down = schema.down_migrate_record(current.clone(), sender_schema)?;
            let candidate = if deep_eq(&down.as_value(), &current.as_value()) {
                apply_record(&current, &incoming_diff)
            } else {
                let patched_down = apply_record(&down, &incoming_diff);
                schema.up_migrate_record(patched_down, sender_schema)?
            };
            validate_record(&candidate)?;
            if deep_eq(&candidate.as_value(), &current.as_value()) {
                return Ok((prev.clone(), prev));
            }
            documents.insert(id.clone(), SnapshotEntry { state: candidate.clone(), last_changed_clock: clock });
            Ok((prev, Some(candidate)))
        }
        RecordOp::Remove => {
            if is_presence {
                return Err(SyncError::InvalidOperation {
                    reason: format!("Remove not permitted on presence op for {id}"),
                });
            }
            if id.type_name().map(|t| t.scope()) != Some(Scope::Document) {
                return Err(SyncError::InvalidOperation {
                    reason: format!("Remove not permitted on non-document-scope record {id}"),
                });
            }
            if documents.shift_remove(id).is_some() {
                tombstones.insert(id.clone(), clock);
                Ok((prev, None))
            } else {
                Ok((None, None))
            }
        }
    }
}

/// Converts a logical before/after record change into the record-op one
/// specific recipient schema should see, down-migrating both sides
/// independently before diffing (spec.md §4.5 step 5 "migrate-down to that
/// peer's schema").
fn down_migrate_change(
    schema: &Schema,
    recipient_schema: &SchemaVersions,
    prev: Option<&Record>,
    next: Option<&Record>,
) -> Result<Option<RecordOp>, SyncError> {
    match (prev, next) {
        (None, None) => Ok(None),
        (None, Some(next)) => {
            let migrated = schema.down_migrate_record(next.clone(), recipient_schema)?;
            Ok(Some(RecordOp::Put(migrated)))
        }
        (Some(_), None) => Ok(Some(RecordOp::Remove)),
        (Some(prev), Some(next)) => {
            let prev_down = schema.down_migrate_record(prev.clone(), recipient_schema)?;
            let next_down = schema.down_migrate_record(next.clone(), recipient_schema)?;
            Ok(diff_records(&prev_down, &next_down).map(RecordOp::Patch))
        }
    }
}

fn option_records_deep_equal(a: Option<&Record>, b: Option<&Record>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => deep_eq(&a.as_value(), &b.as_value()),
        _ => false,
    }
}

fn record_op_maps_equal(a: &RecordOpMap, b: &RecordOpMap) -> bool {
    a == b
}

/// Commands accepted by a room's actor task.
enum RoomCommand {
    AcceptSession { session_id: SessionId, sender: mpsc::UnboundedSender<ServerMessage> },
    HandleMessage { session_id: SessionId, message: ClientMessage },
    HandleClose { session_id: SessionId },
    HandleError { session_id: SessionId },
    GetSnapshot { reply: oneshot::Sender<RoomSnapshot> },
    Close,
}

/// A cheap, `Clone`, `Send` handle to a room's actor task (spec.md §5). The
/// `Room` itself never leaves that task, which gives "no reentrancy" and
/// "one writer at a time" for free from the type system.
#[derive(Clone)]
pub struct RoomHandle {
    sender: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn accept_session(&self, session_id: SessionId, sender: mpsc::UnboundedSender<ServerMessage>) {
        let _ = self.sender.send(RoomCommand::AcceptSession { session_id, sender });
    }

    pub fn handle_message(&self, session_id: SessionId, message: ClientMessage) {
        let _ = self.sender.send(RoomCommand::HandleMessage { session_id, message });
    }

    pub fn handle_close(&self, session_id: SessionId) {
        let _ = self.sender.send(RoomCommand::HandleClose { session_id });
    }

    pub fn handle_error(&self, session_id: SessionId) {
        let _ = self.sender.send(RoomCommand::HandleError { session_id });
    }

    pub async fn get_snapshot(&self) -> Option<RoomSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.sender.send(RoomCommand::GetSnapshot { reply }).ok()?;
        rx.await.ok()
    }

    pub fn close(&self) {
        let _ = self.sender.send(RoomCommand::Close);
    }
}

/// Spawns a room's actor task and returns a handle to it (spec.md §5).
pub fn spawn(room_id: String, schema: Arc<Schema>, persistence: Arc<dyn PersistenceAdapter>) -> RoomHandle {
    let (sender, receiver) = mpsc::unbounded_channel();
    tokio::spawn(run_actor(room_id, schema, persistence, receiver));
    RoomHandle { sender }
}

async fn run_actor(
    room_id: String,
    schema: Arc<Schema>,
    persistence: Arc<dyn PersistenceAdapter>,
    mut receiver: mpsc::UnboundedReceiver<RoomCommand>,
) {
    let mut room = Room::load_or_bootstrap(room_id, schema, persistence).await;
    let mut janitor = tokio::time::interval(room.config.janitor_interval);
    let mut debounce_ticker = tokio::time::interval(room.config.data_message_debounce);
    loop {
        tokio::select! {
            cmd = receiver.recv() => {
                match cmd {
                    Some(RoomCommand::AcceptSession { session_id, sender }) => {
                        room.accept_session(session_id, sender);
                    }
                    Some(RoomCommand::HandleMessage { session_id, message }) => {
                        room.handle_message(&session_id, message);
                    }
                    Some(RoomCommand::HandleClose { session_id }) => room.handle_close(&session_id),
                    Some(RoomCommand::HandleError { session_id }) => room.handle_error(&session_id),
                    Some(RoomCommand::GetSnapshot { reply }) => {
                        let _ = reply.send(room.get_snapshot());
                    }
                    Some(RoomCommand::Close) | None => {
                        room.close().await;
                        break;
                    }
                }
            }
            _ = janitor.tick() => {
                room.run_janitor_sweep();
                room.maybe_flush_persistence().await;
            }
            _ = debounce_ticker.tick() => {
                room.flush_due_debounces();
            }
        }
    }
}
