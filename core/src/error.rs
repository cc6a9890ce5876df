//! Error taxonomy (spec.md §7). Each variant records enough context to build
//! both the client-facing `incompatibility_error`/`error` frame and a useful
//! log line, and knows its own disposition.

use thiserror::Error;

use crate::schema::MigrationDirection;

/// What a `SyncError` should cause the room to do with the originating
/// session/socket once raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Send `incompatibility_error`, close the socket, remove the session.
    CloseSession,
    /// Send `{type: error, error}`, close the socket if still open.
    CloseSocketOnly,
    /// Log only; no client-visible effect.
    LogOnly,
}

/// Wire-level incompatibility reason, sent verbatim in `incompatibility_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IncompatibilityReason {
    ClientTooOld,
    ServerTooOld,
    InvalidRecord,
    InvalidOperation,
    RoomNotFound,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("client schema is too old: sequence {sequence_id} needs a migration the client doesn't have")]
    ClientTooOld { sequence_id: String },

    #[error("server schema is too old: client declares sequence/version the server doesn't know: {sequence_id}")]
    ServerTooOld { sequence_id: String },

    #[error("record {record_id} failed validation after migration: {reason}")]
    InvalidRecord { record_id: String, reason: String },

    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("persistence write failed for room {room_id}: {source}")]
    Persistence {
        room_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("migration {sequence_id}/{version} raised an unexpected error ({direction:?}): {reason}")]
    MigrationInternal {
        sequence_id: String,
        version: u32,
        reason: String,
        direction: MigrationDirection,
    },
}

impl SyncError {
    pub fn disposition(&self) -> Disposition {
        match self {
            SyncError::ClientTooOld { .. }
            | SyncError::ServerTooOld { .. }
            | SyncError::InvalidRecord { .. }
            | SyncError::InvalidOperation { .. } => Disposition::CloseSession,
            SyncError::Protocol(_) => Disposition::CloseSocketOnly,
            SyncError::Persistence { .. } => Disposition::LogOnly,
            SyncError::MigrationInternal { .. } => Disposition::CloseSession,
        }
    }

    /// The `incompatibility_error` reason this error maps to, if any.
    pub fn incompatibility_reason(&self) -> Option<IncompatibilityReason> {
        match self {
            SyncError::ClientTooOld { .. } => Some(IncompatibilityReason::ClientTooOld),
            SyncError::ServerTooOld { .. } => Some(IncompatibilityReason::ServerTooOld),
            SyncError::InvalidRecord { .. } => Some(IncompatibilityReason::InvalidRecord),
            SyncError::InvalidOperation { .. } => Some(IncompatibilityReason::InvalidOperation),
            SyncError::MigrationInternal { direction, .. } => Some(match direction {
                MigrationDirection::Up => IncompatibilityReason::ClientTooOld,
                MigrationDirection::Down => IncompatibilityReason::ServerTooOld,
            }),
            SyncError::Protocol(_) | SyncError::Persistence { .. } => None,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
