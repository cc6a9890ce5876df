//! sync-core: the room-replication engine behind a multi-user whiteboard
//! sync service. No HTTP, no WebSocket framing at the transport level —
//! just the record model, diff engine, schema/migrations, wire message
//! grammar, session bookkeeping, the room actor, and persistence.

pub mod config;
pub mod diff;
pub mod error;
pub mod persistence;
pub mod records;
pub mod room;
pub mod schema;
pub mod session;
pub mod wire;

pub use error::{SyncError, SyncResult};
pub use records::{Record, RecordId, Scope, TypeName};
pub use room::{spawn as spawn_room, Room, RoomHandle};
pub use schema::{Schema, SchemaVersions};
pub use session::{PresenceId, SessionId};
