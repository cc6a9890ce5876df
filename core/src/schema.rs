//! Schema & Migration Engine (spec.md §4.3). A `Schema` is a named set of
//! migration sequences; each sequence is an ordered, strictly-incrementing
//! chain of versioned migrations, either record-scoped (transforms one
//! record) or store-scoped (transforms the whole record map, for
//! cross-record refactors).

use std::collections::HashSet;

use indexmap::IndexMap;
use serde_json::{json, Map, Value};

use crate::error::SyncError;
use crate::records::{Record, RecordId, TypeName};

/// A migration sequence identifier, e.g. `"com.example.shape.geo"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SequenceId(pub String);

impl SequenceId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for SequenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Versions declared by a client (or the server's own, computed) per
/// sequence. Wire field `schema` on `connect`, and the `schema` field of a
/// persisted snapshot.
pub type SchemaVersions = IndexMap<SequenceId, u32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationScope {
    Record,
    Store,
}

/// Which way a migration call was going when it raised
/// [`MigrationError::Internal`] — purely to pick `ClientTooOld` vs
/// `ServerTooOld` for the wire-facing `incompatibility_error` (spec.md §7
/// "Treat as ClientTooOld or ServerTooOld depending on direction").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDirection {
    /// Client's old-schema record or store being brought up to the
    /// server's current schema (ingress).
    Up,
    /// Server's current-schema record being brought down to an older
    /// client's schema (egress).
    Down,
}

/// Error raised by an `up`/`down` migrator function. Distinguishes the two
/// directions a schema mismatch can go so the caller can produce the right
/// `SyncError` variant.
#[derive(Debug, Clone)]
pub enum MigrationError {
    /// The migration refuses to run because the input predates what it can
    /// handle — surfaces as `ClientTooOld`.
    TooOld,
    /// The migration refuses to run because the input is from a newer world
    /// than it understands — surfaces as `ServerTooOld`.
    TooNew,
    /// Anything else unexpected inside a migrator body.
    Internal(String),
}

pub type RecordUpFn = fn(Record) -> Result<Record, MigrationError>;
pub type RecordDownFn = fn(Record) -> Result<Record, MigrationError>;
pub type RecordFilterFn = fn(&Record) -> bool;
pub type StoreUpFn = fn(&mut IndexMap<RecordId, Record>) -> Result<(), MigrationError>;
pub type StoreDownFn = fn(&mut IndexMap<RecordId, Record>) -> Result<(), MigrationError>;

pub enum MigrationKind {
    Record {
        filter: Option<RecordFilterFn>,
        up: RecordUpFn,
        down: Option<RecordDownFn>,
    },
    Store {
        up: StoreUpFn,
        down: Option<StoreDownFn>,
    },
}

/// One versioned step in a migration sequence. `version` is 1-based and
/// must increase strictly by 1 within its sequence (checked by
/// `MigrationSequence::new`, not re-checked on every lookup).
pub struct Migration {
    pub version: u32,
    pub kind: MigrationKind,
    /// A migration whose `down` is present but must still be treated as
    /// unusable (e.g. a deliberately removed downgrade path). Absence of
    /// `down` already implies this; `retired` covers the case where a
    /// migration author wants to keep the function around for reference.
    pub retired: bool,
}

impl Migration {
    pub fn scope(&self) -> MigrationScope {
        match self.kind {
            MigrationKind::Record { .. } => MigrationScope::Record,
            MigrationKind::Store { .. } => MigrationScope::Store,
        }
    }

    fn has_usable_down(&self) -> bool {
        if self.retired {
            return false;
        }
        match &self.kind {
            MigrationKind::Record { down, .. } => down.is_some(),
            MigrationKind::Store { down, .. } => down.is_some(),
        }
    }
}

pub struct MigrationSequence {
    pub id: SequenceId,
    /// Other sequences this one's store-scope migrations must run after.
    /// Not exercised by the concrete catalogue below (single store-scope
    /// sequence with no cross-sequence dependency) but carried for fidelity
    /// to spec.md §4.3's "topological order of depends_on".
    pub depends_on: Vec<SequenceId>,
    pub migrations: Vec<Migration>,
}

impl MigrationSequence {
    pub fn new(id: SequenceId, depends_on: Vec<SequenceId>, migrations: Vec<Migration>) -> Self {
        for (i, m) in migrations.iter().enumerate() {
            assert_eq!(
                m.version,
                (i + 1) as u32,
                "migration versions in sequence {id} must start at 1 and increase by 1"
            );
        }
        Self {
            id,
            depends_on,
            migrations,
        }
    }

    fn max_version(&self) -> u32 {
        self.migrations.last().map(|m| m.version).unwrap_or(0)
    }
}

/// The server's full set of migration sequences, topologically independent
/// for the purposes of per-record lookups (order between distinct sequences
/// never matters for correctness, only order *within* a sequence does).
pub struct Schema {
    sequences: IndexMap<SequenceId, MigrationSequence>,
}

fn to_sync_error(
    err: MigrationError,
    sequence_id: &SequenceId,
    version: u32,
    direction: MigrationDirection,
) -> SyncError {
    match err {
        MigrationError::TooOld => SyncError::ClientTooOld {
            sequence_id: sequence_id.0.clone(),
        },
        MigrationError::TooNew => SyncError::ServerTooOld {
            sequence_id: sequence_id.0.clone(),
        },
        MigrationError::Internal(reason) => SyncError::MigrationInternal {
            sequence_id: sequence_id.0.clone(),
            version,
            reason,
            direction,
        },
    }
}

impl Schema {
    pub fn new(sequences: Vec<MigrationSequence>) -> Self {
        Self {
            sequences: sequences.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    /// The server's own declared versions: the max version in every
    /// sequence. Sent back to clients on connect as `schema`.
    pub fn server_versions(&self) -> SchemaVersions {
        self.sequences
            .values()
            .map(|seq| (seq.id.clone(), seq.max_version()))
            .collect()
    }

    /// Connect-time compatibility check (spec.md §4.3 steps under "Connect
    /// handling" item 3, and the symmetric `ServerTooOld` reasoning).
    pub fn check_client_compatible(&self, client_versions: &SchemaVersions) -> Result<(), SyncError> {
        for (seq_id, &declared) in client_versions {
            match self.sequences.get(seq_id) {
                None => {
                    return Err(SyncError::ServerTooOld {
                        sequence_id: seq_id.0.clone(),
                    })
                }
                Some(seq) => {
                    if declared > seq.max_version() {
                        return Err(SyncError::ServerTooOld {
                            sequence_id: seq_id.0.clone(),
                        });
                    }
                }
            }
        }
        for seq in self.sequences.values() {
            let client_v = client_versions.get(&seq.id).copied().unwrap_or(0);
            for m in &seq.migrations {
                if m.version <= client_v {
                    continue;
                }
                if m.scope() == MigrationScope::Store || !m.has_usable_down() {
                    return Err(SyncError::ClientTooOld {
                        sequence_id: seq.id.0.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Up-migrate one record from `client_versions` to the server's current
    /// versions (spec.md §4.3 "Ingress"). Store-scope migrations are
    /// skipped here: a client missing one is already rejected by
    /// [`Schema::check_client_compatible`] at connect time, so by the time a
    /// push reaches this function the client is guaranteed current on every
    /// store-scope sequence.
    pub fn up_migrate_record(
        &self,
        mut record: Record,
        client_versions: &SchemaVersions,
    ) -> Result<Record, SyncError> {
        for seq in self.sequences.values() {
            let client_v = client_versions.get(&seq.id).copied().unwrap_or(0);
            for m in &seq.migrations {
                if m.version <= client_v {
                    continue;
                }
                if let MigrationKind::Record { filter, up, .. } = &m.kind {
                    if filter.is_none_or(|f| f(&record)) {
                        record = up(record)
                            .map_err(|e| to_sync_error(e, &seq.id, m.version, MigrationDirection::Up))?;
                    }
                }
            }
        }
        Ok(record)
    }

    /// Down-migrate one record from the server's current versions to
    /// `client_versions` (spec.md §4.3 "Egress"). Sequences are walked in
    /// reverse version order within each sequence so `down` functions see
    /// the record the way their matching `up` left it.
    pub fn down_migrate_record(
        &self,
        mut record: Record,
        client_versions: &SchemaVersions,
    ) -> Result<Record, SyncError> {
        for seq in self.sequences.values() {
            let client_v = client_versions.get(&seq.id).copied().unwrap_or(0);
            for m in seq.migrations.iter().rev() {
                if m.version <= client_v {
                    continue;
                }
                if let MigrationKind::Record { filter, down, .. } = &m.kind {
                    if filter.is_none_or(|f| f(&record)) {
                        if m.retired {
                            return Err(SyncError::ClientTooOld {
                                sequence_id: seq.id.0.clone(),
                            });
                        }
                        let down_fn = down.ok_or_else(|| SyncError::ClientTooOld {
                            sequence_id: seq.id.0.clone(),
                        })?;
                        record = down_fn(record)
                            .map_err(|e| to_sync_error(e, &seq.id, m.version, MigrationDirection::Down))?;
                    }
                }
            }
        }
        Ok(record)
    }

    /// Applies every store-scope migration's `up` unconditionally, in
    /// topological order of [`MigrationSequence::depends_on`] (spec.md §4.3
    /// "apply all server-side migrations... in topological order of
    /// `depends_on`"). Called once when a snapshot is loaded (cold start or
    /// legacy-format conversion), since store-scope migrations in this
    /// engine are always retroactive: a connecting client is required to
    /// already be current on them (enforced by
    /// [`Schema::check_client_compatible`]), so the only place they ever
    /// need to run is against data written before the sequence existed.
    pub fn apply_store_migrations(
        &self,
        store: &mut IndexMap<RecordId, Record>,
    ) -> Result<(), SyncError> {
        for seq_id in self.store_migration_order() {
            let seq = &self.sequences[seq_id];
            for m in &seq.migrations {
                if let MigrationKind::Store { up, .. } = &m.kind {
                    up(store).map_err(|e| to_sync_error(e, &seq.id, m.version, MigrationDirection::Up))?;
                }
            }
        }
        Ok(())
    }

    /// Depth-first topological order over `depends_on`, so a sequence's
    /// migrations always run after every sequence it depends on. Panics on
    /// a cycle: sequences are fixed at startup by [`server_schema`], so a
    /// cycle can only be a construction bug, never runtime input.
    fn store_migration_order(&self) -> Vec<&SequenceId> {
        let mut order = Vec::with_capacity(self.sequences.len());
        let mut visited: HashSet<&SequenceId> = HashSet::new();
        let mut visiting: HashSet<&SequenceId> = HashSet::new();

        fn visit<'a>(
            seq_id: &'a SequenceId,
            sequences: &'a IndexMap<SequenceId, MigrationSequence>,
            visited: &mut HashSet<&'a SequenceId>,
            visiting: &mut HashSet<&'a SequenceId>,
            order: &mut Vec<&'a SequenceId>,
        ) {
            if visited.contains(seq_id) {
                return;
            }
            assert!(visiting.insert(seq_id), "cyclic depends_on involving sequence {seq_id}");
            if let Some(seq) = sequences.get(seq_id) {
                for dep in &seq.depends_on {
                    visit(dep, sequences, visited, visiting, order);
                }
            }
            visiting.remove(seq_id);
            visited.insert(seq_id);
            order.push(seq_id);
        }

        for seq_id in self.sequences.keys() {
            visit(seq_id, &self.sequences, &mut visited, &mut visiting, &mut order);
        }
        order
    }
}

fn filter_is_geo_shape(record: &Record) -> bool {
    record.type_name() == Some(TypeName::Shape) && record.inner_type() == Some("geo")
}

fn up_geo_w_h_into_props(mut record: Record) -> Result<Record, MigrationError> {
    let w = record.0.remove("w");
    let h = record.0.remove("h");
    if w.is_some() || h.is_some() {
        let props = record
            .0
            .entry("props".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(props_map) = props else {
            return Err(MigrationError::Internal(
                "geo shape `props` is not an object".into(),
            ));
        };
        if let Some(w) = w {
            props_map.insert("w".to_string(), w);
        }
        if let Some(h) = h {
            props_map.insert("h".to_string(), h);
        }
    }
    Ok(record)
}

fn down_geo_props_w_h_to_top(mut record: Record) -> Result<Record, MigrationError> {
    if let Some(Value::Object(props_map)) = record.0.get_mut("props") {
        let w = props_map.remove("w");
        let h = props_map.remove("h");
        if let Some(w) = w {
            record.0.insert("w".to_string(), w);
        }
        if let Some(h) = h {
            record.0.insert("h".to_string(), h);
        }
    }
    Ok(record)
}

/// Extracts a legacy embedded `boundTo` reference on a shape into a
/// first-class `binding:<id>` record (SPEC_FULL.md §4.3's store-scope
/// worked example). Retroactive and irreversible: there is no `down`.
fn up_extract_bound_to_into_binding(
    store: &mut IndexMap<RecordId, Record>,
) -> Result<(), MigrationError> {
    let mut new_bindings: Vec<(RecordId, Record)> = Vec::new();
    for (id, record) in store.iter_mut() {
        if record.type_name() != Some(TypeName::Shape) {
            continue;
        }
        let Some(bound_to) = record.0.remove("boundTo") else {
            continue;
        };
        let Some(to_id) = bound_to.as_str() else {
            continue;
        };
        let unique_part = id.as_str().trim_start_matches("shape:");
        let binding_id = RecordId::new(TypeName::Binding, format!("{unique_part}-bound"));
        let binding_record = Record::from_value(json!({
            "id": binding_id.as_str(),
            "typeName": "binding",
            "type": "arrow",
            "fromId": id.as_str(),
            "toId": to_id,
            "props": { "terminal": "end" },
        }))
        .expect("constructed value is always an object");
        new_bindings.push((binding_id, binding_record));
    }
    for (id, record) in new_bindings {
        store.insert(id, record);
    }
    Ok(())
}

/// The concrete migration catalogue for this reference service
/// (SPEC_FULL.md §4.3): one record-scope sequence with an up/down pair, and
/// one store-scope retroactive sequence with no down.
pub fn server_schema() -> Schema {
    let geo_sequence = MigrationSequence::new(
        SequenceId::new("com.example.shape.geo"),
        vec![],
        vec![Migration {
            version: 1,
            kind: MigrationKind::Record {
                filter: Some(filter_is_geo_shape),
                up: up_geo_w_h_into_props,
                down: Some(down_geo_props_w_h_to_top),
            },
            retired: false,
        }],
    );

    let shape_store_sequence = MigrationSequence::new(
        SequenceId::new("com.example.shape"),
        vec![],
        vec![Migration {
            version: 1,
            kind: MigrationKind::Store {
                up: up_extract_bound_to_into_binding,
                down: None,
            },
            retired: false,
        }],
    );

    Schema::new(vec![geo_sequence, shape_store_sequence])
}
