//! The diff engine (spec.md §4.4): two pure functions, `diff` and `apply`,
//! plus the recursive `ValueOp`/`ObjectDiff` wire types from spec.md §9's
//! design notes and §6's wire encoding.
//!
//! `ValueOp`/`RecordOp` serialize as JSON tuple-arrays (`["put", v]`, not
//! `{"put": v}`) to match the wire format in spec.md §6, so both carry
//! hand-written `Serialize`/`Deserialize` impls instead of serde's default
//! internally-tagged representation.

use std::fmt;

use indexmap::IndexMap;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::records::Record;

/// A structural diff: key to value-op. Ordered so iteration (and therefore
/// re-serialization) is deterministic across runs, per spec.md §9.
pub type ObjectDiff = IndexMap<String, ValueOp>;

/// Value-level op inside an object-diff (spec.md §3 "Diff Operations").
#[derive(Debug, Clone, PartialEq)]
pub enum ValueOp {
    Put(Value),
    Delete,
    Append(Vec<Value>, usize),
    Patch(ObjectDiff),
}

/// Record-level op (spec.md §3 "Diff Operations").
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOp {
    Put(Record),
    Patch(ObjectDiff),
    Remove,
}

impl Serialize for ValueOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ValueOp::Put(v) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("put")?;
                seq.serialize_element(v)?;
                seq.end()
            }
            ValueOp::Delete => {
                let mut seq = serializer.serialize_seq(Some(1))?;
                seq.serialize_element("delete")?;
                seq.end()
            }
            ValueOp::Append(values, offset) => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("append")?;
                seq.serialize_element(values)?;
                seq.serialize_element(offset)?;
                seq.end()
            }
            ValueOp::Patch(diff) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("patch")?;
                seq.serialize_element(diff)?;
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ValueOp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ValueOpVisitor;
        impl<'de> Visitor<'de> for ValueOpVisitor {
            type Value = ValueOp;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(r#"a value-op array like ["put", value]"#)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<ValueOp, A::Error> {
                let tag: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                match tag.as_str() {
                    "put" => {
                        let v: Value = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        Ok(ValueOp::Put(v))
                    }
                    "delete" => Ok(ValueOp::Delete),
                    "append" => {
                        let values: Vec<Value> = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        let offset: usize = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                        Ok(ValueOp::Append(values, offset))
                    }
                    "patch" => {
                        let diff: ObjectDiff = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        Ok(ValueOp::Patch(diff))
                    }
                    other => Err(de::Error::unknown_variant(
                        other,
                        &["put", "delete", "append", "patch"],
                    )),
                }
            }
        }
        deserializer.deserialize_seq(ValueOpVisitor)
    }
}

impl Serialize for RecordOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RecordOp::Put(record) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("put")?;
                seq.serialize_element(&record.as_value())?;
                seq.end()
            }
            RecordOp::Patch(diff) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("patch")?;
                seq.serialize_element(diff)?;
                seq.end()
            }
            RecordOp::Remove => {
                let mut seq = serializer.serialize_seq(Some(1))?;
                seq.serialize_element("remove")?;
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for RecordOp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordOpVisitor;
        impl<'de> Visitor<'de> for RecordOpVisitor {
            type Value = RecordOp;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(r#"a record-op array like ["put", record]"#)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<RecordOp, A::Error> {
                let tag: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                match tag.as_str() {
                    "put" => {
                        let v: Value = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        let record = Record::from_value(v).ok_or_else(|| {
                            de::Error::custom("put op payload must be a JSON object")
                        })?;
                        Ok(RecordOp::Put(record))
                    }
                    "patch" => {
                        let diff: ObjectDiff = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        Ok(RecordOp::Patch(diff))
                    }
                    "remove" => Ok(RecordOp::Remove),
                    other => Err(de::Error::unknown_variant(other, &["put", "patch", "remove"])),
                }
            }
        }
        deserializer.deserialize_seq(RecordOpVisitor)
    }
}

/// Explicit deep-equal over JSON trees (spec.md §9): order-independent on
/// object keys, `+0`/`-0` equal, `NaN` never equal to anything (IEEE-754,
/// inherited for free from `f64`'s `PartialEq`).
pub fn deep_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| deep_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|v2| deep_eq(v, v2)))
        }
        _ => false,
    }
}

fn deep_eq_record(a: &Record, b: &Record) -> bool {
    deep_eq(&a.as_value(), &b.as_value())
}

/// Structural diff of two records (spec.md §4.4). `props` is recursed into;
/// every other key is whole-replaced on change. Returns `None` for
/// deep-equal inputs.
pub fn diff(prev: &Record, next: &Record) -> Option<ObjectDiff> {
    if deep_eq_record(prev, next) {
        return None;
    }
    let mut out = ObjectDiff::new();
    for (key, pv) in prev.0.iter() {
        match next.0.get(key) {
            None => {
                out.insert(key.clone(), ValueOp::Delete);
            }
            Some(nv) => {
                if deep_eq(pv, nv) {
                    continue;
                }
                if key == "props" {
                    if let Some(op) = diff_value_op(pv, nv) {
                        out.insert(key.clone(), op);
                    }
                } else {
                    out.insert(key.clone(), ValueOp::Put(nv.clone()));
                }
            }
        }
    }
    for (key, nv) in next.0.iter() {
        if !prev.0.contains_key(key) {
            out.insert(key.clone(), ValueOp::Put(nv.clone()));
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// General recursive value diff, used to recurse into `props` and into
/// nested objects/arrays found there.
fn diff_value_op(prev: &Value, next: &Value) -> Option<ValueOp> {
    if deep_eq(prev, next) {
        return None;
    }
    match (prev, next) {
        (Value::Object(p), Value::Object(n)) => {
            let inner = diff_object_map(p, n);
            if inner.is_empty() {
                None
            } else {
                Some(ValueOp::Patch(inner))
            }
        }
        (Value::Array(p), Value::Array(n)) => Some(diff_array(p, n)),
        _ => Some(ValueOp::Put(next.clone())),
    }
}

fn diff_object_map(prev: &Map<String, Value>, next: &Map<String, Value>) -> ObjectDiff {
    let mut out = ObjectDiff::new();
    for (key, pv) in prev.iter() {
        match next.get(key) {
            None => {
                out.insert(key.clone(), ValueOp::Delete);
            }
            Some(nv) => {
                if let Some(op) = diff_value_op(pv, nv) {
                    out.insert(key.clone(), op);
                }
            }
        }
    }
    for (key, nv) in next.iter() {
        if !prev.contains_key(key) {
            out.insert(key.clone(), ValueOp::Put(nv.clone()));
        }
    }
    out
}

/// Array diff policy (spec.md §3): same-length per-index patch when ≤20% of
/// indices changed, an append when `next` is `prev` plus a trailing run, or
/// else a whole replace.
fn diff_array(prev: &[Value], next: &[Value]) -> ValueOp {
    if prev.len() == next.len() && !prev.is_empty() {
        let mut per_index = ObjectDiff::new();
        let mut changed = 0usize;
        for (i, (a, b)) in prev.iter().zip(next.iter()).enumerate() {
            if !deep_eq(a, b) {
                changed += 1;
                if let Some(op) = diff_value_op(a, b) {
                    per_index.insert(i.to_string(), op);
                }
            }
        }
        let ratio = changed as f64 / prev.len() as f64;
        if ratio <= 0.2 {
            return ValueOp::Patch(per_index);
        }
    } else if next.len() > prev.len() {
        let shared_prefix_matches = prev
            .iter()
            .zip(next.iter())
            .all(|(a, b)| deep_eq(a, b));
        if shared_prefix_matches {
            let appended = next[prev.len()..].to_vec();
            return ValueOp::Append(appended, prev.len());
        }
    }
    ValueOp::Put(Value::Array(next.to_vec()))
}

/// Apply an object-diff to a JSON value (spec.md §4.4). Never mutates the
/// caller's `value`; always returns a new owned value. A `Patch` targeting a
/// non-object/non-array value is silently dropped for that key; an `Append`
/// whose `offset` doesn't match the current array length is silently
/// dropped. Both match spec.md's "callers must detect via equality check"
/// contract — the caller compares the result to the input if it needs to
/// know whether anything actually changed.
pub fn apply(value: &Value, diff: &ObjectDiff) -> Value {
    match value {
        Value::Object(obj) => Value::Object(apply_object(obj, diff)),
        other => other.clone(),
    }
}

/// Apply an object-diff directly to a record (used by `Room` when merging
/// an inbound `Patch` record-op into the authoritative copy).
pub fn apply_record(record: &Record, diff: &ObjectDiff) -> Record {
    Record(apply_object(&record.0, diff))
}

fn apply_object(obj: &Map<String, Value>, diff: &ObjectDiff) -> Map<String, Value> {
    let mut result = obj.clone();
    for (key, op) in diff {
        match op {
            ValueOp::Delete => {
                result.remove(key);
            }
            _ => {
                let current = result.get(key).cloned().unwrap_or(Value::Null);
                result.insert(key.clone(), apply_value(&current, op));
            }
        }
    }
    result
}

fn apply_value(value: &Value, op: &ValueOp) -> Value {
    match op {
        ValueOp::Put(v) => v.clone(),
        ValueOp::Delete => value.clone(),
        ValueOp::Append(values, offset) => match value {
            Value::Array(arr) if arr.len() == *offset => {
                let mut next = arr.clone();
                next.extend(values.iter().cloned());
                Value::Array(next)
            }
            other => other.clone(),
        },
        ValueOp::Patch(diff) => match value {
            Value::Object(obj) => Value::Object(apply_object(obj, diff)),
            Value::Array(arr) => Value::Array(apply_array_patch(arr, diff)),
            other => other.clone(),
        },
    }
}

fn apply_array_patch(arr: &[Value], diff: &ObjectDiff) -> Vec<Value> {
    let mut result = arr.to_vec();
    for (key, op) in diff {
        if let Ok(idx) = key.parse::<usize>() {
            if idx < result.len() && !matches!(op, ValueOp::Delete) {
                result[idx] = apply_value(&result[idx], op);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        Record::from_value(v).unwrap()
    }

    #[test]
    fn diff_of_equal_records_is_none() {
        let a = rec(json!({"id": "shape:x1", "typeName": "shape", "x": 1}));
        assert_eq!(diff(&a, &a), None);
    }

    #[test]
    fn round_trip_whole_key_replace() {
        let prev = rec(json!({"id": "shape:x1", "typeName": "shape", "x": 1, "y": 2}));
        let next = rec(json!({"id": "shape:x1", "typeName": "shape", "x": 10, "y": 2}));
        let d = diff(&prev, &next).expect("should differ");
        let applied = apply_record(&prev, &d);
        assert!(deep_eq_record(&applied, &next));
    }

    #[test]
    fn round_trip_props_recursion() {
        let prev = rec(json!({
            "id": "shape:x1", "typeName": "shape",
            "props": {"w": 10, "h": 20, "color": "red"}
        }));
        let next = rec(json!({
            "id": "shape:x1", "typeName": "shape",
            "props": {"w": 15, "h": 20, "color": "red"}
        }));
        let d = diff(&prev, &next).unwrap();
        assert!(matches!(d.get("props"), Some(ValueOp::Patch(_))));
        let applied = apply_record(&prev, &d);
        assert!(deep_eq_record(&applied, &next));
    }

    #[test]
    fn append_safety_no_op_on_length_mismatch() {
        let arr = json!([1, 2, 3]);
        let diff = {
            let mut d = ObjectDiff::new();
            d.insert("items".into(), ValueOp::Append(vec![json!(4)], 0));
            d
        };
        let obj = json!({"items": arr});
        let result = apply(&obj, &diff);
        assert_eq!(result["items"], json!([1, 2, 3]));
    }

    #[test]
    fn append_safety_applies_when_offset_matches() {
        let diff = {
            let mut d = ObjectDiff::new();
            d.insert("items".into(), ValueOp::Append(vec![json!(4)], 3));
            d
        };
        let obj = json!({"items": [1, 2, 3]});
        let result = apply(&obj, &diff);
        assert_eq!(result["items"], json!([1, 2, 3, 4]));
    }

    #[test]
    fn patch_on_non_object_target_is_dropped() {
        let mut inner = ObjectDiff::new();
        inner.insert("a".into(), ValueOp::Put(json!(1)));
        let diff = {
            let mut d = ObjectDiff::new();
            d.insert("field".into(), ValueOp::Patch(inner));
            d
        };
        let obj = json!({"field": 5});
        let result = apply(&obj, &diff);
        assert_eq!(result["field"], json!(5));
    }

    #[test]
    fn record_op_wire_encoding_round_trips() {
        let op = RecordOp::Put(rec(json!({"id": "page:p1", "typeName": "page"})));
        let s = serde_json::to_string(&op).unwrap();
        assert_eq!(s, r#"["put",{"id":"page:p1","typeName":"page"}]"#);
        let back: RecordOp = serde_json::from_str(&s).unwrap();
        assert_eq!(back, op);

        let remove = RecordOp::Remove;
        assert_eq!(serde_json::to_string(&remove).unwrap(), r#"["remove"]"#);
    }

    #[test]
    fn value_op_append_wire_encoding_round_trips() {
        let op = ValueOp::Append(vec![json!(1), json!(2)], 3);
        let s = serde_json::to_string(&op).unwrap();
        assert_eq!(s, r#"["append",[1,2],3]"#);
        let back: ValueOp = serde_json::from_str(&s).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn deep_eq_treats_plus_zero_and_minus_zero_as_equal() {
        assert!(deep_eq(&json!(0.0), &json!(-0.0)));
    }

    #[test]
    fn top_level_array_key_always_whole_replaces() {
        // `diff`'s array-patch/append policy only recurses inside `props`;
        // any other top-level key, array or not, whole-replaces.
        let prev = rec(json!({"id": "page:p1", "typeName": "page", "ids": [1, 2]}));
        let next = rec(json!({"id": "page:p1", "typeName": "page", "ids": [1, 2, 3]}));
        let d = diff(&prev, &next).unwrap();
        assert!(matches!(d.get("ids"), Some(ValueOp::Put(_))));
    }

    #[test]
    fn diff_array_chooses_append_for_trailing_growth() {
        let prev = vec![json!(1), json!(2)];
        let next = vec![json!(1), json!(2), json!(3)];
        assert_eq!(diff_array(&prev, &next), ValueOp::Append(vec![json!(3)], 2));
    }

    #[test]
    fn diff_array_patches_when_few_indices_change() {
        let prev: Vec<Value> = (0..10).map(|i| json!(i)).collect();
        let mut next = prev.clone();
        next[3] = json!(99);
        let op = diff_array(&prev, &next);
        match op {
            ValueOp::Patch(p) => {
                assert_eq!(p.len(), 1);
                assert_eq!(p.get("3"), Some(&ValueOp::Put(json!(99))));
            }
            other => panic!("expected Patch for a 10% change, got {other:?}"),
        }
    }

    #[test]
    fn diff_array_whole_replaces_when_prefix_does_not_match() {
        let prev = vec![json!(1), json!(2)];
        let next = vec![json!(9), json!(2), json!(3)];
        assert_eq!(diff_array(&prev, &next), ValueOp::Put(Value::Array(next)));
    }

    #[test]
    fn diff_value_op_recurses_through_props_for_array_growth() {
        let prev = rec(json!({"id": "shape:x1", "typeName": "shape", "props": {"ids": [1, 2]}}));
        let next = rec(json!({"id": "shape:x1", "typeName": "shape", "props": {"ids": [1, 2, 3]}}));
        let d = diff(&prev, &next).unwrap();
        match d.get("props") {
            Some(ValueOp::Patch(p)) => {
                assert_eq!(p.get("ids"), Some(&ValueOp::Append(vec![json!(3)], 2)));
            }
            other => panic!("expected props patch, got {other:?}"),
        }
    }
}
