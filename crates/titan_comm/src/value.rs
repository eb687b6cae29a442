//! The structured value model carried by every frame.
//!
//! Composite values (sequences, maps, sets, records) live behind [`Shared`]
//! handles so the same node can appear several times in one graph, including
//! inside itself. Identity of a composite is the identity of its handle.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Element type of a byte buffer, kept so typed arrays survive the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Raw,
    Buffer,
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
}

impl BufferKind {
    pub fn tag(self) -> u64 {
        match self {
            BufferKind::Raw => 0,
            BufferKind::Buffer => 1,
            BufferKind::Int8 => 2,
            BufferKind::Uint8 => 3,
            BufferKind::Uint8Clamped => 4,
            BufferKind::Int16 => 5,
            BufferKind::Uint16 => 6,
            BufferKind::Int32 => 7,
            BufferKind::Uint32 => 8,
            BufferKind::Float32 => 9,
            BufferKind::Float64 => 10,
            BufferKind::BigInt64 => 11,
            BufferKind::BigUint64 => 12,
        }
    }

    /// Unknown tags fall back to [`BufferKind::Raw`].
    pub fn from_tag(tag: u64) -> Self {
        match tag {
            1 => BufferKind::Buffer,
            2 => BufferKind::Int8,
            3 => BufferKind::Uint8,
            4 => BufferKind::Uint8Clamped,
            5 => BufferKind::Int16,
            6 => BufferKind::Uint16,
            7 => BufferKind::Int32,
            8 => BufferKind::Uint32,
            9 => BufferKind::Float32,
            10 => BufferKind::Float64,
            11 => BufferKind::BigInt64,
            12 => BufferKind::BigUint64,
            _ => BufferKind::Raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedBuffer {
    pub kind: BufferKind,
    pub bytes: Vec<u8>,
}

/// A reference-counted, interior-mutable node of a value graph.
pub struct Shared<T>(Arc<RwLock<T>>);

impl<T> Shared<T> {
    pub fn new(inner: T) -> Self {
        Self(Arc::new(RwLock::new(inner)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl<T: Clone> Shared<T> {
    /// Copies the current contents out so no guard is held while walking children.
    pub fn snapshot(&self) -> T {
        self.read().clone()
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Int(i32),
    Float(f64),
    Str(String),
    Binary(Vec<u8>),
    Buffer(Arc<TypedBuffer>),
    Seq(Shared<Vec<Value>>),
    Map(Shared<Vec<(Value, Value)>>),
    Set(Shared<Vec<Value>>),
    Record(Shared<Vec<(String, Value)>>),
}

impl Value {
    pub fn seq(items: Vec<Value>) -> Self {
        Value::Seq(Shared::new(items))
    }

    /// Builds a map; later duplicates of a key replace the earlier value in place.
    pub fn map(entries: Vec<(Value, Value)>) -> Self {
        let mut out = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            insert_entry(&mut out, key, value);
        }
        Value::Map(Shared::new(out))
    }

    pub fn set(items: Vec<Value>) -> Self {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            insert_member(&mut out, item);
        }
        Value::Set(Shared::new(out))
    }

    pub fn record<K: Into<String>>(fields: impl IntoIterator<Item = (K, Value)>) -> Self {
        let mut out: Vec<(String, Value)> = Vec::new();
        for (key, value) in fields {
            insert_field(&mut out, key.into(), value);
        }
        Value::Record(Shared::new(out))
    }

    pub fn buffer(kind: BufferKind, bytes: Vec<u8>) -> Self {
        Value::Buffer(Arc::new(TypedBuffer { kind, bytes }))
    }

    /// A plain byte buffer, the shape used for uploaded binaries.
    pub fn bytes(bytes: Vec<u8>) -> Self {
        Self::buffer(BufferKind::Buffer, bytes)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Binary(_) => "binary",
            Value::Buffer(_) => "buffer",
            Value::Seq(_) => "sequence",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
            Value::Record(_) => "record",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integers, and floats holding an exact 32-bit integer.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && *f >= i32::MIN as f64 && *f <= i32::MAX as f64 => {
                Some(*f as i32)
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(f64::from(*i)),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Value::Buffer(buffer) => Some(buffer.bytes.clone()),
            Value::Binary(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    /// Elements of a sequence or set.
    pub fn to_vec(&self) -> Option<Vec<Value>> {
        match self {
            Value::Seq(items) | Value::Set(items) => Some(items.snapshot()),
            _ => None,
        }
    }

    pub fn to_entries(&self) -> Option<Vec<(Value, Value)>> {
        match self {
            Value::Map(entries) => Some(entries.snapshot()),
            _ => None,
        }
    }

    pub fn to_fields(&self) -> Option<Vec<(String, Value)>> {
        match self {
            Value::Record(fields) => Some(fields.snapshot()),
            _ => None,
        }
    }

    /// Looks up a record field.
    pub fn field(&self, key: &str) -> Option<Value> {
        match self {
            Value::Record(fields) => fields
                .read()
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.clone()),
            _ => None,
        }
    }

    /// Appends to a sequence in place; false for any other kind.
    pub fn push(&self, item: Value) -> bool {
        match self {
            Value::Seq(items) => {
                items.write().push(item);
                true
            }
            _ => false,
        }
    }

    /// Sets a record field in place; false for any other kind.
    pub fn insert_field(&self, key: impl Into<String>, value: Value) -> bool {
        match self {
            Value::Record(fields) => {
                insert_field(&mut fields.write(), key.into(), value);
                true
            }
            _ => false,
        }
    }

    /// Key equality used by maps and sets: primitives by value (NaN equals
    /// NaN, zero equals negative zero), composites and buffers by identity.
    pub fn same_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Buffer(a), Value::Buffer(b)) => Arc::ptr_eq(a, b),
            (Value::Seq(a), Value::Seq(b)) | (Value::Set(a), Value::Set(b)) => a.ptr_eq(b),
            (Value::Map(a), Value::Map(b)) => a.ptr_eq(b),
            (Value::Record(a), Value::Record(b)) => a.ptr_eq(b),
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            _ => false,
        }
    }

    /// Lossy conversion for display and logs. Cycles become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut path = Vec::new();
        to_json(self, &mut path)
    }
}

pub(crate) fn insert_entry(entries: &mut Vec<(Value, Value)>, key: Value, value: Value) {
    match entries.iter_mut().find(|(existing, _)| existing.same_value(&key)) {
        Some(slot) => slot.1 = value,
        None => entries.push((key, value)),
    }
}

pub(crate) fn insert_member(members: &mut Vec<Value>, item: Value) {
    if !members.iter().any(|existing| existing.same_value(&item)) {
        members.push(item);
    }
}

pub(crate) fn insert_field(fields: &mut Vec<(String, Value)>, key: String, value: Value) {
    match fields.iter_mut().find(|(existing, _)| *existing == key) {
        Some(slot) => slot.1 = value,
        None => fields.push((key, value)),
    }
}

impl PartialEq for Value {
    /// Structural equality. Cycles compare equal once both sides loop back
    /// to a pair of nodes already under comparison.
    fn eq(&self, other: &Self) -> bool {
        let mut seen = HashSet::new();
        structural_eq(self, other, &mut seen)
    }
}

fn structural_eq(a: &Value, b: &Value, seen: &mut HashSet<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y || (x.is_nan() && y.is_nan()),
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Binary(x), Value::Binary(y)) => x == y,
        (Value::Buffer(x), Value::Buffer(y)) => x == y,
        (Value::Seq(x), Value::Seq(y)) | (Value::Set(x), Value::Set(y)) => {
            if !seen.insert((x.addr(), y.addr())) {
                return true;
            }
            let (xs, ys) = (x.snapshot(), y.snapshot());
            xs.len() == ys.len() && xs.iter().zip(&ys).all(|(p, q)| structural_eq(p, q, seen))
        }
        (Value::Map(x), Value::Map(y)) => {
            if !seen.insert((x.addr(), y.addr())) {
                return true;
            }
            let (xs, ys) = (x.snapshot(), y.snapshot());
            xs.len() == ys.len()
                && xs.iter().zip(&ys).all(|((xk, xv), (yk, yv))| {
                    structural_eq(xk, yk, seen) && structural_eq(xv, yv, seen)
                })
        }
        (Value::Record(x), Value::Record(y)) => {
            if !seen.insert((x.addr(), y.addr())) {
                return true;
            }
            let (xs, ys) = (x.snapshot(), y.snapshot());
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(&ys)
                    .all(|((xk, xv), (yk, yv))| xk == yk && structural_eq(xv, yv, seen))
        }
        _ => false,
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut path = Vec::new();
        debug_value(self, f, &mut path)
    }
}

fn debug_value(value: &Value, f: &mut fmt::Formatter<'_>, path: &mut Vec<usize>) -> fmt::Result {
    let addr = match value {
        Value::Undefined => return f.write_str("undefined"),
        Value::Null => return f.write_str("null"),
        Value::Bool(b) => return write!(f, "{b}"),
        Value::Int(i) => return write!(f, "{i}"),
        Value::Float(x) => return write!(f, "{x:?}"),
        Value::Str(s) => return write!(f, "{s:?}"),
        Value::Binary(b) => return write!(f, "Binary({} bytes)", b.len()),
        Value::Buffer(b) => return write!(f, "{:?}({} bytes)", b.kind, b.bytes.len()),
        Value::Seq(s) | Value::Set(s) => s.addr(),
        Value::Map(m) => m.addr(),
        Value::Record(r) => r.addr(),
    };
    if path.contains(&addr) {
        return f.write_str("<cycle>");
    }
    path.push(addr);
    let result = match value {
        Value::Seq(items) => {
            f.write_str("[")?;
            for (i, item) in items.snapshot().iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                debug_value(item, f, path)?;
            }
            f.write_str("]")
        }
        Value::Set(items) => {
            f.write_str("Set{")?;
            for (i, item) in items.snapshot().iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                debug_value(item, f, path)?;
            }
            f.write_str("}")
        }
        Value::Map(entries) => {
            f.write_str("Map{")?;
            for (i, (key, item)) in entries.snapshot().iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                debug_value(key, f, path)?;
                f.write_str(" => ")?;
                debug_value(item, f, path)?;
            }
            f.write_str("}")
        }
        Value::Record(fields) => {
            f.write_str("{")?;
            for (i, (key, item)) in fields.snapshot().iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{key}: ")?;
                debug_value(item, f, path)?;
            }
            f.write_str("}")
        }
        _ => Ok(()),
    };
    path.pop();
    result
}

fn to_json(value: &Value, path: &mut Vec<usize>) -> serde_json::Value {
    use serde_json::Value as Json;

    let addr = match value {
        Value::Undefined | Value::Null => return Json::Null,
        Value::Bool(b) => return Json::Bool(*b),
        Value::Int(i) => return Json::from(*i),
        Value::Float(x) => {
            return serde_json::Number::from_f64(*x).map(Json::Number).unwrap_or(Json::Null);
        }
        Value::Str(s) => return Json::String(s.clone()),
        Value::Binary(b) => return Json::from(b.clone()),
        Value::Buffer(b) => return Json::from(b.bytes.clone()),
        Value::Seq(s) | Value::Set(s) => s.addr(),
        Value::Map(m) => m.addr(),
        Value::Record(r) => r.addr(),
    };
    if path.contains(&addr) {
        return Json::Null;
    }
    path.push(addr);
    let json = match value {
        Value::Seq(items) | Value::Set(items) => {
            Json::Array(items.snapshot().iter().map(|item| to_json(item, path)).collect())
        }
        Value::Map(entries) => {
            let entries = entries.snapshot();
            if entries.iter().all(|(key, _)| key.as_str().is_some()) {
                let mut object = serde_json::Map::new();
                for (key, item) in &entries {
                    let name = key.as_str().unwrap_or_default().to_string();
                    object.insert(name, to_json(item, path));
                }
                Json::Object(object)
            } else {
                Json::Array(
                    entries
                        .iter()
                        .map(|(key, item)| Json::Array(vec![to_json(key, path), to_json(item, path)]))
                        .collect(),
                )
            }
        }
        Value::Record(fields) => {
            let mut object = serde_json::Map::new();
            for (key, item) in fields.snapshot().iter() {
                object.insert(key.clone(), to_json(item, path));
            }
            Json::Object(object)
        }
        _ => Json::Null,
    };
    path.pop();
    json
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::seq(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_keys_stay_unique() {
        let map = Value::map(vec![
            (Value::from("a"), Value::from(1)),
            (Value::from("b"), Value::from(2)),
            (Value::from("a"), Value::from(3)),
        ]);
        let entries = map.to_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], (Value::from("a"), Value::from(3)));
    }

    #[test]
    fn test_set_uses_same_value_zero() {
        let set = Value::set(vec![
            Value::Float(0.0),
            Value::Float(-0.0),
            Value::Float(f64::NAN),
            Value::Float(f64::NAN),
        ]);
        assert_eq!(set.to_vec().unwrap().len(), 2);
    }

    #[test]
    fn test_cyclic_equality_terminates() {
        let a = Value::seq(vec![Value::from(1)]);
        a.push(a.clone());
        let b = Value::seq(vec![Value::from(1)]);
        b.push(b.clone());
        assert_eq!(a, b);

        let c = Value::seq(vec![Value::from(2)]);
        c.push(c.clone());
        assert_ne!(a, c);
    }

    #[test]
    fn test_debug_marks_cycles() {
        let record = Value::record([("name", Value::from("node"))]);
        record.insert_field("me", record.clone());
        assert_eq!(format!("{record:?}"), "{name: \"node\", me: <cycle>}");
    }

    #[test]
    fn test_to_json_of_record_and_map() {
        let value = Value::record([
            ("id", Value::from("abc")),
            ("n", Value::from(2)),
            ("tags", Value::map(vec![(Value::from("k"), Value::from(true))])),
        ]);
        assert_eq!(
            value.to_json(),
            serde_json::json!({ "id": "abc", "n": 2, "tags": { "k": true } })
        );
    }
}
