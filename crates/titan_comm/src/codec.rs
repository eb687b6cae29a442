//! Self-describing binary encoding of [`Value`] graphs.
//!
//! Every value starts with a one byte ASCII tag. Lengths and counts are
//! unsigned LEB128, integers are signed LEB128, floats are little-endian
//! IEEE-754 doubles. Anything that is not a bool, null, undefined or 32-bit
//! integer is entered in a per-message reference table before its children
//! are written; a later occurrence of the same composite (or an equal float,
//! string or binary string) is written as `r` plus its table index.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::value::{BufferKind, Shared, TypedBuffer, Value, insert_entry, insert_field, insert_member};

pub const TAG_INTEGER: u8 = b'i';
pub const TAG_NUMBER: u8 = b'n';
pub const TAG_STRING: u8 = b's';
pub const TAG_BINARY: u8 = b'B';
pub const TAG_TRUE: u8 = b't';
pub const TAG_FALSE: u8 = b'f';
pub const TAG_UNDEFINED: u8 = b'u';
pub const TAG_NULL: u8 = b'N';
pub const TAG_ARRAY: u8 = b'a';
pub const TAG_MAP: u8 = b'M';
pub const TAG_SET: u8 = b'S';
pub const TAG_BUFFER: u8 = b'b';
pub const TAG_OBJECT: u8 = b'o';
pub const TAG_REFERENCE: u8 = b'r';

/// Nesting bound for decoding; deeper input is rejected instead of exhausting the stack.
const MAX_DEPTH: usize = 512;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("trailing data: {0} byte(s) left after the value")]
    TrailingData(usize),
}

fn malformed(msg: impl Into<String>) -> CodecError {
    CodecError::MalformedMessage(msg.into())
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut encoder = Encoder::default();
    encoder.value(value);
    encoder.out
}

pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    let mut decoder = Decoder {
        buf: bytes,
        pos: 0,
        refs: Vec::new(),
    };
    let value = decoder.value(0)?;
    let rest = bytes.len() - decoder.pos;
    if rest > 0 {
        return Err(CodecError::TrailingData(rest));
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// varints
// ---------------------------------------------------------------------------

pub fn write_uleb(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn write_ileb(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

// ---------------------------------------------------------------------------
// encoder
// ---------------------------------------------------------------------------

#[derive(Hash, PartialEq, Eq)]
enum RefKey {
    Float(u64),
    Str(String),
    Binary(Vec<u8>),
    Node(usize),
}

impl RefKey {
    /// `None` for values that are tabled but can never be matched again (NaN).
    fn of(value: &Value) -> Option<RefKey> {
        match value {
            Value::Float(f) if f.is_nan() => None,
            // zero and negative zero compare equal
            Value::Float(f) if *f == 0.0 => Some(RefKey::Float(0)),
            Value::Float(f) => Some(RefKey::Float(f.to_bits())),
            Value::Str(s) => Some(RefKey::Str(s.clone())),
            Value::Binary(b) => Some(RefKey::Binary(b.clone())),
            Value::Buffer(b) => Some(RefKey::Node(Arc::as_ptr(b) as usize)),
            Value::Seq(s) | Value::Set(s) => Some(RefKey::Node(s.addr())),
            Value::Map(m) => Some(RefKey::Node(m.addr())),
            Value::Record(r) => Some(RefKey::Node(r.addr())),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Encoder {
    out: Vec<u8>,
    table: HashMap<RefKey, u64>,
    next: u64,
}

impl Encoder {
    fn value(&mut self, value: &Value) {
        match value {
            Value::Undefined => return self.out.push(TAG_UNDEFINED),
            Value::Null => return self.out.push(TAG_NULL),
            Value::Bool(true) => return self.out.push(TAG_TRUE),
            Value::Bool(false) => return self.out.push(TAG_FALSE),
            Value::Int(i) => {
                self.out.push(TAG_INTEGER);
                return write_ileb(&mut self.out, i64::from(*i));
            }
            _ => {}
        }

        let key = RefKey::of(value);
        if let Some(index) = key.as_ref().and_then(|k| self.table.get(k)) {
            self.out.push(TAG_REFERENCE);
            return write_uleb(&mut self.out, *index);
        }
        let index = self.next;
        self.next += 1;
        if let Some(key) = key {
            self.table.insert(key, index);
        }

        match value {
            Value::Float(f) => {
                self.out.push(TAG_NUMBER);
                self.out.extend_from_slice(&f.to_le_bytes());
            }
            Value::Str(s) => {
                self.out.push(TAG_STRING);
                self.bytes(s.as_bytes());
            }
            Value::Binary(b) => {
                self.out.push(TAG_BINARY);
                self.bytes(b);
            }
            Value::Buffer(buffer) => {
                self.out.push(TAG_BUFFER);
                write_uleb(&mut self.out, buffer.kind.tag());
                self.bytes(&buffer.bytes);
            }
            Value::Seq(items) => self.items(TAG_ARRAY, items),
            Value::Set(items) => self.items(TAG_SET, items),
            Value::Map(entries) => {
                let entries = entries.snapshot();
                self.out.push(TAG_MAP);
                write_uleb(&mut self.out, entries.len() as u64);
                for (key, item) in &entries {
                    self.value(key);
                    self.value(item);
                }
            }
            Value::Record(fields) => {
                let fields = fields.snapshot();
                self.out.push(TAG_OBJECT);
                write_uleb(&mut self.out, fields.len() as u64);
                for (key, item) in &fields {
                    self.bytes(key.as_bytes());
                    self.value(item);
                }
            }
            Value::Undefined | Value::Null | Value::Bool(_) | Value::Int(_) => {}
        }
    }

    fn items(&mut self, tag: u8, items: &Shared<Vec<Value>>) {
        let items = items.snapshot();
        self.out.push(tag);
        write_uleb(&mut self.out, items.len() as u64);
        for item in &items {
            self.value(item);
        }
    }

    fn bytes(&mut self, bytes: &[u8]) {
        write_uleb(&mut self.out, bytes.len() as u64);
        self.out.extend_from_slice(bytes);
    }
}

// ---------------------------------------------------------------------------
// decoder
// ---------------------------------------------------------------------------

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    refs: Vec<Value>,
}

impl<'a> Decoder<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| malformed(format!("truncated input at offset {}", self.pos)))?;
        let buf = self.buf;
        let slice = &buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn uleb(&mut self) -> Result<u64, CodecError> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.byte()?;
            if shift >= 64 || (shift == 63 && byte & 0x7e != 0) {
                return Err(malformed("unsigned varint overflows 64 bits"));
            }
            result |= u64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    fn ileb(&mut self) -> Result<i64, CodecError> {
        let mut result: i64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.byte()?;
            if shift >= 64 {
                return Err(malformed("signed varint overflows 64 bits"));
            }
            result |= i64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    fn len(&mut self) -> Result<usize, CodecError> {
        let len = self.uleb()?;
        usize::try_from(len).map_err(|_| malformed(format!("length {len} out of range")))
    }

    /// Pre-allocation capped by what the remaining input could possibly hold.
    fn capacity(&self, count: usize) -> usize {
        count.min(self.buf.len() - self.pos)
    }

    fn chunk(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.len()?;
        self.take(len)
    }

    fn text(&mut self) -> Result<String, CodecError> {
        let bytes = self.chunk()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed("string is not valid UTF-8"))
    }

    /// Reserves the next table slot for a value being produced.
    fn reserve(&mut self) -> usize {
        self.refs.push(Value::Undefined);
        self.refs.len() - 1
    }

    fn value(&mut self, depth: usize) -> Result<Value, CodecError> {
        if depth > MAX_DEPTH {
            return Err(malformed("nesting too deep"));
        }
        let tag = self.byte()?;
        match tag {
            TAG_UNDEFINED => Ok(Value::Undefined),
            TAG_NULL => Ok(Value::Null),
            TAG_TRUE => Ok(Value::Bool(true)),
            TAG_FALSE => Ok(Value::Bool(false)),
            TAG_INTEGER => {
                let raw = self.ileb()?;
                i32::try_from(raw)
                    .map(Value::Int)
                    .map_err(|_| malformed(format!("integer {raw} exceeds 32 bits")))
            }
            TAG_REFERENCE => {
                let index = self.uleb()?;
                usize::try_from(index)
                    .ok()
                    .and_then(|i| self.refs.get(i))
                    .cloned()
                    .ok_or_else(|| malformed(format!("unknown reference {index}")))
            }
            TAG_NUMBER => {
                let slot = self.reserve();
                let raw = self.take(8)?;
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(raw);
                Ok(self.fill(slot, Value::Float(f64::from_le_bytes(bytes))))
            }
            TAG_STRING => {
                let slot = self.reserve();
                let text = self.text()?;
                Ok(self.fill(slot, Value::Str(text)))
            }
            TAG_BINARY => {
                let slot = self.reserve();
                let bytes = self.chunk()?.to_vec();
                Ok(self.fill(slot, Value::Binary(bytes)))
            }
            TAG_BUFFER => {
                let slot = self.reserve();
                let kind = BufferKind::from_tag(self.uleb()?);
                let bytes = self.chunk()?.to_vec();
                Ok(self.fill(slot, Value::Buffer(Arc::new(TypedBuffer { kind, bytes }))))
            }
            TAG_ARRAY | TAG_SET => {
                let node = Shared::new(Vec::new());
                let value = if tag == TAG_ARRAY {
                    Value::Seq(node.clone())
                } else {
                    Value::Set(node.clone())
                };
                self.refs.push(value.clone());
                let count = self.len()?;
                node.write().reserve(self.capacity(count));
                for _ in 0..count {
                    let item = self.value(depth + 1)?;
                    if tag == TAG_ARRAY {
                        node.write().push(item);
                    } else {
                        insert_member(&mut node.write(), item);
                    }
                }
                Ok(value)
            }
            TAG_MAP => {
                let node = Shared::new(Vec::new());
                self.refs.push(Value::Map(node.clone()));
                let count = self.len()?;
                for _ in 0..count {
                    let key = self.value(depth + 1)?;
                    let item = self.value(depth + 1)?;
                    insert_entry(&mut node.write(), key, item);
                }
                Ok(Value::Map(node))
            }
            TAG_OBJECT => {
                let node = Shared::new(Vec::new());
                self.refs.push(Value::Record(node.clone()));
                let count = self.len()?;
                for _ in 0..count {
                    let key = self.text()?;
                    let item = self.value(depth + 1)?;
                    insert_field(&mut node.write(), key, item);
                }
                Ok(Value::Record(node))
            }
            other => Err(malformed(format!(
                "unknown tag 0x{other:02x} at offset {}",
                self.pos - 1
            ))),
        }
    }

    fn fill(&mut self, slot: usize, value: Value) -> Value {
        self.refs[slot] = value.clone();
        value
    }
}
