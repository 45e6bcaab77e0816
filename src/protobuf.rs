//! Minimal protocol-buffer wire codec.
//!
//! Covers exactly what the SABR protocol needs: writing tagged varint and
//! length-delimited fields (including nested submessages) for the request
//! body, and parsing arbitrary messages into a field-number map for every
//! framed response part. Field semantics live at the call sites; this module
//! only knows the wire format.

use std::collections::BTreeMap;

use bytes::Bytes;

const WIRE_VARINT: u32 = 0;
const WIRE_FIXED64: u32 = 1;
const WIRE_LEN: u32 = 2;
const WIRE_FIXED32: u32 = 5;

// ---------------------------------------------------------------------------
// Varint codec (standard protobuf, 7-bit continuation)
// ---------------------------------------------------------------------------

/// Append a standard protobuf varint (little-endian 7-bit groups).
pub fn write_uvarint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Read a standard protobuf varint at `*pos`, advancing it.
///
/// `None` on end of buffer or a continuation run past 64 bits.
fn read_uvarint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos)?;
        *pos += 1;
        if shift >= 64 {
            return None;
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Serializes one protobuf message, field by field.
///
/// Submessages nest through [`message_field`](MessageWriter::message_field):
///
/// ```
/// use sabr_fetch::protobuf::MessageWriter;
///
/// let mut w = MessageWriter::new();
/// w.varint_field(1, 251);
/// w.message_field(19, |w| w.string_field(1, "en"));
/// assert_eq!(w.into_bytes()[0], 0x08); // tag: field 1, varint
/// ```
#[derive(Debug, Default)]
pub struct MessageWriter {
    buf: Vec<u8>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn tag(&mut self, field: u32, wire_type: u32) {
        write_uvarint(&mut self.buf, ((field as u64) << 3) | wire_type as u64);
    }

    pub fn varint_field(&mut self, field: u32, value: u64) {
        self.tag(field, WIRE_VARINT);
        write_uvarint(&mut self.buf, value);
    }

    pub fn bytes_field(&mut self, field: u32, value: &[u8]) {
        self.tag(field, WIRE_LEN);
        write_uvarint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(value);
    }

    pub fn string_field(&mut self, field: u32, value: &str) {
        self.bytes_field(field, value.as_bytes());
    }

    /// Write a length-delimited submessage built by `build`.
    pub fn message_field(&mut self, field: u32, build: impl FnOnce(&mut MessageWriter)) {
        let mut inner = MessageWriter::new();
        build(&mut inner);
        self.bytes_field(field, &inner.buf);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

// ---------------------------------------------------------------------------
// Parsed message
// ---------------------------------------------------------------------------

/// One decoded wire value.
#[derive(Debug, Clone)]
pub enum Value {
    Varint(u64),
    Fixed64(i64),
    Bytes(Bytes),
    Fixed32(u32),
}

/// A parsed message: field number -> values in wire order.
///
/// Repeated fields keep their wire-level multiplicity. Parsing never fails;
/// anything the walker cannot make sense of (unknown wire type, truncated
/// length, overlong varint) terminates the walk and the fields decoded so
/// far are returned.
#[derive(Debug, Clone, Default)]
pub struct Message {
    fields: BTreeMap<u32, Vec<Value>>,
}

impl Message {
    pub fn parse(data: Bytes) -> Message {
        let mut fields: BTreeMap<u32, Vec<Value>> = BTreeMap::new();
        let buf = &data[..];
        let mut pos = 0usize;

        while pos < buf.len() {
            let Some(tag) = read_uvarint(buf, &mut pos) else {
                break;
            };
            let field = (tag >> 3) as u32;
            let value = match (tag & 0x7) as u32 {
                WIRE_VARINT => match read_uvarint(buf, &mut pos) {
                    Some(v) => Value::Varint(v),
                    None => break,
                },
                WIRE_FIXED64 => {
                    if buf.len() - pos < 8 {
                        break;
                    }
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&buf[pos..pos + 8]);
                    pos += 8;
                    Value::Fixed64(i64::from_le_bytes(raw))
                }
                WIRE_LEN => {
                    let Some(len) = read_uvarint(buf, &mut pos) else {
                        break;
                    };
                    let Some(end) = pos.checked_add(len as usize) else {
                        break;
                    };
                    if end > buf.len() {
                        break;
                    }
                    let slice = data.slice(pos..end);
                    pos = end;
                    Value::Bytes(slice)
                }
                WIRE_FIXED32 => {
                    if buf.len() - pos < 4 {
                        break;
                    }
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(&buf[pos..pos + 4]);
                    pos += 4;
                    Value::Fixed32(u32::from_le_bytes(raw))
                }
                _ => break,
            };
            fields.entry(field).or_default().push(value);
        }

        Message { fields }
    }

    fn first(&self, field: u32) -> Option<&Value> {
        self.fields.get(&field)?.first()
    }

    pub fn first_varint(&self, field: u32) -> Option<u64> {
        match self.first(field)? {
            Value::Varint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn first_bool(&self, field: u32) -> Option<bool> {
        self.first_varint(field).map(|v| v != 0)
    }

    pub fn first_bytes(&self, field: u32) -> Option<&Bytes> {
        match self.first(field)? {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn first_string(&self, field: u32) -> Option<String> {
        std::str::from_utf8(self.first_bytes(field)?)
            .ok()
            .map(str::to_owned)
    }

    /// Recursively parse the first length-delimited value as a submessage.
    pub fn first_message(&self, field: u32) -> Option<Message> {
        self.first_bytes(field).map(|b| Message::parse(b.clone()))
    }

    pub fn all_messages(&self, field: u32) -> Vec<Message> {
        self.fields
            .get(&field)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| match v {
                        Value::Bytes(b) => Some(Message::parse(b.clone())),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all_varints(&self, field: u32) -> Vec<u64> {
        self.fields
            .get(&field)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| match v {
                        Value::Varint(n) => Some(*n),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
