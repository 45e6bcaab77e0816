//! UMP (Universal Media Protocol) framing for SABR responses.
//!
//! A response body is a concatenation of frames ("parts"):
//!   [varint: part_type] [varint: part_size] [raw bytes: part_data]
//!
//! The varint encoding is the protocol's own variable-length integer format,
//! NOT the standard protobuf varint: the number of leading 1-bits in the
//! first byte selects the total length.

use bytes::{Bytes, BytesMut};

use crate::error::{Result, SabrError};

// ---------------------------------------------------------------------------
// Part type constants
// ---------------------------------------------------------------------------

pub const MEDIA_HEADER: u32 = 20;
pub const MEDIA: u32 = 21;
pub const MEDIA_END: u32 = 22;
pub const LIVE_METADATA: u32 = 31;
pub const NEXT_REQUEST_POLICY: u32 = 35;
pub const FORMAT_INITIALIZATION_METADATA: u32 = 42;
pub const SABR_REDIRECT: u32 = 43;
pub const SABR_ERROR: u32 = 44;
pub const SABR_CONTEXT_UPDATE: u32 = 57;
pub const STREAM_PROTECTION_STATUS: u32 = 58;
pub const SABR_CONTEXT_SENDING_POLICY: u32 = 59;

// ---------------------------------------------------------------------------
// Variable-length integer codec
// ---------------------------------------------------------------------------

/// Total encoded length implied by the first byte.
fn varint_len(first: u8) -> usize {
    if first < 128 {
        1
    } else if first < 192 {
        2
    } else if first < 224 {
        3
    } else if first < 240 {
        4
    } else {
        5
    }
}

/// Read a UMP varint from the front of `buf`.
///
/// Returns `Some((value, bytes_consumed))`, or `None` if `buf` holds less
/// than a complete varint. The caller decides whether `None` means "wait for
/// more data" or "truncated at end of stream".
///
/// Layout:
///   1 byte:  first < 128      -> value = first
///   2 bytes: first 128..192   -> low 6 bits of first, next byte = bits 6..13
///   3 bytes: first 192..224   -> low 5 bits of first, next 2 bytes above
///   4 bytes: first 224..240   -> low 4 bits of first, next 3 bytes above
///   5 bytes: first >= 240     -> first byte discarded, next 4 bytes LE u32
pub fn read_varint(buf: &[u8]) -> Option<(u32, usize)> {
    let first = *buf.first()?;
    let len = varint_len(first);
    if buf.len() < len {
        return None;
    }

    let value = match len {
        1 => first as u32,
        2 => (first as u32 & 0x3f) | (buf[1] as u32) << 6,
        3 => (first as u32 & 0x1f) | (buf[1] as u32 | (buf[2] as u32) << 8) << 5,
        4 => {
            (first as u32 & 0x0f)
                | (buf[1] as u32 | (buf[2] as u32) << 8 | (buf[3] as u32) << 16) << 4
        }
        _ => u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]),
    };
    Some((value, len))
}

/// Encode `value` as a UMP varint, appending to `out`.
///
/// Picks the shortest form that fits: boundaries 128, 16384, 2097152,
/// 268435456, otherwise the 5-byte form.
pub fn write_varint(out: &mut Vec<u8>, value: u32) {
    if value < 1 << 7 {
        out.push(value as u8);
    } else if value < 1 << 14 {
        out.push(0x80 | (value & 0x3f) as u8);
        out.push((value >> 6) as u8);
    } else if value < 1 << 21 {
        out.push(0xc0 | (value & 0x1f) as u8);
        out.push((value >> 5) as u8);
        out.push((value >> 13) as u8);
    } else if value < 1 << 28 {
        out.push(0xe0 | (value & 0x0f) as u8);
        out.push((value >> 4) as u8);
        out.push((value >> 12) as u8);
        out.push((value >> 20) as u8);
    } else {
        out.push(0xf0);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

// ---------------------------------------------------------------------------
// UMP part
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UmpPart {
    pub part_type: u32,
    pub data: Bytes,
}

// ---------------------------------------------------------------------------
// Streaming parser
// ---------------------------------------------------------------------------

/// Accumulates chunked HTTP response data and lazily yields complete parts.
///
/// Feed each response chunk with [`push`](UmpParser::push), drain with
/// [`next_part`](UmpParser::next_part), and call
/// [`finish`](UmpParser::finish) once the body ends: end-of-stream at a part
/// boundary is a clean end, end-of-stream inside a varint or payload is a
/// protocol error.
#[derive(Debug, Default)]
pub struct UmpParser {
    buffer: BytesMut,
}

impl UmpParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the latest response chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Try to extract the next complete part.
    ///
    /// Returns `None` if the buffered data ends mid-part; push more bytes
    /// and try again.
    pub fn next_part(&mut self) -> Option<UmpPart> {
        let (part_type, type_len) = read_varint(&self.buffer)?;
        let (part_size, size_len) = read_varint(&self.buffer[type_len..])?;

        let header_len = type_len + size_len;
        let total_len = header_len + part_size as usize;
        if self.buffer.len() < total_len {
            return None;
        }

        let frame = self.buffer.split_to(total_len).freeze();
        Some(UmpPart {
            part_type,
            data: frame.slice(header_len..),
        })
    }

    /// Check that the stream ended on a part boundary.
    pub fn finish(&self) -> Result<()> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(SabrError::Protocol(format!(
                "response ended inside a UMP part ({} trailing bytes)",
                self.buffer.len()
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn encode(value: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varint(&mut buf, value);
        buf
    }

    fn roundtrip(value: u32) {
        let buf = encode(value);
        let (decoded, consumed) = read_varint(&buf).expect("should decode");
        assert_eq!(decoded, value, "value mismatch for {value}");
        assert_eq!(consumed, buf.len(), "consumed length mismatch for {value}");
    }

    // -- varint round-trip ---------------------------------------------------

    #[test]
    fn varint_edge_values() {
        let cases: [(u32, usize); 11] = [
            (0, 1),
            (1, 1),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (2_097_151, 3),
            (2_097_152, 4),
            (268_435_455, 4),
            (268_435_456, 5),
            (u32::MAX, 5),
        ];
        for (value, expected_len) in cases {
            let buf = encode(value);
            assert_eq!(buf.len(), expected_len, "encoded length for {value}");
            roundtrip(value);
        }
    }

    #[test]
    fn varint_random_roundtrip() {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            roundtrip(rng.gen());
        }
    }

    #[test]
    fn varint_length_prefix_bits() {
        // The first byte's leading bits encode the length.
        assert_eq!(encode(127)[0], 127);
        assert!(encode(128)[0] >= 0x80 && encode(128)[0] < 0xc0);
        assert!(encode(16_384)[0] >= 0xc0 && encode(16_384)[0] < 0xe0);
        assert!(encode(2_097_152)[0] >= 0xe0 && encode(2_097_152)[0] < 0xf0);
        assert!(encode(268_435_456)[0] >= 0xf0);
    }

    // -- read_varint edge cases ----------------------------------------------

    #[test]
    fn read_varint_empty() {
        assert!(read_varint(&[]).is_none());
    }

    #[test]
    fn read_varint_short_buffer() {
        // 2-byte varint but only 1 byte present
        assert!(read_varint(&[0x80]).is_none());
        // 5-byte varint but only 3 bytes present
        assert!(read_varint(&[0xf0, 0x01, 0x02]).is_none());
    }

    // -- parser --------------------------------------------------------------

    fn frame(part_type: u32, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint(&mut out, part_type);
        write_varint(&mut out, data.len() as u32);
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn parser_single_part() {
        let mut parser = UmpParser::new();
        parser.push(&frame(MEDIA_HEADER, &[0xde, 0xad, 0xbe, 0xef]));

        let part = parser.next_part().expect("should yield a part");
        assert_eq!(part.part_type, MEDIA_HEADER);
        assert_eq!(&part.data[..], &[0xde, 0xad, 0xbe, 0xef]);

        assert!(parser.next_part().is_none());
        parser.finish().expect("clean end");
    }

    #[test]
    fn parser_multiple_parts() {
        let mut out = Vec::new();
        for i in 0..3u8 {
            out.extend_from_slice(&frame(MEDIA, &[i, i + 10]));
        }

        let mut parser = UmpParser::new();
        parser.push(&out);

        for i in 0..3u8 {
            let part = parser.next_part().expect("should yield a part");
            assert_eq!(part.part_type, MEDIA);
            assert_eq!(&part.data[..], &[i, i + 10]);
        }
        assert!(parser.next_part().is_none());
    }

    #[test]
    fn parser_chunked_delivery() {
        let out = frame(SABR_ERROR, &[1, 2, 3, 4]);
        let mut parser = UmpParser::new();

        // Feed one byte at a time; the parser must wait until it has everything.
        for (i, &byte) in out.iter().enumerate() {
            assert!(
                parser.next_part().is_none(),
                "should not yield before all bytes are pushed (byte {i})"
            );
            parser.push(&[byte]);
        }

        let part = parser.next_part().expect("should yield after all bytes");
        assert_eq!(part.part_type, SABR_ERROR);
        assert_eq!(&part.data[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn parser_empty_body_part() {
        let mut parser = UmpParser::new();
        parser.push(&frame(MEDIA_END, &[]));

        let part = parser.next_part().expect("should yield a part");
        assert_eq!(part.part_type, MEDIA_END);
        assert!(part.data.is_empty());
    }

    #[test]
    fn parser_truncated_payload_is_error() {
        let full = frame(MEDIA, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut parser = UmpParser::new();
        parser.push(&full[..full.len() - 3]);

        assert!(parser.next_part().is_none());
        assert!(parser.finish().is_err());
    }

    #[test]
    fn parser_truncated_size_varint_is_error() {
        let mut out = Vec::new();
        write_varint(&mut out, MEDIA);
        out.push(0x80); // first byte of a 2-byte size varint, second missing

        let mut parser = UmpParser::new();
        parser.push(&out);
        assert!(parser.next_part().is_none());
        assert!(parser.finish().is_err());
    }
}
