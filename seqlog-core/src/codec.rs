//! Binary record codec
//!
//! Every record occupies one channel slot. The layout is little-endian and
//! versioned:
//!
//! ```text
//! u16 total_len | u8 version | u8 kind | u32 pid | u64 tag | u32 seq | i64 timestamp_us
//! open:    u8 flag | u16 depth | ident class | ident func
//! close:   (nothing)
//! message: u8 level | u8 flag | u8 scope [ident category] | ident body
//! ident:   u8 0 | u16 len | utf8      (text)
//!          u8 1 | u32 id              (numeric)
//! ```
//!
//! Text is truncated to [`MAX_TEXT_LEN`] bytes on a char boundary when
//! encoding, so every encoded record fits in [`MAX_RECORD_LEN`] bytes.

use crate::error::{Result, SeqLogError};
use crate::record::{Ident, Level, OutputFlag, Record, RecordBody, Scope, Tag};

/// Layout version written into every record
pub const CODEC_VERSION: u8 = 1;

/// Longest text payload of a single ident
pub const MAX_TEXT_LEN: usize = 255;

/// Fixed header shared by all kinds
pub const HEADER_LEN: usize = 2 + 1 + 1 + 4 + 8 + 4 + 8;

const MAX_IDENT_LEN: usize = 1 + 2 + MAX_TEXT_LEN;

/// Upper bound for any encoded record
pub const MAX_RECORD_LEN: usize = HEADER_LEN + 3 + 2 * MAX_IDENT_LEN;

const KIND_OPEN: u8 = 1;
const KIND_CLOSE: u8 = 2;
const KIND_MESSAGE: u8 = 3;

const IDENT_TEXT: u8 = 0;
const IDENT_ID: u8 = 1;

const SCOPE_TAG: u8 = 0;
const SCOPE_CATEGORY: u8 = 1;

/// Encode a record into a fresh buffer
pub fn encode(record: &Record) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    encode_into(record, &mut buf);
    buf
}

/// Encode a record, appending to `buf`
pub fn encode_into(record: &Record, buf: &mut Vec<u8>) {
    let start = buf.len();
    buf.extend_from_slice(&[0, 0]);
    buf.push(CODEC_VERSION);
    buf.push(match record.body {
        RecordBody::Open { .. } => KIND_OPEN,
        RecordBody::Close => KIND_CLOSE,
        RecordBody::Message { .. } => KIND_MESSAGE,
    });
    buf.extend_from_slice(&record.pid.to_le_bytes());
    buf.extend_from_slice(&record.tag.raw().to_le_bytes());
    buf.extend_from_slice(&record.seq.to_le_bytes());
    buf.extend_from_slice(&record.timestamp_us.to_le_bytes());

    match &record.body {
        RecordBody::Open {
            flag,
            depth,
            class,
            func,
        } => {
            buf.push(*flag as u8);
            buf.extend_from_slice(&depth.to_le_bytes());
            put_ident(buf, class);
            put_ident(buf, func);
        }
        RecordBody::Close => {}
        RecordBody::Message {
            level,
            flag,
            scope,
            body,
        } => {
            buf.push(*level as u8);
            buf.push(*flag as u8);
            match scope {
                Scope::Tag => buf.push(SCOPE_TAG),
                Scope::Category(category) => {
                    buf.push(SCOPE_CATEGORY);
                    put_ident(buf, category);
                }
            }
            put_ident(buf, body);
        }
    }

    let len = (buf.len() - start) as u16;
    buf[start..start + 2].copy_from_slice(&len.to_le_bytes());
}

fn put_ident(buf: &mut Vec<u8>, ident: &Ident) {
    match ident {
        Ident::Text(text) => {
            let text = truncate_text(text);
            buf.push(IDENT_TEXT);
            buf.extend_from_slice(&(text.len() as u16).to_le_bytes());
            buf.extend_from_slice(text.as_bytes());
        }
        Ident::Id(id) => {
            buf.push(IDENT_ID);
            buf.extend_from_slice(&id.to_le_bytes());
        }
    }
}

/// Cut `text` to at most [`MAX_TEXT_LEN`] bytes without splitting a char
pub fn truncate_text(text: &str) -> &str {
    if text.len() <= MAX_TEXT_LEN {
        return text;
    }
    let mut end = MAX_TEXT_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Decode exactly one record from `bytes`
///
/// Any truncation, unknown discriminant, invalid UTF-8 or trailing byte is
/// reported as `CorruptRecord`.
pub fn decode(bytes: &[u8]) -> Result<Record> {
    let mut r = Reader::new(bytes);

    let total = r.u16()? as usize;
    if total != bytes.len() {
        return Err(SeqLogError::corrupt(format!(
            "length field says {} bytes, slot holds {}",
            total,
            bytes.len()
        )));
    }
    let version = r.u8()?;
    if version != CODEC_VERSION {
        return Err(SeqLogError::corrupt(format!("unknown version {}", version)));
    }
    let kind = r.u8()?;
    let pid = r.u32()?;
    let tag = Tag::from_raw(r.u64()?);
    let seq = r.u32()?;
    let timestamp_us = r.i64()?;

    let body = match kind {
        KIND_OPEN => {
            let flag = r.flag()?;
            let depth = r.u16()?;
            let class = r.ident()?;
            let func = r.ident()?;
            RecordBody::Open {
                flag,
                depth,
                class,
                func,
            }
        }
        KIND_CLOSE => RecordBody::Close,
        KIND_MESSAGE => {
            let raw_level = r.u8()?;
            let level = Level::from_u8(raw_level)
                .ok_or_else(|| SeqLogError::corrupt(format!("unknown level {}", raw_level)))?;
            let flag = r.flag()?;
            let scope = match r.u8()? {
                SCOPE_TAG => Scope::Tag,
                SCOPE_CATEGORY => Scope::Category(r.ident()?),
                other => {
                    return Err(SeqLogError::corrupt(format!("unknown scope {}", other)));
                }
            };
            let body = r.ident()?;
            RecordBody::Message {
                level,
                flag,
                scope,
                body,
            }
        }
        other => return Err(SeqLogError::corrupt(format!("unknown kind {}", other))),
    };

    if r.remaining() != 0 {
        return Err(SeqLogError::corrupt(format!(
            "{} trailing bytes",
            r.remaining()
        )));
    }

    Ok(Record {
        pid,
        tag,
        seq,
        timestamp_us,
        body,
    })
}

/// Read the length prefix of an encoded record, if enough bytes are present
pub fn peek_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < 2 {
        return None;
    }
    Some(u16::from_le_bytes([bytes[0], bytes[1]]) as usize)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(SeqLogError::corrupt(format!(
                "truncated at byte {}: wanted {} more, have {}",
                self.pos,
                n,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn flag(&mut self) -> Result<OutputFlag> {
        let raw = self.u8()?;
        OutputFlag::from_u8(raw)
            .ok_or_else(|| SeqLogError::corrupt(format!("unknown output flag {}", raw)))
    }

    fn ident(&mut self) -> Result<Ident> {
        match self.u8()? {
            IDENT_TEXT => {
                let len = self.u16()? as usize;
                if len > MAX_TEXT_LEN {
                    return Err(SeqLogError::corrupt(format!("text of {} bytes", len)));
                }
                let raw = self.take(len)?;
                let text = std::str::from_utf8(raw)
                    .map_err(|e| SeqLogError::corrupt(format!("invalid utf-8: {}", e)))?;
                Ok(Ident::Text(text.to_string()))
            }
            IDENT_ID => Ok(Ident::Id(self.u32()?)),
            other => Err(SeqLogError::corrupt(format!("unknown ident kind {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag() -> Tag {
        Tag::new(1234, 5)
    }

    #[test]
    fn test_open_record_layout() {
        let record = Record::open(tag(), 1, 0, OutputFlag::OutputAll, "Order", 7u32).at(1_000);
        let bytes = encode(&record);

        assert_eq!(peek_len(&bytes), Some(bytes.len()));
        assert_eq!(bytes[2], CODEC_VERSION);
        assert_eq!(bytes[3], KIND_OPEN);
        assert_eq!(&bytes[4..8], &1234u32.to_le_bytes());
        assert_eq!(bytes[HEADER_LEN], OutputFlag::OutputAll as u8);

        assert_eq!(decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_category_message_decodes() {
        let record = Record::category(tag(), Level::Warn, "net", "socket closed");
        assert_eq!(decode(&encode(&record)).unwrap(), record);
    }

    #[test]
    fn test_long_text_truncated_on_char_boundary() {
        // 'é' is two bytes; 200 of them straddle the limit
        let body = "é".repeat(200);
        let record = Record::message(tag(), 1, Level::Info, OutputFlag::Keep, body.as_str());
        let bytes = encode(&record);
        assert!(bytes.len() <= MAX_RECORD_LEN);

        match decode(&bytes).unwrap().body {
            RecordBody::Message { body, .. } => {
                let text = body.as_text().unwrap().to_string();
                assert_eq!(text.len(), 254);
                assert!(text.chars().all(|c| c == 'é'));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_max_record_fits_bound() {
        let long = "x".repeat(1000);
        let record = Record::category(tag(), Level::Error, long.as_str(), long.as_str());
        assert_eq!(encode(&record).len(), MAX_RECORD_LEN);
    }

    #[test]
    fn test_truncated_record_is_corrupt() {
        let bytes = encode(&Record::open(tag(), 1, 0, OutputFlag::Keep, "A", "b"));
        for cut in [0, 1, 5, HEADER_LEN, bytes.len() - 1] {
            let err = decode(&bytes[..cut]).unwrap_err();
            assert_eq!(err.error_code(), "CORRUPT_RECORD");
        }
    }

    #[test]
    fn test_unknown_discriminants_are_corrupt() {
        let good = encode(&Record::message(tag(), 1, Level::Info, OutputFlag::Keep, "m"));

        let mut bad_version = good.clone();
        bad_version[2] = 9;
        assert!(decode(&bad_version).is_err());

        let mut bad_kind = good.clone();
        bad_kind[3] = 0;
        assert!(decode(&bad_kind).is_err());

        let mut bad_level = good.clone();
        bad_level[HEADER_LEN] = 4;
        assert!(decode(&bad_level).is_err());

        let mut bad_flag = good;
        bad_flag[HEADER_LEN + 1] = 17;
        assert!(decode(&bad_flag).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode(&Record::close(tag(), 3));
        bytes.push(0);
        let len = bytes.len() as u16;
        bytes[..2].copy_from_slice(&len.to_le_bytes());
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut bytes = encode(&Record::message(tag(), 1, Level::Info, OutputFlag::Keep, "ab"));
        let last = bytes.len() - 1;
        bytes[last] = 0xff;
        assert!(decode(&bytes).is_err());
    }
}
