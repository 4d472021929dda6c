//! Data-driven request/response schema
//!
//! Every DLP command is described by a static table: a command id plus one
//! `ArgDesc` per argument, each a list of typed field descriptors. A
//! single generic encoder/decoder walks the tables in both directions;
//! there is no per-message codec code.

use crate::error::{Error, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wire codec for one field inside an argument payload
#[derive(Debug, Clone, Copy)]
pub enum Codec {
    U8,
    /// Big-endian
    U16,
    /// Big-endian
    U32,
    FixedBytes(usize),
    /// Null-terminated string
    CStr,
    /// One-byte length-prefixed string
    PStr,
    /// 8-byte DLP date-time
    DateTime,
    /// All remaining bytes of the argument
    Rest,
    /// Nested record with a fixed field list
    Record(&'static [FieldDesc]),
    /// One-byte count followed by that many records
    Array(&'static [FieldDesc]),
}

/// A decoded (or to-be-encoded) field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    Bytes(Vec<u8>),
    Str(String),
    DateTime(DlpDateTime),
    Record(Vec<Value>),
    List(Vec<Vec<Value>>),
}

impl Value {
    pub fn as_u8(&self) -> Result<u8> {
        match self {
            Value::U8(v) => Ok(*v),
            other => Err(type_error("u8", other)),
        }
    }

    pub fn as_u16(&self) -> Result<u16> {
        match self {
            Value::U16(v) => Ok(*v),
            other => Err(type_error("u16", other)),
        }
    }

    pub fn as_u32(&self) -> Result<u32> {
        match self {
            Value::U32(v) => Ok(*v),
            other => Err(type_error("u32", other)),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(v) => Ok(v),
            other => Err(type_error("bytes", other)),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(v) => Ok(v),
            other => Err(type_error("string", other)),
        }
    }

    pub fn as_datetime(&self) -> Result<DlpDateTime> {
        match self {
            Value::DateTime(v) => Ok(*v),
            other => Err(type_error("date-time", other)),
        }
    }

    pub fn as_list(&self) -> Result<&[Vec<Value>]> {
        match self {
            Value::List(v) => Ok(v),
            other => Err(type_error("list", other)),
        }
    }
}

fn type_error(wanted: &str, got: &Value) -> Error {
    Error::Protocol(format!("expected {} value, got {:?}", wanted, got))
}

/// One field of an argument
#[derive(Debug, Clone, Copy)]
pub struct FieldDesc {
    pub name: &'static str,
    pub codec: Codec,
}

/// Convenience constructor for the static tables
pub const fn field(name: &'static str, codec: Codec) -> FieldDesc {
    FieldDesc { name, codec }
}

/// One argument: a fixed sequence of fields
#[derive(Debug, Clone, Copy)]
pub struct ArgDesc {
    pub fields: &'static [FieldDesc],
}

/// One DLP command: id plus request/response argument schemas
#[derive(Debug, Clone, Copy)]
pub struct CommandDesc {
    pub name: &'static str,
    pub command: u8,
    pub request: &'static [ArgDesc],
    pub response: &'static [ArgDesc],
}

// ============================================================================
// DLP date-time (8 bytes)
// ============================================================================

/// 8-byte timestamp: year (u16 BE), month, day, hour, minute, second, pad.
/// All-zero means "never".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DlpDateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

pub const DATETIME_SIZE: usize = 8;

impl DlpDateTime {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.year.to_be_bytes());
        out.push(self.month);
        out.push(self.day);
        out.push(self.hour);
        out.push(self.minute);
        out.push(self.second);
        out.push(0);
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DATETIME_SIZE {
            return Err(Error::Protocol("truncated DLP date-time".to_string()));
        }
        Ok(DlpDateTime {
            year: u16::from_be_bytes([data[0], data[1]]),
            month: data[2],
            day: data[3],
            hour: data[4],
            minute: data[5],
            second: data[6],
        })
    }

    pub fn is_zero(&self) -> bool {
        *self == DlpDateTime::default()
    }

    /// Packed representation used as a sync anchor (equality-comparable)
    pub fn as_anchor(&self) -> u64 {
        ((self.year as u64) << 40)
            | ((self.month as u64) << 32)
            | ((self.day as u64) << 24)
            | ((self.hour as u64) << 16)
            | ((self.minute as u64) << 8)
            | (self.second as u64)
    }

    /// Convert from a Unix timestamp (seconds)
    pub fn from_unix(secs: u64) -> Self {
        let days = (secs / 86400) as i64;
        let tod = secs % 86400;
        let (year, month, day) = civil_from_days(days);
        DlpDateTime {
            year: year as u16,
            month: month as u8,
            day: day as u8,
            hour: (tod / 3600) as u8,
            minute: (tod % 3600 / 60) as u8,
            second: (tod % 60) as u8,
        }
    }

    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::from_unix(secs)
    }
}

/// Days since 1970-01-01 to (year, month, day), proleptic Gregorian
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (y + if m <= 2 { 1 } else { 0 }, m, d)
}

// ============================================================================
// Generic encoder / decoder
// ============================================================================

/// Encode one argument payload from values matching the descriptor
pub fn encode_arg_payload(desc: &ArgDesc, values: &[Value]) -> Result<Vec<u8>> {
    if values.len() != desc.fields.len() {
        return Err(Error::Protocol(format!(
            "schema expects {} fields, got {} values",
            desc.fields.len(),
            values.len()
        )));
    }
    let mut out = Vec::new();
    for (field, value) in desc.fields.iter().zip(values) {
        encode_field(field, value, &mut out)?;
    }
    Ok(out)
}

fn encode_field(field: &FieldDesc, value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match (&field.codec, value) {
        (Codec::U8, Value::U8(v)) => out.push(*v),
        (Codec::U16, Value::U16(v)) => out.extend_from_slice(&v.to_be_bytes()),
        (Codec::U32, Value::U32(v)) => out.extend_from_slice(&v.to_be_bytes()),
        (Codec::FixedBytes(n), Value::Bytes(v)) => {
            if v.len() != *n {
                return Err(Error::Protocol(format!(
                    "field {} expects {} bytes, got {}",
                    field.name,
                    n,
                    v.len()
                )));
            }
            out.extend_from_slice(v);
        }
        (Codec::CStr, Value::Str(v)) => {
            out.extend_from_slice(v.as_bytes());
            out.push(0);
        }
        (Codec::PStr, Value::Str(v)) => {
            if v.len() > 255 {
                return Err(Error::Protocol(format!("field {} string too long", field.name)));
            }
            out.push(v.len() as u8);
            out.extend_from_slice(v.as_bytes());
        }
        (Codec::DateTime, Value::DateTime(v)) => v.encode(out),
        (Codec::Rest, Value::Bytes(v)) => out.extend_from_slice(v),
        (Codec::Record(fields), Value::Record(values)) => {
            if values.len() != fields.len() {
                return Err(Error::Protocol(format!(
                    "record field {} expects {} fields, got {}",
                    field.name,
                    fields.len(),
                    values.len()
                )));
            }
            for (f, v) in fields.iter().zip(values) {
                encode_field(f, v, out)?;
            }
        }
        (Codec::Array(fields), Value::List(records)) => {
            if records.len() > 255 {
                return Err(Error::Protocol(format!("field {} array too long", field.name)));
            }
            out.push(records.len() as u8);
            for record in records {
                if record.len() != fields.len() {
                    return Err(Error::Protocol(format!(
                        "array field {} record shape mismatch",
                        field.name
                    )));
                }
                for (f, v) in fields.iter().zip(record) {
                    encode_field(f, v, out)?;
                }
            }
        }
        (codec, value) => {
            return Err(Error::Protocol(format!(
                "field {}: value {:?} does not match codec {:?}",
                field.name, value, codec
            )));
        }
    }
    Ok(())
}

/// Decode one argument payload into values by the descriptor
pub fn decode_arg_payload(desc: &ArgDesc, payload: &[u8]) -> Result<Vec<Value>> {
    let mut cursor = Cursor {
        data: payload,
        pos: 0,
    };
    let values = decode_fields(desc.fields, &mut cursor)?;
    if cursor.remaining() > 0 {
        // Devices occasionally pad arguments; tolerate trailing bytes
        log::debug!("{} trailing bytes after argument fields", cursor.remaining());
    }
    Ok(values)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Protocol(format!(
                "truncated field {}: need {} bytes, {} left",
                what,
                n,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

fn decode_fields(fields: &[FieldDesc], cursor: &mut Cursor) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(fields.len());
    for field in fields {
        values.push(decode_field(field, cursor)?);
    }
    Ok(values)
}

fn decode_field(field: &FieldDesc, cursor: &mut Cursor) -> Result<Value> {
    let value = match field.codec {
        Codec::U8 => Value::U8(cursor.take(1, field.name)?[0]),
        Codec::U16 => {
            let b = cursor.take(2, field.name)?;
            Value::U16(u16::from_be_bytes([b[0], b[1]]))
        }
        Codec::U32 => {
            let b = cursor.take(4, field.name)?;
            Value::U32(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        }
        Codec::FixedBytes(n) => Value::Bytes(cursor.take(n, field.name)?.to_vec()),
        Codec::CStr => {
            let rest = &cursor.data[cursor.pos..];
            let nul = rest.iter().position(|&b| b == 0).ok_or_else(|| {
                Error::Protocol(format!("unterminated string in field {}", field.name))
            })?;
            let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
            cursor.pos += nul + 1;
            Value::Str(s)
        }
        Codec::PStr => {
            let len = cursor.take(1, field.name)?[0] as usize;
            let bytes = cursor.take(len, field.name)?;
            Value::Str(String::from_utf8_lossy(bytes).into_owned())
        }
        Codec::DateTime => {
            Value::DateTime(DlpDateTime::parse(cursor.take(DATETIME_SIZE, field.name)?)?)
        }
        Codec::Rest => {
            let rest = cursor.data[cursor.pos..].to_vec();
            cursor.pos = cursor.data.len();
            Value::Bytes(rest)
        }
        Codec::Record(fields) => Value::Record(decode_fields(fields, cursor)?),
        Codec::Array(fields) => {
            let count = cursor.take(1, field.name)?[0] as usize;
            let mut records = Vec::with_capacity(count);
            for _ in 0..count {
                records.push(decode_fields(fields, cursor)?);
            }
            Value::List(records)
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const POINT: &[FieldDesc] = &[field("x", Codec::U16), field("y", Codec::U16)];

    const SAMPLE: ArgDesc = ArgDesc {
        fields: &[
            field("kind", Codec::U8),
            field("tag", Codec::FixedBytes(4)),
            field("label", Codec::CStr),
            field("origin", Codec::Record(POINT)),
            field("points", Codec::Array(POINT)),
            field("blob", Codec::Rest),
        ],
    };

    #[test]
    fn test_round_trip_all_codecs() {
        let values = vec![
            Value::U8(7),
            Value::Bytes(b"data".to_vec()),
            Value::Str("memo".to_string()),
            Value::Record(vec![Value::U16(3), Value::U16(4)]),
            Value::List(vec![
                vec![Value::U16(1), Value::U16(2)],
                vec![Value::U16(5), Value::U16(6)],
            ]),
            Value::Bytes(vec![0xDE, 0xAD]),
        ];

        let payload = encode_arg_payload(&SAMPLE, &values).unwrap();
        let decoded = decode_arg_payload(&SAMPLE, &payload).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_codec_value_mismatch_rejected() {
        const FIELDS: &[FieldDesc] = &[field("n", Codec::U16)];
        let desc = ArgDesc { fields: FIELDS };
        assert!(encode_arg_payload(&desc, &[Value::U8(1)]).is_err());
    }

    #[test]
    fn test_truncated_field_rejected() {
        const FIELDS: &[FieldDesc] = &[field("n", Codec::U32)];
        let desc = ArgDesc { fields: FIELDS };
        assert!(decode_arg_payload(&desc, &[1, 2]).is_err());
    }

    #[test]
    fn test_unterminated_cstr_rejected() {
        const FIELDS: &[FieldDesc] = &[field("s", Codec::CStr)];
        let desc = ArgDesc { fields: FIELDS };
        assert!(decode_arg_payload(&desc, b"abc").is_err());
    }

    #[test]
    fn test_datetime_round_trip() {
        let dt = DlpDateTime {
            year: 2002,
            month: 7,
            day: 19,
            hour: 14,
            minute: 30,
            second: 5,
        };
        let mut bytes = Vec::new();
        dt.encode(&mut bytes);
        assert_eq!(bytes.len(), DATETIME_SIZE);
        assert_eq!(DlpDateTime::parse(&bytes).unwrap(), dt);
    }

    #[test]
    fn test_datetime_from_unix() {
        // 2001-09-09 01:46:40 UTC
        let dt = DlpDateTime::from_unix(1_000_000_000);
        assert_eq!(dt.year, 2001);
        assert_eq!(dt.month, 9);
        assert_eq!(dt.day, 9);
        assert_eq!(dt.hour, 1);
        assert_eq!(dt.minute, 46);
        assert_eq!(dt.second, 40);
    }

    #[test]
    fn test_datetime_anchor_distinguishes() {
        let a = DlpDateTime::from_unix(1_000_000_000);
        let b = DlpDateTime::from_unix(1_000_000_001);
        assert_ne!(a.as_anchor(), b.as_anchor());
        assert!(DlpDateTime::default().is_zero());
    }
}
