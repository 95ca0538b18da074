use crate::err::{DeserializationError, DeserializationResult as Result};
use crate::model::deserialized::NodeId;
use crate::utils::{
    ByteCursor, INVALID_TIMESTAMP_SENTINEL, decode_utf16le_lossy, filetime_to_timestamp,
    format_timestamp, systime_to_timestamp,
};

use encoding::{DecoderTrap, EncodingRef};
use jiff::Timestamp;
use log::{trace, warn};
use serde_json::{Value, json};
use std::borrow::Cow;
use std::fmt::{self, Write};
use std::string::ToString;
use winstructs::guid::Guid;

/// A FILETIME value, kept raw so that corrupted values can still be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileTime(pub u64);

impl FileTime {
    /// `None` when the value does not fit the supported date range.
    pub fn to_timestamp(self) -> Option<Timestamp> {
        filetime_to_timestamp(self.0)
    }
}

impl fmt::Display for FileTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_timestamp() {
            Some(ts) => f.write_str(&format_timestamp(&ts)),
            None => f.write_str(INVALID_TIMESTAMP_SENTINEL),
        }
    }
}

/// A SYSTEMTIME value: year, month, day of week, day, hour, minute, second, milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SystemTime(pub [u16; 8]);

impl SystemTime {
    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        let mut fields = [0_u16; 8];
        for (field, raw) in fields.iter_mut().zip(bytes.chunks_exact(2)) {
            *field = u16::from_le_bytes([raw[0], raw[1]]);
        }
        SystemTime(fields)
    }

    pub fn to_timestamp(self) -> Option<Timestamp> {
        systime_to_timestamp(&self.0)
    }
}

impl fmt::Display for SystemTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_timestamp() {
            Some(ts) => f.write_str(&format_timestamp(&ts)),
            None => f.write_str(INVALID_TIMESTAMP_SENTINEL),
        }
    }
}

/// A security identifier in its binary form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sid(Vec<u8>);

impl Sid {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn read(cursor: &mut ByteCursor<'_>) -> Result<Sid> {
        let start = cursor.pos();
        let header = cursor.array::<8>("sid")?;
        let sub_authorities = usize::from(header[1]) * 4;

        let subs = cursor.take_bytes(sub_authorities, "sid").inspect_err(|_| {
            // Keep the cursor where the SID started for error reporting.
            let _ = cursor.set_pos(start, "sid");
        })?;

        let mut bytes = Vec::with_capacity(8 + sub_authorities);
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(subs);
        Ok(Sid(bytes))
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = &self.0;
        if bytes.len() < 8 {
            return write!(f, "S-?");
        }
        let revision = bytes[0];

        // IdentifierAuthority is a 48-bit big-endian integer.
        let authority = bytes[2..8]
            .iter()
            .fold(0_u64, |acc, &b| (acc << 8) | u64::from(b));

        write!(f, "S-{revision}-{authority}")?;
        for sub in bytes[8..].chunks_exact(4) {
            write!(f, "-{}", u32::from_le_bytes([sub[0], sub[1], sub[2], sub[3]]))?;
        }
        Ok(())
    }
}

#[derive(Debug, PartialOrd, PartialEq, Clone)]
pub enum BinXmlValue {
    NullType,
    StringType(String),
    AnsiStringType(String),
    Int8Type(i8),
    UInt8Type(u8),
    Int16Type(i16),
    UInt16Type(u16),
    Int32Type(i32),
    UInt32Type(u32),
    Int64Type(i64),
    UInt64Type(u64),
    Real32Type(f32),
    Real64Type(f64),
    BoolType(bool),
    BinaryType(Vec<u8>),
    GuidType(Guid),
    SizeTType(u64),
    FileTimeType(FileTime),
    SysTimeType(SystemTime),
    SidType(Sid),
    HexInt32Type(u32),
    HexInt64Type(u64),
    /// A nested fragment, owned by the arena the value was decoded into.
    BinXmlType(NodeId),
    StringArrayType(Vec<String>),
    Int8ArrayType(Vec<i8>),
    UInt8ArrayType(Vec<u8>),
    Int16ArrayType(Vec<i16>),
    UInt16ArrayType(Vec<u16>),
    Int32ArrayType(Vec<i32>),
    UInt32ArrayType(Vec<u32>),
    Int64ArrayType(Vec<i64>),
    UInt64ArrayType(Vec<u64>),
    Real32ArrayType(Vec<f32>),
    Real64ArrayType(Vec<f64>),
    BoolArrayType(Vec<bool>),
    GuidArrayType(Vec<Guid>),
    FileTimeArrayType(Vec<FileTime>),
    SysTimeArrayType(Vec<SystemTime>),
    SidArrayType(Vec<Sid>),
    HexInt32ArrayType(Vec<u32>),
    HexInt64ArrayType(Vec<u64>),
    /// Placeholder for a value that failed to decode in lenient mode.
    Undecodable { value_type: u8, bytes: Vec<u8> },
}

#[repr(u8)]
#[derive(Debug, PartialOrd, PartialEq, Eq, Clone, Copy, Hash)]
pub enum BinXmlValueType {
    NullType = 0x00,
    StringType = 0x01,
    AnsiStringType = 0x02,
    Int8Type = 0x03,
    UInt8Type = 0x04,
    Int16Type = 0x05,
    UInt16Type = 0x06,
    Int32Type = 0x07,
    UInt32Type = 0x08,
    Int64Type = 0x09,
    UInt64Type = 0x0a,
    Real32Type = 0x0b,
    Real64Type = 0x0c,
    BoolType = 0x0d,
    BinaryType = 0x0e,
    GuidType = 0x0f,
    SizeTType = 0x10,
    FileTimeType = 0x11,
    SysTimeType = 0x12,
    SidType = 0x13,
    HexInt32Type = 0x14,
    HexInt64Type = 0x15,
    EvtHandle = 0x20,
    BinXmlType = 0x21,
    EvtXmlType = 0x23,
    StringArrayType = 0x81,
    AnsiStringArrayType = 0x82,
    Int8ArrayType = 0x83,
    UInt8ArrayType = 0x84,
    Int16ArrayType = 0x85,
    UInt16ArrayType = 0x86,
    Int32ArrayType = 0x87,
    UInt32ArrayType = 0x88,
    Int64ArrayType = 0x89,
    UInt64ArrayType = 0x8a,
    Real32ArrayType = 0x8b,
    Real64ArrayType = 0x8c,
    BoolArrayType = 0x8d,
    BinaryArrayType = 0x8e,
    GuidArrayType = 0x8f,
    SizeTArrayType = 0x90,
    FileTimeArrayType = 0x91,
    SysTimeArrayType = 0x92,
    SidArrayType = 0x93,
    HexInt32ArrayType = 0x94,
    HexInt64ArrayType = 0x95,
}

impl BinXmlValueType {
    pub fn from_u8(byte: u8) -> Option<BinXmlValueType> {
        match byte {
            0x00 => Some(BinXmlValueType::NullType),
            0x01 => Some(BinXmlValueType::StringType),
            0x02 => Some(BinXmlValueType::AnsiStringType),
            0x03 => Some(BinXmlValueType::Int8Type),
            0x04 => Some(BinXmlValueType::UInt8Type),
            0x05 => Some(BinXmlValueType::Int16Type),
            0x06 => Some(BinXmlValueType::UInt16Type),
            0x07 => Some(BinXmlValueType::Int32Type),
            0x08 => Some(BinXmlValueType::UInt32Type),
            0x09 => Some(BinXmlValueType::Int64Type),
            0x0a => Some(BinXmlValueType::UInt64Type),
            0x0b => Some(BinXmlValueType::Real32Type),
            0x0c => Some(BinXmlValueType::Real64Type),
            0x0d => Some(BinXmlValueType::BoolType),
            0x0e => Some(BinXmlValueType::BinaryType),
            0x0f => Some(BinXmlValueType::GuidType),
            0x10 => Some(BinXmlValueType::SizeTType),
            0x11 => Some(BinXmlValueType::FileTimeType),
            0x12 => Some(BinXmlValueType::SysTimeType),
            0x13 => Some(BinXmlValueType::SidType),
            0x14 => Some(BinXmlValueType::HexInt32Type),
            0x15 => Some(BinXmlValueType::HexInt64Type),
            0x20 => Some(BinXmlValueType::EvtHandle),
            0x21 => Some(BinXmlValueType::BinXmlType),
            0x23 => Some(BinXmlValueType::EvtXmlType),
            0x81 => Some(BinXmlValueType::StringArrayType),
            0x82 => Some(BinXmlValueType::AnsiStringArrayType),
            0x83 => Some(BinXmlValueType::Int8ArrayType),
            0x84 => Some(BinXmlValueType::UInt8ArrayType),
            0x85 => Some(BinXmlValueType::Int16ArrayType),
            0x86 => Some(BinXmlValueType::UInt16ArrayType),
            0x87 => Some(BinXmlValueType::Int32ArrayType),
            0x88 => Some(BinXmlValueType::UInt32ArrayType),
            0x89 => Some(BinXmlValueType::Int64ArrayType),
            0x8a => Some(BinXmlValueType::UInt64ArrayType),
            0x8b => Some(BinXmlValueType::Real32ArrayType),
            0x8c => Some(BinXmlValueType::Real64ArrayType),
            0x8d => Some(BinXmlValueType::BoolArrayType),
            0x8e => Some(BinXmlValueType::BinaryArrayType),
            0x8f => Some(BinXmlValueType::GuidArrayType),
            0x90 => Some(BinXmlValueType::SizeTArrayType),
            0x91 => Some(BinXmlValueType::FileTimeArrayType),
            0x92 => Some(BinXmlValueType::SysTimeArrayType),
            0x93 => Some(BinXmlValueType::SidArrayType),
            0x94 => Some(BinXmlValueType::HexInt32ArrayType),
            0x95 => Some(BinXmlValueType::HexInt64ArrayType),
            _ => None,
        }
    }

    /// The wire tag of this type.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Name of the leaf node kind holding a value of this type.
    pub fn node_name(self) -> &'static str {
        match self {
            BinXmlValueType::NullType => "NullTypeNode",
            BinXmlValueType::StringType => "WstringTypeNode",
            BinXmlValueType::AnsiStringType => "StringTypeNode",
            BinXmlValueType::Int8Type => "SignedByteTypeNode",
            BinXmlValueType::UInt8Type => "UnsignedByteTypeNode",
            BinXmlValueType::Int16Type => "SignedWordTypeNode",
            BinXmlValueType::UInt16Type => "UnsignedWordTypeNode",
            BinXmlValueType::Int32Type => "SignedDwordTypeNode",
            BinXmlValueType::UInt32Type => "UnsignedDwordTypeNode",
            BinXmlValueType::Int64Type => "SignedQwordTypeNode",
            BinXmlValueType::UInt64Type => "UnsignedQwordTypeNode",
            BinXmlValueType::Real32Type => "FloatTypeNode",
            BinXmlValueType::Real64Type => "DoubleTypeNode",
            BinXmlValueType::BoolType => "BooleanTypeNode",
            BinXmlValueType::BinaryType => "BinaryTypeNode",
            BinXmlValueType::GuidType => "GuidTypeNode",
            BinXmlValueType::SizeTType => "SizeTypeNode",
            BinXmlValueType::FileTimeType => "FiletimeTypeNode",
            BinXmlValueType::SysTimeType => "SystemtimeTypeNode",
            BinXmlValueType::SidType => "SIDTypeNode",
            BinXmlValueType::HexInt32Type => "Hex32TypeNode",
            BinXmlValueType::HexInt64Type => "Hex64TypeNode",
            BinXmlValueType::EvtHandle => "EvtHandleTypeNode",
            BinXmlValueType::BinXmlType => "BXmlTypeNode",
            BinXmlValueType::EvtXmlType => "EvtXmlTypeNode",
            BinXmlValueType::StringArrayType => "WstringArrayTypeNode",
            BinXmlValueType::AnsiStringArrayType => "StringArrayTypeNode",
            BinXmlValueType::Int8ArrayType => "SignedByteArrayTypeNode",
            BinXmlValueType::UInt8ArrayType => "UnsignedByteArrayTypeNode",
            BinXmlValueType::Int16ArrayType => "SignedWordArrayTypeNode",
            BinXmlValueType::UInt16ArrayType => "UnsignedWordArrayTypeNode",
            BinXmlValueType::Int32ArrayType => "SignedDwordArrayTypeNode",
            BinXmlValueType::UInt32ArrayType => "UnsignedDwordArrayTypeNode",
            BinXmlValueType::Int64ArrayType => "SignedQwordArrayTypeNode",
            BinXmlValueType::UInt64ArrayType => "UnsignedQwordArrayTypeNode",
            BinXmlValueType::Real32ArrayType => "FloatArrayTypeNode",
            BinXmlValueType::Real64ArrayType => "DoubleArrayTypeNode",
            BinXmlValueType::BoolArrayType => "BooleanArrayTypeNode",
            BinXmlValueType::BinaryArrayType => "BinaryArrayTypeNode",
            BinXmlValueType::GuidArrayType => "GuidArrayTypeNode",
            BinXmlValueType::SizeTArrayType => "SizeArrayTypeNode",
            BinXmlValueType::FileTimeArrayType => "FiletimeArrayTypeNode",
            BinXmlValueType::SysTimeArrayType => "SystemtimeArrayTypeNode",
            BinXmlValueType::SidArrayType => "SIDArrayTypeNode",
            BinXmlValueType::HexInt32ArrayType => "Hex32ArrayTypeNode",
            BinXmlValueType::HexInt64ArrayType => "Hex64ArrayTypeNode",
        }
    }
}

fn read_bool(raw: i32, offset: u64) -> bool {
    match raw {
        0 => false,
        1 => true,
        other => {
            warn!(
                "invalid boolean value {} at offset {}; treating as {}",
                other,
                offset,
                other != 0
            );
            other != 0
        }
    }
}

pub(crate) fn read_guid(bytes: &[u8], offset: u64) -> Result<Guid> {
    Guid::from_buffer(bytes).map_err(|_| DeserializationError::OutOfBounds {
        what: "guid",
        offset,
        need: 16,
        have: bytes.len(),
    })
}

/// Variable-length values embedded directly in a `ValueNode` carry their own length prefix.
fn value_len(cursor: &mut ByteCursor<'_>, size: Option<u16>, what: &'static str) -> Result<u16> {
    match size {
        Some(sz) => Ok(sz),
        None => cursor.u16_named(what),
    }
}

impl BinXmlValue {
    /// Decode one value of `value_type`.
    ///
    /// `size` is the declared byte length from a substitution descriptor; literal values inside
    /// a `ValueNode` have no declared length and `size` is `None`.
    ///
    /// `BinXmlType` values are nested fragments and are decoded by the node decoder instead.
    pub(crate) fn from_cursor(
        value_type: BinXmlValueType,
        cursor: &mut ByteCursor<'_>,
        size: Option<u16>,
        ansi_codec: EncodingRef,
    ) -> Result<BinXmlValue> {
        trace!(
            "Offset `0x{offset:08x} ({offset})`: {value_type:?}, {size:?}",
            offset = cursor.position(),
            value_type = value_type,
            size = size
        );

        let offset = cursor.position();
        let value = match (value_type, size) {
            (BinXmlValueType::NullType, _) => BinXmlValue::NullType,

            (BinXmlValueType::StringType, Some(sz)) => {
                let raw = cursor.take_bytes(usize::from(sz), "<string_value>")?;
                BinXmlValue::StringType(decode_utf16le_lossy(raw))
            }
            (BinXmlValueType::StringType, None) => {
                BinXmlValue::StringType(cursor.len_prefixed_utf16_string(false, "<string_value>")?)
            }

            (BinXmlValueType::AnsiStringType, size) => {
                let sz = value_len(cursor, size, "<ansi_string_len>")?;
                let raw = cursor.take_bytes(usize::from(sz), "<ansi_string_value>")?;
                // Embedded NUL bytes are padding.
                let filtered: Vec<u8> = raw.iter().copied().filter(|b| *b != 0).collect();
                let decoded = ansi_codec
                    .decode(&filtered, DecoderTrap::Replace)
                    .unwrap_or_else(|_| String::from_utf8_lossy(&filtered).into_owned());
                BinXmlValue::AnsiStringType(decoded)
            }

            (BinXmlValueType::Int8Type, _) => BinXmlValue::Int8Type(cursor.i8_named("i8")?),
            (BinXmlValueType::UInt8Type, _) => BinXmlValue::UInt8Type(cursor.u8_named("u8")?),
            (BinXmlValueType::Int16Type, _) => BinXmlValue::Int16Type(cursor.i16_named("i16")?),
            (BinXmlValueType::UInt16Type, _) => BinXmlValue::UInt16Type(cursor.u16_named("u16")?),
            (BinXmlValueType::Int32Type, _) => BinXmlValue::Int32Type(cursor.i32_named("i32")?),
            (BinXmlValueType::UInt32Type, _) => BinXmlValue::UInt32Type(cursor.u32_named("u32")?),
            (BinXmlValueType::Int64Type, _) => BinXmlValue::Int64Type(cursor.i64_named("i64")?),
            (BinXmlValueType::UInt64Type, _) => BinXmlValue::UInt64Type(cursor.u64_named("u64")?),
            (BinXmlValueType::Real32Type, _) => {
                BinXmlValue::Real32Type(f32::from_le_bytes(cursor.array::<4>("f32")?))
            }
            (BinXmlValueType::Real64Type, _) => {
                BinXmlValue::Real64Type(f64::from_le_bytes(cursor.array::<8>("f64")?))
            }
            (BinXmlValueType::BoolType, _) => {
                BinXmlValue::BoolType(read_bool(cursor.i32_named("bool")?, offset))
            }

            (BinXmlValueType::BinaryType, Some(sz)) => {
                BinXmlValue::BinaryType(cursor.take_bytes(usize::from(sz), "binary")?.to_vec())
            }
            (BinXmlValueType::BinaryType, None) => {
                let sz = cursor.u32_named("binary_len")? as usize;
                BinXmlValue::BinaryType(cursor.take_bytes(sz, "binary")?.to_vec())
            }

            (BinXmlValueType::GuidType, _) => {
                BinXmlValue::GuidType(read_guid(&cursor.array::<16>("guid")?, offset)?)
            }

            (BinXmlValueType::SizeTType, Some(4)) => {
                BinXmlValue::SizeTType(u64::from(cursor.u32_named("sizet32")?))
            }
            (BinXmlValueType::SizeTType, _) => BinXmlValue::SizeTType(cursor.u64_named("sizet64")?),

            (BinXmlValueType::FileTimeType, _) => {
                BinXmlValue::FileTimeType(FileTime(cursor.u64_named("filetime")?))
            }
            (BinXmlValueType::SysTimeType, _) => {
                BinXmlValue::SysTimeType(SystemTime::from_bytes(&cursor.array::<16>("systime")?))
            }
            (BinXmlValueType::SidType, _) => BinXmlValue::SidType(Sid::read(cursor)?),

            (BinXmlValueType::HexInt32Type, _) => {
                BinXmlValue::HexInt32Type(cursor.u32_named("hex32")?)
            }
            (BinXmlValueType::HexInt64Type, _) => {
                BinXmlValue::HexInt64Type(cursor.u64_named("hex64")?)
            }

            (BinXmlValueType::StringArrayType, size) => {
                let sz = value_len(cursor, size, "string_array_len")?;
                let raw = cursor.take_bytes(usize::from(sz), "string_array")?;
                let units: Vec<u16> = raw
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();

                let mut items: Vec<String> = if units.is_empty() {
                    Vec::new()
                } else {
                    units
                        .split(|unit| *unit == 0)
                        .map(String::from_utf16_lossy)
                        .collect()
                };
                // Every item is NUL terminated; the split leaves an empty tail behind.
                if units.last() == Some(&0) {
                    items.pop();
                }
                BinXmlValue::StringArrayType(items)
            }
            (BinXmlValueType::Int8ArrayType, size) => {
                let sz = value_len(cursor, size, "i8_array_len")?;
                let raw = cursor.take_bytes(usize::from(sz), "i8_array")?;
                BinXmlValue::Int8ArrayType(raw.iter().map(|b| *b as i8).collect())
            }
            (BinXmlValueType::UInt8ArrayType, size) => {
                let sz = value_len(cursor, size, "u8_array_len")?;
                BinXmlValue::UInt8ArrayType(cursor.take_bytes(usize::from(sz), "u8_array")?.to_vec())
            }
            (BinXmlValueType::Int16ArrayType, size) => {
                let sz = value_len(cursor, size, "i16_array_len")?;
                BinXmlValue::Int16ArrayType(cursor.read_sized_vec_aligned::<2, _>(
                    sz,
                    "i16_array",
                    |_off, b| Ok(i16::from_le_bytes(*b)),
                )?)
            }
            (BinXmlValueType::UInt16ArrayType, size) => {
                let sz = value_len(cursor, size, "u16_array_len")?;
                BinXmlValue::UInt16ArrayType(cursor.read_sized_vec_aligned::<2, _>(
                    sz,
                    "u16_array",
                    |_off, b| Ok(u16::from_le_bytes(*b)),
                )?)
            }
            (BinXmlValueType::Int32ArrayType, size) => {
                let sz = value_len(cursor, size, "i32_array_len")?;
                BinXmlValue::Int32ArrayType(cursor.read_sized_vec_aligned::<4, _>(
                    sz,
                    "i32_array",
                    |_off, b| Ok(i32::from_le_bytes(*b)),
                )?)
            }
            (BinXmlValueType::UInt32ArrayType, size) => {
                let sz = value_len(cursor, size, "u32_array_len")?;
                BinXmlValue::UInt32ArrayType(cursor.read_sized_vec_aligned::<4, _>(
                    sz,
                    "u32_array",
                    |_off, b| Ok(u32::from_le_bytes(*b)),
                )?)
            }
            (BinXmlValueType::Int64ArrayType, size) => {
                let sz = value_len(cursor, size, "i64_array_len")?;
                BinXmlValue::Int64ArrayType(cursor.read_sized_vec_aligned::<8, _>(
                    sz,
                    "i64_array",
                    |_off, b| Ok(i64::from_le_bytes(*b)),
                )?)
            }
            (BinXmlValueType::UInt64ArrayType, size) => {
                let sz = value_len(cursor, size, "u64_array_len")?;
                BinXmlValue::UInt64ArrayType(cursor.read_sized_vec_aligned::<8, _>(
                    sz,
                    "u64_array",
                    |_off, b| Ok(u64::from_le_bytes(*b)),
                )?)
            }
            (BinXmlValueType::Real32ArrayType, size) => {
                let sz = value_len(cursor, size, "f32_array_len")?;
                BinXmlValue::Real32ArrayType(cursor.read_sized_vec_aligned::<4, _>(
                    sz,
                    "f32_array",
                    |_off, b| Ok(f32::from_le_bytes(*b)),
                )?)
            }
            (BinXmlValueType::Real64ArrayType, size) => {
                let sz = value_len(cursor, size, "f64_array_len")?;
                BinXmlValue::Real64ArrayType(cursor.read_sized_vec_aligned::<8, _>(
                    sz,
                    "f64_array",
                    |_off, b| Ok(f64::from_le_bytes(*b)),
                )?)
            }
            (BinXmlValueType::BoolArrayType, size) => {
                let sz = value_len(cursor, size, "bool_array_len")?;
                BinXmlValue::BoolArrayType(cursor.read_sized_vec_aligned::<4, _>(
                    sz,
                    "bool_array",
                    |off, b| Ok(read_bool(i32::from_le_bytes(*b), off)),
                )?)
            }
            (BinXmlValueType::GuidArrayType, size) => {
                let sz = value_len(cursor, size, "guid_array_len")?;
                BinXmlValue::GuidArrayType(cursor.read_sized_vec_aligned::<16, _>(
                    sz,
                    "guid_array",
                    |off, b| read_guid(b, off),
                )?)
            }
            (BinXmlValueType::FileTimeArrayType, size) => {
                let sz = value_len(cursor, size, "filetime_array_len")?;
                BinXmlValue::FileTimeArrayType(cursor.read_sized_vec_aligned::<8, _>(
                    sz,
                    "filetime_array",
                    |_off, b| Ok(FileTime(u64::from_le_bytes(*b))),
                )?)
            }
            (BinXmlValueType::SysTimeArrayType, size) => {
                let sz = value_len(cursor, size, "systime_array_len")?;
                BinXmlValue::SysTimeArrayType(cursor.read_sized_vec_aligned::<16, _>(
                    sz,
                    "systime_array",
                    |_off, b| Ok(SystemTime::from_bytes(b)),
                )?)
            }
            (BinXmlValueType::SidArrayType, size) => {
                let sz = value_len(cursor, size, "sid_array_len")?;
                // SIDs are variable sized, read until the declared bytes are consumed.
                let mut items = cursor.sub_range(cursor.pos(), usize::from(sz), "sid_array")?;
                let mut sids = Vec::new();
                while items.remaining() > 0 {
                    sids.push(Sid::read(&mut items)?);
                }
                cursor.advance(usize::from(sz), "sid_array")?;
                BinXmlValue::SidArrayType(sids)
            }
            (BinXmlValueType::HexInt32ArrayType, size) => {
                let sz = value_len(cursor, size, "hex32_array_len")?;
                BinXmlValue::HexInt32ArrayType(cursor.read_sized_vec_aligned::<4, _>(
                    sz,
                    "hex32_array",
                    |_off, b| Ok(u32::from_le_bytes(*b)),
                )?)
            }
            (BinXmlValueType::HexInt64ArrayType, size) => {
                let sz = value_len(cursor, size, "hex64_array_len")?;
                BinXmlValue::HexInt64ArrayType(cursor.read_sized_vec_aligned::<8, _>(
                    sz,
                    "hex64_array",
                    |_off, b| Ok(u64::from_le_bytes(*b)),
                )?)
            }

            (BinXmlValueType::BinXmlType, _) => {
                return Err(DeserializationError::mismatch(
                    "BXmlTypeNode",
                    offset,
                    "nested fragments must be decoded as a node",
                ));
            }

            (
                BinXmlValueType::EvtHandle
                | BinXmlValueType::EvtXmlType
                | BinXmlValueType::AnsiStringArrayType
                | BinXmlValueType::BinaryArrayType
                | BinXmlValueType::SizeTArrayType,
                _,
            ) => {
                return Err(DeserializationError::UnsupportedVariantType {
                    value: value_type.tag(),
                    offset,
                });
            }
        };

        Ok(value)
    }

    /// The type this value was decoded as, `None` for an [`BinXmlValue::Undecodable`] placeholder
    /// with an unmapped tag.
    pub fn value_type(&self) -> Option<BinXmlValueType> {
        let value_type = match self {
            BinXmlValue::NullType => BinXmlValueType::NullType,
            BinXmlValue::StringType(_) => BinXmlValueType::StringType,
            BinXmlValue::AnsiStringType(_) => BinXmlValueType::AnsiStringType,
            BinXmlValue::Int8Type(_) => BinXmlValueType::Int8Type,
            BinXmlValue::UInt8Type(_) => BinXmlValueType::UInt8Type,
            BinXmlValue::Int16Type(_) => BinXmlValueType::Int16Type,
            BinXmlValue::UInt16Type(_) => BinXmlValueType::UInt16Type,
            BinXmlValue::Int32Type(_) => BinXmlValueType::Int32Type,
            BinXmlValue::UInt32Type(_) => BinXmlValueType::UInt32Type,
            BinXmlValue::Int64Type(_) => BinXmlValueType::Int64Type,
            BinXmlValue::UInt64Type(_) => BinXmlValueType::UInt64Type,
            BinXmlValue::Real32Type(_) => BinXmlValueType::Real32Type,
            BinXmlValue::Real64Type(_) => BinXmlValueType::Real64Type,
            BinXmlValue::BoolType(_) => BinXmlValueType::BoolType,
            BinXmlValue::BinaryType(_) => BinXmlValueType::BinaryType,
            BinXmlValue::GuidType(_) => BinXmlValueType::GuidType,
            BinXmlValue::SizeTType(_) => BinXmlValueType::SizeTType,
            BinXmlValue::FileTimeType(_) => BinXmlValueType::FileTimeType,
            BinXmlValue::SysTimeType(_) => BinXmlValueType::SysTimeType,
            BinXmlValue::SidType(_) => BinXmlValueType::SidType,
            BinXmlValue::HexInt32Type(_) => BinXmlValueType::HexInt32Type,
            BinXmlValue::HexInt64Type(_) => BinXmlValueType::HexInt64Type,
            BinXmlValue::BinXmlType(_) => BinXmlValueType::BinXmlType,
            BinXmlValue::StringArrayType(_) => BinXmlValueType::StringArrayType,
            BinXmlValue::Int8ArrayType(_) => BinXmlValueType::Int8ArrayType,
            BinXmlValue::UInt8ArrayType(_) => BinXmlValueType::UInt8ArrayType,
            BinXmlValue::Int16ArrayType(_) => BinXmlValueType::Int16ArrayType,
            BinXmlValue::UInt16ArrayType(_) => BinXmlValueType::UInt16ArrayType,
            BinXmlValue::Int32ArrayType(_) => BinXmlValueType::Int32ArrayType,
            BinXmlValue::UInt32ArrayType(_) => BinXmlValueType::UInt32ArrayType,
            BinXmlValue::Int64ArrayType(_) => BinXmlValueType::Int64ArrayType,
            BinXmlValue::UInt64ArrayType(_) => BinXmlValueType::UInt64ArrayType,
            BinXmlValue::Real32ArrayType(_) => BinXmlValueType::Real32ArrayType,
            BinXmlValue::Real64ArrayType(_) => BinXmlValueType::Real64ArrayType,
            BinXmlValue::BoolArrayType(_) => BinXmlValueType::BoolArrayType,
            BinXmlValue::GuidArrayType(_) => BinXmlValueType::GuidArrayType,
            BinXmlValue::FileTimeArrayType(_) => BinXmlValueType::FileTimeArrayType,
            BinXmlValue::SysTimeArrayType(_) => BinXmlValueType::SysTimeArrayType,
            BinXmlValue::SidArrayType(_) => BinXmlValueType::SidArrayType,
            BinXmlValue::HexInt32ArrayType(_) => BinXmlValueType::HexInt32ArrayType,
            BinXmlValue::HexInt64ArrayType(_) => BinXmlValueType::HexInt64ArrayType,
            BinXmlValue::Undecodable { value_type, .. } => {
                return BinXmlValueType::from_u8(*value_type);
            }
        };
        Some(value_type)
    }

    pub fn node_name(&self) -> &'static str {
        match self {
            BinXmlValue::Undecodable { .. } => "UndecodableValueNode",
            other => other
                .value_type()
                .map(BinXmlValueType::node_name)
                .unwrap_or("UndecodableValueNode"),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, BinXmlValue::NullType)
    }

    /// The canonical string rendering of the value.
    ///
    /// Nested fragments have no scalar rendering and render empty.
    pub fn as_cow_str(&self) -> Cow<'_, str> {
        match self {
            BinXmlValue::NullType => Cow::Borrowed(""),
            BinXmlValue::StringType(s) => Cow::Borrowed(s),
            BinXmlValue::AnsiStringType(s) => Cow::Borrowed(s),
            BinXmlValue::Int8Type(num) => Cow::Owned(num.to_string()),
            BinXmlValue::UInt8Type(num) => Cow::Owned(num.to_string()),
            BinXmlValue::Int16Type(num) => Cow::Owned(num.to_string()),
            BinXmlValue::UInt16Type(num) => Cow::Owned(num.to_string()),
            BinXmlValue::Int32Type(num) => Cow::Owned(num.to_string()),
            BinXmlValue::UInt32Type(num) => Cow::Owned(num.to_string()),
            BinXmlValue::Int64Type(num) => Cow::Owned(num.to_string()),
            BinXmlValue::UInt64Type(num) => Cow::Owned(num.to_string()),
            BinXmlValue::Real32Type(num) => Cow::Owned(num.to_string()),
            BinXmlValue::Real64Type(num) => Cow::Owned(num.to_string()),
            BinXmlValue::BoolType(b) => Cow::Borrowed(bool_str(*b)),
            BinXmlValue::BinaryType(bytes) => Cow::Owned(to_hex_string(bytes)),
            BinXmlValue::GuidType(guid) => Cow::Owned(guid_string(guid)),
            BinXmlValue::SizeTType(v) => Cow::Owned(format!("0x{:x}", v)),
            BinXmlValue::FileTimeType(tm) => Cow::Owned(tm.to_string()),
            BinXmlValue::SysTimeType(tm) => Cow::Owned(tm.to_string()),
            BinXmlValue::SidType(sid) => Cow::Owned(sid.to_string()),
            BinXmlValue::HexInt32Type(v) => Cow::Owned(format!("0x{:x}", v)),
            BinXmlValue::HexInt64Type(v) => Cow::Owned(format!("0x{:x}", v)),
            BinXmlValue::BinXmlType(_) => Cow::Borrowed(""),
            BinXmlValue::StringArrayType(items) => Cow::Owned(items.join(",")),
            BinXmlValue::Int8ArrayType(numbers) => Cow::Owned(to_delimited_list(numbers)),
            BinXmlValue::UInt8ArrayType(numbers) => Cow::Owned(to_delimited_list(numbers)),
            BinXmlValue::Int16ArrayType(numbers) => Cow::Owned(to_delimited_list(numbers)),
            BinXmlValue::UInt16ArrayType(numbers) => Cow::Owned(to_delimited_list(numbers)),
            BinXmlValue::Int32ArrayType(numbers) => Cow::Owned(to_delimited_list(numbers)),
            BinXmlValue::UInt32ArrayType(numbers) => Cow::Owned(to_delimited_list(numbers)),
            BinXmlValue::Int64ArrayType(numbers) => Cow::Owned(to_delimited_list(numbers)),
            BinXmlValue::UInt64ArrayType(numbers) => Cow::Owned(to_delimited_list(numbers)),
            BinXmlValue::Real32ArrayType(numbers) => Cow::Owned(to_delimited_list(numbers)),
            BinXmlValue::Real64ArrayType(numbers) => Cow::Owned(to_delimited_list(numbers)),
            BinXmlValue::BoolArrayType(bools) => Cow::Owned(
                bools
                    .iter()
                    .map(|b| bool_str(*b))
                    .collect::<Vec<&str>>()
                    .join(","),
            ),
            BinXmlValue::GuidArrayType(guids) => Cow::Owned(
                guids
                    .iter()
                    .map(guid_string)
                    .collect::<Vec<String>>()
                    .join(","),
            ),
            BinXmlValue::FileTimeArrayType(filetimes) => Cow::Owned(to_delimited_list(filetimes)),
            BinXmlValue::SysTimeArrayType(systimes) => Cow::Owned(to_delimited_list(systimes)),
            BinXmlValue::SidArrayType(sids) => Cow::Owned(to_delimited_list(sids)),
            BinXmlValue::HexInt32ArrayType(values) => Cow::Owned(
                values
                    .iter()
                    .map(|v| format!("0x{:x}", v))
                    .collect::<Vec<String>>()
                    .join(","),
            ),
            BinXmlValue::HexInt64ArrayType(values) => Cow::Owned(
                values
                    .iter()
                    .map(|v| format!("0x{:x}", v))
                    .collect::<Vec<String>>()
                    .join(","),
            ),
            BinXmlValue::Undecodable { bytes, .. } => Cow::Owned(to_hex_string(bytes)),
        }
    }
}

impl fmt::Display for BinXmlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_cow_str())
    }
}

fn bool_str(b: bool) -> &'static str {
    if b { "1" } else { "0" }
}

fn to_delimited_list<N: ToString>(ns: &[N]) -> String {
    ns.iter()
        .map(ToString::to_string)
        .collect::<Vec<String>>()
        .join(",")
}

fn to_hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut acc, &b| {
            let _ = write!(acc, "{:02X}", b);
            acc
        })
}

/// `{xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx}` in lowercase.
fn guid_string(guid: &Guid) -> String {
    let plain = guid.to_string();
    let inner = plain.trim_matches(|c| c == '{' || c == '}');
    format!("{{{}}}", inner.to_ascii_lowercase())
}

impl From<&BinXmlValue> for serde_json::Value {
    fn from(value: &BinXmlValue) -> Self {
        match value {
            BinXmlValue::NullType | BinXmlValue::BinXmlType(_) => Value::Null,
            BinXmlValue::StringType(s) => json!(s),
            BinXmlValue::AnsiStringType(s) => json!(s),
            BinXmlValue::Int8Type(num) => json!(num),
            BinXmlValue::UInt8Type(num) => json!(num),
            BinXmlValue::Int16Type(num) => json!(num),
            BinXmlValue::UInt16Type(num) => json!(num),
            BinXmlValue::Int32Type(num) => json!(num),
            BinXmlValue::UInt32Type(num) => json!(num),
            BinXmlValue::Int64Type(num) => json!(num),
            BinXmlValue::UInt64Type(num) => json!(num),
            BinXmlValue::Real32Type(num) => json!(num),
            BinXmlValue::Real64Type(num) => json!(num),
            BinXmlValue::BoolType(b) => json!(b),
            BinXmlValue::Int8ArrayType(numbers) => json!(numbers),
            BinXmlValue::UInt8ArrayType(numbers) => json!(numbers),
            BinXmlValue::Int16ArrayType(numbers) => json!(numbers),
            BinXmlValue::UInt16ArrayType(numbers) => json!(numbers),
            BinXmlValue::Int32ArrayType(numbers) => json!(numbers),
            BinXmlValue::UInt32ArrayType(numbers) => json!(numbers),
            BinXmlValue::Int64ArrayType(numbers) => json!(numbers),
            BinXmlValue::UInt64ArrayType(numbers) => json!(numbers),
            BinXmlValue::Real32ArrayType(numbers) => json!(numbers),
            BinXmlValue::Real64ArrayType(numbers) => json!(numbers),
            BinXmlValue::BoolArrayType(bools) => json!(bools),
            BinXmlValue::StringArrayType(items) => json!(items),
            BinXmlValue::GuidArrayType(guids) => {
                json!(guids.iter().map(guid_string).collect::<Vec<String>>())
            }
            BinXmlValue::FileTimeArrayType(filetimes) => json!(
                filetimes
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<String>>()
            ),
            BinXmlValue::SysTimeArrayType(systimes) => json!(
                systimes
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<String>>()
            ),
            BinXmlValue::SidArrayType(sids) => json!(
                sids.iter()
                    .map(ToString::to_string)
                    .collect::<Vec<String>>()
            ),
            BinXmlValue::HexInt32ArrayType(values) => json!(
                values
                    .iter()
                    .map(|v| format!("0x{:x}", v))
                    .collect::<Vec<String>>()
            ),
            BinXmlValue::HexInt64ArrayType(values) => json!(
                values
                    .iter()
                    .map(|v| format!("0x{:x}", v))
                    .collect::<Vec<String>>()
            ),
            // Everything else only has a string form.
            other => json!(other.as_cow_str()),
        }
    }
}
