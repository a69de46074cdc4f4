//! Fixed-width little-endian pack/unpack for the CIP atomic data types.
//!
//! Mirrors the role of `rustradio::Sample` (`size()`/`parse()`/
//! `serialize()` over `from_le_bytes`/`to_le_bytes`), generalized from one
//! hardcoded sample type to a runtime dispatch table over all 14 CIP
//! atomic types, since a tag's type isn't known until the symbol table or
//! template is decoded.

use crate::error::CodecError;

/// The 14 CIP atomic data types this crate understands, plus `BOOL`
/// (which shares `SINT`'s wire unpacker; the bit index is applied by the
/// struct decoder, not here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AtomicType {
    /// 1-bit boolean, packed into a byte shared with sibling members.
    Bool,
    /// 8-bit signed integer.
    Sint,
    /// 16-bit signed integer.
    Int,
    /// 32-bit signed integer.
    Dint,
    /// 64-bit signed integer.
    Lint,
    /// 8-bit unsigned integer.
    Usint,
    /// 16-bit unsigned integer.
    Uint,
    /// 32-bit unsigned integer.
    Udint,
    /// 64-bit unsigned integer.
    Ulint,
    /// 32-bit IEEE-754 float.
    Real,
    /// 64-bit IEEE-754 float.
    Lreal,
    /// 8-bit bit string.
    Byte,
    /// 16-bit bit string.
    Word,
    /// 32-bit bit string.
    Dword,
    /// 64-bit bit string.
    Lword,
}

impl AtomicType {
    /// The 8-bit CIP data-type code.
    pub fn code(self) -> u8 {
        use AtomicType::*;
        match self {
            Bool => 0xC1,
            Sint => 0xC2,
            Int => 0xC3,
            Dint => 0xC4,
            Lint => 0xC5,
            Usint => 0xC6,
            Uint => 0xC7,
            Udint => 0xC8,
            Ulint => 0xC9,
            Real => 0xCA,
            Lreal => 0xCB,
            Byte => 0xD1,
            Word => 0xD2,
            Dword => 0xD3,
            Lword => 0xD4,
        }
    }

    /// Resolve a data-type code into its `AtomicType`, if recognized.
    pub fn from_code(code: u16) -> Option<Self> {
        use AtomicType::*;
        Some(match code & 0x00FF {
            0xC1 => Bool,
            0xC2 => Sint,
            0xC3 => Int,
            0xC4 => Dint,
            0xC5 => Lint,
            0xC6 => Usint,
            0xC7 => Uint,
            0xC8 => Udint,
            0xC9 => Ulint,
            0xCA => Real,
            0xCB => Lreal,
            0xD1 => Byte,
            0xD2 => Word,
            0xD3 => Dword,
            0xD4 => Lword,
            _ => return None,
        })
    }

    /// Human-readable CIP type name, e.g. `"DINT"`.
    pub fn name(self) -> &'static str {
        use AtomicType::*;
        match self {
            Bool => "BOOL",
            Sint => "SINT",
            Int => "INT",
            Dint => "DINT",
            Lint => "LINT",
            Usint => "USINT",
            Uint => "UINT",
            Udint => "UDINT",
            Ulint => "ULINT",
            Real => "REAL",
            Lreal => "LREAL",
            Byte => "BYTE",
            Word => "WORD",
            Dword => "DWORD",
            Lword => "LWORD",
        }
    }

    /// Wire size in bytes.
    pub fn size(self) -> usize {
        use AtomicType::*;
        match self {
            Bool | Sint | Usint | Byte => 1,
            Int | Uint | Word => 2,
            Dint | Udint | Real | Dword => 4,
            Lint | Ulint | Lreal | Lword => 8,
        }
    }
}

/// A decoded atomic value, tagged by the CIP type it came from.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum AtomicValue {
    /// `BOOL`
    Bool(bool),
    /// `SINT`
    Sint(i8),
    /// `INT`
    Int(i16),
    /// `DINT`
    Dint(i32),
    /// `LINT`
    Lint(i64),
    /// `USINT`
    Usint(u8),
    /// `UINT`
    Uint(u16),
    /// `UDINT`
    Udint(u32),
    /// `ULINT`
    Ulint(u64),
    /// `REAL`
    Real(f32),
    /// `LREAL`
    Lreal(f64),
    /// `BYTE`
    Byte(u8),
    /// `WORD`
    Word(u16),
    /// `DWORD`
    Dword(u32),
    /// `LWORD`
    Lword(u64),
}

impl AtomicValue {
    /// The `AtomicType` this value was decoded as.
    pub fn atomic_type(&self) -> AtomicType {
        use AtomicValue::*;
        match self {
            Bool(_) => AtomicType::Bool,
            Sint(_) => AtomicType::Sint,
            Int(_) => AtomicType::Int,
            Dint(_) => AtomicType::Dint,
            Lint(_) => AtomicType::Lint,
            Usint(_) => AtomicType::Usint,
            Uint(_) => AtomicType::Uint,
            Udint(_) => AtomicType::Udint,
            Ulint(_) => AtomicType::Ulint,
            Real(_) => AtomicType::Real,
            Lreal(_) => AtomicType::Lreal,
            Byte(_) => AtomicType::Byte,
            Word(_) => AtomicType::Word,
            Dword(_) => AtomicType::Dword,
            Lword(_) => AtomicType::Lword,
        }
    }

    /// Re-serialize this value to its little-endian wire bytes.
    pub fn pack(&self) -> Vec<u8> {
        use AtomicValue::*;
        match *self {
            Bool(b) => vec![if b { 1 } else { 0 }],
            Sint(v) => v.to_le_bytes().to_vec(),
            Int(v) => v.to_le_bytes().to_vec(),
            Dint(v) => v.to_le_bytes().to_vec(),
            Lint(v) => v.to_le_bytes().to_vec(),
            Usint(v) => v.to_le_bytes().to_vec(),
            Uint(v) => v.to_le_bytes().to_vec(),
            Udint(v) => v.to_le_bytes().to_vec(),
            Ulint(v) => v.to_le_bytes().to_vec(),
            Real(v) => v.to_le_bytes().to_vec(),
            Lreal(v) => v.to_le_bytes().to_vec(),
            Byte(v) => v.to_le_bytes().to_vec(),
            Word(v) => v.to_le_bytes().to_vec(),
            Dword(v) => v.to_le_bytes().to_vec(),
            Lword(v) => v.to_le_bytes().to_vec(),
        }
    }
}

fn check_size(type_name: &'static str, expected: usize, data: &[u8]) -> Result<(), CodecError> {
    if data.len() != expected {
        return Err(CodecError::WrongSize {
            type_name,
            expected,
            got: data.len(),
        });
    }
    Ok(())
}

/// Unpack `data` (exactly `ty.size()` bytes) as `ty`.
///
/// `BOOL` unpacks via the `SINT` reader: callers that need the
/// bit-packed boolean semantics of a struct member apply the bit index
/// themselves (see `resolver::decode_struct_value`).
pub fn unpack(ty: AtomicType, data: &[u8]) -> Result<AtomicValue, CodecError> {
    check_size(ty.name(), ty.size(), data)?;
    Ok(match ty {
        AtomicType::Bool => AtomicValue::Bool(data[0] != 0),
        AtomicType::Sint => AtomicValue::Sint(i8::from_le_bytes([data[0]])),
        AtomicType::Int => AtomicValue::Int(i16::from_le_bytes(data.try_into().unwrap())),
        AtomicType::Dint => AtomicValue::Dint(i32::from_le_bytes(data.try_into().unwrap())),
        AtomicType::Lint => AtomicValue::Lint(i64::from_le_bytes(data.try_into().unwrap())),
        AtomicType::Usint => AtomicValue::Usint(data[0]),
        AtomicType::Uint => AtomicValue::Uint(u16::from_le_bytes(data.try_into().unwrap())),
        AtomicType::Udint => AtomicValue::Udint(u32::from_le_bytes(data.try_into().unwrap())),
        AtomicType::Ulint => AtomicValue::Ulint(u64::from_le_bytes(data.try_into().unwrap())),
        AtomicType::Real => AtomicValue::Real(f32::from_le_bytes(data.try_into().unwrap())),
        AtomicType::Lreal => AtomicValue::Lreal(f64::from_le_bytes(data.try_into().unwrap())),
        AtomicType::Byte => AtomicValue::Byte(data[0]),
        AtomicType::Word => AtomicValue::Word(u16::from_le_bytes(data.try_into().unwrap())),
        AtomicType::Dword => AtomicValue::Dword(u32::from_le_bytes(data.try_into().unwrap())),
        AtomicType::Lword => AtomicValue::Lword(u64::from_le_bytes(data.try_into().unwrap())),
    })
}

/// Pack a `u16` as little-endian bytes. Used for framing fields that are
/// not themselves atomic tag values (element counts, attribute ids).
pub fn pack_u16(v: u16) -> [u8; 2] {
    v.to_le_bytes()
}

/// Pack a `u32` as little-endian bytes. Used for sequence-adjacent
/// framing fields that are not themselves atomic tag values (offsets,
/// session handles, instance ids).
pub fn pack_u32(v: u32) -> [u8; 4] {
    v.to_le_bytes()
}

/// Unpack 2 little-endian bytes as `u16`. Panics if `data.len() != 2`;
/// callers are expected to have already validated reply lengths before
/// calling this (see `encap::EncapHeader::decode` for the checked
/// length check applied to untrusted peer data).
pub fn unpack_u16(data: &[u8]) -> u16 {
    u16::from_le_bytes(data.try_into().expect("2-byte slice"))
}

/// Unpack 4 little-endian bytes as `u32`.
pub fn unpack_u32(data: &[u8]) -> u32 {
    u32::from_le_bytes(data.try_into().expect("4-byte slice"))
}
