//! Pure codec between raw Modbus register arrays and typed scalar values.
//!
//! Multi-word values combine most-significant word first; the `*Le`
//! variants reverse the word order (least-significant word first) for
//! devices that transmit that way. Byte order within each 16-bit word is
//! big-endian per Modbus convention. Coil and discrete data is stored as
//! one raw element per bit, so `Bool` offsets index elements exactly like
//! the word families do.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::RegisterKind;

/// Errors produced by [`decode`] and [`encode`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    /// The requested offset/footprint lies outside the raw data.
    #[error("offset {offset} with footprint {footprint} is outside raw data of length {len}")]
    Unreadable {
        offset: i32,
        footprint: u16,
        len: usize,
    },

    /// The scalar variant does not match the target value type.
    #[error("scalar value {value:?} does not match value type {ty}")]
    TypeMismatch { ty: ValueType, value: ScalarValue },
}

/// Scalar encoding of a value inside a data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// Single bit, for coil and discrete-input blocks.
    Bool,
    /// Signed 16-bit integer (1 register).
    #[serde(rename = "i16")]
    Int16,
    /// Unsigned 16-bit integer (1 register).
    #[serde(rename = "u16")]
    UInt16,
    /// Signed 32-bit integer (2 registers, most-significant word first).
    #[serde(rename = "i32")]
    Int32,
    /// Signed 32-bit integer (2 registers, least-significant word first).
    #[serde(rename = "i32le")]
    Int32Le,
    /// Unsigned 32-bit integer (2 registers).
    #[serde(rename = "u32")]
    UInt32,
    /// Unsigned 32-bit integer (2 registers, least-significant word first).
    #[serde(rename = "u32le")]
    UInt32Le,
    /// IEEE 754 single-precision float (2 registers).
    #[serde(rename = "f32")]
    Float32,
    /// IEEE 754 single-precision float (2 registers, least-significant word first).
    #[serde(rename = "f32le")]
    Float32Le,
    /// Signed 64-bit integer (4 registers).
    #[serde(rename = "i64")]
    Int64,
    /// Signed 64-bit integer (4 registers, least-significant word first).
    #[serde(rename = "i64le")]
    Int64Le,
    /// Unsigned 64-bit integer (4 registers).
    #[serde(rename = "u64")]
    UInt64,
    /// Unsigned 64-bit integer (4 registers, least-significant word first).
    #[serde(rename = "u64le")]
    UInt64Le,
    /// IEEE 754 double-precision float (4 registers).
    #[serde(rename = "f64")]
    Float64,
    /// IEEE 754 double-precision float (4 registers, least-significant word first).
    #[serde(rename = "f64le")]
    Float64Le,
}

impl ValueType {
    /// Number of raw elements this type occupies.
    ///
    /// `Bool` occupies one element: coil/discrete blocks store one raw
    /// element per bit.
    pub fn footprint(&self) -> u16 {
        match self {
            ValueType::Bool | ValueType::Int16 | ValueType::UInt16 => 1,
            ValueType::Int32
            | ValueType::Int32Le
            | ValueType::UInt32
            | ValueType::UInt32Le
            | ValueType::Float32
            | ValueType::Float32Le => 2,
            ValueType::Int64
            | ValueType::Int64Le
            | ValueType::UInt64
            | ValueType::UInt64Le
            | ValueType::Float64
            | ValueType::Float64Le => 4,
        }
    }

    /// Whether words are transmitted least-significant first.
    pub fn is_swapped(&self) -> bool {
        matches!(
            self,
            ValueType::Int32Le
                | ValueType::UInt32Le
                | ValueType::Float32Le
                | ValueType::Int64Le
                | ValueType::UInt64Le
                | ValueType::Float64Le
        )
    }

    /// Whether this type is usable on blocks of the given register kind.
    ///
    /// `Bool` belongs to the bit tables; everything else to the word
    /// tables. `Invalid` blocks accept nothing.
    pub fn fits_kind(&self, kind: RegisterKind) -> bool {
        match kind {
            RegisterKind::Invalid => false,
            _ => (*self == ValueType::Bool) == kind.is_bit(),
        }
    }

    /// String name used in configuration and node paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Bool => "bool",
            ValueType::Int16 => "i16",
            ValueType::UInt16 => "u16",
            ValueType::Int32 => "i32",
            ValueType::Int32Le => "i32le",
            ValueType::UInt32 => "u32",
            ValueType::UInt32Le => "u32le",
            ValueType::Float32 => "f32",
            ValueType::Float32Le => "f32le",
            ValueType::Int64 => "i64",
            ValueType::Int64Le => "i64le",
            ValueType::UInt64 => "u64",
            ValueType::UInt64Le => "u64le",
            ValueType::Float64 => "f64",
            ValueType::Float64Le => "f64le",
        }
    }
}

impl std::str::FromStr for ValueType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bool" => Ok(ValueType::Bool),
            "i16" => Ok(ValueType::Int16),
            "u16" => Ok(ValueType::UInt16),
            "i32" => Ok(ValueType::Int32),
            "i32le" => Ok(ValueType::Int32Le),
            "u32" => Ok(ValueType::UInt32),
            "u32le" => Ok(ValueType::UInt32Le),
            "f32" => Ok(ValueType::Float32),
            "f32le" => Ok(ValueType::Float32Le),
            "i64" => Ok(ValueType::Int64),
            "i64le" => Ok(ValueType::Int64Le),
            "u64" => Ok(ValueType::UInt64),
            "u64le" => Ok(ValueType::UInt64Le),
            "f64" => Ok(ValueType::Float64),
            "f64le" => Ok(ValueType::Float64Le),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decoded (or to-be-written) typed value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Float32(f32),
    Int64(i64),
    UInt64(u64),
    Float64(f64),
}

/// Decode a typed value from raw data at an element offset.
///
/// Fails with [`CodecError::Unreadable`] when the offset is negative or
/// `offset + footprint` exceeds the data length.
pub fn decode(words: &[u16], offset: i32, ty: ValueType) -> Result<ScalarValue, CodecError> {
    let footprint = ty.footprint();
    let start = usize::try_from(offset).map_err(|_| CodecError::Unreadable {
        offset,
        footprint,
        len: words.len(),
    })?;
    let end = start.saturating_add(footprint as usize);
    if end > words.len() {
        return Err(CodecError::Unreadable {
            offset,
            footprint,
            len: words.len(),
        });
    }

    let selected = &words[start..end];
    let raw = if ty.is_swapped() {
        combine(selected.iter().rev().copied())
    } else {
        combine(selected.iter().copied())
    };

    let value = match ty {
        ValueType::Bool => ScalarValue::Bool(selected[0] != 0),
        ValueType::Int16 => ScalarValue::Int16(raw as u16 as i16),
        ValueType::UInt16 => ScalarValue::UInt16(raw as u16),
        ValueType::Int32 | ValueType::Int32Le => ScalarValue::Int32(raw as u32 as i32),
        ValueType::UInt32 | ValueType::UInt32Le => ScalarValue::UInt32(raw as u32),
        ValueType::Float32 | ValueType::Float32Le => {
            ScalarValue::Float32(f32::from_bits(raw as u32))
        }
        ValueType::Int64 | ValueType::Int64Le => ScalarValue::Int64(raw as i64),
        ValueType::UInt64 | ValueType::UInt64Le => ScalarValue::UInt64(raw),
        ValueType::Float64 | ValueType::Float64Le => ScalarValue::Float64(f64::from_bits(raw)),
    };

    Ok(value)
}

/// Encode a typed value into the raw words a write request carries.
///
/// Exact inverse of [`decode`]: `decode(&encode(v, ty)?, 0, ty) == v` for
/// every representable value. The scalar variant must match the target
/// type; no implicit numeric conversion happens here.
pub fn encode(value: &ScalarValue, ty: ValueType) -> Result<Vec<u16>, CodecError> {
    let raw: u64 = match (ty, value) {
        (ValueType::Bool, ScalarValue::Bool(b)) => return Ok(vec![u16::from(*b)]),
        (ValueType::Int16, ScalarValue::Int16(v)) => *v as u16 as u64,
        (ValueType::UInt16, ScalarValue::UInt16(v)) => *v as u64,
        (ValueType::Int32 | ValueType::Int32Le, ScalarValue::Int32(v)) => *v as u32 as u64,
        (ValueType::UInt32 | ValueType::UInt32Le, ScalarValue::UInt32(v)) => *v as u64,
        (ValueType::Float32 | ValueType::Float32Le, ScalarValue::Float32(v)) => {
            v.to_bits() as u64
        }
        (ValueType::Int64 | ValueType::Int64Le, ScalarValue::Int64(v)) => *v as u64,
        (ValueType::UInt64 | ValueType::UInt64Le, ScalarValue::UInt64(v)) => *v,
        (ValueType::Float64 | ValueType::Float64Le, ScalarValue::Float64(v)) => v.to_bits(),
        _ => {
            return Err(CodecError::TypeMismatch {
                ty,
                value: *value,
            });
        }
    };

    let mut words = split(raw, ty.footprint());
    if ty.is_swapped() {
        words.reverse();
    }
    Ok(words)
}

/// Fold words into an integer, most-significant word first.
fn combine(words: impl Iterator<Item = u16>) -> u64 {
    words.fold(0u64, |acc, w| (acc << 16) | u64::from(w))
}

/// Split an integer into its trailing `count` words, most-significant first.
fn split(raw: u64, count: u16) -> Vec<u16> {
    (0..count)
        .rev()
        .map(|i| (raw >> (16 * i as u32)) as u16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_footprints() {
        assert_eq!(ValueType::Bool.footprint(), 1);
        assert_eq!(ValueType::Int16.footprint(), 1);
        assert_eq!(ValueType::UInt32.footprint(), 2);
        assert_eq!(ValueType::Float32Le.footprint(), 2);
        assert_eq!(ValueType::Int64.footprint(), 4);
        assert_eq!(ValueType::Float64.footprint(), 4);
    }

    #[test]
    fn test_decode_word_order_fixture() {
        // Normative fixture: [0x0001, 0x0002, 0x0003, 0x0004], offset 1,
        // i32 must read 0x00020003 (most-significant word first).
        let raw = [0x0001u16, 0x0002, 0x0003, 0x0004];
        let value = decode(&raw, 1, ValueType::Int32).unwrap();
        assert_eq!(value, ScalarValue::Int32(0x0002_0003));
    }

    #[test]
    fn test_decode_swapped_word_order() {
        let raw = [0x0003u16, 0x0002];
        assert_eq!(
            decode(&raw, 0, ValueType::UInt32Le).unwrap(),
            ScalarValue::UInt32(0x0002_0003)
        );
        assert_eq!(
            decode(&raw, 0, ValueType::UInt32).unwrap(),
            ScalarValue::UInt32(0x0003_0002)
        );
    }

    #[test]
    fn test_decode_f32_big_endian() {
        // 123.456f32 = 0x42F6E979
        let raw = [0x42F6u16, 0xE979];
        let ScalarValue::Float32(v) = decode(&raw, 0, ValueType::Float32).unwrap() else {
            panic!("expected f32");
        };
        assert!((v - 123.456).abs() < 0.001);
    }

    #[test]
    fn test_decode_bool_elements() {
        let raw = [0u16, 1, 0, 1];
        assert_eq!(
            decode(&raw, 0, ValueType::Bool).unwrap(),
            ScalarValue::Bool(false)
        );
        assert_eq!(
            decode(&raw, 3, ValueType::Bool).unwrap(),
            ScalarValue::Bool(true)
        );
    }

    #[test]
    fn test_decode_unreadable() {
        let raw = [1u16, 2, 3];
        assert!(matches!(
            decode(&raw, -1, ValueType::UInt16),
            Err(CodecError::Unreadable { .. })
        ));
        assert!(matches!(
            decode(&raw, 2, ValueType::UInt32),
            Err(CodecError::Unreadable { .. })
        ));
        assert!(matches!(
            decode(&raw, 0, ValueType::UInt64),
            Err(CodecError::Unreadable { .. })
        ));
        // Exactly at the boundary is fine.
        assert!(decode(&raw, 1, ValueType::UInt32).is_ok());
    }

    #[test]
    fn test_encode_type_mismatch() {
        assert!(matches!(
            encode(&ScalarValue::Int16(1), ValueType::UInt32),
            Err(CodecError::TypeMismatch { .. })
        ));
        assert!(matches!(
            encode(&ScalarValue::Bool(true), ValueType::Float64),
            Err(CodecError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_round_trip_boundaries() {
        let cases: Vec<(ScalarValue, ValueType)> = vec![
            (ScalarValue::Bool(true), ValueType::Bool),
            (ScalarValue::Bool(false), ValueType::Bool),
            (ScalarValue::Int16(i16::MIN), ValueType::Int16),
            (ScalarValue::Int16(-1), ValueType::Int16),
            (ScalarValue::Int16(i16::MAX), ValueType::Int16),
            (ScalarValue::UInt16(0), ValueType::UInt16),
            (ScalarValue::UInt16(u16::MAX), ValueType::UInt16),
            (ScalarValue::Int32(i32::MIN), ValueType::Int32),
            (ScalarValue::Int32(-123456), ValueType::Int32Le),
            (ScalarValue::UInt32(u32::MAX), ValueType::UInt32),
            (ScalarValue::UInt32(0xDEAD_BEEF), ValueType::UInt32Le),
            (ScalarValue::Float32(-0.5), ValueType::Float32),
            (ScalarValue::Float32(f32::MAX), ValueType::Float32Le),
            (ScalarValue::Int64(i64::MIN), ValueType::Int64),
            (ScalarValue::Int64(i64::MAX), ValueType::Int64Le),
            (ScalarValue::UInt64(u64::MAX), ValueType::UInt64),
            (ScalarValue::UInt64(1), ValueType::UInt64Le),
            (ScalarValue::Float64(1234.5678), ValueType::Float64),
            (ScalarValue::Float64(f64::MIN_POSITIVE), ValueType::Float64Le),
        ];

        for (value, ty) in cases {
            let words = encode(&value, ty).unwrap();
            assert_eq!(words.len(), ty.footprint() as usize, "{ty}");
            assert_eq!(decode(&words, 0, ty).unwrap(), value, "{ty}");
        }
    }

    #[test]
    fn test_fits_kind() {
        assert!(ValueType::Bool.fits_kind(RegisterKind::Coils));
        assert!(ValueType::Bool.fits_kind(RegisterKind::DiscreteInputs));
        assert!(!ValueType::Bool.fits_kind(RegisterKind::HoldingRegisters));
        assert!(ValueType::Float32.fits_kind(RegisterKind::InputRegisters));
        assert!(!ValueType::Float32.fits_kind(RegisterKind::Coils));
        assert!(!ValueType::UInt16.fits_kind(RegisterKind::Invalid));
    }

    #[test]
    fn test_value_type_serde_names() {
        assert_eq!(
            serde_json::to_string(&ValueType::UInt32Le).unwrap(),
            "\"u32le\""
        );
        let ty: ValueType = serde_json::from_str("\"f64\"").unwrap();
        assert_eq!(ty, ValueType::Float64);
    }
}
