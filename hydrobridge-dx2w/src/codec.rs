//! Register codec: wire words ↔ typed values.
//!
//! Words are big-endian 16-bit holding registers as returned by the device.
//! `float32` spans two words, high word first.

use hydrobridge_common::Value;

use crate::catalog::{RegisterDefinition, WireType};
use crate::error::{Dx2wError, Result};

/// Wire word written for a boolean `true`.
pub const BOOL_TRUE_WORD: u16 = 0xFFFF;

/// Decode raw words into a typed value.
///
/// With `scale == 0` the native value is returned unscaled; otherwise the
/// result is always `raw * scale + offset`, regardless of the wire type.
pub fn decode(def: &RegisterDefinition, words: &[u16]) -> Result<Value> {
    let needed = def.data_type.word_count() as usize;
    if words.len() < needed {
        return Err(Dx2wError::Decode {
            register: def.name.clone(),
            message: format!(
                "insufficient data: expected {} word(s), got {}",
                needed,
                words.len()
            ),
        });
    }

    let raw = match def.data_type {
        WireType::Bool => return Ok(Value::Boolean(words[0] != 0)),
        WireType::Uint16 => words[0] as f64,
        WireType::Int16 => words[0] as i16 as f64,
        WireType::Float32 => {
            let bits = ((words[0] as u32) << 16) | (words[1] as u32);
            let value = f32::from_bits(bits);
            if !value.is_finite() {
                return Err(Dx2wError::Decode {
                    register: def.name.clone(),
                    message: format!("non-finite float32 (bits {:#010x})", bits),
                });
            }
            value as f64
        }
    };

    if def.is_scaled() {
        Ok(Value::Numeric(raw * def.scale + def.offset))
    } else {
        Ok(Value::Numeric(raw))
    }
}

/// Encode a typed value into raw words, inverting scale and offset.
///
/// Values outside the wire type's range are rejected, never clamped.
pub fn encode(def: &RegisterDefinition, value: Value) -> Result<Vec<u16>> {
    match def.data_type {
        WireType::Bool => {
            let word = if value.is_on() { BOOL_TRUE_WORD } else { 0 };
            Ok(vec![word])
        }
        WireType::Int16 => {
            let raw = unscale(def, value)?.round();
            if raw < i16::MIN as f64 || raw > i16::MAX as f64 {
                return Err(out_of_range(def, raw));
            }
            Ok(vec![raw as i16 as u16])
        }
        WireType::Uint16 => {
            let raw = unscale(def, value)?.round();
            if raw < 0.0 || raw > u16::MAX as f64 {
                return Err(out_of_range(def, raw));
            }
            Ok(vec![raw as u16])
        }
        WireType::Float32 => {
            let raw = unscale(def, value)?;
            if raw.abs() > f32::MAX as f64 {
                return Err(out_of_range(def, raw));
            }
            let bits = (raw as f32).to_bits();
            Ok(vec![(bits >> 16) as u16, (bits & 0xFFFF) as u16])
        }
    }
}

/// Invert `raw * scale + offset`.
fn unscale(def: &RegisterDefinition, value: Value) -> Result<f64> {
    let mut raw = value.as_f64();
    if def.is_scaled() {
        raw = (raw - def.offset) / def.scale;
    }
    if !raw.is_finite() {
        return Err(out_of_range(def, raw));
    }
    Ok(raw)
}

fn out_of_range(def: &RegisterDefinition, raw: f64) -> Dx2wError {
    Dx2wError::Range {
        register: def.name.clone(),
        wire_type: def.data_type.as_str(),
        value: raw,
    }
}
