//! Byte-unit parsing and conversion.
//!
//! Memory limits and estimates are written either as raw byte counts or as
//! strings like `"512MiB"` / `"4GB"`. A unit is three parts: a magnitude
//! prefix from [`PREFIX_SEQUENCE`] (position 0 = none), an optional `i`
//! marking binary scaling (factor 1024 instead of 1000), and a final `B`
//! (bytes) or `b` (bits). A binary unit without a prefix (`"iB"`) is
//! rejected at parse time; bit units parse but cannot resolve to a memory
//! size.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Magnitude prefixes, indexed by power. Position 0 is the empty prefix.
pub const PREFIX_SEQUENCE: &str = "-KMGTPEZY";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnitError {
    #[error("illegal unit: {0:?}")]
    IllegalUnit(String),
    #[error("units must share prefix base and bit/byte kind to convert")]
    MixedFormats,
    #[error("bit unit {0:?} cannot express a memory size")]
    BitUnit(String),
}

/// A byte/bit unit: prefix power, binary vs. decimal scaling, byte vs. bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteUnit {
    pub prefix: usize,
    pub binary: bool,
    pub byte: bool,
}

impl ByteUnit {
    pub const fn new(prefix: usize, binary: bool, byte: bool) -> Self {
        ByteUnit {
            prefix,
            binary,
            byte,
        }
    }

    /// Parse a trailing unit plus optional magnitude, e.g. `"512MiB"`.
    ///
    /// A bare unit with no magnitude (`"KB"`) yields value `0`. An empty
    /// string parses as zero bits.
    pub fn parse(s: &str) -> Result<(f64, ByteUnit), UnitError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok((0.0, ByteUnit::new(0, false, false)));
        }
        let chars: Vec<char> = s.chars().collect();
        let len = chars.len();
        let mut unit = ByteUnit::new(0, false, false);

        // Walk backwards: b/B, then optional i, then optional prefix letter.
        let mut pos = 1usize;
        match chars[len - pos] {
            'b' => unit.byte = false,
            'B' => unit.byte = true,
            _ => return Err(UnitError::IllegalUnit(s.to_string())),
        }
        pos += 1;
        if pos > len {
            return Ok((0.0, unit));
        }

        if chars[len - pos] == 'i' {
            unit.binary = true;
            pos += 1;
        }
        if pos > len {
            return Err(UnitError::IllegalUnit(s.to_string()));
        }

        if let Some(idx) = PREFIX_SEQUENCE.find(chars[len - pos]) {
            unit.prefix = idx;
            pos += 1;
        }

        if unit.prefix == 0 && unit.binary {
            return Err(UnitError::IllegalUnit(s.to_string()));
        }
        if pos > len {
            return Ok((0.0, unit));
        }

        let magnitude: String = chars[..=len - pos].iter().collect();
        let value = magnitude
            .parse::<i64>()
            .map(|v| v as f64)
            .or_else(|_| magnitude.parse::<f64>())
            .unwrap_or(0.0);
        Ok((value, unit))
    }

    /// Convert `value` between two units of the same base and bit/byte kind.
    pub fn convert(from: ByteUnit, to: ByteUnit, value: f64) -> Result<f64, UnitError> {
        if from.binary != to.binary || from.byte != to.byte {
            return Err(UnitError::MixedFormats);
        }
        let co = if from.binary { 1024f64 } else { 1000f64 };
        let mut dist = to.prefix as i32 - from.prefix as i32;
        let mut value = value;
        while dist != 0 {
            if dist < 0 {
                value *= co;
                dist += 1;
            } else {
                value /= co;
                dist -= 1;
            }
        }
        Ok(value)
    }

    /// Render the unit, optionally prefixed with a magnitude.
    pub fn format(&self, value: Option<f64>) -> String {
        let mut out = String::new();
        if let Some(v) = value {
            out.push_str(&format_magnitude(v));
        }
        if self.prefix > 0 {
            out.push(PREFIX_SEQUENCE.as_bytes()[self.prefix] as char);
        }
        if self.binary {
            out.push('i');
        }
        out.push(if self.byte { 'B' } else { 'b' });
        out
    }
}

fn format_magnitude(v: f64) -> String {
    if v == v.trunc() && v.abs() < 9e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// Resolve a parsed `(value, unit)` pair to whole bytes. Bit units are
/// rejected: memory sizes are byte quantities.
pub fn to_bytes(value: f64, unit: ByteUnit) -> Result<u64, UnitError> {
    if !unit.byte {
        return Err(UnitError::BitUnit(unit.format(None)));
    }
    let co = if unit.binary { 1024f64 } else { 1000f64 };
    Ok((value * co.powi(unit.prefix as i32)) as u64)
}

/// A memory quantity as it appears in config files and task estimates:
/// either raw bytes or a unit string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemValue {
    Bytes(u64),
    Text(String),
}

impl From<u64> for MemValue {
    fn from(bytes: u64) -> Self {
        MemValue::Bytes(bytes)
    }
}

impl From<&str> for MemValue {
    fn from(text: &str) -> Self {
        MemValue::Text(text.to_string())
    }
}

impl From<String> for MemValue {
    fn from(text: String) -> Self {
        MemValue::Text(text)
    }
}

impl MemValue {
    /// Resolve to whole bytes, parsing the string form if necessary.
    /// Strings carrying a bit unit (`"8Kb"`) are rejected.
    pub fn as_bytes(&self) -> Result<u64, UnitError> {
        match self {
            MemValue::Bytes(b) => Ok(*b),
            MemValue::Text(s) => {
                let (v, u) = ByteUnit::parse(s)?;
                to_bytes(v, u)
            }
        }
    }
}

/// Bytes rendered as fractional GiB, for telemetry logging.
pub fn gib(bytes: u64) -> f64 {
    bytes as f64 / (1024f64 * 1024f64 * 1024f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_common_forms() {
        assert_eq!(MemValue::Text("512MiB".into()).as_bytes().unwrap(), 512 * 1024 * 1024);
        assert_eq!(MemValue::Text("1GB".into()).as_bytes().unwrap(), 1_000_000_000);
        assert_eq!(MemValue::Bytes(1024).as_bytes().unwrap(), 1024);
    }

    #[test]
    fn bare_unit_has_zero_magnitude() {
        let (v, u) = ByteUnit::parse("KB").unwrap();
        assert_eq!(v, 0.0);
        assert_eq!(u, ByteUnit::new(1, false, true));
        assert_eq!(to_bytes(v, u).unwrap(), 0);
    }

    #[test]
    fn bit_units_cannot_size_memory() {
        // Bit units survive parsing but are refused as memory quantities.
        assert!(MemValue::Text("Kb".into()).as_bytes().is_err());
        assert!(MemValue::Text("8Kb".into()).as_bytes().is_err());
        assert!(MemValue::Text("b".into()).as_bytes().is_err());
        let (v, u) = ByteUnit::parse("Kb").unwrap();
        assert_eq!((v, u), (0.0, ByteUnit::new(1, false, false)));
    }

    #[test]
    fn float_magnitudes() {
        assert_eq!(MemValue::Text("1.5KB".into()).as_bytes().unwrap(), 1500);
    }

    #[test]
    fn no_prefix_binary_is_illegal() {
        assert!(ByteUnit::parse("iB").is_err());
        assert!(ByteUnit::parse("4iB").is_err());
    }

    #[test]
    fn garbage_trailing_unit_is_illegal() {
        assert!(ByteUnit::parse("12MiX").is_err());
    }

    #[test]
    fn empty_string_is_zero_bits() {
        let (v, u) = ByteUnit::parse("").unwrap();
        assert_eq!(v, 0.0);
        assert_eq!(u, ByteUnit::new(0, false, false));
    }

    #[test]
    fn roundtrip_full_unit_matrix() {
        // Every prefix × scaling × kind combination except the invalid
        // no-prefix-binary cell must survive format → parse unchanged.
        for prefix in 0..PREFIX_SEQUENCE.len() {
            for binary in [false, true] {
                for byte in [false, true] {
                    if prefix == 0 && binary {
                        continue;
                    }
                    let unit = ByteUnit::new(prefix, binary, byte);
                    let s = unit.format(Some(3.0));
                    let (v, parsed) = ByteUnit::parse(&s)
                        .unwrap_or_else(|e| panic!("parse {s:?}: {e}"));
                    assert_eq!(v, 3.0, "magnitude for {s:?}");
                    assert_eq!(parsed, unit, "unit for {s:?}");
                }
            }
        }
    }

    #[test]
    fn convert_same_base() {
        assert_eq!(
            ByteUnit::convert(ByteUnit::new(3, true, true), ByteUnit::new(1, true, true), 1.0)
                .unwrap(),
            1024.0 * 1024.0
        );
        assert_eq!(
            ByteUnit::convert(ByteUnit::new(1, false, true), ByteUnit::new(2, false, true), 500.0)
                .unwrap(),
            0.5
        );
    }

    #[test]
    fn convert_rejects_mixed_formats() {
        assert_eq!(
            ByteUnit::convert(
                ByteUnit::new(3, true, true),
                ByteUnit::new(3, false, true),
                1.0
            ),
            Err(UnitError::MixedFormats)
        );
    }
}
