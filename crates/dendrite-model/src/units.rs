//! Unit suffixes on equation values.
//!
//! An equation may end in `;unit` (for example `10;mV`). Units are kept as a
//! dimension vector over the SI base dimensions plus a scale factor to the
//! base unit, enough to convert literals and to flag additions of
//! incompatible quantities during digest.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Exponents over (s, m, kg, A, K, mol, cd).
pub type Dimension = [i8; 7];

const DIMENSIONLESS: Dimension = [0; 7];

/// A parsed unit: dimension vector and multiplicative scale to SI base.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub dimension: Dimension,
    pub scale: f64,
}

impl Unit {
    pub fn dimensionless() -> Self {
        Self {
            dimension: DIMENSIONLESS,
            scale: 1.0,
        }
    }

    pub fn is_dimensionless(&self) -> bool {
        self.dimension == DIMENSIONLESS
    }

    /// True when two units may appear on either side of `+`/`-`.
    pub fn compatible(&self, other: &Unit) -> bool {
        self.dimension == other.dimension
    }

    pub fn multiply(&self, other: &Unit) -> Unit {
        let mut dimension = self.dimension;
        for (d, o) in dimension.iter_mut().zip(other.dimension) {
            *d += o;
        }
        Unit {
            dimension,
            scale: self.scale * other.scale,
        }
    }

    pub fn divide(&self, other: &Unit) -> Unit {
        let mut dimension = self.dimension;
        for (d, o) in dimension.iter_mut().zip(other.dimension) {
            *d -= o;
        }
        Unit {
            dimension,
            scale: self.scale / other.scale,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 7] = ["s", "m", "kg", "A", "K", "mol", "cd"];
        if self.is_dimensionless() {
            return write!(f, "1");
        }
        let mut first = true;
        for (name, exp) in NAMES.iter().zip(self.dimension) {
            if exp != 0 {
                if !first {
                    write!(f, ".")?;
                }
                first = false;
                if exp == 1 {
                    write!(f, "{name}")?;
                } else {
                    write!(f, "{name}{exp}")?;
                }
            }
        }
        Ok(())
    }
}

fn base(index: usize) -> Dimension {
    let mut d = DIMENSIONLESS;
    d[index] = 1;
    d
}

/// Named units understood by the parser, value in SI base units.
fn lookup(symbol: &str) -> Option<Unit> {
    let (dimension, scale) = match symbol {
        "s" => (base(0), 1.0),
        "m" => (base(1), 1.0),
        "g" => (base(2), 1e-3),
        "A" => (base(3), 1.0),
        "K" => (base(4), 1.0),
        "mol" => (base(5), 1.0),
        "cd" => (base(6), 1.0),
        "Hz" => ([-1, 0, 0, 0, 0, 0, 0], 1.0),
        "N" => ([-2, 1, 1, 0, 0, 0, 0], 1.0),
        "V" => ([-3, 2, 1, -1, 0, 0, 0], 1.0),
        "F" => ([4, -2, -1, 2, 0, 0, 0], 1.0),
        "S" => ([3, -2, -1, 2, 0, 0, 0], 1.0),
        "ohm" => ([-3, 2, 1, -2, 0, 0, 0], 1.0),
        _ => return None,
    };
    Some(Unit { dimension, scale })
}

fn prefix(symbol: &str) -> Option<f64> {
    Some(match symbol {
        "G" => 1e9,
        "M" => 1e6,
        "k" => 1e3,
        "c" => 1e-2,
        "m" => 1e-3,
        "u" | "µ" => 1e-6,
        "n" => 1e-9,
        "p" => 1e-12,
        "f" => 1e-15,
        _ => return None,
    })
}

/// Parse a unit suffix such as `mV`, `ms`, or `Hz`.
///
/// Tries the whole symbol first so that `mol` is not read as milli-`ol`.
pub fn parse(symbol: &str) -> Result<Unit> {
    if symbol.is_empty() {
        return Ok(Unit::dimensionless());
    }
    if let Some(unit) = lookup(symbol) {
        return Ok(unit);
    }
    let mut chars = symbol.chars();
    if let Some(first) = chars.next() {
        let rest = chars.as_str();
        if let (Some(factor), Some(unit)) = (prefix(&first.to_string()), lookup(rest)) {
            return Ok(Unit {
                dimension: unit.dimension,
                scale: unit.scale * factor,
            });
        }
    }
    Err(ModelError::UnknownUnit(symbol.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_units() {
        assert_eq!(parse("s").unwrap().scale, 1.0);
        assert_eq!(parse("s").unwrap().dimension[0], 1);
    }

    #[test]
    fn prefixed() {
        let mv = parse("mV").unwrap();
        assert!((mv.scale - 1e-3).abs() < 1e-12);
        assert_eq!(mv.dimension, parse("V").unwrap().dimension);
    }

    #[test]
    fn whole_symbol_beats_prefix() {
        // "mol" must not parse as milli-"ol".
        assert_eq!(parse("mol").unwrap().dimension[5], 1);
    }

    #[test]
    fn compatibility() {
        let ms = parse("ms").unwrap();
        let s = parse("s").unwrap();
        let v = parse("V").unwrap();
        assert!(ms.compatible(&s));
        assert!(!ms.compatible(&v));
    }

    #[test]
    fn hz_times_s_is_dimensionless() {
        let hz = parse("Hz").unwrap();
        let s = parse("s").unwrap();
        assert!(hz.multiply(&s).is_dimensionless());
    }

    #[test]
    fn unknown_rejected() {
        assert!(parse("florbs").is_err());
    }
}
