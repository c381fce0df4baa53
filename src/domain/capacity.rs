//! Capacity quantities
//!
//! Parses Kubernetes resource quantity strings ("10Gi", "500M", "1.5Ti",
//! "2e9") into byte counts. Fractional byte results round up, matching how
//! the API server reports `Quantity::Value()`.

use crate::error::{Error, Result};

const BINARY_SUFFIXES: [(&str, u32); 6] =
    [("Ki", 1), ("Mi", 2), ("Gi", 3), ("Ti", 4), ("Pi", 5), ("Ei", 6)];

const DECIMAL_SUFFIXES: [(&str, i32); 9] = [
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

/// Parse a quantity string into bytes
pub fn parse_quantity(input: &str) -> Result<u64> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty size string".into()));
    }
    if s.starts_with('-') {
        return Err(Error::CapacityParse(format!("negative size: {}", s)));
    }
    let s = s.strip_prefix('+').unwrap_or(s);

    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let (num_str, suffix) = s.split_at(num_end);

    let (mantissa, frac_digits) = parse_decimal(num_str)
        .ok_or_else(|| Error::CapacityParse(format!("invalid number in {:?}", input)))?;

    let mut numerator = mantissa;
    let mut denominator = pow(10, frac_digits as u32)?;

    if suffix.is_empty() {
        // plain bytes
    } else if let Some((_, power)) = BINARY_SUFFIXES.iter().find(|(sfx, _)| *sfx == suffix) {
        numerator = checked_mul(numerator, pow(1024, *power)?)?;
    } else {
        let exponent = match DECIMAL_SUFFIXES.iter().find(|(sfx, _)| *sfx == suffix) {
            Some((_, exp)) => *exp,
            None => parse_exponent(suffix).ok_or_else(|| {
                Error::CapacityParse(format!("unknown unit {:?} in {:?}", suffix, input))
            })?,
        };
        if exponent >= 0 {
            numerator = checked_mul(numerator, pow(10, exponent as u32)?)?;
        } else {
            denominator = checked_mul(denominator, pow(10, exponent.unsigned_abs())?)?;
        }
    }

    let bytes = numerator.div_ceil(denominator);
    u64::try_from(bytes).map_err(|_| Error::CapacityParse(format!("size too large: {}", input)))
}

/// Render a byte count with the largest exact binary suffix
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0".into();
    }
    for (suffix, power) in BINARY_SUFFIXES.iter().rev() {
        let unit = 1u64 << (10 * power);
        if bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    bytes.to_string()
}

/// Split "12.50" into (1250, 2)
fn parse_decimal(s: &str) -> Option<(u128, usize)> {
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if frac_part.contains('.') {
        return None;
    }
    let digits = format!("{}{}", int_part, frac_part);
    let mantissa = digits.parse::<u128>().ok()?;
    Some((mantissa, frac_part.len()))
}

/// Parse an "e6" / "E-3" exponent suffix
fn parse_exponent(suffix: &str) -> Option<i32> {
    let rest = suffix.strip_prefix('e').or_else(|| suffix.strip_prefix('E'))?;
    if rest.is_empty() {
        return None;
    }
    rest.parse::<i32>().ok().filter(|e| e.abs() <= 30)
}

fn pow(base: u128, exp: u32) -> Result<u128> {
    base.checked_pow(exp)
        .ok_or_else(|| Error::CapacityParse("size exponent out of range".into()))
}

fn checked_mul(a: u128, b: u128) -> Result<u128> {
    a.checked_mul(b)
        .ok_or_else(|| Error::CapacityParse("size too large".into()))
}
