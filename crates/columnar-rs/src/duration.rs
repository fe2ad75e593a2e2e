//! Go-syntax duration strings.
//!
//! The service reports metric durations (and accepts its `timeout`
//! body field) as a concatenation of `<decimal><unit>` segments, e.g.
//! `"3h15m10s500ms"`. Units are `ns`, `us`/`µs`/`μs`, `ms`, `s`, `m`,
//! `h`. A leading `+` is permitted, `-` is rejected, `"0"` alone is
//! zero, and no whitespace or other separators are allowed.

use crate::error::{Error, Result};

/// Milliseconds per unit, longest unit spellings first so `ms` wins
/// over `m` and `ns`/`us` over bare `s`.
const UNITS: [(&str, f64); 8] = [
    ("ns", 1e-6),
    ("us", 1e-3),
    ("µs", 1e-3),
    ("μs", 1e-3),
    ("ms", 1.0),
    ("s", 1_000.0),
    ("m", 60_000.0),
    ("h", 3_600_000.0),
];

/// Parse a Go-syntax duration string into fractional milliseconds.
///
/// The parser is additive: `"1h30m"` equals `"90m"`. Anything outside
/// the grammar is an [`Error::InvalidArgument`].
pub fn parse_duration(input: &str) -> Result<f64> {
    let mut s = input;
    if let Some(rest) = s.strip_prefix('+') {
        s = rest;
    }
    if s.starts_with('-') {
        return Err(invalid(input, "negative durations are not allowed"));
    }
    if s == "0" {
        return Ok(0.0);
    }
    if s.is_empty() {
        return Err(invalid(input, "empty duration"));
    }

    let mut total_ms = 0.0;
    while !s.is_empty() {
        let (value, rest) = scan_decimal(s).ok_or_else(|| invalid(input, "expected a number"))?;
        let (factor, rest) = scan_unit(rest).ok_or_else(|| invalid(input, "missing unit"))?;
        total_ms += value * factor;
        s = rest;
    }
    Ok(total_ms)
}

/// Render a millisecond count as the wire form the service accepts.
pub fn format_ms(ms: u64) -> String {
    format!("{ms}ms")
}

fn invalid(input: &str, why: &str) -> Error {
    Error::InvalidArgument(format!("invalid duration {input:?}: {why}"))
}

/// Scan `[0-9]*(\.[0-9]*)?` requiring at least one digit overall.
fn scan_decimal(s: &str) -> Option<(f64, &str)> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    let int_digits = i;
    let mut frac_digits = 0;
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
            frac_digits += 1;
        }
    }
    if int_digits == 0 && frac_digits == 0 {
        return None;
    }
    let value: f64 = s[..i].parse().ok()?;
    Some((value, &s[i..]))
}

fn scan_unit(s: &str) -> Option<(f64, &str)> {
    for (unit, factor) in UNITS {
        if let Some(rest) = s.strip_prefix(unit) {
            return Some((factor, rest));
        }
    }
    None
}
