// =============================================================================
// Formatter — display-ready numbers, amounts, and times
// =============================================================================
//
// Pure functions. Every cache record carries precomputed display strings so
// the fan-out path never formats under load more than once per merge.
// Formatting failures are never fatal: callers substitute an empty string.
// =============================================================================

use chrono::{Local, TimeZone, Utc};

/// Formatting failed (NaN or infinite input).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatError {
    pub reason: String,
}

impl std::fmt::Display for FormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "format error: {}", self.reason)
    }
}

impl std::error::Error for FormatError {}

fn check_finite(value: f64) -> Result<(), FormatError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(FormatError {
            reason: format!("non-finite value: {value}"),
        })
    }
}

/// Format `value` with exactly `precision` fractional digits, trailing zeros
/// preserved.
pub fn format_decimal(value: f64, precision: usize) -> Result<String, FormatError> {
    check_finite(value)?;
    Ok(format!("{value:.precision$}"))
}

/// Like [`format_decimal`] but with a thousands separator in the integer
/// part. Used for USDT amounts.
pub fn format_usdt(value: f64, precision: usize) -> Result<String, FormatError> {
    check_finite(value)?;
    let plain = format!("{value:.precision$}");
    Ok(group_thousands(&plain))
}

/// Insert `,` separators into the integer part of an already-formatted
/// decimal string.
fn group_thousands(plain: &str) -> String {
    let (sign, rest) = match plain.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", plain),
    };
    let (int_part, frac_part) = match rest.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (rest, None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (idx, ch) in int_part.chars().enumerate() {
        if idx > 0 && (int_part.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    match frac_part {
        Some(f) => format!("{sign}{grouped}.{f}"),
        None => format!("{sign}{grouped}"),
    }
}

/// Shorten a large number with a K/M/B suffix (two fractional digits).
/// Values below 1 000 are formatted plain.
pub fn format_large_number(value: f64) -> Result<String, FormatError> {
    check_finite(value)?;
    let sign = if value < 0.0 { "-" } else { "" };
    let abs = value.abs();
    let s = if abs >= 1e9 {
        format!("{sign}{:.2}B", abs / 1e9)
    } else if abs >= 1e6 {
        format!("{sign}{:.2}M", abs / 1e6)
    } else if abs >= 1e3 {
        format!("{sign}{:.2}K", abs / 1e3)
    } else {
        format!("{sign}{abs:.2}")
    };
    Ok(s)
}

/// UTC milliseconds → `HH:MM:SS` in the server's local timezone.
pub fn format_time_hms(timestamp_ms: i64) -> Result<String, FormatError> {
    let utc = Utc
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .ok_or_else(|| FormatError {
            reason: format!("timestamp out of range: {timestamp_ms}"),
        })?;
    Ok(utc.with_timezone(&Local).format("%H:%M:%S").to_string())
}

/// Convenience used at cache-insert sites: format or fall back to `""`.
pub fn or_empty(result: Result<String, FormatError>) -> String {
    result.unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================
