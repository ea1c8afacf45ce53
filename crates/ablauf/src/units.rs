//! Strict duration and size grammars
//!
//! Workflow definitions express delays and budgets as short strings
//! (`"500ms"`, `"64mb"`). The grammar is deliberately rigid: an integer,
//! optional whitespace, a lowercase unit. No decimals, no negatives, no
//! uppercase variants.

use once_cell::sync::Lazy;
use regex::Regex;

/// Error for inputs rejected by the duration/size grammars
///
/// The message echoes the rejected input so callers can surface it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitParseError {
    /// Input did not match `^(\d+)\s*(ms|s|m|h|d)$`
    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    /// Input did not match `^(\d+)\s*(b|kb|mb|gb)$`
    #[error("invalid size: {0:?}")]
    InvalidSize(String),
}

static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\s*(ms|s|m|h|d)$").expect("duration regex"));

static SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\s*(b|kb|mb|gb)$").expect("size regex"));

/// Parse a duration string into milliseconds.
///
/// Units: `ms`, `s`, `m`, `h`, `d`.
pub fn parse_duration(input: &str) -> Result<i64, UnitParseError> {
    let captures = DURATION_RE
        .captures(input)
        .ok_or_else(|| UnitParseError::InvalidDuration(input.to_string()))?;

    let value: i64 = captures[1]
        .parse()
        .map_err(|_| UnitParseError::InvalidDuration(input.to_string()))?;

    let multiplier: i64 = match &captures[2] {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => unreachable!("unit restricted by regex"),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| UnitParseError::InvalidDuration(input.to_string()))
}

/// Parse a size string into bytes.
///
/// Units: `b`, `kb`, `mb`, `gb` (powers of 1024).
pub fn parse_size(input: &str) -> Result<u64, UnitParseError> {
    let captures = SIZE_RE
        .captures(input)
        .ok_or_else(|| UnitParseError::InvalidSize(input.to_string()))?;

    let value: u64 = captures[1]
        .parse()
        .map_err(|_| UnitParseError::InvalidSize(input.to_string()))?;

    let multiplier: u64 = match &captures[2] {
        "b" => 1,
        "kb" => 1 << 10,
        "mb" => 1 << 20,
        "gb" => 1 << 30,
        _ => unreachable!("unit restricted by regex"),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| UnitParseError::InvalidSize(input.to_string()))
}
