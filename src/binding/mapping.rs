//! Source value parsing and dial range mapping

use regex::Regex;
use std::sync::LazyLock;

static NUMBER_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[-+]?\d*\.?\d+").ok());

/// States that mean "no reading" rather than a malformed value
const UNAVAILABLE_STATES: &[&str] = &["unknown", "unavailable", "none", ""];

/// Parse a source state into a number.
///
/// Tries a plain numeric parse first, then the first numeric substring
/// ("23.5°C" -> 23.5). Returns `None` when no usable number is present.
pub fn parse_source_value(state: &str) -> Option<f64> {
    let trimmed = state.trim();
    if UNAVAILABLE_STATES
        .iter()
        .any(|s| trimmed.eq_ignore_ascii_case(s))
    {
        return None;
    }

    if let Ok(value) = trimmed.parse::<f64>() {
        return value.is_finite().then_some(value);
    }

    NUMBER_RE
        .as_ref()?
        .find(trimmed)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Map a source value into the 0-100 dial range.
///
/// Linear between `min` and `max`, clamped at both ends. A zero-width range
/// maps to the midpoint.
pub fn map_value(value: f64, min: f64, max: f64) -> u8 {
    if min == max {
        return 50;
    }
    if value <= min {
        return 0;
    }
    if value >= max {
        return 100;
    }
    let percent = (value - min) / (max - min) * 100.0;
    percent.clamp(0.0, 100.0) as u8
}
