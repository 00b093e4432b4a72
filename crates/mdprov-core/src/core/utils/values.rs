use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// A typed value extracted from a Fortran namelist or `KEY = VALUE` line.
///
/// Shell placeholders (`${VAR}`, `$(cmd)`) survive as [`FortranValue::Text`]
/// so templated inputs remain inspectable instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FortranValue {
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
}

impl FortranValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FortranValue::Bool(b) => Some(i64::from(*b)),
            FortranValue::Int(i) => Some(*i),
            FortranValue::Real(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FortranValue::Bool(b) => Some(f64::from(u8::from(*b))),
            FortranValue::Int(i) => Some(*i as f64),
            FortranValue::Real(f) => Some(*f),
            FortranValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FortranValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Parses a numeric token, rewriting Fortran `D`-exponent notation first.
///
/// Returns `None` for tokens that are not numeric or that evaluate to NaN or
/// infinity; callers treat both as "field absent" and record a warning.
pub fn clean_numeric(token: &str) -> Option<f64> {
    let cleaned = token.trim().replace(['d', 'D'], "e");
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() => Some(value),
        _ => None,
    }
}

/// Converts a raw namelist token into a typed value.
///
/// Returns `None` only for numeric tokens that evaluate to NaN or infinity;
/// everything else falls through to [`FortranValue::Text`].
pub fn clean_value(raw: &str) -> Option<FortranValue> {
    let val = raw
        .trim()
        .trim_matches(',')
        .trim_matches('"')
        .trim_matches('\'');

    if val.is_empty() {
        return Some(FortranValue::Text(String::new()));
    }
    // Shell variables and command substitutions stay opaque.
    if val.contains('$') {
        return Some(FortranValue::Text(val.to_string()));
    }
    if val.eq_ignore_ascii_case(".true.") {
        return Some(FortranValue::Bool(true));
    }
    if val.eq_ignore_ascii_case(".false.") {
        return Some(FortranValue::Bool(false));
    }
    if let Ok(i) = val.parse::<i64>() {
        return Some(FortranValue::Int(i));
    }
    let as_float = val.replace(['d', 'D'], "e");
    if let Ok(f) = as_float.parse::<f64>() {
        if f.is_finite() {
            return Some(FortranValue::Real(f));
        }
        return None;
    }
    Some(FortranValue::Text(val.to_string()))
}

static KEY_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z0-9_\-\(\)\./]+)\s*=\s*([-\d\.\*]+)").unwrap()
});

/// Extracts `KEY = VALUE` pairs from an output-log line.
///
/// Overflowed Fortran fields (`*******`) and malformed numbers yield `None`
/// values so consumers can distinguish them from real observations.
pub fn extract_key_values(line: &str) -> Vec<(String, Option<f64>)> {
    KEY_VALUE_RE
        .captures_iter(line)
        .map(|caps| {
            let key = caps[1].trim().to_string();
            let raw = caps[2].trim().trim_matches(',');
            let value = if raw.contains('*') {
                None
            } else {
                clean_numeric(raw)
            };
            (key, value)
        })
        .collect()
}
