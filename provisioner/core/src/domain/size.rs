// Copyright (c) 2026 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Byte-size parsing and human-readable formatting.
//!
//! Memory settings arrive as operator-entered strings (`"2G"`, `"512M"`,
//! `"1.5GB"`) and leave as report text. Units are binary: `K` is 1024 bytes.

use thiserror::Error;

const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];

/// The input could not be understood as a byte size.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid size: `{0}`")]
pub struct InvalidSizeError(pub String);

/// Parses a human-entered size string into bytes.
///
/// Accepts an optional fractional number followed by an optional unit
/// suffix (`B`, `K`/`KB`, `M`/`MB`, `G`/`GB`, `T`/`TB`, case-insensitive).
/// A bare number is bytes. Negative and blank inputs are rejected.
pub fn parse_size(raw: &str) -> Result<u64, InvalidSizeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(InvalidSizeError(raw.to_string()));
    }
    let split = trimmed
        .find(|ch: char| !ch.is_ascii_digit() && ch != '.')
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| InvalidSizeError(raw.to_string()))?;
    let multiplier: f64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1.0,
        "K" | "KB" => 1024.0,
        "M" | "MB" => 1024.0 * 1024.0,
        "G" | "GB" => 1024.0 * 1024.0 * 1024.0,
        "T" | "TB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return Err(InvalidSizeError(raw.to_string())),
    };
    Ok((value * multiplier).round() as u64)
}

/// Renders a byte count for status reports: largest binary unit that keeps
/// the value at or above one, at most two decimals, thousands grouped.
/// Zero and negative counts render as `"0"`.
pub fn format_size(bytes: i64) -> String {
    if bytes <= 0 {
        return "0".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    let mut rendered = format!("{rounded:.2}");
    if rendered.contains('.') {
        rendered = rendered
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string();
    }
    let (whole, fraction) = match rendered.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (rendered.as_str(), None),
    };
    let mut out = group_thousands(whole);
    if let Some(fraction) = fraction {
        out.push('.');
        out.push_str(fraction);
    }
    out.push(' ');
    out.push_str(UNITS[unit]);
    out
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
