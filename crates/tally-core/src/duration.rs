//! Human-friendly duration parsing for configuration values.

use std::time::Duration;

/// Parses `"300"`, `"2s"`, `"500ms"`, `"5m"` or `"1h"`.
///
/// A bare integer is read as seconds.
///
/// # Errors
///
/// Returns a description of the problem if the text is not a duration.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }

    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {text}"))?;

    match unit {
        "" | "s" => Ok(Duration::from_secs(amount)),
        "ms" => Ok(Duration::from_millis(amount)),
        "m" => Ok(Duration::from_secs(amount.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(amount.saturating_mul(3600))),
        other => Err(format!("unknown duration unit '{other}' in {text}")),
    }
}
