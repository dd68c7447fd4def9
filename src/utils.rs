//! Shared utility functions used across the crate.

use std::time::Duration;

/// Parse a duration string (e.g., "30s", "500ms", "3m", "8m30s", "1h") into std::time::Duration.
///
/// Supported formats:
/// - `Nms` - milliseconds (e.g., "500ms")
/// - `Ns` - seconds, fractional allowed (e.g., "30s", "1.5s")
/// - `Nm` - minutes (e.g., "5m")
/// - `Nh` - hours (e.g., "1h")
/// - Any concatenation of the above (e.g., "1h2m", "8m30s")
/// - Plain number - treated as milliseconds (e.g., "1000")
///
/// Returns `None` if the string cannot be parsed or does not fit in a `Duration`.
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(ms) = s.parse::<u64>() {
        return Some(Duration::from_millis(ms));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let value: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];

        let (secs, unit_len) = if rest.starts_with("ms") {
            (value / 1000.0, 2)
        } else if rest.starts_with('s') {
            (value, 1)
        } else if rest.starts_with('m') {
            (value * 60.0, 1)
        } else if rest.starts_with('h') {
            (value * 3600.0, 1)
        } else {
            return None;
        };
        rest = &rest[unit_len..];
        total = total.checked_add(Duration::try_from_secs_f64(secs).ok()?)?;
    }
    Some(total)
}

/// Render a duration the way stage durations are written in configs ("8m30s", "250ms").
pub fn format_duration(d: Duration) -> String {
    let total_ms = d.as_millis();
    if total_ms == 0 {
        return "0s".to_string();
    }
    if total_ms < 1000 {
        return format!("{}ms", total_ms);
    }
    let mut secs = d.as_secs();
    let mut out = String::new();
    if secs >= 3600 {
        out.push_str(&format!("{}h", secs / 3600));
        secs %= 3600;
    }
    if secs >= 60 {
        out.push_str(&format!("{}m", secs / 60));
        secs %= 60;
    }
    let ms = d.subsec_millis();
    if ms > 0 {
        out.push_str(&format!("{}.{:03}s", secs, ms));
    } else if secs > 0 || out.is_empty() {
        out.push_str(&format!("{}s", secs));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_milliseconds() {
        assert_eq!(
            parse_duration_str("500ms"),
            Some(Duration::from_millis(500))
        );
        assert_eq!(
            parse_duration_str("1000ms"),
            Some(Duration::from_millis(1000))
        );
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_duration_str("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration_str("1s"), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_parse_minutes_and_hours() {
        assert_eq!(parse_duration_str("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration_str("1h"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_parse_compound() {
        assert_eq!(parse_duration_str("8m30s"), Some(Duration::from_secs(510)));
        assert_eq!(parse_duration_str("1h2m3s"), Some(Duration::from_secs(3723)));
        assert_eq!(
            parse_duration_str("1s500ms"),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_parse_plain_number() {
        assert_eq!(
            parse_duration_str("1000"),
            Some(Duration::from_millis(1000))
        );
    }

    #[test]
    fn test_parse_fractional() {
        assert_eq!(
            parse_duration_str("1.5s"),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(parse_duration_str("0.5m"), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_with_whitespace() {
        assert_eq!(parse_duration_str(" 30s "), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!(parse_duration_str("invalid"), None);
        assert_eq!(parse_duration_str("abc123"), None);
        assert_eq!(parse_duration_str("10x"), None);
        assert_eq!(parse_duration_str("-5s"), None);
        assert_eq!(parse_duration_str(""), None);
    }

    #[test]
    fn test_parse_out_of_range_is_none() {
        assert_eq!(parse_duration_str("99999999999999999999h"), None);
        assert_eq!(parse_duration_str("5124095576030431h5124095576030431h"), None);
        assert_eq!(parse_duration_str("1e400s"), None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(510)), "8m30s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(180)), "3m");
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.500s");
    }
}
