//! Shared utility functions used across the crate.

use std::time::Duration;

/// Parse a duration string (e.g., "30s", "500ms", "1m", "1h") into std::time::Duration.
///
/// Supported formats:
/// - `Nms` - milliseconds (e.g., "500ms")
/// - `Ns` - seconds, fractional allowed (e.g., "30s", "1.5s")
/// - `Nm` - minutes (e.g., "5m")
/// - `Nh` - hours (e.g., "1h")
/// - Compound k6 spans, largest unit first (e.g., "1m30s", "1h5m", "2s500ms")
/// - Plain number - treated as milliseconds (e.g., "1000")
///
/// Returns `None` if the string cannot be parsed or describes a negative span.
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<u64>().ok().map(Duration::from_millis);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    // Units must appear in strictly decreasing order, each at most once.
    let mut last_rank = usize::MAX;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let (number, tail) = rest.split_at(number_len);
        let (rank, unit_secs, unit_len) = if tail.starts_with("ms") {
            (0, 0.001, 2)
        } else if tail.starts_with('s') {
            (1, 1.0, 1)
        } else if tail.starts_with('m') {
            (2, 60.0, 1)
        } else if tail.starts_with('h') {
            (3, 3600.0, 1)
        } else {
            return None;
        };
        if rank >= last_rank {
            return None;
        }
        last_rank = rank;
        let segment = if rank == 0 {
            Duration::from_millis(number.parse::<u64>().ok()?)
        } else {
            scaled(number, unit_secs)?
        };
        total = total.checked_add(segment)?;
        rest = &tail[unit_len..];
    }
    Some(total)
}

/// Render a duration the way it is accepted back by [`parse_duration_str`].
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 && d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
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
        assert_eq!(parse_duration_str("0s"), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_minutes_and_hours() {
        assert_eq!(parse_duration_str("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration_str("1h"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_parse_plain_number() {
        assert_eq!(
            parse_duration_str("1000"),
            Some(Duration::from_millis(1000))
        );
    }

    #[test]
    fn test_parse_compound() {
        assert_eq!(parse_duration_str("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration_str("1h5m"), Some(Duration::from_secs(3900)));
        assert_eq!(
            parse_duration_str("2s500ms"),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(
            parse_duration_str("1h0m1.5s"),
            Some(Duration::from_millis(3_601_500))
        );
    }

    #[test]
    fn test_parse_compound_rejects_bad_order() {
        assert_eq!(parse_duration_str("30s1m"), None);
        assert_eq!(parse_duration_str("1m1m"), None);
        assert_eq!(parse_duration_str("1m30"), None);
        assert_eq!(parse_duration_str("m30s"), None);
    }

    #[test]
    fn test_parse_with_whitespace() {
        assert_eq!(parse_duration_str(" 30s "), Some(Duration::from_secs(30)));
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
    fn test_parse_rejects_negative() {
        assert_eq!(parse_duration_str("-5s"), None);
        assert_eq!(parse_duration_str("-1m"), None);
        assert_eq!(parse_duration_str("-100"), None);
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!(parse_duration_str("invalid"), None);
        assert_eq!(parse_duration_str("abc123"), None);
        assert_eq!(parse_duration_str("NaNs"), None);
        assert_eq!(parse_duration_str(""), None);
        assert_eq!(parse_duration_str("1.2.3s"), None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
    }
}
