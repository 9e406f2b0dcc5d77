//! Shallow syntactic format checks for string attributes.
//!
//! These are approximations, not RFC validators: an IPv4 octet may exceed 255,
//! and an email only needs an inner `@`.

use crate::types::AttributeFormat;

/// Check `value` against `format`. Returns the failure message, if any.
pub fn check(format: AttributeFormat, value: &str) -> Option<&'static str> {
    let ok = match format {
        AttributeFormat::Email => is_email(value),
        AttributeFormat::Url => is_url(value),
        AttributeFormat::Ipv4 => is_ipv4(value),
        AttributeFormat::Date => is_date(value),
        AttributeFormat::Datetime => is_datetime(value),
    };
    if ok {
        None
    } else {
        Some(message(format))
    }
}

pub fn message(format: AttributeFormat) -> &'static str {
    match format {
        AttributeFormat::Email => "must be a valid email address",
        AttributeFormat::Url => "must be a valid URL",
        AttributeFormat::Ipv4 => "must be a valid IPv4 address",
        AttributeFormat::Date => "must be a valid date (YYYY-MM-DD)",
        AttributeFormat::Datetime => "must be a valid datetime (ISO 8601)",
    }
}

/// 4 to 253 bytes, contains `@`, and `@` is neither first nor last.
pub fn is_email(s: &str) -> bool {
    (4..=253).contains(&s.len()) && s.contains('@') && !s.starts_with('@') && !s.ends_with('@')
}

pub fn is_url(s: &str) -> bool {
    s.len() > 7 && (s.starts_with("http://") || s.starts_with("https://"))
}

/// Four dot-separated groups of one to three ASCII digits.
pub fn is_ipv4(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|p| (1..=3).contains(&p.len()) && p.bytes().all(|b| b.is_ascii_digit()))
}

pub fn is_date(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 10 && b[4] == b'-' && b[7] == b'-'
}

pub fn is_datetime(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 19 && b[4] == b'-' && b[7] == b'-' && b[10] == b'T' && b[13] == b':' && b[16] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_rules() {
        assert!(is_email("a@b.c"));
        assert!(is_email("ab@c"));
        assert!(!is_email("a@b"));
        assert!(!is_email("@abc.d"));
        assert!(!is_email("abcd@"));
        assert!(!is_email("abcdef"));
        assert!(!is_email(&format!("{}@x", "a".repeat(252))));
    }

    #[test]
    fn url_rules() {
        assert!(is_url("http://x"));
        assert!(is_url("https://example.com"));
        assert!(!is_url("http://"));
        assert!(!is_url("ftp://example.com"));
    }

    #[test]
    fn ipv4_is_shallow() {
        assert!(is_ipv4("10.0.0.5"));
        assert!(is_ipv4("999.999.999.999"));
        assert!(!is_ipv4("10.0.0"));
        assert!(!is_ipv4("10.0.0.5.1"));
        assert!(!is_ipv4("10.0.0.a"));
        assert!(!is_ipv4("10..0.5"));
        assert!(!is_ipv4("1000.0.0.5"));
        assert!(!is_ipv4("not-an-ip"));
    }

    #[test]
    fn date_and_datetime_rules() {
        assert!(is_date("2024-01-15"));
        assert!(is_date("2024-99-99"));
        assert!(!is_date("2024/01/15"));
        assert!(!is_date("2024-01-1"));

        assert!(is_datetime("2024-01-15T10:30:00"));
        assert!(is_datetime("2024-01-15T10:30:00Z"));
        assert!(!is_datetime("2024-01-15 10:30:00"));
        assert!(!is_datetime("2024-01-15T10:30"));
    }

    #[test]
    fn check_reports_format_specific_message() {
        assert_eq!(
            check(AttributeFormat::Ipv4, "nope"),
            Some("must be a valid IPv4 address")
        );
        assert_eq!(check(AttributeFormat::Date, "2024-01-15"), None);
    }
}
