use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub fn parse_rfc3339_to_unix_ms(value: &str) -> Option<i64> {
    let timestamp = OffsetDateTime::parse(value, &Rfc3339).ok()?;
    let ms: i128 = timestamp.unix_timestamp_nanos() / 1_000_000;
    i64::try_from(ms).ok()
}

pub fn unix_ms_to_rfc3339(ms: i64) -> Option<String> {
    let nanos: i128 = i128::from(ms).saturating_mul(1_000_000);
    let timestamp = OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()?;
    timestamp.format(&Rfc3339).ok()
}

/// First non-empty line of a prompt, trimmed.
pub fn derive_title_from_user_text(text: &str) -> Option<String> {
    let first_line = text
        .lines()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())?;
    Some(first_line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_between_rfc3339_and_unix_ms() {
        assert_eq!(
            parse_rfc3339_to_unix_ms("2026-01-01T00:00:01.500Z"),
            Some(1_767_225_601_500)
        );
        assert_eq!(parse_rfc3339_to_unix_ms("yesterday"), None);

        let formatted = unix_ms_to_rfc3339(1_767_225_601_500).expect("format");
        assert_eq!(parse_rfc3339_to_unix_ms(&formatted), Some(1_767_225_601_500));
    }

    #[test]
    fn title_is_first_non_empty_line() {
        assert_eq!(
            derive_title_from_user_text("\n   \n  Fix the parser  \nmore"),
            Some("Fix the parser".to_string())
        );
        assert_eq!(derive_title_from_user_text("  \n "), None);
    }
}
