use crate::error::DomainError;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

pub fn uuid_v7_without_dashes() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Random opaque token for lock ownership and OAuth state.
pub fn random_token() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn format_ms_rfc3339(epoch_ms: i64) -> String {
    let fallback = OffsetDateTime::from_unix_timestamp(0).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    let value =
        OffsetDateTime::from_unix_timestamp_nanos(epoch_ms as i128 * 1_000_000).unwrap_or(fallback);
    value
        .format(&Rfc3339)
        .unwrap_or("1970-01-01T00:00:00Z".to_string())
}

pub fn parse_rfc3339_ms(value: &str) -> crate::DomainResult<i64> {
    let dt = OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| DomainError::Validation(format!("invalid timestamp '{value}': {err}")))?;
    Ok((dt.unix_timestamp_nanos() / 1_000_000) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_round_trip_keeps_millisecond_precision() {
        let epoch_ms = 1_760_000_123_456;
        let formatted = format_ms_rfc3339(epoch_ms);
        assert_eq!(parse_rfc3339_ms(&formatted).expect("parse"), epoch_ms);
    }

    #[test]
    fn random_tokens_are_unique_and_dashless() {
        let first = random_token();
        let second = random_token();
        assert_ne!(first, second);
        assert_eq!(first.len(), 32);
        assert!(!first.contains('-'));
    }
}
