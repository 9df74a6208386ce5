//! ISO-8601 timestamps with a fixed textual form.
//!
//! Every timestamp is stored as `YYYY-MM-DDTHH:MM:SS.mmmZ`. Because the width never
//! varies, comparing the text in SQL (`updatedAt > $1`) orders the same way as
//! comparing the instants.

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serializer};

/// Current time truncated to millisecond precision.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// The `updatedAt` for a mutation of a record last stamped at `previous`.
///
/// Never goes backwards, even if the wall clock does.
pub fn next_after(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = now();
    if now > previous {
        now
    } else {
        previous + Duration::milliseconds(1)
    }
}

pub fn to_iso(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse any RFC 3339 timestamp and normalize it to UTC milliseconds.
pub fn parse_iso(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(text)?
        .with_timezone(&Utc)
        .trunc_subsecs(3))
}

/// Serde adapter for `DateTime<Utc>` fields.
pub mod iso {
    use super::*;

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&to_iso(at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_iso(&text).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for `Option<DateTime<Utc>>` fields.
pub mod iso_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        at: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match at {
            Some(at) => serializer.serialize_some(&to_iso(at)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => parse_iso(&text).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fixed_width_rendering() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(to_iso(&at), "2024-03-09T07:05:01.000Z");
    }

    #[test]
    fn test_text_order_matches_time_order() {
        let earlier = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let later = earlier + Duration::milliseconds(120);
        assert!(to_iso(&later) > to_iso(&earlier));
    }

    #[test]
    fn test_parse_normalizes_offset_and_precision() {
        let parsed = parse_iso("2024-03-09T09:05:01.123456+02:00").unwrap();
        assert_eq!(to_iso(&parsed), "2024-03-09T07:05:01.123Z");
    }

    #[test]
    fn test_next_after_is_monotonic() {
        let future = now() + Duration::hours(1);
        assert_eq!(next_after(future), future + Duration::milliseconds(1));

        let past = now() - Duration::hours(1);
        assert!(next_after(past) > past);
    }
}
