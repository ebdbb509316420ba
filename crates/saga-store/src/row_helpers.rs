use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    get(row, idx, table, column)
}

/// Deserialize a JSON text column.
pub fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

pub fn parse_timestamp(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid timestamp {raw}: {e}"),
        })
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga_core::{MessageStatus, Role};

    #[test]
    fn parse_enum_success() {
        let role: Role = parse_enum("agent", "messages", "role").unwrap();
        assert_eq!(role, Role::Agent);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<MessageStatus, _> = parse_enum("INVALID", "messages", "status");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "messages", column: "status", .. })
        ));
    }

    #[test]
    fn parse_json_failure() {
        let result: Result<serde_json::Value, _> = parse_json("not valid json", "messages", "content");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "messages", column: "content", .. })
        ));
    }

    #[test]
    fn timestamps_round_trip_and_sort_as_text() {
        let early = DateTime::parse_from_rfc3339("2026-01-01T00:00:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2026-01-01T00:00:05.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let (a, b) = (format_timestamp(&early), format_timestamp(&late));
        assert!(a < b, "{a} should sort before {b}");
        assert_eq!(parse_timestamp(&b, "sessions", "created_at").unwrap(), late);
    }

    #[test]
    fn bad_timestamp_is_corrupt_row() {
        assert!(matches!(
            parse_timestamp("yesterday", "sessions", "created_at"),
            Err(StoreError::CorruptRow { column: "created_at", .. })
        ));
    }
}
