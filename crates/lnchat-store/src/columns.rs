//! Column conversions shared by the row mappers.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use serde::de::DeserializeOwned;
use serde::Serialize;

use lnchat_shared::{Address, PageOptions};

fn conversion_error<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

pub(crate) fn address(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Address> {
    let raw: String = row.get(idx)?;
    Address::parse(&raw).map_err(|e| conversion_error(idx, Type::Text, e))
}

pub(crate) fn opt_address(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<Address>> {
    let raw: Option<String> = row.get(idx)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => Address::parse(s)
            .map(Some)
            .map_err(|e| conversion_error(idx, Type::Text, e)),
    }
}

pub(crate) fn json<T: DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, Type::Text, e))
}

/// Serialized name of a unit enum variant, as stored in tag columns.
pub(crate) fn enum_tag<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

pub(crate) fn timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, Type::Text, e))
}

pub(crate) fn id(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    Ok(raw as u64)
}

/// `WHERE`/`ORDER BY`/`LIMIT` tail for key-set pagination over `column`.
///
/// Binds `?1` to the last seen id and `?2` to the page size.
pub(crate) fn page_clause(column: &str, page: &PageOptions) -> String {
    if page.reverse {
        format!("(?1 = 0 OR {column} < ?1) ORDER BY {column} DESC LIMIT ?2")
    } else {
        format!("{column} > ?1 ORDER BY {column} ASC LIMIT ?2")
    }
}
