//! Text encodings shared by the SQL backends.

use std::str::FromStr;

use rust_decimal::Decimal;
use time::{format_description::well_known::Rfc3339, Date, Month, OffsetDateTime};

use crate::storage::StorageError;

pub fn timestamp_to_str(ts: OffsetDateTime) -> Result<String, StorageError> {
    ts.format(&Rfc3339)
        .map_err(|e| StorageError::Other(format!("Invalid timestamp: {}", e)))
}

pub fn str_to_timestamp(s: &str) -> Result<OffsetDateTime, StorageError> {
    OffsetDateTime::parse(s, &Rfc3339)
        .map_err(|e| StorageError::Other(format!("Invalid timestamp '{}': {}", s, e)))
}

pub fn date_to_str(d: Date) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), d.month() as u8, d.day())
}

pub fn str_to_date(s: &str) -> Result<Date, StorageError> {
    let invalid = || StorageError::Other(format!("Invalid date: {}", s));
    let parts: Vec<&str> = s.split('-').collect();
    if parts.len() != 3 {
        return Err(invalid());
    }
    let year = parts[0].parse::<i32>().map_err(|_| invalid())?;
    let month = parts[1].parse::<u8>().map_err(|_| invalid())?;
    let day = parts[2].parse::<u8>().map_err(|_| invalid())?;
    let month = Month::try_from(month).map_err(|_| invalid())?;
    Date::from_calendar_date(year, month, day).map_err(|_| invalid())
}

pub fn str_to_decimal(s: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(s).map_err(|e| StorageError::Other(format!("Invalid decimal '{}': {}", s, e)))
}

pub fn opt_str_to_decimal(s: Option<String>) -> Result<Option<Decimal>, StorageError> {
    s.as_deref().map(str_to_decimal).transpose()
}

pub fn opt_str_to_timestamp(s: Option<String>) -> Result<Option<OffsetDateTime>, StorageError> {
    s.as_deref().map(str_to_timestamp).transpose()
}
