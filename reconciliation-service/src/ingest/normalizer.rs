//! Raw row to canonical record conversion.
//!
//! Leniency is intentional at this layer: an unparsable amount becomes zero
//! and an unparsable date becomes `None`. Only a missing transaction id drops
//! the row.

use crate::ingest::reader::RawRow;
use crate::models::{ColumnMapping, IngestedRecord};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use uuid::Uuid;

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%m-%d-%Y",
    "%d.%m.%Y",
    "%d %b %Y",
    "%d-%b-%Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%Y%m%d",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

/// Build a record for `job_id` from `row`, or `None` when the row has no
/// transaction identifier.
pub fn normalize(row: &RawRow, mapping: &ColumnMapping, job_id: Uuid) -> Option<IngestedRecord> {
    let transaction_id = row
        .get(&mapping.transaction_id)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())?;

    let ref_number = row
        .get(&mapping.ref_number)
        .map(|v| v.trim().to_string())
        .unwrap_or_default();

    let amount = row
        .get(&mapping.amount)
        .map(|v| parse_amount(v))
        .unwrap_or(Decimal::ZERO);

    let date = row.get(&mapping.date).and_then(|v| parse_date(v));

    Some(IngestedRecord {
        id: Uuid::new_v4(),
        upload_job_id: job_id,
        transaction_id: transaction_id.to_string(),
        ref_number,
        amount,
        date,
        created_utc: Utc::now(),
    })
}

/// Keep digits, `.` and `-`, then parse the longest leading number of the
/// form `-?digits[.digits]`. Anything without a leading number is zero.
// TODO: surface unparsable amounts as row failures once the UI can show them.
pub fn parse_amount(raw: &str) -> Decimal {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();

    let (negative, rest) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.as_str()),
    };
    let digits_end = |s: &str| s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());

    let whole = &rest[..digits_end(rest)];
    let fraction = rest[whole.len()..]
        .strip_prefix('.')
        .map(|tail| &tail[..digits_end(tail)])
        .unwrap_or_default();
    if whole.is_empty() && fraction.is_empty() {
        return Decimal::ZERO;
    }

    let mut number = String::with_capacity(whole.len() + fraction.len() + 3);
    if negative {
        number.push('-');
    }
    number.push_str(if whole.is_empty() { "0" } else { whole });
    if !fraction.is_empty() {
        number.push('.');
        number.push_str(fraction);
    }
    Decimal::from_str(&number).unwrap_or(Decimal::ZERO)
}

/// Best-effort date parsing across the layouts seen in bank exports.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.date_naive());
    }

    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|dt| dt.date())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        })
}
