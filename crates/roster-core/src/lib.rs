//! Member roster domain model and reconciliation engine.
//!
//! Storage backends plug in through the traits in [`store`]; the engine in
//! [`engine`] only ever talks to those traits and keeps no state of its own.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod engine;
pub mod memory;
pub mod row;
pub mod store;

pub use engine::{
    diff_dynamic_fields, merge_dynamic_fields, reconcile, DynamicFieldDiff, ReconcileError,
    ReconciliationResult, RowAction, RowOutcome,
};
pub use memory::InMemoryRosterStore;
pub use row::RosterRow;
pub use store::{HistoryStore, MemberStore, RosterQuery, RosterStore};

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

/// Field name to value, in the order the columns were first seen.
pub type DynamicFields = IndexMap<String, String>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RosterError {
    #[error("malformed row: {reason}")]
    MalformedRow { reason: String },
    #[error(
        "dynamic field lookup for member {member_id} field {field_name:?} matched {matches} rows"
    )]
    DynamicFieldLookup {
        member_id: MemberId,
        field_name: String,
        matches: usize,
    },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl RosterError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedRow {
            reason: reason.into(),
        }
    }
}

/// Externally supplied member identity. Never generated by the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct MemberId(pub i64);

impl Display for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MemberId {
    type Err = RosterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        trimmed
            .parse::<i64>()
            .map(Self)
            .map_err(|_| RosterError::malformed(format!("id {trimmed:?} is not an integer")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CanonicalFields {
    pub first_name: String,
    pub last_name: String,
    #[serde(with = "iso_date")]
    pub date_of_birth: Date,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Member {
    pub id: MemberId,
    #[serde(flatten)]
    pub canonical: CanonicalFields,
    pub dynamic_fields: DynamicFields,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMember {
    pub id: MemberId,
    pub canonical: CanonicalFields,
    pub dynamic_fields: DynamicFields,
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberUpdate {
    pub canonical: CanonicalFields,
    pub dynamic_fields: DynamicFields,
    pub updated_at: OffsetDateTime,
}

/// Normalized per-field projection of a member's snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DynamicField {
    pub id: i64,
    pub member_id: MemberId,
    pub field_name: String,
    pub field_value: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHistoryRecord {
    pub member_id: MemberId,
    pub batch_id: Ulid,
    pub canonical: CanonicalFields,
    pub dynamic_fields: DynamicFields,
    pub recorded_at: OffsetDateTime,
}

/// Member state captured immediately before an overwrite.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryRecord {
    pub history_id: i64,
    pub member_id: MemberId,
    pub batch_id: Ulid,
    pub canonical: CanonicalFields,
    pub dynamic_fields: DynamicFields,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemberView {
    pub member: Member,
    pub dynamic_field_rows: Vec<DynamicField>,
}

/// Parses a calendar date as `YYYY-MM-DD`, falling back to the date part of
/// an RFC 3339 timestamp.
///
/// # Errors
/// Returns [`RosterError::MalformedRow`] when neither form parses.
pub fn parse_date(value: &str) -> Result<Date, RosterError> {
    let trimmed = value.trim();
    if let Ok(date) = Date::parse(trimmed, format_description!("[year]-[month]-[day]")) {
        return Ok(date);
    }

    OffsetDateTime::parse(trimmed, &Rfc3339)
        .map(OffsetDateTime::date)
        .map_err(|_| RosterError::malformed(format!("date_of_birth {trimmed:?} is not a date")))
}

/// Formats a date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`RosterError::StoreUnavailable`] when formatting fails.
pub fn format_date(value: Date) -> Result<String, RosterError> {
    value
        .format(format_description!("[year]-[month]-[day]"))
        .map_err(|err| RosterError::StoreUnavailable(format!("date formatting failed: {err}")))
}

/// Parses an RFC 3339 timestamp and requires a UTC offset.
///
/// # Errors
/// Returns [`RosterError::StoreUnavailable`] when parsing fails or the value
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, RosterError> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339).map_err(|err| {
        RosterError::StoreUnavailable(format!("invalid RFC3339 timestamp {value:?}: {err}"))
    })?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(RosterError::StoreUnavailable(format!(
            "timestamp MUST be UTC (offset Z): {value}"
        )));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC 3339.
///
/// # Errors
/// Returns [`RosterError::StoreUnavailable`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, RosterError> {
    value
        .format(&Rfc3339)
        .map_err(|err| RosterError::StoreUnavailable(format!("timestamp formatting failed: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}
