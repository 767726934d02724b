use serde::{Deserialize, Serialize};
use time::Date;

use crate::{iso_date, parse_date, CanonicalFields, DynamicFields, MemberId, RosterError};

pub const ID_COLUMNS: &[&str] = &["id"];
pub const FIRST_NAME_COLUMNS: &[&str] = &["first_name", "firstName"];
pub const LAST_NAME_COLUMNS: &[&str] = &["last_name", "lastName"];
pub const DATE_OF_BIRTH_COLUMNS: &[&str] = &["dob", "date_of_birth", "dateOfBirth"];

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum FixedColumn {
    Id,
    FirstName,
    LastName,
    DateOfBirth,
}

impl FixedColumn {
    fn classify(name: &str) -> Option<Self> {
        if ID_COLUMNS.contains(&name) {
            Some(Self::Id)
        } else if FIRST_NAME_COLUMNS.contains(&name) {
            Some(Self::FirstName)
        } else if LAST_NAME_COLUMNS.contains(&name) {
            Some(Self::LastName)
        } else if DATE_OF_BIRTH_COLUMNS.contains(&name) {
            Some(Self::DateOfBirth)
        } else {
            None
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::FirstName => "first_name",
            Self::LastName => "last_name",
            Self::DateOfBirth => "date_of_birth",
        }
    }
}

/// One validated input record: the four fixed fields plus every other column.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RosterRow {
    pub id: MemberId,
    pub first_name: String,
    pub last_name: String,
    #[serde(with = "iso_date")]
    pub date_of_birth: Date,
    pub extra_fields: DynamicFields,
}

impl RosterRow {
    #[must_use]
    pub fn new(
        id: MemberId,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        date_of_birth: Date,
    ) -> Self {
        Self {
            id,
            first_name: first_name.into(),
            last_name: last_name.into(),
            date_of_birth,
            extra_fields: DynamicFields::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_fields.insert(name.into(), value.into());
        self
    }

    /// Builds a row from `(column, value)` pairs.
    ///
    /// Column names are trimmed before matching. `id` and the date are
    /// trimmed before parsing; names and dynamic values are kept as given.
    ///
    /// # Errors
    /// Returns [`RosterError::MalformedRow`] when a fixed field is missing,
    /// given twice, or fails to parse, or when a column name is empty.
    pub fn from_record<I, K, V>(fields: I) -> Result<Self, RosterError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut id = None;
        let mut first_name = None;
        let mut last_name = None;
        let mut date_of_birth = None;
        let mut extra_fields = DynamicFields::new();

        for (raw_name, raw_value) in fields {
            let name = raw_name.as_ref().trim();
            let value = raw_value.as_ref();
            if name.is_empty() {
                return Err(RosterError::malformed("column name MUST NOT be empty"));
            }

            let Some(column) = FixedColumn::classify(name) else {
                if extra_fields
                    .insert(name.to_string(), value.to_string())
                    .is_some()
                {
                    return Err(RosterError::malformed(format!(
                        "column {name:?} appears more than once"
                    )));
                }
                continue;
            };

            let already_set = match column {
                FixedColumn::Id => id.replace(value.parse::<MemberId>()?).is_some(),
                FixedColumn::FirstName => first_name.replace(value.to_string()).is_some(),
                FixedColumn::LastName => last_name.replace(value.to_string()).is_some(),
                FixedColumn::DateOfBirth => date_of_birth.replace(parse_date(value)?).is_some(),
            };
            if already_set {
                return Err(RosterError::malformed(format!(
                    "{} is given more than once",
                    column.label()
                )));
            }
        }

        Ok(Self {
            id: require(id, FixedColumn::Id)?,
            first_name: require(first_name, FixedColumn::FirstName)?,
            last_name: require(last_name, FixedColumn::LastName)?,
            date_of_birth: require(date_of_birth, FixedColumn::DateOfBirth)?,
            extra_fields,
        })
    }

    #[must_use]
    pub fn canonical(&self) -> CanonicalFields {
        CanonicalFields {
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            date_of_birth: self.date_of_birth,
        }
    }
}

fn require<T>(value: Option<T>, column: FixedColumn) -> Result<T, RosterError> {
    value.ok_or_else(|| RosterError::malformed(format!("{} is required", column.label())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn malformed_reason(result: Result<RosterRow, RosterError>) -> String {
        match result {
            Err(RosterError::MalformedRow { reason }) => reason,
            other => panic!("expected malformed row, got {other:?}"),
        }
    }

    #[test]
    fn fixed_columns_are_split_from_extra_fields() {
        let row = must(RosterRow::from_record([
            ("id", "1"),
            ("first_name", "Ana"),
            ("last_name", "Lee"),
            ("dob", "1990-01-01"),
            ("city", "NYC"),
            (" zip ", "10001"),
        ]));

        assert_eq!(row.id, MemberId(1));
        assert_eq!(row.first_name, "Ana");
        assert_eq!(row.last_name, "Lee");
        assert_eq!(row.date_of_birth, date!(1990 - 01 - 01));
        assert_eq!(row.extra_fields.len(), 2);
        assert_eq!(row.extra_fields.get("city").map(String::as_str), Some("NYC"));
        assert_eq!(row.extra_fields.get("zip").map(String::as_str), Some("10001"));
    }

    #[test]
    fn camel_case_headers_are_accepted() {
        let row = must(RosterRow::from_record([
            ("id", "7"),
            ("firstName", "Bo"),
            ("lastName", "Kim"),
            ("dateOfBirth", "2001-12-31"),
        ]));
        assert_eq!(row.id, MemberId(7));
        assert!(row.extra_fields.is_empty());
    }

    #[test]
    fn non_numeric_id_is_malformed() {
        let reason = malformed_reason(RosterRow::from_record([
            ("id", "abc"),
            ("first_name", "Ana"),
            ("last_name", "Lee"),
            ("dob", "1990-01-01"),
        ]));
        assert!(reason.contains("not an integer"), "reason={reason}");
    }

    #[test]
    fn missing_required_field_is_malformed() {
        let reason = malformed_reason(RosterRow::from_record([
            ("id", "1"),
            ("first_name", "Ana"),
            ("dob", "1990-01-01"),
        ]));
        assert_eq!(reason, "last_name is required");
    }

    #[test]
    fn unparseable_date_is_malformed() {
        let reason = malformed_reason(RosterRow::from_record([
            ("id", "1"),
            ("first_name", "Ana"),
            ("last_name", "Lee"),
            ("dob", "yesterday"),
        ]));
        assert!(reason.contains("date_of_birth"), "reason={reason}");
    }

    #[test]
    fn aliased_fixed_column_given_twice_is_malformed() {
        let reason = malformed_reason(RosterRow::from_record([
            ("id", "1"),
            ("first_name", "Ana"),
            ("firstName", "Anna"),
            ("last_name", "Lee"),
            ("dob", "1990-01-01"),
        ]));
        assert_eq!(reason, "first_name is given more than once");
    }

    #[test]
    fn repeated_extra_column_is_malformed() {
        let reason = malformed_reason(RosterRow::from_record([
            ("id", "1"),
            ("first_name", "Ana"),
            ("last_name", "Lee"),
            ("dob", "1990-01-01"),
            ("city", "NYC"),
            (" city", "LA"),
        ]));
        assert_eq!(reason, "column \"city\" appears more than once");
    }

    #[test]
    fn extra_fields_keep_column_order() {
        let row = must(RosterRow::from_record([
            ("zip", "10001"),
            ("id", "1"),
            ("first_name", "Ana"),
            ("last_name", "Lee"),
            ("dob", "1990-01-01"),
            ("city", "NYC"),
            ("apt", "4B"),
        ]));
        let names = row.extra_fields.keys().map(String::as_str).collect::<Vec<_>>();
        assert_eq!(names, vec!["zip", "city", "apt"]);
    }

    #[test]
    fn builder_collects_extra_fields() {
        let row = RosterRow::new(MemberId(3), "Ana", "Lee", date!(1990 - 01 - 01))
            .with_field("city", "LA")
            .with_field("zip", "90001");
        assert_eq!(row.extra_fields.len(), 2);
        assert_eq!(row.canonical().first_name, "Ana");
    }
}
