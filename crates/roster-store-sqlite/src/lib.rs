#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use roster_core::{
    format_date, format_rfc3339, now_utc, parse_date, parse_rfc3339_utc, CanonicalFields,
    DynamicField, DynamicFields, HistoryRecord, HistoryStore, Member, MemberId, MemberStore,
    MemberUpdate, MemberView, NewHistoryRecord, NewMember, RosterError, RosterQuery, RosterStore,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

const ROSTER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_ROSTER_V1: &str = r"
CREATE TABLE IF NOT EXISTS members (
  id INTEGER PRIMARY KEY,
  first_name TEXT NOT NULL,
  last_name TEXT NOT NULL,
  date_of_birth TEXT NOT NULL,
  dynamic_fields_json TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS member_dynamic_fields (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  member_id INTEGER NOT NULL,
  field_name TEXT NOT NULL,
  field_value TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (member_id) REFERENCES members(id)
);

CREATE INDEX IF NOT EXISTS idx_member_dynamic_fields_member_name
  ON member_dynamic_fields(member_id, field_name);

CREATE TABLE IF NOT EXISTS member_history (
  history_id INTEGER PRIMARY KEY AUTOINCREMENT,
  member_id INTEGER NOT NULL,
  batch_id TEXT NOT NULL,
  canonical_json TEXT NOT NULL,
  dynamic_fields_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (member_id) REFERENCES members(id)
);

CREATE INDEX IF NOT EXISTS idx_member_history_member
  ON member_history(member_id, history_id);

CREATE TRIGGER IF NOT EXISTS trg_member_history_no_update
BEFORE UPDATE ON member_history
BEGIN
  SELECT RAISE(FAIL, 'member_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_member_history_no_delete
BEFORE DELETE ON member_history
BEGIN
  SELECT RAISE(FAIL, 'member_history is append-only');
END;
";

const MEMBER_COLUMNS: &str =
    "id, first_name, last_name, date_of_birth, dynamic_fields_json, created_at, updated_at";
const DYNAMIC_FIELD_COLUMNS: &str = "id, member_id, field_name, field_value, created_at";
const HISTORY_COLUMNS: &str =
    "history_id, member_id, batch_id, canonical_json, dynamic_fields_json, created_at";

pub struct SqliteRosterStore {
    conn: Connection,
}

impl SqliteRosterStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        debug!(path = %path.display(), "opened roster database");
        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_ROSTER_V1)
            .context("failed to apply roster schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![ROSTER_MIGRATION_VERSION, now],
            )
            .context("failed to register roster schema migration")?;

        if inserted > 0 {
            info!(version = ROSTER_MIGRATION_VERSION, "applied roster schema migration");
        }
        Ok(())
    }

    pub fn count_members(&self) -> Result<usize> {
        self.count_rows("members")
    }

    pub fn count_dynamic_fields(&self) -> Result<usize> {
        self.count_rows("member_dynamic_fields")
    }

    pub fn count_history(&self) -> Result<usize> {
        self.count_rows("member_history")
    }

    fn count_rows(&self, table_name: &str) -> Result<usize> {
        let count = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table_name}"), [], |row| {
                row.get::<_, i64>(0)
            })
            .with_context(|| format!("failed to count {table_name} rows"))?;
        usize::try_from(count).with_context(|| format!("invalid {table_name} row count: {count}"))
    }

    fn list_dynamic_fields(&self, member_id: MemberId) -> Result<Vec<DynamicField>, RosterError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {DYNAMIC_FIELD_COLUMNS}
                 FROM member_dynamic_fields
                 WHERE member_id = ?1
                 ORDER BY id ASC"
            ))
            .map_err(|err| store_error("prepare dynamic field listing", &err))?;
        let rows = stmt
            .query_map(params![member_id.0], parse_dynamic_field_row)
            .map_err(|err| store_error("list dynamic fields", &err))?;
        collect_rows(rows, "list dynamic fields")
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl MemberStore for SqliteRosterStore {
    fn find_member(&self, id: MemberId) -> Result<Option<Member>, RosterError> {
        self.conn
            .query_row(
                &format!("SELECT {MEMBER_COLUMNS} FROM members WHERE id = ?1"),
                params![id.0],
                parse_member_row,
            )
            .optional()
            .map_err(|err| store_error("find member", &err))
    }

    fn insert_member(&mut self, member: &NewMember) -> Result<Member, RosterError> {
        let recorded_at = format_rfc3339(member.recorded_at)?;
        self.conn
            .execute(
                "INSERT INTO members(
                    id, first_name, last_name, date_of_birth,
                    dynamic_fields_json, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    member.id.0,
                    member.canonical.first_name,
                    member.canonical.last_name,
                    format_date(member.canonical.date_of_birth)?,
                    to_json(&member.dynamic_fields)?,
                    recorded_at,
                ],
            )
            .map_err(|err| store_error("insert member", &err))?;

        Ok(Member {
            id: member.id,
            canonical: member.canonical.clone(),
            dynamic_fields: member.dynamic_fields.clone(),
            created_at: member.recorded_at,
            updated_at: member.recorded_at,
        })
    }

    fn update_member(&mut self, id: MemberId, update: &MemberUpdate) -> Result<(), RosterError> {
        let changed = self
            .conn
            .execute(
                "UPDATE members SET
                    first_name = ?2,
                    last_name = ?3,
                    date_of_birth = ?4,
                    dynamic_fields_json = ?5,
                    updated_at = ?6
                 WHERE id = ?1",
                params![
                    id.0,
                    update.canonical.first_name,
                    update.canonical.last_name,
                    format_date(update.canonical.date_of_birth)?,
                    to_json(&update.dynamic_fields)?,
                    format_rfc3339(update.updated_at)?,
                ],
            )
            .map_err(|err| store_error("update member", &err))?;

        if changed != 1 {
            return Err(RosterError::StoreUnavailable(format!(
                "update member {id} touched {changed} rows"
            )));
        }
        Ok(())
    }

    fn find_dynamic_fields(
        &self,
        member_id: MemberId,
        field_name: &str,
    ) -> Result<Vec<DynamicField>, RosterError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {DYNAMIC_FIELD_COLUMNS}
                 FROM member_dynamic_fields
                 WHERE member_id = ?1 AND field_name = ?2
                 ORDER BY id ASC"
            ))
            .map_err(|err| store_error("prepare dynamic field lookup", &err))?;
        let rows = stmt
            .query_map(params![member_id.0, field_name], parse_dynamic_field_row)
            .map_err(|err| store_error("find dynamic field", &err))?;
        collect_rows(rows, "find dynamic field")
    }

    fn insert_dynamic_field(
        &mut self,
        member_id: MemberId,
        field_name: &str,
        field_value: &str,
        recorded_at: OffsetDateTime,
    ) -> Result<DynamicField, RosterError> {
        self.conn
            .execute(
                "INSERT INTO member_dynamic_fields(member_id, field_name, field_value, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    member_id.0,
                    field_name,
                    field_value,
                    format_rfc3339(recorded_at)?
                ],
            )
            .map_err(|err| store_error("insert dynamic field", &err))?;

        Ok(DynamicField {
            id: self.conn.last_insert_rowid(),
            member_id,
            field_name: field_name.to_string(),
            field_value: field_value.to_string(),
            created_at: recorded_at,
        })
    }

    fn update_dynamic_field(&mut self, id: i64, field_value: &str) -> Result<(), RosterError> {
        let changed = self
            .conn
            .execute(
                "UPDATE member_dynamic_fields SET field_value = ?2 WHERE id = ?1",
                params![id, field_value],
            )
            .map_err(|err| store_error("update dynamic field", &err))?;

        if changed != 1 {
            return Err(RosterError::StoreUnavailable(format!(
                "update dynamic field {id} touched {changed} rows"
            )));
        }
        Ok(())
    }
}

impl HistoryStore for SqliteRosterStore {
    fn append_history(&mut self, record: &NewHistoryRecord) -> Result<HistoryRecord, RosterError> {
        self.conn
            .execute(
                "INSERT INTO member_history(
                    member_id, batch_id, canonical_json, dynamic_fields_json, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.member_id.0,
                    record.batch_id.to_string(),
                    to_json(&record.canonical)?,
                    to_json(&record.dynamic_fields)?,
                    format_rfc3339(record.recorded_at)?,
                ],
            )
            .map_err(|err| store_error("append history", &err))?;

        Ok(HistoryRecord {
            history_id: self.conn.last_insert_rowid(),
            member_id: record.member_id,
            batch_id: record.batch_id,
            canonical: record.canonical.clone(),
            dynamic_fields: record.dynamic_fields.clone(),
            created_at: record.recorded_at,
        })
    }
}

impl RosterStore for SqliteRosterStore {
    /// Wraps the row in `BEGIN IMMEDIATE`, so the write lock is held from the
    /// member lookup onward and concurrent writers queue per row.
    fn within_row<T, F>(&mut self, work: F) -> Result<T, RosterError>
    where
        F: FnOnce(&mut Self) -> Result<T, RosterError>,
    {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|err| store_error("begin row transaction", &err))?;

        match work(self) {
            Ok(value) => {
                if let Err(err) = self.conn.execute_batch("COMMIT") {
                    self.rollback_row();
                    return Err(store_error("commit row transaction", &err));
                }
                Ok(value)
            }
            Err(err) => {
                self.rollback_row();
                Err(err)
            }
        }
    }
}

impl SqliteRosterStore {
    fn rollback_row(&self) {
        if self.conn.is_autocommit() {
            return;
        }
        if let Err(err) = self.conn.execute_batch("ROLLBACK") {
            warn!(error = %err, "row transaction rollback failed");
        }
    }
}

impl RosterQuery for SqliteRosterStore {
    fn get_member(&self, id: MemberId) -> Result<Option<MemberView>, RosterError> {
        let Some(member) = self.find_member(id)? else {
            return Ok(None);
        };

        let dynamic_field_rows = self.list_dynamic_fields(id)?;
        Ok(Some(MemberView {
            member,
            dynamic_field_rows,
        }))
    }

    fn get_history(&self, member_id: MemberId) -> Result<Vec<HistoryRecord>, RosterError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {HISTORY_COLUMNS}
                 FROM member_history
                 WHERE member_id = ?1
                 ORDER BY history_id ASC"
            ))
            .map_err(|err| store_error("prepare history listing", &err))?;
        let rows = stmt
            .query_map(params![member_id.0], parse_history_row)
            .map_err(|err| store_error("list history", &err))?;
        collect_rows(rows, "list history")
    }

    fn list_members(&self) -> Result<Vec<Member>, RosterError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {MEMBER_COLUMNS} FROM members ORDER BY id ASC"
            ))
            .map_err(|err| store_error("prepare member listing", &err))?;
        let rows = stmt
            .query_map([], parse_member_row)
            .map_err(|err| store_error("list members", &err))?;
        collect_rows(rows, "list members")
    }
}

fn parse_member_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Member> {
    let date_of_birth_raw: String = row.get(3)?;
    let dynamic_fields_raw: String = row.get(4)?;
    let created_at_raw: String = row.get(5)?;
    let updated_at_raw: String = row.get(6)?;

    Ok(Member {
        id: MemberId(row.get(0)?),
        canonical: CanonicalFields {
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            date_of_birth: parse_date(&date_of_birth_raw).map_err(|err| to_sql_error(3, &err))?,
        },
        dynamic_fields: from_json_column(4, &dynamic_fields_raw)?,
        created_at: parse_timestamp_column(5, &created_at_raw)?,
        updated_at: parse_timestamp_column(6, &updated_at_raw)?,
    })
}

fn parse_dynamic_field_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DynamicField> {
    let created_at_raw: String = row.get(4)?;

    Ok(DynamicField {
        id: row.get(0)?,
        member_id: MemberId(row.get(1)?),
        field_name: row.get(2)?,
        field_value: row.get(3)?,
        created_at: parse_timestamp_column(4, &created_at_raw)?,
    })
}

fn parse_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let batch_id_raw: String = row.get(2)?;
    let canonical_raw: String = row.get(3)?;
    let dynamic_fields_raw: String = row.get(4)?;
    let created_at_raw: String = row.get(5)?;

    let batch_id = Ulid::from_string(&batch_id_raw).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid ULID batch_id: {batch_id_raw}"),
            )),
        )
    })?;

    Ok(HistoryRecord {
        history_id: row.get(0)?,
        member_id: MemberId(row.get(1)?),
        batch_id,
        canonical: from_json_column(3, &canonical_raw)?,
        dynamic_fields: from_json_column::<DynamicFields>(4, &dynamic_fields_raw)?,
        created_at: parse_timestamp_column(5, &created_at_raw)?,
    })
}

fn parse_timestamp_column(index: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| to_sql_error(index, &err))
}

fn from_json_column<T: serde::de::DeserializeOwned>(
    index: usize,
    raw: &str,
) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid stored JSON: {err}"),
            )),
        )
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RosterError> {
    serde_json::to_string(value)
        .map_err(|err| RosterError::StoreUnavailable(format!("failed to serialize snapshot: {err}")))
}

fn to_sql_error(index: usize, err: &RosterError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn store_error(operation: &str, err: &rusqlite::Error) -> RosterError {
    RosterError::StoreUnavailable(format!("{operation}: {err}"))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
    operation: &str,
) -> Result<Vec<T>, RosterError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(|err| store_error(operation, &err))?);
    }
    Ok(values)
}
