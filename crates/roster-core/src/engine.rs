//! Row-by-row reconciliation of roster input against stored member state.
//!
//! Each row runs inside its own [`RosterStore::within_row`] scope. A failed
//! row is rolled back by the store; rows before it stay applied and the
//! call stops there.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::store::RosterStore;
use crate::{
    now_utc, DynamicFields, Member, MemberId, MemberUpdate, NewHistoryRecord, NewMember,
    RosterError, RosterRow,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RowAction {
    Inserted,
    Updated,
}

/// How an incoming set of dynamic fields relates to a stored snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DynamicFieldDiff {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl DynamicFieldDiff {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RowOutcome {
    pub row_index: usize,
    pub member_id: MemberId,
    pub action: RowAction,
    pub history_id: Option<i64>,
    pub field_changes: DynamicFieldDiff,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconciliationResult {
    pub batch_id: Ulid,
    pub rows_processed: usize,
    pub members_inserted: usize,
    pub members_updated: usize,
    pub history_records_appended: usize,
    pub dynamic_fields_inserted: usize,
    pub dynamic_fields_updated: usize,
    pub outcomes: Vec<RowOutcome>,
}

impl ReconciliationResult {
    fn new(batch_id: Ulid) -> Self {
        Self {
            batch_id,
            rows_processed: 0,
            members_inserted: 0,
            members_updated: 0,
            history_records_appended: 0,
            dynamic_fields_inserted: 0,
            dynamic_fields_updated: 0,
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, row_index: usize, member_id: MemberId, applied: AppliedRow) {
        self.rows_processed += 1;
        match applied.action {
            RowAction::Inserted => self.members_inserted += 1,
            RowAction::Updated => self.members_updated += 1,
        }
        if applied.history_id.is_some() {
            self.history_records_appended += 1;
        }
        self.dynamic_fields_inserted += applied.dynamic_fields_inserted;
        self.dynamic_fields_updated += applied.dynamic_fields_updated;
        self.outcomes.push(RowOutcome {
            row_index,
            member_id,
            action: applied.action,
            history_id: applied.history_id,
            field_changes: applied.field_changes,
        });
    }
}

/// A row that could not be applied. Rows before `row_index` are committed
/// and summarized in `applied`.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("row {row_index} (member {member_id}) was not applied: {source}")]
pub struct ReconcileError {
    pub row_index: usize,
    pub member_id: MemberId,
    #[source]
    pub source: RosterError,
    pub applied: ReconciliationResult,
}

struct AppliedRow {
    action: RowAction,
    history_id: Option<i64>,
    dynamic_fields_inserted: usize,
    dynamic_fields_updated: usize,
    field_changes: DynamicFieldDiff,
}

/// Applies `rows` to `store` in input order.
///
/// A repeated member id is reconciled against the state its earlier
/// occurrence left behind, so it archives that state too.
///
/// # Errors
/// Returns [`ReconcileError`] for the first row that fails. That row leaves
/// no writes behind; earlier rows remain applied.
pub fn reconcile<S: RosterStore>(
    store: &mut S,
    rows: &[RosterRow],
) -> Result<ReconciliationResult, ReconcileError> {
    let mut result = ReconciliationResult::new(Ulid::new());
    let batch_id = result.batch_id;

    for (row_index, row) in rows.iter().enumerate() {
        match store.within_row(|scope| reconcile_row(scope, batch_id, row)) {
            Ok(applied) => result.record(row_index, row.id, applied),
            Err(source) => {
                warn!(
                    %batch_id,
                    row_index,
                    member_id = %row.id,
                    error = %source,
                    "row reconciliation failed"
                );
                return Err(ReconcileError {
                    row_index,
                    member_id: row.id,
                    source,
                    applied: result,
                });
            }
        }
    }

    info!(
        %batch_id,
        rows = result.rows_processed,
        inserted = result.members_inserted,
        updated = result.members_updated,
        "reconciliation finished"
    );
    Ok(result)
}

/// Overlays `incoming` on `existing`. Incoming values win; keys missing from
/// `incoming` are kept in place and new keys are appended in incoming order.
#[must_use]
pub fn merge_dynamic_fields(existing: &DynamicFields, incoming: &DynamicFields) -> DynamicFields {
    let mut merged = existing.clone();
    for (name, value) in incoming {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

#[must_use]
pub fn diff_dynamic_fields(existing: &DynamicFields, incoming: &DynamicFields) -> DynamicFieldDiff {
    let mut diff = DynamicFieldDiff::default();
    for (name, value) in incoming {
        match existing.get(name) {
            None => diff.added.push(name.clone()),
            Some(current) if current == value => diff.unchanged.push(name.clone()),
            Some(_) => diff.changed.push(name.clone()),
        }
    }
    diff
}

fn reconcile_row<S: RosterStore>(
    store: &mut S,
    batch_id: Ulid,
    row: &RosterRow,
) -> Result<AppliedRow, RosterError> {
    let now = now_utc();
    match store.find_member(row.id)? {
        None => insert_member(store, row, now),
        Some(existing) => update_member(store, batch_id, &existing, row, now),
    }
}

fn insert_member<S: RosterStore>(
    store: &mut S,
    row: &RosterRow,
    now: OffsetDateTime,
) -> Result<AppliedRow, RosterError> {
    store.insert_member(&NewMember {
        id: row.id,
        canonical: row.canonical(),
        dynamic_fields: row.extra_fields.clone(),
        recorded_at: now,
    })?;

    for (name, value) in &row.extra_fields {
        store.insert_dynamic_field(row.id, name, value, now)?;
    }

    debug!(
        member_id = %row.id,
        dynamic_fields = row.extra_fields.len(),
        "member inserted"
    );
    Ok(AppliedRow {
        action: RowAction::Inserted,
        history_id: None,
        dynamic_fields_inserted: row.extra_fields.len(),
        dynamic_fields_updated: 0,
        field_changes: diff_dynamic_fields(&DynamicFields::new(), &row.extra_fields),
    })
}

fn update_member<S: RosterStore>(
    store: &mut S,
    batch_id: Ulid,
    existing: &Member,
    row: &RosterRow,
    now: OffsetDateTime,
) -> Result<AppliedRow, RosterError> {
    let history = store.append_history(&NewHistoryRecord {
        member_id: existing.id,
        batch_id,
        canonical: existing.canonical.clone(),
        dynamic_fields: existing.dynamic_fields.clone(),
        recorded_at: now,
    })?;

    store.update_member(
        existing.id,
        &MemberUpdate {
            canonical: row.canonical(),
            dynamic_fields: merge_dynamic_fields(&existing.dynamic_fields, &row.extra_fields),
            updated_at: now,
        },
    )?;

    let mut dynamic_fields_inserted = 0;
    let mut dynamic_fields_updated = 0;
    for (name, value) in &row.extra_fields {
        match store.find_dynamic_field(existing.id, name)? {
            Some(field) => {
                store.update_dynamic_field(field.id, value)?;
                dynamic_fields_updated += 1;
            }
            None => {
                store.insert_dynamic_field(existing.id, name, value, now)?;
                dynamic_fields_inserted += 1;
            }
        }
    }

    let field_changes = diff_dynamic_fields(&existing.dynamic_fields, &row.extra_fields);
    debug!(
        member_id = %existing.id,
        history_id = history.history_id,
        added = field_changes.added.len(),
        changed = field_changes.changed.len(),
        "member updated"
    );
    Ok(AppliedRow {
        action: RowAction::Updated,
        history_id: Some(history.history_id),
        dynamic_fields_inserted,
        dynamic_fields_updated,
        field_changes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRosterStore;
    use crate::store::{MemberStore, RosterQuery};
    use crate::MemberView;
    use time::macros::date;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some"),
        }
    }

    fn fields(pairs: &[(&str, &str)]) -> DynamicFields {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    fn ana(city: &str) -> RosterRow {
        RosterRow::new(MemberId(1), "Ana", "Lee", date!(1990 - 01 - 01)).with_field("city", city)
    }

    fn view(store: &InMemoryRosterStore, id: i64) -> MemberView {
        must_some(must(store.get_member(MemberId(id))))
    }

    #[test]
    fn fresh_member_gets_fields_and_no_history() {
        let mut store = InMemoryRosterStore::new();
        let row = ana("NYC").with_field("zip", "10001");

        let result = must(reconcile(&mut store, &[row]));

        assert_eq!(result.members_inserted, 1);
        assert_eq!(result.history_records_appended, 0);
        assert_eq!(result.dynamic_fields_inserted, 2);
        assert_eq!(result.outcomes[0].action, RowAction::Inserted);
        assert_eq!(result.outcomes[0].field_changes.added, vec!["city", "zip"]);

        let member = view(&store, 1);
        assert_eq!(member.member.canonical.first_name, "Ana");
        assert_eq!(member.member.dynamic_fields, fields(&[("city", "NYC"), ("zip", "10001")]));
        assert_eq!(member.dynamic_field_rows.len(), 2);
        assert!(must(store.get_history(MemberId(1))).is_empty());
    }

    #[test]
    fn update_archives_previous_state_and_merges_fields() {
        let mut store = InMemoryRosterStore::new();
        must(reconcile(&mut store, &[ana("NYC")]));

        let second = RosterRow::new(MemberId(1), "Ana", "Lee-Park", date!(1990 - 01 - 01))
            .with_field("city", "LA")
            .with_field("zip", "90001");
        let result = must(reconcile(&mut store, &[second]));

        assert_eq!(result.members_updated, 1);
        assert_eq!(result.history_records_appended, 1);
        assert_eq!(result.dynamic_fields_updated, 1);
        assert_eq!(result.dynamic_fields_inserted, 1);
        assert_eq!(result.outcomes[0].field_changes.changed, vec!["city"]);
        assert_eq!(result.outcomes[0].field_changes.added, vec!["zip"]);

        let member = view(&store, 1);
        assert_eq!(member.member.canonical.last_name, "Lee-Park");
        assert_eq!(member.member.dynamic_fields, fields(&[("city", "LA"), ("zip", "90001")]));

        let history = must(store.get_history(MemberId(1)));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].canonical.last_name, "Lee");
        assert_eq!(history[0].dynamic_fields, fields(&[("city", "NYC")]));
        assert_eq!(history[0].batch_id, result.batch_id);
        assert_eq!(result.outcomes[0].history_id, Some(history[0].history_id));
    }

    #[test]
    fn keys_missing_from_later_rows_are_retained() {
        let mut store = InMemoryRosterStore::new();
        let first = ana("NYC").with_field("team", "blue");
        must(reconcile(&mut store, &[first]));
        must(reconcile(&mut store, &[ana("LA")]));

        let member = view(&store, 1);
        assert_eq!(member.member.dynamic_fields, fields(&[("city", "LA"), ("team", "blue")]));
        let team = must_some(must(store.find_dynamic_field(MemberId(1), "team")));
        assert_eq!(team.field_value, "blue");
    }

    #[test]
    fn resubmitting_same_row_changes_nothing_but_history() {
        let mut store = InMemoryRosterStore::new();
        must(reconcile(&mut store, &[ana("NYC")]));
        let before = view(&store, 1);

        let result = must(reconcile(&mut store, &[ana("NYC")]));
        let after = view(&store, 1);

        assert!(result.outcomes[0].field_changes.is_noop());
        assert_eq!(before.member.dynamic_fields, after.member.dynamic_fields);
        assert_eq!(before.dynamic_field_rows.len(), after.dynamic_field_rows.len());
        assert_eq!(must(store.get_history(MemberId(1))).len(), 1);
    }

    #[test]
    fn repeated_id_in_one_call_archives_intermediate_state() {
        let mut store = InMemoryRosterStore::new();
        let rows = [ana("NYC"), ana("LA"), ana("SF")];

        let result = must(reconcile(&mut store, &rows));
        assert_eq!(result.members_inserted, 1);
        assert_eq!(result.members_updated, 2);

        let history = must(store.get_history(MemberId(1)));
        let cities = history
            .iter()
            .map(|record| record.dynamic_fields["city"].as_str())
            .collect::<Vec<_>>();
        assert_eq!(cities, vec!["NYC", "LA"]);
        assert_eq!(view(&store, 1).member.dynamic_fields["city"], "SF");
    }

    #[test]
    fn history_replays_every_prior_view() {
        let mut store = InMemoryRosterStore::new();
        let rows = [
            ana("NYC"),
            RosterRow::new(MemberId(1), "Anabel", "Lee", date!(1990 - 01 - 02))
                .with_field("zip", "10001"),
            ana("LA"),
        ];

        let mut views = Vec::new();
        for row in &rows {
            views.push(store.get_member(row.id).ok().flatten());
            must(reconcile(&mut store, std::slice::from_ref(row)));
        }

        let history = must(store.get_history(MemberId(1)));
        let prior_views = views.into_iter().flatten().collect::<Vec<_>>();
        assert_eq!(history.len(), prior_views.len());
        for (record, prior) in history.iter().zip(&prior_views) {
            assert_eq!(record.canonical, prior.member.canonical);
            assert_eq!(record.dynamic_fields, prior.member.dynamic_fields);
        }
    }

    #[test]
    fn duplicate_dynamic_field_rows_fail_only_that_row() {
        let mut store = InMemoryRosterStore::new();
        must(reconcile(&mut store, &[ana("NYC")]));
        must(store.insert_dynamic_field(MemberId(1), "city", "Boston", now_utc()));

        let other = RosterRow::new(MemberId(2), "Bo", "Kim", date!(1985 - 05 - 05));
        let err = match reconcile(&mut store, &[other, ana("LA")]) {
            Ok(result) => panic!("expected failure, got {result:?}"),
            Err(err) => err,
        };

        assert_eq!(err.row_index, 1);
        assert_eq!(err.member_id, MemberId(1));
        assert!(matches!(
            err.source,
            RosterError::DynamicFieldLookup { matches: 2, .. }
        ));
        assert_eq!(err.applied.rows_processed, 1);

        assert!(must(store.get_member(MemberId(2))).is_some());
        assert!(must(store.get_history(MemberId(1))).is_empty());
        assert_eq!(view(&store, 1).member.dynamic_fields["city"], "NYC");
    }

    #[test]
    fn store_failure_is_reported_with_row_context() {
        let mut store = InMemoryRosterStore::new();
        store.fail_after_writes(1);

        let rows = [
            RosterRow::new(MemberId(5), "Cy", "Ng", date!(1970 - 03 - 03)),
            RosterRow::new(MemberId(6), "Di", "Ox", date!(1971 - 04 - 04)),
        ];
        let err = match reconcile(&mut store, &rows) {
            Ok(result) => panic!("expected failure, got {result:?}"),
            Err(err) => err,
        };

        assert_eq!(err.row_index, 1);
        assert_eq!(err.member_id, MemberId(6));
        assert!(matches!(err.source, RosterError::StoreUnavailable(_)));
        assert!(must(store.get_member(MemberId(5))).is_some());
        assert!(must(store.get_member(MemberId(6))).is_none());
    }

    #[test]
    fn merge_is_additive_and_overriding() {
        let existing = fields(&[("a", "1"), ("b", "2")]);
        let incoming = fields(&[("b", "20"), ("c", "3")]);

        let merged = merge_dynamic_fields(&existing, &incoming);
        assert_eq!(merged, fields(&[("a", "1"), ("b", "20"), ("c", "3")]));

        let diff = diff_dynamic_fields(&existing, &incoming);
        assert_eq!(diff.added, vec!["c"]);
        assert_eq!(diff.changed, vec!["b"]);
        assert!(diff.unchanged.is_empty());
    }

    #[test]
    fn merge_keeps_existing_positions_and_appends_new_keys() {
        let existing = fields(&[("zip", "10001"), ("city", "NYC")]);
        let incoming = fields(&[("team", "blue"), ("city", "LA")]);

        let merged = merge_dynamic_fields(&existing, &incoming);
        let names = merged.keys().map(String::as_str).collect::<Vec<_>>();
        assert_eq!(names, vec!["zip", "city", "team"]);
        assert_eq!(merged["city"], "LA");
    }

    #[test]
    fn dynamic_field_rows_follow_column_order() {
        let mut store = InMemoryRosterStore::new();
        let row = RosterRow::new(MemberId(1), "Ana", "Lee", date!(1990 - 01 - 01))
            .with_field("zip", "10001")
            .with_field("city", "NYC");

        let result = must(reconcile(&mut store, &[row]));
        assert_eq!(result.outcomes[0].field_changes.added, vec!["zip", "city"]);

        let names = view(&store, 1)
            .dynamic_field_rows
            .iter()
            .map(|field| field.field_name.clone())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["zip", "city"]);
    }
}
