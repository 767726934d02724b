use time::OffsetDateTime;

use crate::{
    DynamicField, HistoryRecord, Member, MemberId, MemberUpdate, MemberView, NewHistoryRecord,
    NewMember, RosterError,
};

/// Current-state tables: one row per member plus one row per
/// `(member, dynamic field name)` pair.
pub trait MemberStore {
    fn find_member(&self, id: MemberId) -> Result<Option<Member>, RosterError>;

    fn insert_member(&mut self, member: &NewMember) -> Result<Member, RosterError>;

    fn update_member(&mut self, id: MemberId, update: &MemberUpdate) -> Result<(), RosterError>;

    /// Every stored row for the pair. More than one is an integrity violation
    /// the caller decides how to report.
    fn find_dynamic_fields(
        &self,
        member_id: MemberId,
        field_name: &str,
    ) -> Result<Vec<DynamicField>, RosterError>;

    fn insert_dynamic_field(
        &mut self,
        member_id: MemberId,
        field_name: &str,
        field_value: &str,
        recorded_at: OffsetDateTime,
    ) -> Result<DynamicField, RosterError>;

    fn update_dynamic_field(&mut self, id: i64, field_value: &str) -> Result<(), RosterError>;

    /// Point lookup for a single dynamic field.
    ///
    /// # Errors
    /// Returns [`RosterError::DynamicFieldLookup`] when the pair matches more
    /// than one row, or the store's own error when the lookup fails.
    fn find_dynamic_field(
        &self,
        member_id: MemberId,
        field_name: &str,
    ) -> Result<Option<DynamicField>, RosterError> {
        let mut matches = self.find_dynamic_fields(member_id, field_name)?;
        if matches.len() > 1 {
            return Err(RosterError::DynamicFieldLookup {
                member_id,
                field_name: field_name.to_string(),
                matches: matches.len(),
            });
        }
        Ok(matches.pop())
    }
}

/// Append-only log of pre-update member state.
pub trait HistoryStore {
    fn append_history(&mut self, record: &NewHistoryRecord) -> Result<HistoryRecord, RosterError>;
}

pub trait RosterStore: MemberStore + HistoryStore {
    /// Runs one row's reads and writes as a single unit. On error nothing
    /// written inside `work` may remain visible. Scopes never nest and never
    /// span more than one row.
    fn within_row<T, F>(&mut self, work: F) -> Result<T, RosterError>
    where
        F: FnOnce(&mut Self) -> Result<T, RosterError>;
}

/// Read-only query surface, separate from reconciliation.
pub trait RosterQuery {
    fn get_member(&self, id: MemberId) -> Result<Option<MemberView>, RosterError>;

    /// History for one member, oldest first.
    fn get_history(&self, member_id: MemberId) -> Result<Vec<HistoryRecord>, RosterError>;

    fn list_members(&self) -> Result<Vec<Member>, RosterError>;
}
