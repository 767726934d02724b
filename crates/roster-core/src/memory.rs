//! Process-local store used to exercise the engine without a database.

use std::collections::BTreeMap;

use time::OffsetDateTime;

use crate::store::{HistoryStore, MemberStore, RosterQuery, RosterStore};
use crate::{
    DynamicField, HistoryRecord, Member, MemberId, MemberUpdate, MemberView, NewHistoryRecord,
    NewMember, RosterError,
};

#[derive(Debug, Clone, Default)]
pub struct InMemoryRosterStore {
    members: BTreeMap<MemberId, Member>,
    dynamic_fields: BTreeMap<i64, DynamicField>,
    history: Vec<HistoryRecord>,
    next_dynamic_field_id: i64,
    next_history_id: i64,
    write_budget: Option<usize>,
}

impl InMemoryRosterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write after the next `writes` fail with
    /// [`RosterError::StoreUnavailable`].
    pub fn fail_after_writes(&mut self, writes: usize) {
        self.write_budget = Some(writes);
    }

    fn spend_write(&mut self) -> Result<(), RosterError> {
        match self.write_budget {
            Some(0) => Err(RosterError::StoreUnavailable(
                "in-memory store write budget exhausted".to_string(),
            )),
            Some(remaining) => {
                self.write_budget = Some(remaining - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl MemberStore for InMemoryRosterStore {
    fn find_member(&self, id: MemberId) -> Result<Option<Member>, RosterError> {
        Ok(self.members.get(&id).cloned())
    }

    fn insert_member(&mut self, member: &NewMember) -> Result<Member, RosterError> {
        if self.members.contains_key(&member.id) {
            return Err(RosterError::StoreUnavailable(format!(
                "member {} already exists",
                member.id
            )));
        }
        self.spend_write()?;

        let stored = Member {
            id: member.id,
            canonical: member.canonical.clone(),
            dynamic_fields: member.dynamic_fields.clone(),
            created_at: member.recorded_at,
            updated_at: member.recorded_at,
        };
        self.members.insert(member.id, stored.clone());
        Ok(stored)
    }

    fn update_member(&mut self, id: MemberId, update: &MemberUpdate) -> Result<(), RosterError> {
        if !self.members.contains_key(&id) {
            return Err(RosterError::StoreUnavailable(format!(
                "member {id} does not exist"
            )));
        }
        self.spend_write()?;

        if let Some(member) = self.members.get_mut(&id) {
            member.canonical = update.canonical.clone();
            member.dynamic_fields = update.dynamic_fields.clone();
            member.updated_at = update.updated_at;
        }
        Ok(())
    }

    fn find_dynamic_fields(
        &self,
        member_id: MemberId,
        field_name: &str,
    ) -> Result<Vec<DynamicField>, RosterError> {
        Ok(self
            .dynamic_fields
            .values()
            .filter(|field| field.member_id == member_id && field.field_name == field_name)
            .cloned()
            .collect())
    }

    fn insert_dynamic_field(
        &mut self,
        member_id: MemberId,
        field_name: &str,
        field_value: &str,
        recorded_at: OffsetDateTime,
    ) -> Result<DynamicField, RosterError> {
        self.spend_write()?;
        self.next_dynamic_field_id += 1;

        let field = DynamicField {
            id: self.next_dynamic_field_id,
            member_id,
            field_name: field_name.to_string(),
            field_value: field_value.to_string(),
            created_at: recorded_at,
        };
        self.dynamic_fields.insert(field.id, field.clone());
        Ok(field)
    }

    fn update_dynamic_field(&mut self, id: i64, field_value: &str) -> Result<(), RosterError> {
        if !self.dynamic_fields.contains_key(&id) {
            return Err(RosterError::StoreUnavailable(format!(
                "dynamic field {id} does not exist"
            )));
        }
        self.spend_write()?;

        if let Some(field) = self.dynamic_fields.get_mut(&id) {
            field.field_value = field_value.to_string();
        }
        Ok(())
    }
}

impl HistoryStore for InMemoryRosterStore {
    fn append_history(&mut self, record: &NewHistoryRecord) -> Result<HistoryRecord, RosterError> {
        self.spend_write()?;
        self.next_history_id += 1;

        let stored = HistoryRecord {
            history_id: self.next_history_id,
            member_id: record.member_id,
            batch_id: record.batch_id,
            canonical: record.canonical.clone(),
            dynamic_fields: record.dynamic_fields.clone(),
            created_at: record.recorded_at,
        };
        self.history.push(stored.clone());
        Ok(stored)
    }
}

impl RosterStore for InMemoryRosterStore {
    fn within_row<T, F>(&mut self, work: F) -> Result<T, RosterError>
    where
        F: FnOnce(&mut Self) -> Result<T, RosterError>,
    {
        let checkpoint = self.clone();
        let outcome = work(self);
        if outcome.is_err() {
            let write_budget = self.write_budget;
            *self = checkpoint;
            self.write_budget = write_budget;
        }
        outcome
    }
}

impl RosterQuery for InMemoryRosterStore {
    fn get_member(&self, id: MemberId) -> Result<Option<MemberView>, RosterError> {
        let Some(member) = self.members.get(&id) else {
            return Ok(None);
        };

        let dynamic_field_rows = self
            .dynamic_fields
            .values()
            .filter(|field| field.member_id == id)
            .cloned()
            .collect();
        Ok(Some(MemberView {
            member: member.clone(),
            dynamic_field_rows,
        }))
    }

    fn get_history(&self, member_id: MemberId) -> Result<Vec<HistoryRecord>, RosterError> {
        Ok(self
            .history
            .iter()
            .filter(|record| record.member_id == member_id)
            .cloned()
            .collect())
    }

    fn list_members(&self) -> Result<Vec<Member>, RosterError> {
        Ok(self.members.values().cloned().collect())
    }
}
