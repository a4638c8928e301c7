//! Row types for queries whose columns don't map one-to-one onto a domain type.

use crate::types::{LedgerAction, LedgerEntry, LedgerEntryId, LedgerRef, UserId};

#[derive(Debug, sqlx::FromRow)]
pub struct LedgerEntryRow {
    pub id: LedgerEntryId,
    pub user_id: UserId,
    pub delta: i64,
    pub action: LedgerAction,
    pub reason: String,
    pub ref_id: Option<i64>,
    pub created_at: i64,
}

impl LedgerEntryRow {
    /// None if the row carries an action whose reference id is missing.
    pub fn into_entry(self) -> Option<LedgerEntry> {
        let reference = LedgerRef::from_parts(self.action, self.ref_id)?;
        Some(LedgerEntry {
            id: self.id,
            user_id: self.user_id,
            delta: self.delta,
            reference,
            reason: self.reason,
            created_at: self.created_at,
        })
    }
}

/// Participation joined with the participant's display name, used by settlement.
#[derive(Debug, sqlx::FromRow)]
pub struct StakeRow {
    pub participation_id: crate::types::ParticipationId,
    pub user_id: UserId,
    pub display_name: String,
    pub stake: i64,
    pub prediction: String,
}
