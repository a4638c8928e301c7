use tracing::{debug, instrument, warn};

use crate::config::MAX_PAGE_SIZE;
use crate::db::models::LedgerEntryRow;
use crate::db::{Db, UnitOfWork};
use crate::error::{AppError, Result};
use crate::types::{now_ms, LeaderboardEntry, LedgerAudit, LedgerEntry, LedgerRef, UserId};

/// Owns every change to a user's point balance.
///
/// `credit` and `debit` run on the caller's [`UnitOfWork`] and never commit on their own,
/// so the balance write and its ledger row land together or not at all.
/// Reads go straight to the pool.
#[derive(Clone)]
pub struct PointsLedger {
    db: Db,
}

impl PointsLedger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Adds `amount` to the balance and records the entry. Returns the new balance.
    #[instrument(skip_all, fields(user_id = %user_id, amount = amount, action = %reference.action()))]
    pub async fn credit(
        uow: &mut UnitOfWork,
        user_id: UserId,
        amount: i64,
        reference: LedgerRef,
        reason: &str,
    ) -> Result<i64> {
        require_positive(amount)?;

        let new_balance: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET points = points + ? WHERE id = ? RETURNING points",
        )
        .bind(amount)
        .bind(user_id)
        .fetch_optional(&mut **uow)
        .await?;
        let new_balance = new_balance.ok_or(AppError::UserNotFound(user_id))?;

        append_entry(uow, user_id, amount, reference, reason).await?;
        debug!(amount, new_balance, "points credited");
        Ok(new_balance)
    }

    /// Removes `amount` from the balance and records the entry. Returns the new balance.
    ///
    /// The funds check and the decrement are one conditional UPDATE, so two concurrent
    /// debits can never both pass against the same points.
    #[instrument(skip_all, fields(user_id = %user_id, amount = amount, action = %reference.action()))]
    pub async fn debit(
        uow: &mut UnitOfWork,
        user_id: UserId,
        amount: i64,
        reference: LedgerRef,
        reason: &str,
    ) -> Result<i64> {
        require_positive(amount)?;

        let new_balance: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET points = points - ? WHERE id = ? AND points >= ? RETURNING points",
        )
        .bind(amount)
        .bind(user_id)
        .bind(amount)
        .fetch_optional(&mut **uow)
        .await?;

        let Some(new_balance) = new_balance else {
            let available: Option<i64> =
                sqlx::query_scalar("SELECT points FROM users WHERE id = ?")
                    .bind(user_id)
                    .fetch_optional(&mut **uow)
                    .await?;
            return Err(match available {
                Some(available) => AppError::InsufficientFunds { needed: amount, available },
                None => AppError::UserNotFound(user_id),
            });
        };

        append_entry(uow, user_id, -amount, reference, reason).await?;
        debug!(amount, new_balance, "points debited");
        Ok(new_balance)
    }

    pub async fn balance(&self, user_id: UserId) -> Result<i64> {
        let points: Option<i64> = sqlx::query_scalar("SELECT points FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(self.db.pool())
            .await?;
        points.ok_or(AppError::UserNotFound(user_id))
    }

    /// Most recent entries first.
    pub async fn history(&self, user_id: UserId, limit: i64) -> Result<Vec<LedgerEntry>> {
        let rows: Vec<LedgerEntryRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, delta, action, reason, ref_id, created_at
            FROM ledger_entries
            WHERE user_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit.clamp(1, MAX_PAGE_SIZE))
        .fetch_all(self.db.pool())
        .await?;

        let entries = rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id;
                let entry = row.into_entry();
                if entry.is_none() {
                    warn!(entry_id = %id, "ledger entry without a reference id, skipped");
                }
                entry
            })
            .collect();
        Ok(entries)
    }

    /// Balance next to the sum of all recorded deltas; they must always match.
    pub async fn audit(&self, user_id: UserId) -> Result<LedgerAudit> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT u.points,
                   COALESCE((SELECT SUM(l.delta) FROM ledger_entries l WHERE l.user_id = u.id), 0)
            FROM users u
            WHERE u.id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;

        let (balance, ledger_sum) = row.ok_or(AppError::UserNotFound(user_id))?;
        Ok(LedgerAudit { user_id, balance, ledger_sum })
    }

    pub async fn leaderboard(&self, limit: i64) -> Result<Vec<LeaderboardEntry>> {
        let rows = sqlx::query_as::<_, LeaderboardEntry>(
            r#"
            SELECT id AS user_id, display_name, points
            FROM users
            ORDER BY points DESC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit.clamp(1, MAX_PAGE_SIZE))
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }
}

fn require_positive(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(AppError::invalid_input(format!(
            "ledger amount must be positive, got {amount}"
        )));
    }
    Ok(())
}

async fn append_entry(
    uow: &mut UnitOfWork,
    user_id: UserId,
    delta: i64,
    reference: LedgerRef,
    reason: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ledger_entries (user_id, delta, action, reason, ref_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(delta)
    .bind(reference.action())
    .bind(reason)
    .bind(reference.ref_id())
    .bind(now_ms())
    .execute(&mut **uow)
    .await?;
    Ok(())
}
