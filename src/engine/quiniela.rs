use tracing::{info, instrument};

use crate::config::{MAX_PREDICTION_CHARS, PAYOUT_DENOMINATOR, PAYOUT_NUMERATOR};
use crate::db::models::StakeRow;
use crate::db::Db;
use crate::directory::ChatDirectory;
use crate::engine::required_text;
use crate::error::{is_unique_violation, AppError, Result};
use crate::ledger::PointsLedger;
use crate::types::{
    now_ms, ChatId, InstanceDetails, InstanceId, InstanceState, InstanceSummary, JoinReceipt,
    LedgerRef, Participation, ParticipationListing, Payout, Quiniela, QuinielaId,
    QuinielaInstance, Settlement, UserId,
};

const INSTANCE_COLUMNS: &str =
    "id, chat_id, quiniela_id, adder_id, state, result, created_at, finalized_at";

const PARTICIPATION_COLUMNS: &str = "id, instance_id, user_id, stake, prediction, created_at";

const SUMMARY_SELECT: &str = r#"
    SELECT i.id, i.chat_id, i.quiniela_id, i.adder_id, i.state, i.result,
           i.created_at, i.finalized_at,
           q.name AS quiniela_name,
           q.kind AS quiniela_kind,
           u.display_name AS adder_name,
           (SELECT COUNT(*) FROM participations p WHERE p.instance_id = i.id) AS participant_count,
           (SELECT COALESCE(SUM(p.stake), 0) FROM participations p WHERE p.instance_id = i.id)
               AS total_staked
    FROM quiniela_instances i
    JOIN quinielas q ON q.id = i.quiniela_id
    JOIN users u ON u.id = i.adder_id
"#;

/// Winning payout for a stake: 1.5x, truncated toward zero.
pub fn payout_for(stake: i64) -> i64 {
    stake.saturating_mul(PAYOUT_NUMERATOR) / PAYOUT_DENOMINATOR
}

/// Chat-scoped wagers on catalog quinielas.
///
/// Stakes are debited on join (escrow) and never refunded. On settlement every exact
/// match of the result is paid [`payout_for`] its stake; losers keep nothing.
#[derive(Clone)]
pub struct QuinielaEngine {
    db: Db,
}

impl QuinielaEngine {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Attaches catalog quiniela `quiniela_id` to a chat as a new active instance.
    #[instrument(skip(self))]
    pub async fn attach_to_chat(
        &self,
        quiniela_id: QuinielaId,
        chat_id: ChatId,
        adder_id: UserId,
    ) -> Result<QuinielaInstance> {
        let mut uow = self.db.begin().await?;

        ChatDirectory::require_member(&mut uow, chat_id, adder_id).await?;

        let active: Option<bool> = sqlx::query_scalar("SELECT active FROM quinielas WHERE id = ?")
            .bind(quiniela_id)
            .fetch_optional(&mut *uow)
            .await?;
        match active {
            None => return Err(AppError::QuinielaNotFound(quiniela_id)),
            Some(false) => return Err(AppError::NotAvailable("this quiniela")),
            Some(true) => {}
        }

        let existing: Option<InstanceId> = sqlx::query_scalar(
            "SELECT id FROM quiniela_instances WHERE chat_id = ? AND quiniela_id = ? AND state = 'active'",
        )
        .bind(chat_id)
        .bind(quiniela_id)
        .fetch_optional(&mut *uow)
        .await?;
        if existing.is_some() {
            return Err(AppError::AlreadyActive);
        }

        let instance = sqlx::query_as::<_, QuinielaInstance>(&format!(
            r#"
            INSERT INTO quiniela_instances (chat_id, quiniela_id, adder_id, state, created_at)
            VALUES (?, ?, ?, 'active', ?)
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(chat_id)
        .bind(quiniela_id)
        .bind(adder_id)
        .bind(now_ms())
        .fetch_one(&mut *uow)
        .await
        .map_err(|e| if is_unique_violation(&e) { AppError::AlreadyActive } else { e.into() })?;

        uow.commit().await?;
        info!(instance_id = %instance.id, chat_id = %chat_id, quiniela_id = %quiniela_id, "quiniela attached");
        Ok(instance)
    }

    /// Joins an active instance, escrowing `stake` immediately.
    #[instrument(skip(self, prediction))]
    pub async fn join(
        &self,
        instance_id: InstanceId,
        user_id: UserId,
        stake: i64,
        prediction: &str,
    ) -> Result<JoinReceipt> {
        if stake <= 0 {
            return Err(AppError::InvalidStake(stake));
        }
        let prediction = required_text("prediction", prediction, MAX_PREDICTION_CHARS)?;

        let mut uow = self.db.begin().await?;

        let instance = fetch_instance(&mut uow, instance_id).await?;
        if instance.state != InstanceState::Active {
            return Err(AppError::NotActive);
        }
        ChatDirectory::require_member(&mut uow, instance.chat_id, user_id).await?;

        let already: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM participations WHERE instance_id = ? AND user_id = ?",
        )
        .bind(instance_id)
        .bind(user_id)
        .fetch_optional(&mut *uow)
        .await?;
        if already.is_some() {
            return Err(AppError::AlreadyJoined);
        }

        let participation = sqlx::query_as::<_, Participation>(&format!(
            r#"
            INSERT INTO participations (instance_id, user_id, stake, prediction, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING {PARTICIPATION_COLUMNS}
            "#
        ))
        .bind(instance_id)
        .bind(user_id)
        .bind(stake)
        .bind(&prediction)
        .bind(now_ms())
        .fetch_one(&mut *uow)
        .await
        .map_err(|e| if is_unique_violation(&e) { AppError::AlreadyJoined } else { e.into() })?;

        let name: String = sqlx::query_scalar("SELECT name FROM quinielas WHERE id = ?")
            .bind(instance.quiniela_id)
            .fetch_one(&mut *uow)
            .await?;
        let new_balance = PointsLedger::debit(
            &mut uow,
            user_id,
            stake,
            LedgerRef::QuinielaStake { participation_id: participation.id },
            &format!("Quiniela stake: {name}"),
        )
        .await?;

        uow.commit().await?;
        info!(
            instance_id = %instance_id,
            user_id = %user_id,
            stake,
            new_balance,
            "quiniela joined"
        );
        Ok(JoinReceipt { participation, chat_id: instance.chat_id, new_balance })
    }

    /// Finalizes an instance and pays every participant whose prediction equals
    /// `actual_result` exactly. Only the adder may settle, and only once.
    #[instrument(skip(self, actual_result))]
    pub async fn settle(
        &self,
        instance_id: InstanceId,
        actual_result: &str,
        requester_id: UserId,
    ) -> Result<Settlement> {
        let mut uow = self.db.begin().await?;

        let instance = fetch_instance(&mut uow, instance_id).await?;
        if instance.adder_id != requester_id {
            return Err(AppError::NotAuthorized("only the member who added the quiniela can settle it"));
        }
        if instance.state != InstanceState::Active {
            return Err(AppError::AlreadyFinalized);
        }
        let result = required_text("result", actual_result, MAX_PREDICTION_CHARS)?;

        let finalized = sqlx::query(
            r#"
            UPDATE quiniela_instances
            SET state = 'finalized', result = ?, finalized_at = ?
            WHERE id = ? AND state = 'active'
            "#,
        )
        .bind(&result)
        .bind(now_ms())
        .bind(instance_id)
        .execute(&mut *uow)
        .await?
        .rows_affected();
        if finalized == 0 {
            return Err(AppError::AlreadyFinalized);
        }

        let name: String = sqlx::query_scalar("SELECT name FROM quinielas WHERE id = ?")
            .bind(instance.quiniela_id)
            .fetch_one(&mut *uow)
            .await?;

        let stakes = sqlx::query_as::<_, StakeRow>(
            r#"
            SELECT p.id AS participation_id, p.user_id, u.display_name, p.stake, p.prediction
            FROM participations p
            JOIN users u ON u.id = p.user_id
            WHERE p.instance_id = ?
            ORDER BY p.id
            "#,
        )
        .bind(instance_id)
        .fetch_all(&mut *uow)
        .await?;

        let mut winners = Vec::new();
        for row in stakes.into_iter().filter(|r| r.prediction == result) {
            let payout = payout_for(row.stake);
            PointsLedger::credit(
                &mut uow,
                row.user_id,
                payout,
                LedgerRef::QuinielaPayout { participation_id: row.participation_id },
                &format!("Quiniela won: {name}"),
            )
            .await?;
            winners.push(Payout {
                user_id: row.user_id,
                display_name: row.display_name,
                participation_id: row.participation_id,
                stake: row.stake,
                payout,
            });
        }

        uow.commit().await?;
        info!(
            instance_id = %instance_id,
            chat_id = %instance.chat_id,
            result = %result,
            winners = winners.len(),
            "quiniela finalized"
        );
        Ok(Settlement {
            instance_id,
            chat_id: instance.chat_id,
            result,
            winner_count: winners.len(),
            winners,
        })
    }

    /// Active catalog entries.
    pub async fn list_available(&self) -> Result<Vec<Quiniela>> {
        let rows = sqlx::query_as::<_, Quiniela>(
            "SELECT id, name, description, kind, active FROM quinielas WHERE active = 1 ORDER BY id",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    /// Instances attached to a chat, active first, newest first within each state.
    pub async fn list_by_chat(&self, chat_id: ChatId, requester_id: UserId) -> Result<Vec<InstanceSummary>> {
        let mut conn = self.db.pool().acquire().await?;
        ChatDirectory::require_member(&mut conn, chat_id, requester_id).await?;

        let rows = sqlx::query_as::<_, InstanceSummary>(&format!(
            "{SUMMARY_SELECT} WHERE i.chat_id = ? ORDER BY (i.state = 'active') DESC, i.id DESC"
        ))
        .bind(chat_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }

    pub async fn get_details(&self, instance_id: InstanceId, requester_id: UserId) -> Result<InstanceDetails> {
        let mut conn = self.db.pool().acquire().await?;

        let summary = sqlx::query_as::<_, InstanceSummary>(&format!("{SUMMARY_SELECT} WHERE i.id = ?"))
            .bind(instance_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(AppError::InstanceNotFound(instance_id))?;

        let quiniela_description: Option<String> =
            sqlx::query_scalar("SELECT description FROM quinielas WHERE id = ?")
                .bind(summary.instance.quiniela_id)
                .fetch_one(&mut *conn)
                .await?;

        let can_settle = summary.instance.adder_id == requester_id
            && summary.instance.state == InstanceState::Active;
        Ok(InstanceDetails { summary, quiniela_description, can_settle })
    }

    pub async fn list_participations(&self, instance_id: InstanceId) -> Result<Vec<ParticipationListing>> {
        let mut conn = self.db.pool().acquire().await?;
        fetch_instance(&mut conn, instance_id).await?;

        let rows = sqlx::query_as::<_, ParticipationListing>(
            r#"
            SELECT p.id, p.instance_id, p.user_id, p.stake, p.prediction, p.created_at,
                   u.display_name
            FROM participations p
            JOIN users u ON u.id = p.user_id
            WHERE p.instance_id = ?
            ORDER BY p.id
            "#,
        )
        .bind(instance_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }

    pub async fn my_participation(
        &self,
        instance_id: InstanceId,
        user_id: UserId,
    ) -> Result<Option<Participation>> {
        let row = sqlx::query_as::<_, Participation>(&format!(
            "SELECT {PARTICIPATION_COLUMNS} FROM participations WHERE instance_id = ? AND user_id = ?"
        ))
        .bind(instance_id)
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row)
    }
}

async fn fetch_instance(conn: &mut sqlx::SqliteConnection, instance_id: InstanceId) -> Result<QuinielaInstance> {
    sqlx::query_as::<_, QuinielaInstance>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM quiniela_instances WHERE id = ?"
    ))
    .bind(instance_id)
    .fetch_optional(conn)
    .await?
    .ok_or(AppError::InstanceNotFound(instance_id))
}
