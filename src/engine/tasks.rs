use tracing::{info, instrument};

use crate::config::{
    MAX_DESCRIPTION_CHARS, MAX_PAGE_SIZE, MAX_TITLE_CHARS, TASK_REWARD_DEFAULT, TASK_REWARD_MAX,
    TASK_REWARD_MIN,
};
use crate::db::Db;
use crate::directory::ChatDirectory;
use crate::engine::{optional_text, required_text};
use crate::error::{AppError, Result};
use crate::ledger::PointsLedger;
use crate::types::{now_ms, ChatId, ChatKind, LedgerRef, Task, TaskCompletion, TaskId, TaskListing, TaskState, UserId};

const TASK_COLUMNS: &str = "id, chat_id, title, description, creator_id, reward, state, \
                            completer_id, created_at, completed_at";

/// Chat-scoped bounties: the first member other than the creator to claim a task wins its reward.
#[derive(Clone)]
pub struct TaskClaimEngine {
    db: Db,
}

impl TaskClaimEngine {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Creates a pending task in a group chat. `reward` defaults to 10.
    #[instrument(skip(self, title, description))]
    pub async fn create(
        &self,
        chat_id: ChatId,
        creator_id: UserId,
        title: &str,
        description: Option<&str>,
        reward: Option<i64>,
    ) -> Result<Task> {
        let reward = reward.unwrap_or(TASK_REWARD_DEFAULT);
        if !(TASK_REWARD_MIN..=TASK_REWARD_MAX).contains(&reward) {
            return Err(AppError::invalid_input(format!(
                "reward must be between {TASK_REWARD_MIN} and {TASK_REWARD_MAX} points"
            )));
        }
        let title = required_text("title", title, MAX_TITLE_CHARS)?;
        let description = optional_text("description", description, MAX_DESCRIPTION_CHARS)?;

        let mut uow = self.db.begin().await?;
        match ChatDirectory::chat_kind(&mut uow, chat_id).await? {
            None => return Err(AppError::ChatNotFound(chat_id)),
            Some(ChatKind::Direct) => {
                return Err(AppError::invalid_input("tasks can only be created in group chats"))
            }
            Some(ChatKind::Group) => {}
        }
        ChatDirectory::require_member(&mut uow, chat_id, creator_id).await?;

        let task = sqlx::query_as::<_, Task>(&format!(
            r#"
            INSERT INTO tasks (chat_id, title, description, creator_id, reward, state, created_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(chat_id)
        .bind(&title)
        .bind(&description)
        .bind(creator_id)
        .bind(reward)
        .bind(now_ms())
        .fetch_one(&mut *uow)
        .await?;

        uow.commit().await?;
        info!(task_id = %task.id, chat_id = %chat_id, reward, "task created");
        Ok(task)
    }

    /// Claims a pending task and credits its reward to the claimant.
    ///
    /// The pending -> completed transition is a compare-and-set on `state`, so concurrent
    /// claims produce exactly one winner; everyone else gets `AlreadyCompleted`.
    #[instrument(skip(self))]
    pub async fn complete(&self, task_id: TaskId, claimant_id: UserId) -> Result<TaskCompletion> {
        let mut uow = self.db.begin().await?;

        let task = fetch_task(&mut uow, task_id).await?;
        if task.state != TaskState::Pending {
            return Err(AppError::AlreadyCompleted);
        }
        // Creators can't collect their own bounty.
        if task.creator_id == claimant_id {
            return Err(AppError::SelfCompletion);
        }
        if !ChatDirectory::is_member(&mut uow, task.chat_id, claimant_id).await? {
            return Err(AppError::NotAuthorized("only chat members can complete tasks"));
        }

        let completed = sqlx::query_as::<_, Task>(&format!(
            r#"
            UPDATE tasks
            SET state = 'completed', completer_id = ?, completed_at = ?
            WHERE id = ? AND state = 'pending'
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(claimant_id)
        .bind(now_ms())
        .bind(task_id)
        .fetch_optional(&mut *uow)
        .await?
        .ok_or(AppError::AlreadyCompleted)?;

        let new_balance = PointsLedger::credit(
            &mut uow,
            claimant_id,
            completed.reward,
            LedgerRef::TaskReward { task_id },
            &format!("Task completed: {}", completed.title),
        )
        .await?;

        uow.commit().await?;
        info!(
            task_id = %task_id,
            chat_id = %completed.chat_id,
            completer_id = %claimant_id,
            reward = completed.reward,
            "task completed"
        );
        Ok(TaskCompletion {
            reward: completed.reward,
            task: completed,
            completer_id: claimant_id,
            new_balance,
        })
    }

    /// Deletes a task. Only its creator may do so, and only while it is pending.
    #[instrument(skip(self))]
    pub async fn delete(&self, task_id: TaskId, requester_id: UserId) -> Result<()> {
        let mut uow = self.db.begin().await?;

        let task = fetch_task(&mut uow, task_id).await?;
        if task.creator_id != requester_id {
            return Err(AppError::NotAuthorized("only the creator can delete a task"));
        }
        if task.state != TaskState::Pending {
            return Err(AppError::TaskNotPending);
        }

        let deleted = sqlx::query("DELETE FROM tasks WHERE id = ? AND state = 'pending'")
            .bind(task_id)
            .execute(&mut *uow)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(AppError::TaskNotPending);
        }

        uow.commit().await?;
        info!(task_id = %task_id, "task deleted");
        Ok(())
    }

    pub async fn get(&self, task_id: TaskId) -> Result<Task> {
        let mut conn = self.db.pool().acquire().await?;
        fetch_task(&mut conn, task_id).await
    }

    /// Tasks of a chat, newest first. The requester must be a member.
    pub async fn list_by_chat(
        &self,
        chat_id: ChatId,
        requester_id: UserId,
        limit: i64,
    ) -> Result<Vec<TaskListing>> {
        let mut conn = self.db.pool().acquire().await?;
        ChatDirectory::require_member(&mut conn, chat_id, requester_id).await?;

        let rows = sqlx::query_as::<_, TaskListing>(
            r#"
            SELECT t.id, t.chat_id, t.title, t.description, t.creator_id, t.reward, t.state,
                   t.completer_id, t.created_at, t.completed_at,
                   c.display_name AS creator_name,
                   d.display_name AS completer_name
            FROM tasks t
            JOIN users c ON c.id = t.creator_id
            LEFT JOIN users d ON d.id = t.completer_id
            WHERE t.chat_id = ?
            ORDER BY t.id DESC
            LIMIT ?
            "#,
        )
        .bind(chat_id)
        .bind(limit.clamp(1, MAX_PAGE_SIZE))
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }
}

async fn fetch_task(conn: &mut sqlx::SqliteConnection, task_id: TaskId) -> Result<Task> {
    sqlx::query_as::<_, Task>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
        .bind(task_id)
        .fetch_optional(conn)
        .await?
        .ok_or(AppError::TaskNotFound(task_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestDb;
    use crate::types::PointsEvent;

    struct Fixture {
        t: TestDb,
        a: UserId,
        b: UserId,
        c: UserId,
        chat: ChatId,
    }

    async fn fixture() -> Fixture {
        let t = TestDb::new().await;
        let a = t.user("A", 0).await;
        let b = t.user("B", 0).await;
        let c = t.user("C", 0).await;
        let chat = t.group_chat(&[a, b, c]).await;
        Fixture { t, a, b, c, chat }
    }

    #[tokio::test]
    async fn create_applies_default_reward_and_trims() {
        let f = fixture().await;
        let task = f
            .t
            .tasks()
            .create(f.chat, f.a, "  Traer la pizza ", Some("  "), None)
            .await
            .unwrap();
        assert_eq!(task.reward, TASK_REWARD_DEFAULT);
        assert_eq!(task.title, "Traer la pizza");
        assert_eq!(task.description, None);
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.completer_id, None);
    }

    #[tokio::test]
    async fn create_enforces_reward_bounds() {
        let f = fixture().await;
        let tasks = f.t.tasks();
        for bad in [0, -1, 1001] {
            let err = tasks.create(f.chat, f.a, "t", None, Some(bad)).await.unwrap_err();
            assert!(matches!(err, AppError::InvalidInput(_)), "reward {bad}: {err:?}");
        }
        for good in [1, 1000] {
            let task = tasks.create(f.chat, f.a, "t", None, Some(good)).await.unwrap();
            assert_eq!(task.reward, good);
        }
    }

    #[tokio::test]
    async fn create_requires_group_chat_and_membership() {
        let f = fixture().await;
        let outsider = f.t.user("Z", 0).await;
        let direct = f.t.direct_chat(f.a, f.b).await;
        let tasks = f.t.tasks();

        let err = tasks.create(direct, f.a, "t", None, None).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        let err = tasks.create(f.chat, outsider, "t", None, None).await.unwrap_err();
        assert!(matches!(err, AppError::NotMember(_)));
        let err = tasks.create(ChatId(404), f.a, "t", None, None).await.unwrap_err();
        assert!(matches!(err, AppError::ChatNotFound(ChatId(404))));
    }

    #[tokio::test]
    async fn complete_pays_reward_exactly_once() {
        let f = fixture().await;
        let tasks = f.t.tasks();
        let task = tasks.create(f.chat, f.a, "Gol", None, Some(50)).await.unwrap();

        let done = tasks.complete(task.id, f.b).await.unwrap();
        assert_eq!(done.reward, 50);
        assert_eq!(done.new_balance, 50);
        assert_eq!(done.task.state, TaskState::Completed);
        assert_eq!(done.task.completer_id, Some(f.b));
        assert_eq!(done.completer_id, f.b);
        assert!(matches!(
            PointsEvent::from(&done),
            PointsEvent::TaskCompleted { completer_id, reward: 50, .. } if completer_id == f.b
        ));

        let err = tasks.complete(task.id, f.c).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyCompleted));
        let err = tasks.complete(task.id, f.b).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyCompleted));

        assert_eq!(f.t.ledger().balance(f.b).await.unwrap(), 50);
        assert_eq!(f.t.ledger().balance(f.c).await.unwrap(), 0);
        let entries = f.t.ledger().history(f.b, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reference, LedgerRef::TaskReward { task_id: task.id });
        assert_eq!(entries[0].reason, "Task completed: Gol");
    }

    #[tokio::test]
    async fn creator_cannot_complete_own_task() {
        let f = fixture().await;
        let tasks = f.t.tasks();
        let task = tasks.create(f.chat, f.a, "Gol", None, None).await.unwrap();

        let err = tasks.complete(task.id, f.a).await.unwrap_err();
        assert!(matches!(err, AppError::SelfCompletion));
        assert_eq!(tasks.get(task.id).await.unwrap().state, TaskState::Pending);
        assert_eq!(f.t.ledger().balance(f.a).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn complete_checks_existence_and_membership() {
        let f = fixture().await;
        let outsider = f.t.user("Z", 0).await;
        let tasks = f.t.tasks();
        let task = tasks.create(f.chat, f.a, "Gol", None, None).await.unwrap();

        let err = tasks.complete(TaskId(999), f.b).await.unwrap_err();
        assert!(matches!(err, AppError::TaskNotFound(TaskId(999))));
        let err = tasks.complete(task.id, outsider).await.unwrap_err();
        assert!(matches!(err, AppError::NotAuthorized(_)));
        assert_eq!(tasks.get(task.id).await.unwrap().state, TaskState::Pending);
    }

    #[tokio::test]
    async fn completed_state_wins_over_self_completion() {
        let f = fixture().await;
        let tasks = f.t.tasks();
        let task = tasks.create(f.chat, f.a, "Gol", None, None).await.unwrap();
        tasks.complete(task.id, f.b).await.unwrap();

        let err = tasks.complete(task.id, f.a).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyCompleted));
    }

    #[tokio::test]
    async fn delete_rules() {
        let f = fixture().await;
        let tasks = f.t.tasks();
        let pending = tasks.create(f.chat, f.a, "uno", None, None).await.unwrap();
        let done = tasks.create(f.chat, f.a, "dos", None, None).await.unwrap();
        tasks.complete(done.id, f.b).await.unwrap();

        let err = tasks.delete(pending.id, f.b).await.unwrap_err();
        assert!(matches!(err, AppError::NotAuthorized(_)));
        let err = tasks.delete(done.id, f.a).await.unwrap_err();
        assert!(matches!(err, AppError::TaskNotPending));
        let err = tasks.delete(TaskId(999), f.a).await.unwrap_err();
        assert!(matches!(err, AppError::TaskNotFound(_)));

        tasks.delete(pending.id, f.a).await.unwrap();
        let err = tasks.get(pending.id).await.unwrap_err();
        assert!(matches!(err, AppError::TaskNotFound(_)));
        // payout already made stays in place
        assert_eq!(f.t.ledger().balance(f.b).await.unwrap(), TASK_REWARD_DEFAULT);
    }

    #[tokio::test]
    async fn list_by_chat_is_newest_first_with_names() {
        let f = fixture().await;
        let outsider = f.t.user("Z", 0).await;
        let tasks = f.t.tasks();
        let first = tasks.create(f.chat, f.a, "uno", None, None).await.unwrap();
        let second = tasks.create(f.chat, f.b, "dos", None, None).await.unwrap();
        tasks.complete(first.id, f.c).await.unwrap();

        let listed = tasks.list_by_chat(f.chat, f.a, 50).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].task.id, second.id);
        assert_eq!(listed[0].creator_name, "B");
        assert_eq!(listed[0].completer_name, None);
        assert_eq!(listed[1].task.id, first.id);
        assert_eq!(listed[1].completer_name.as_deref(), Some("C"));

        let err = tasks.list_by_chat(f.chat, outsider, 50).await.unwrap_err();
        assert!(matches!(err, AppError::NotMember(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_one_winner() {
        let f = fixture().await;
        let task = f.t.tasks().create(f.chat, f.a, "Carrera", None, Some(50)).await.unwrap();

        let tasks = f.t.tasks();
        let (rb, rc) = tokio::join!(tasks.complete(task.id, f.b), tasks.complete(task.id, f.c));
        let (winner, loser_err) = match (rb, rc) {
            (Ok(_), Err(e)) => (f.b, e),
            (Err(e), Ok(_)) => (f.c, e),
            other => panic!("expected exactly one winner, got {other:?}"),
        };
        assert!(matches!(loser_err, AppError::AlreadyCompleted));
        assert_eq!(f.t.ledger().balance(winner).await.unwrap(), 50);
        let total = f.t.ledger().balance(f.b).await.unwrap() + f.t.ledger().balance(f.c).await.unwrap();
        assert_eq!(total, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_concurrent_claims_credit_reward_once() {
        let t = TestDb::new().await;
        let creator = t.user("creator", 0).await;
        let mut claimants = Vec::new();
        for i in 0..8 {
            claimants.push(t.user(&format!("claimant{i}"), 0).await);
        }
        let mut members = claimants.clone();
        members.push(creator);
        let chat = t.group_chat(&members).await;
        let task = t.tasks().create(chat, creator, "Race", None, Some(75)).await.unwrap();

        let task_id = task.id;
        let mut handles = Vec::new();
        for &claimant in &claimants {
            let tasks = t.tasks();
            handles.push(tokio::spawn(async move { tasks.complete(task_id, claimant).await }));
        }
        let mut successes = 0;
        for handle in futures_util::future::join_all(handles).await {
            match handle.unwrap() {
                Ok(_) => successes += 1,
                Err(AppError::AlreadyCompleted) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(successes, 1);

        let mut total = 0;
        for &claimant in &claimants {
            let audit = t.ledger().audit(claimant).await.unwrap();
            assert!(audit.is_balanced());
            total += audit.balance;
        }
        assert_eq!(total, 75);
    }
}
