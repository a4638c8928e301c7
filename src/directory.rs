//! Chat membership and user lookups consumed by the engines.
//!
//! Chats and users belong to the wider app; only what the points core needs
//! lives here. Checks that gate a write take the caller's connection so they
//! see the same snapshot as the write that follows.

use sqlx::SqliteConnection;
use tracing::{info, instrument};

use crate::config::{DEFAULT_PROFILE_ICON, MAX_DISPLAY_NAME_CHARS};
use crate::db::Db;
use crate::engine::required_text;
use crate::error::{AppError, Result};
use crate::ledger::PointsLedger;
use crate::types::{now_ms, ChatId, ChatKind, LedgerRef, UserId, UserProfile};

#[derive(Clone)]
pub struct ChatDirectory {
    db: Db,
}

impl ChatDirectory {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Creates a chat with the given members. Every member must exist.
    #[instrument(skip(self, name))]
    pub async fn create_chat(
        &self,
        kind: ChatKind,
        name: Option<&str>,
        members: &[UserId],
    ) -> Result<ChatId> {
        let mut uow = self.db.begin().await?;
        let now = now_ms();

        let chat_id: ChatId = sqlx::query_scalar(
            "INSERT INTO chats (kind, name, created_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(kind)
        .bind(name.map(str::trim).filter(|n| !n.is_empty()))
        .bind(now)
        .fetch_one(&mut *uow)
        .await?;

        for &user_id in members {
            require_user(&mut uow, user_id).await?;
            sqlx::query(
                "INSERT OR IGNORE INTO chat_members (chat_id, user_id, joined_at) VALUES (?, ?, ?)",
            )
            .bind(chat_id)
            .bind(user_id)
            .bind(now)
            .execute(&mut *uow)
            .await?;
        }

        uow.commit().await?;
        info!(chat_id = %chat_id, kind = %kind, members = members.len(), "chat created");
        Ok(chat_id)
    }

    /// Adds a member; adding an existing member is a no-op.
    pub async fn add_member(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        let mut uow = self.db.begin().await?;
        if Self::chat_kind(&mut uow, chat_id).await?.is_none() {
            return Err(AppError::ChatNotFound(chat_id));
        }
        require_user(&mut uow, user_id).await?;
        sqlx::query(
            "INSERT OR IGNORE INTO chat_members (chat_id, user_id, joined_at) VALUES (?, ?, ?)",
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(now_ms())
        .execute(&mut *uow)
        .await?;
        uow.commit().await
    }

    pub async fn is_member(
        conn: &mut SqliteConnection,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM chat_members WHERE chat_id = ? AND user_id = ?")
                .bind(chat_id)
                .bind(user_id)
                .fetch_optional(conn)
                .await?;
        Ok(found.is_some())
    }

    /// `NotMember` unless `user_id` belongs to `chat_id`.
    pub async fn require_member(
        conn: &mut SqliteConnection,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<()> {
        if Self::is_member(conn, chat_id, user_id).await? {
            Ok(())
        } else {
            Err(AppError::NotMember(chat_id))
        }
    }

    pub async fn chat_kind(conn: &mut SqliteConnection, chat_id: ChatId) -> Result<Option<ChatKind>> {
        let kind = sqlx::query_scalar("SELECT kind FROM chats WHERE id = ?")
            .bind(chat_id)
            .fetch_optional(conn)
            .await?;
        Ok(kind)
    }
}

/// Read-only view of users. Balances shown here are informational;
/// [`PointsLedger`] is the authority.
#[derive(Clone)]
pub struct UserDirectory {
    db: Db,
    welcome_bonus: i64,
}

impl UserDirectory {
    pub fn new(db: Db, welcome_bonus: i64) -> Self {
        Self { db, welcome_bonus }
    }

    /// Creates a user and credits the welcome bonus through the ledger in the same unit of work.
    #[instrument(skip(self))]
    pub async fn register(&self, display_name: &str) -> Result<UserProfile> {
        let display_name = required_text("display name", display_name, MAX_DISPLAY_NAME_CHARS)?;
        let mut uow = self.db.begin().await?;

        let user_id: UserId = sqlx::query_scalar(
            r#"
            INSERT INTO users (display_name, points, profile_icon, created_at)
            VALUES (?, 0, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&display_name)
        .bind(DEFAULT_PROFILE_ICON)
        .bind(now_ms())
        .fetch_one(&mut *uow)
        .await?;

        let mut points = 0;
        if self.welcome_bonus > 0 {
            points = PointsLedger::credit(
                &mut uow,
                user_id,
                self.welcome_bonus,
                LedgerRef::WelcomeBonus,
                "Welcome bonus",
            )
            .await?;
        }

        uow.commit().await?;
        info!(user_id = %user_id, points, "user registered");
        Ok(UserProfile {
            id: user_id,
            display_name,
            points,
            profile_icon: DEFAULT_PROFILE_ICON.to_string(),
        })
    }

    pub async fn profile(&self, user_id: UserId) -> Result<UserProfile> {
        let profile = sqlx::query_as::<_, UserProfile>(
            "SELECT id, display_name, points, profile_icon FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;
        profile.ok_or(AppError::UserNotFound(user_id))
    }

    pub async fn balance(&self, user_id: UserId) -> Result<i64> {
        Ok(self.profile(user_id).await?.points)
    }

    pub async fn display_name(conn: &mut SqliteConnection, user_id: UserId) -> Result<String> {
        let name: Option<String> = sqlx::query_scalar("SELECT display_name FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(conn)
            .await?;
        name.ok_or(AppError::UserNotFound(user_id))
    }
}

async fn require_user(conn: &mut SqliteConnection, user_id: UserId) -> Result<()> {
    UserDirectory::display_name(conn, user_id).await.map(|_| ())
}
