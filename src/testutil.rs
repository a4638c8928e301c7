//! Shared fixtures for database-backed tests.

use tempfile::TempDir;

use crate::config::Config;
use crate::db::Db;
use crate::directory::{ChatDirectory, UserDirectory};
use crate::engine::{QuinielaEngine, ShopExchange, TaskClaimEngine};
use crate::ledger::PointsLedger;
use crate::types::{ChatId, ChatKind, ItemId, QuinielaId, UserId};

/// A migrated file-backed database that lives as long as the value.
/// File-backed so that concurrent tests get real SQLite locking across connections.
pub struct TestDb {
    pub db: Db,
    _dir: TempDir,
}

impl TestDb {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let cfg = Config {
            log_level: "debug".to_string(),
            db_path: dir.path().join("points.db").display().to_string(),
            api_port: 0,
            db_max_connections: 8,
            db_busy_timeout_ms: 10_000,
            welcome_bonus: 0,
        };
        let db = Db::connect(&cfg).await.unwrap();
        Self { db, _dir: dir }
    }

    /// Registers a user whose starting balance arrives as a welcome bonus.
    pub async fn user(&self, name: &str, points: i64) -> UserId {
        UserDirectory::new(self.db.clone(), points).register(name).await.unwrap().id
    }

    pub async fn group_chat(&self, members: &[UserId]) -> ChatId {
        self.chats().create_chat(ChatKind::Group, Some("Peña mundialista"), members).await.unwrap()
    }

    pub async fn direct_chat(&self, a: UserId, b: UserId) -> ChatId {
        self.chats().create_chat(ChatKind::Direct, None, &[a, b]).await.unwrap()
    }

    pub async fn catalog_quiniela(&self, name: &str, active: bool) -> QuinielaId {
        sqlx::query_scalar(
            "INSERT INTO quinielas (name, description, kind, active) VALUES (?, 'test', 'champion', ?) RETURNING id",
        )
        .bind(name)
        .bind(active)
        .fetch_one(self.db.pool())
        .await
        .unwrap()
    }

    pub async fn item(&self, name: &str, price: i64, icon: &str, available: bool) -> ItemId {
        sqlx::query_scalar(
            "INSERT INTO shop_items (name, price, icon, available) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(price)
        .bind(icon)
        .bind(available)
        .fetch_one(self.db.pool())
        .await
        .unwrap()
    }

    pub fn ledger(&self) -> PointsLedger {
        PointsLedger::new(self.db.clone())
    }

    pub fn chats(&self) -> ChatDirectory {
        ChatDirectory::new(self.db.clone())
    }

    pub fn users(&self) -> UserDirectory {
        UserDirectory::new(self.db.clone(), 0)
    }

    pub fn tasks(&self) -> TaskClaimEngine {
        TaskClaimEngine::new(self.db.clone())
    }

    pub fn quinielas(&self) -> QuinielaEngine {
        QuinielaEngine::new(self.db.clone())
    }

    pub fn shop(&self) -> ShopExchange {
        ShopExchange::new(self.db.clone())
    }
}
