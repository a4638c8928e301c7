use tracing::{info, instrument};

use crate::config::DEFAULT_PROFILE_ICON;
use crate::db::Db;
use crate::error::{is_unique_violation, AppError, Result};
use crate::ledger::PointsLedger;
use crate::types::{now_ms, EquipOutcome, ItemId, LedgerRef, OwnedItem, PurchaseReceipt, ShopItem, UserId};

/// Cosmetic icon shop: one-time purchases plus a single equipped slot per user.
///
/// `user_items.equipped` is authoritative; `users.profile_icon` mirrors it for cheap reads.
#[derive(Clone)]
pub struct ShopExchange {
    db: Db,
}

impl ShopExchange {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn purchase(&self, user_id: UserId, item_id: ItemId) -> Result<PurchaseReceipt> {
        let mut uow = self.db.begin().await?;

        let item = sqlx::query_as::<_, ShopItem>(
            "SELECT id, name, description, price, icon, available FROM shop_items WHERE id = ?",
        )
        .bind(item_id)
        .fetch_optional(&mut *uow)
        .await?
        .ok_or(AppError::ItemNotFound(item_id))?;
        if !item.available {
            return Err(AppError::NotAvailable("this item"));
        }

        let owned: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM user_items WHERE user_id = ? AND item_id = ?")
                .bind(user_id)
                .bind(item_id)
                .fetch_optional(&mut *uow)
                .await?;
        if owned.is_some() {
            return Err(AppError::AlreadyOwned);
        }

        // Free items skip the ledger; it only records non-zero deltas.
        let new_balance = if item.price > 0 {
            PointsLedger::debit(
                &mut uow,
                user_id,
                item.price,
                LedgerRef::ShopPurchase { item_id },
                &format!("Shop purchase: {}", item.name),
            )
            .await?
        } else {
            let points: Option<i64> = sqlx::query_scalar("SELECT points FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&mut *uow)
                .await?;
            points.ok_or(AppError::UserNotFound(user_id))?
        };

        sqlx::query(
            "INSERT INTO user_items (user_id, item_id, equipped, purchased_at) VALUES (?, ?, 0, ?)",
        )
        .bind(user_id)
        .bind(item_id)
        .bind(now_ms())
        .execute(&mut *uow)
        .await
        .map_err(|e| if is_unique_violation(&e) { AppError::AlreadyOwned } else { e.into() })?;

        uow.commit().await?;
        info!(user_id = %user_id, item_id = %item_id, price = item.price, new_balance, "item purchased");
        Ok(PurchaseReceipt { item, new_balance })
    }

    /// Equips an owned item, unequipping whatever was equipped before.
    #[instrument(skip(self))]
    pub async fn equip(&self, user_id: UserId, item_id: ItemId) -> Result<EquipOutcome> {
        let mut uow = self.db.begin().await?;

        let icon: Option<String> = sqlx::query_scalar(
            r#"
            SELECT s.icon
            FROM user_items ui
            JOIN shop_items s ON s.id = ui.item_id
            WHERE ui.user_id = ? AND ui.item_id = ?
            "#,
        )
        .bind(user_id)
        .bind(item_id)
        .fetch_optional(&mut *uow)
        .await?;
        let icon = icon.ok_or(AppError::NotOwned(item_id))?;

        // Clear then set inside one unit of work; no reader ever sees two equipped items.
        sqlx::query("UPDATE user_items SET equipped = 0 WHERE user_id = ? AND equipped = 1")
            .bind(user_id)
            .execute(&mut *uow)
            .await?;
        sqlx::query("UPDATE user_items SET equipped = 1 WHERE user_id = ? AND item_id = ?")
            .bind(user_id)
            .bind(item_id)
            .execute(&mut *uow)
            .await?;
        sqlx::query("UPDATE users SET profile_icon = ? WHERE id = ?")
            .bind(&icon)
            .bind(user_id)
            .execute(&mut *uow)
            .await?;

        uow.commit().await?;
        info!(user_id = %user_id, item_id = %item_id, icon = %icon, "item equipped");
        Ok(EquipOutcome { item_id: Some(item_id), profile_icon: icon })
    }

    /// Clears the equipped slot. Succeeds when nothing was equipped.
    #[instrument(skip(self))]
    pub async fn unequip(&self, user_id: UserId) -> Result<EquipOutcome> {
        let mut uow = self.db.begin().await?;

        let updated = sqlx::query("UPDATE users SET profile_icon = ? WHERE id = ?")
            .bind(DEFAULT_PROFILE_ICON)
            .bind(user_id)
            .execute(&mut *uow)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(AppError::UserNotFound(user_id));
        }
        let cleared = sqlx::query("UPDATE user_items SET equipped = 0 WHERE user_id = ? AND equipped = 1")
            .bind(user_id)
            .execute(&mut *uow)
            .await?
            .rows_affected();

        uow.commit().await?;
        info!(user_id = %user_id, cleared, "items unequipped");
        Ok(EquipOutcome { item_id: None, profile_icon: DEFAULT_PROFILE_ICON.to_string() })
    }

    /// Items currently for sale.
    pub async fn catalog(&self) -> Result<Vec<ShopItem>> {
        let items = sqlx::query_as::<_, ShopItem>(
            r#"
            SELECT id, name, description, price, icon, available
            FROM shop_items
            WHERE available = 1
            ORDER BY price, id
            "#,
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(items)
    }

    pub async fn inventory(&self, user_id: UserId) -> Result<Vec<OwnedItem>> {
        let items = sqlx::query_as::<_, OwnedItem>(
            r#"
            SELECT s.id, s.name, s.description, s.price, s.icon, s.available,
                   ui.equipped, ui.purchased_at
            FROM user_items ui
            JOIN shop_items s ON s.id = ui.item_id
            WHERE ui.user_id = ?
            ORDER BY ui.purchased_at, s.id
            "#,
        )
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(items)
    }
}
