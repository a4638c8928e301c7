use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! id_type {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(
                Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
                Serialize, Deserialize, sqlx::Type,
            )]
            #[serde(transparent)]
            #[sqlx(transparent)]
            pub struct $name(pub i64);

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

id_type!(UserId, ChatId, TaskId, QuinielaId, InstanceId, ParticipationId, ItemId, LedgerEntryId);

// ---------------------------------------------------------------------------
// Lifecycle states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ChatKind {
    Direct,
    Group,
}

impl std::fmt::Display for ChatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatKind::Direct => write!(f, "direct"),
            ChatKind::Group => write!(f, "group"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum InstanceState {
    Active,
    Finalized,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// The `action` column of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum LedgerAction {
    WelcomeBonus,
    TaskReward,
    QuinielaStake,
    QuinielaPayout,
    ShopPurchase,
}

impl std::fmt::Display for LedgerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LedgerAction::WelcomeBonus => "welcome_bonus",
            LedgerAction::TaskReward => "task_reward",
            LedgerAction::QuinielaStake => "quiniela_stake",
            LedgerAction::QuinielaPayout => "quiniela_payout",
            LedgerAction::ShopPurchase => "shop_purchase",
        };
        write!(f, "{s}")
    }
}

/// What a ledger entry points at. Stored as `(action, ref_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerRef {
    WelcomeBonus,
    TaskReward { task_id: TaskId },
    QuinielaStake { participation_id: ParticipationId },
    QuinielaPayout { participation_id: ParticipationId },
    ShopPurchase { item_id: ItemId },
}

impl LedgerRef {
    pub fn action(&self) -> LedgerAction {
        match self {
            LedgerRef::WelcomeBonus => LedgerAction::WelcomeBonus,
            LedgerRef::TaskReward { .. } => LedgerAction::TaskReward,
            LedgerRef::QuinielaStake { .. } => LedgerAction::QuinielaStake,
            LedgerRef::QuinielaPayout { .. } => LedgerAction::QuinielaPayout,
            LedgerRef::ShopPurchase { .. } => LedgerAction::ShopPurchase,
        }
    }

    pub fn ref_id(&self) -> Option<i64> {
        match self {
            LedgerRef::WelcomeBonus => None,
            LedgerRef::TaskReward { task_id } => Some(task_id.0),
            LedgerRef::QuinielaStake { participation_id }
            | LedgerRef::QuinielaPayout { participation_id } => Some(participation_id.0),
            LedgerRef::ShopPurchase { item_id } => Some(item_id.0),
        }
    }

    /// Rebuilds the typed reference from its stored columns.
    /// Returns None when an action that needs an id has none.
    pub fn from_parts(action: LedgerAction, ref_id: Option<i64>) -> Option<Self> {
        let r = match action {
            LedgerAction::WelcomeBonus => LedgerRef::WelcomeBonus,
            LedgerAction::TaskReward => LedgerRef::TaskReward { task_id: TaskId(ref_id?) },
            LedgerAction::QuinielaStake => LedgerRef::QuinielaStake {
                participation_id: ParticipationId(ref_id?),
            },
            LedgerAction::QuinielaPayout => LedgerRef::QuinielaPayout {
                participation_id: ParticipationId(ref_id?),
            },
            LedgerAction::ShopPurchase => LedgerRef::ShopPurchase { item_id: ItemId(ref_id?) },
        };
        Some(r)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub user_id: UserId,
    pub delta: i64,
    pub reference: LedgerRef,
    pub reason: String,
    /// Millisecond UTC epoch.
    pub created_at: i64,
}

/// Balance next to the sum of every delta recorded for the same user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerAudit {
    pub user_id: UserId,
    pub balance: i64,
    pub ledger_sum: i64,
}

impl LedgerAudit {
    pub fn is_balanced(&self) -> bool {
        self.balance == self.ledger_sum
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
    pub points: i64,
    pub profile_icon: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub display_name: String,
    pub points: i64,
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Task {
    pub id: TaskId,
    pub chat_id: ChatId,
    pub title: String,
    pub description: Option<String>,
    pub creator_id: UserId,
    pub reward: i64,
    pub state: TaskState,
    pub completer_id: Option<UserId>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

/// Task row enriched with display names for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct TaskListing {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub task: Task,
    pub creator_name: String,
    pub completer_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskCompletion {
    pub task: Task,
    pub completer_id: UserId,
    pub reward: i64,
    pub new_balance: i64,
}

// ---------------------------------------------------------------------------
// Quinielas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Quiniela {
    pub id: QuinielaId,
    pub name: String,
    pub description: Option<String>,
    pub kind: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct QuinielaInstance {
    pub id: InstanceId,
    pub chat_id: ChatId,
    pub quiniela_id: QuinielaId,
    pub adder_id: UserId,
    pub state: InstanceState,
    pub result: Option<String>,
    pub created_at: i64,
    pub finalized_at: Option<i64>,
}

/// Instance joined with its catalog entry and stake totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct InstanceSummary {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub instance: QuinielaInstance,
    pub quiniela_name: String,
    pub quiniela_kind: String,
    pub adder_name: String,
    pub participant_count: i64,
    pub total_staked: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceDetails {
    #[serde(flatten)]
    pub summary: InstanceSummary,
    pub quiniela_description: Option<String>,
    /// Requester added the instance and it is still active.
    pub can_settle: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Participation {
    pub id: ParticipationId,
    pub instance_id: InstanceId,
    pub user_id: UserId,
    pub stake: i64,
    pub prediction: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ParticipationListing {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub participation: Participation,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinReceipt {
    pub participation: Participation,
    pub chat_id: ChatId,
    pub new_balance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Payout {
    pub user_id: UserId,
    pub display_name: String,
    pub participation_id: ParticipationId,
    pub stake: i64,
    pub payout: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settlement {
    pub instance_id: InstanceId,
    pub chat_id: ChatId,
    pub result: String,
    pub winner_count: usize,
    pub winners: Vec<Payout>,
}

// ---------------------------------------------------------------------------
// Shop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ShopItem {
    pub id: ItemId,
    pub name: String,
    pub description: Option<String>,
    pub price: i64,
    pub icon: String,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct OwnedItem {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub item: ShopItem,
    pub equipped: bool,
    pub purchased_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseReceipt {
    pub item: ShopItem,
    pub new_balance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EquipOutcome {
    pub item_id: Option<ItemId>,
    pub profile_icon: String,
}

// ---------------------------------------------------------------------------
// Notification events, produced after commit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PointsEvent {
    TaskCompleted {
        task_id: TaskId,
        chat_id: ChatId,
        completer_id: UserId,
        reward: i64,
    },
    QuinielaJoined {
        instance_id: InstanceId,
        chat_id: ChatId,
        user_id: UserId,
        stake: i64,
    },
    QuinielaFinalized {
        instance_id: InstanceId,
        chat_id: ChatId,
        result: String,
        winner_count: usize,
        total_paid: i64,
    },
    ItemPurchased {
        user_id: UserId,
        item_id: ItemId,
        price: i64,
    },
    ItemEquipped {
        user_id: UserId,
        item_id: Option<ItemId>,
    },
}

impl PointsEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PointsEvent::TaskCompleted { .. } => "task_completed",
            PointsEvent::QuinielaJoined { .. } => "quiniela_joined",
            PointsEvent::QuinielaFinalized { .. } => "quiniela_finalized",
            PointsEvent::ItemPurchased { .. } => "item_purchased",
            PointsEvent::ItemEquipped { .. } => "item_equipped",
        }
    }
}

impl From<&TaskCompletion> for PointsEvent {
    fn from(c: &TaskCompletion) -> Self {
        PointsEvent::TaskCompleted {
            task_id: c.task.id,
            chat_id: c.task.chat_id,
            completer_id: c.completer_id,
            reward: c.reward,
        }
    }
}

impl From<&JoinReceipt> for PointsEvent {
    fn from(r: &JoinReceipt) -> Self {
        PointsEvent::QuinielaJoined {
            instance_id: r.participation.instance_id,
            chat_id: r.chat_id,
            user_id: r.participation.user_id,
            stake: r.participation.stake,
        }
    }
}

impl From<&Settlement> for PointsEvent {
    fn from(s: &Settlement) -> Self {
        PointsEvent::QuinielaFinalized {
            instance_id: s.instance_id,
            chat_id: s.chat_id,
            result: s.result.clone(),
            winner_count: s.winner_count,
            total_paid: s.winners.iter().map(|w| w.payout).sum(),
        }
    }
}

/// Millisecond UTC epoch.
pub fn now_ms() -> i64 {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    i64::try_from(ms).unwrap_or(i64::MAX)
}
