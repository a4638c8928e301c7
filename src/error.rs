use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use crate::types::{ChatId, InstanceId, ItemId, QuinielaId, TaskId, UserId};

#[derive(Debug, Error)]
pub enum AppError {
    // --- expected rejections ---------------------------------------------
    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("chat {0} not found")]
    ChatNotFound(ChatId),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("quiniela {0} not found")]
    QuinielaNotFound(QuinielaId),

    #[error("quiniela instance {0} not found")]
    InstanceNotFound(InstanceId),

    #[error("shop item {0} not found")]
    ItemNotFound(ItemId),

    #[error("not authorized: {0}")]
    NotAuthorized(&'static str),

    #[error("task creators cannot complete their own task")]
    SelfCompletion,

    #[error("user is not a member of chat {0}")]
    NotMember(ChatId),

    #[error("you do not own shop item {0}")]
    NotOwned(ItemId),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("stake must be a positive number of points, got {0}")]
    InvalidStake(i64),

    #[error("task already completed")]
    AlreadyCompleted,

    #[error("only pending tasks can be deleted")]
    TaskNotPending,

    #[error("quiniela instance is not active")]
    NotActive,

    #[error("quiniela instance already finalized")]
    AlreadyFinalized,

    #[error("{0} is not available")]
    NotAvailable(&'static str),

    #[error("you already joined this quiniela")]
    AlreadyJoined,

    #[error("this quiniela is already active in the chat")]
    AlreadyActive,

    #[error("you already own this item")]
    AlreadyOwned,

    #[error("insufficient points: needed {needed}, available {available}")]
    InsufficientFunds { needed: i64, available: i64 },

    // --- unexpected failures ---------------------------------------------
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Histogram error: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Caller-facing failure taxonomy. Unexpected failures have no kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    NotAuthorized,
    NotMember,
    InvalidInput,
    AlreadyExists,
    InvalidState,
    InsufficientFunds,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::NotAuthorized => "not_authorized",
            ErrorKind::NotMember => "not_member",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::InsufficientFunds => "insufficient_funds",
        };
        write!(f, "{s}")
    }
}

impl AppError {
    /// Taxonomy kind for expected rejections; `None` means a bug or an infrastructure failure.
    pub fn kind(&self) -> Option<ErrorKind> {
        let kind = match self {
            AppError::UserNotFound(_)
            | AppError::ChatNotFound(_)
            | AppError::TaskNotFound(_)
            | AppError::QuinielaNotFound(_)
            | AppError::InstanceNotFound(_)
            | AppError::ItemNotFound(_)
            | AppError::NotOwned(_) => ErrorKind::NotFound,
            AppError::NotAuthorized(_) | AppError::SelfCompletion => ErrorKind::NotAuthorized,
            AppError::NotMember(_) => ErrorKind::NotMember,
            AppError::InvalidInput(_) | AppError::InvalidStake(_) => ErrorKind::InvalidInput,
            AppError::AlreadyJoined | AppError::AlreadyActive | AppError::AlreadyOwned => {
                ErrorKind::AlreadyExists
            }
            AppError::AlreadyCompleted
            | AppError::TaskNotPending
            | AppError::NotActive
            | AppError::AlreadyFinalized
            | AppError::NotAvailable(_) => ErrorKind::InvalidState,
            AppError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            AppError::Database(_)
            | AppError::Migration(_)
            | AppError::Histogram(_)
            | AppError::Config(_)
            | AppError::Io(_) => return None,
        };
        Some(kind)
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        AppError::InvalidInput(msg.into())
    }
}

// Extractor rejections surface as `InvalidInput` (400).
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::InvalidInput(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::InvalidInput(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::InvalidInput(rejection.body_text())
    }
}

/// True when `err` is a UNIQUE / PRIMARY KEY violation raised by SQLite.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map_or(false, |db| db.is_unique_violation())
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match self.kind() {
            Some(kind) => {
                debug!(error_kind = %kind, "request rejected: {self}");
                let status = match kind {
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::NotAuthorized | ErrorKind::NotMember => StatusCode::FORBIDDEN,
                    ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    ErrorKind::AlreadyExists | ErrorKind::InvalidState => StatusCode::CONFLICT,
                    ErrorKind::InsufficientFunds => StatusCode::UNPROCESSABLE_ENTITY,
                };
                (status, ErrorBody { error: kind.to_string(), message: self.to_string() })
            }
            None => {
                error!(error = ?self, "unexpected failure while handling request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: "internal".to_string(),
                        message: "internal server error".to_string(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
