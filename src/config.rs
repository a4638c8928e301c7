use crate::error::{AppError, Result};

/// Inclusive bounds on a task's reward.
pub const TASK_REWARD_MIN: i64 = 1;
pub const TASK_REWARD_MAX: i64 = 1000;
pub const TASK_REWARD_DEFAULT: i64 = 10;

/// Winning quinielas pay `floor(stake * NUM / DEN)`, i.e. 1.5x truncated.
pub const PAYOUT_NUMERATOR: i64 = 3;
pub const PAYOUT_DENOMINATOR: i64 = 2;

/// Profile icon shown when nothing is equipped.
pub const DEFAULT_PROFILE_ICON: &str = "default";

/// Channel capacity for post-commit notification events.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Text limits, counted in chars after trimming.
pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_DISPLAY_NAME_CHARS: usize = 64;
pub const MAX_DESCRIPTION_CHARS: usize = 2000;
pub const MAX_PREDICTION_CHARS: usize = 200;

/// Upper bound on rows returned by list endpoints.
pub const MAX_PAGE_SIZE: i64 = 500;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    pub db_max_connections: u32,
    /// How long a writer waits for the SQLite lock before failing (DB_BUSY_TIMEOUT_MS).
    pub db_busy_timeout_ms: u64,
    /// Points credited to every newly registered user (WELCOME_BONUS).
    pub welcome_bonus: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let welcome_bonus = parse_var("WELCOME_BONUS", "100")?;
        if welcome_bonus < 0 {
            return Err(AppError::Config("WELCOME_BONUS must not be negative".to_string()));
        }

        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "vive_mundial.db".to_string()),
            api_port: parse_var("API_PORT", "3000")?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", "8")?,
            db_busy_timeout_ms: parse_var("DB_BUSY_TIMEOUT_MS", "5000")?,
            welcome_bonus,
        })
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse::<T>()
        .map_err(|_| AppError::Config(format!("{key} has an invalid value")))
}
