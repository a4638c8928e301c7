mod quiniela;
mod shop;
mod tasks;

pub use quiniela::{payout_for, QuinielaEngine};
pub use shop::ShopExchange;
pub use tasks::TaskClaimEngine;

use crate::error::{AppError, Result};

/// Trims `value` and rejects it when empty or longer than `max_chars`.
pub(crate) fn required_text(field: &str, value: &str, max_chars: usize) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::invalid_input(format!("{field} must not be empty")));
    }
    if trimmed.chars().count() > max_chars {
        return Err(AppError::invalid_input(format!(
            "{field} must be at most {max_chars} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Like [`required_text`] but blank input becomes `None`.
pub(crate) fn optional_text(field: &str, value: Option<&str>, max_chars: usize) -> Result<Option<String>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => required_text(field, v, max_chars).map(Some),
    }
}
