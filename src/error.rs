use thiserror::Error;
use tracing::{error, warn};

/// Error taxonomy shared by every component. Handlers decide per variant
/// whether to answer the user, retry, or stay silent.
#[derive(Error, Debug)]
pub enum BotError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("permission denied: {0}")]
    Permission(String),
}

impl BotError {
    /// Text safe to show back to the user. Store errors never leak details.
    pub(crate) fn user_message(&self) -> String {
        match self {
            BotError::Validation(msg) => msg.clone(),
            BotError::NotFound(what) => format!("Nothing here: {what}."),
            BotError::Conflict(msg) => msg.clone(),
            BotError::Store(_) => "Something went wrong on our side. Please try again.".into(),
            BotError::Permission(msg) => msg.clone(),
        }
    }

    pub(crate) fn log(&self, ctx: &str) {
        match self {
            BotError::Store(e) => error!(context = %ctx, cause = %e, "store error"),
            other => warn!(context = %ctx, cause = %other, "request rejected"),
        }
    }
}
