use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use crate::error::BotError;

/// Sentinel in a question's options column meaning "accept free text".
pub const MANUAL_INPUT: &str = "MANUAL_INPUT";

/// Stored in place of an answer when a question is skipped by an unmet
/// relation, so ordinals stay dense for export.
pub const SKIP_PLACEHOLDER: &str = "not answered";

/// Joins literal answer options inside the options column.
pub const OPTION_SEPARATOR: &str = "/\\";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Editor,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Editor => "editor",
            Role::Admin => "admin",
            Role::SuperAdmin => "super_admin",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, BotError> {
        match s {
            "user" => Ok(Role::User),
            "editor" => Ok(Role::Editor),
            "admin" => Ok(Role::Admin),
            "super_admin" => Ok(Role::SuperAdmin),
            other => Err(BotError::Validation(format!("unknown role: {other}"))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Active quiz position attached 1:1 to a user. Absent means no quiz in
/// progress. `ordinal` is 1-based; `rewrite` marks a single in-place
/// correction rather than forward progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub quiz_id: i64,
    pub ordinal: i32,
    pub rewrite: bool,
}

#[derive(Debug, Clone)]
pub struct User {
    pub internal_id: i64,
    pub tg_user_id: i64,
    pub role: Role,
    pub is_banned: bool,
    pub mailing: bool,
    pub session: Option<SessionState>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Quiz {
    pub quiz_id: i64,
    pub name: String,
    pub title: String,
    pub gratitude: String,
    pub visible: bool,
}

/// Conditional-skip rule: the question is only posed if the recorded answer
/// to `prerequisite` equals `required_answer` exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub prerequisite: i32,
    pub required_answer: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerSpec {
    FreeText,
    Options(Vec<String>),
}

impl AnswerSpec {
    /// Column representation: `/\`-joined options or the manual-input marker.
    pub fn encode(&self) -> String {
        match self {
            AnswerSpec::FreeText => MANUAL_INPUT.to_owned(),
            AnswerSpec::Options(opts) => opts.join(OPTION_SEPARATOR),
        }
    }

    pub fn decode(column: &str) -> Self {
        if column == MANUAL_INPUT {
            AnswerSpec::FreeText
        } else {
            AnswerSpec::Options(column.split(OPTION_SEPARATOR).map(str::to_owned).collect())
        }
    }
}

#[derive(Debug, Clone)]
pub struct Question {
    pub ordinal: i32,
    pub text: String,
    pub answers: AnswerSpec,
    pub relation: Option<Relation>,
}

/// One live answer per (user, quiz, ordinal). Serializable as the raw dump
/// consumed by the export adapter.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AnswerRow {
    pub internal_user_id: i64,
    pub quiz_id: i64,
    pub ordinal: i32,
    pub answer: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct BanRecord {
    pub ban_id: i64,
    pub internal_user_id: i64,
    pub initiator: String,
    pub reason: String,
    pub banned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub unban_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewBan {
    pub internal_user_id: i64,
    pub initiator: String,
    pub reason: String,
    pub banned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Typed parsing for stringified boolean flags (quiz visibility and the
/// like). Anything except the two literals is rejected.
pub fn parse_bool_flag(s: &str) -> Result<bool, BotError> {
    match s.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(BotError::Validation(format!(
            "expected 'true' or 'false', got '{other}'"
        ))),
    }
}
