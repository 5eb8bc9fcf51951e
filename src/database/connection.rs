use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;

use crate::compiler::CompiledQuiz;
use crate::database::models::{
    AnswerRow, AnswerSpec, BanRecord, NewBan, Question, Quiz, Relation, Role, SessionState, User,
};
use crate::error::BotError;

pub(crate) struct Connection {
    pool: PgPool,
}

impl Connection {
    pub(crate) async fn connect(connection_string: &str) -> Result<Self, BotError> {
        let pool = PgPool::connect(connection_string).await?;
        Ok(Self { pool })
    }

    pub(crate) async fn migrate(&self) -> Result<(), BotError> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }
}

/// Maps constraint violations onto the conflict variant so callers can tell
/// a stale write from an outage.
fn map_store_err(e: sqlx::Error, what: &str) -> BotError {
    if let sqlx::Error::Database(db) = &e {
        if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) {
            return BotError::Conflict(format!("{what} already exists"));
        }
    }
    BotError::Store(e)
}

#[derive(FromRow)]
struct UserRow {
    internal_id: i64,
    tg_user_id: i64,
    role: String,
    is_banned: bool,
    mailing: bool,
    session_quiz_id: Option<i64>,
    session_ordinal: Option<i32>,
    session_rewrite: bool,
}

impl TryFrom<UserRow> for User {
    type Error = BotError;

    fn try_from(row: UserRow) -> Result<Self, BotError> {
        let session = match (row.session_quiz_id, row.session_ordinal) {
            (Some(quiz_id), Some(ordinal)) => Some(SessionState {
                quiz_id,
                ordinal,
                rewrite: row.session_rewrite,
            }),
            _ => None,
        };
        Ok(User {
            internal_id: row.internal_id,
            tg_user_id: row.tg_user_id,
            role: Role::from_str(&row.role)?,
            is_banned: row.is_banned,
            mailing: row.mailing,
            session,
        })
    }
}

#[derive(FromRow)]
struct QuestionRow {
    ordinal: i32,
    text: String,
    options: String,
    relation_ordinal: Option<i32>,
    relation_answer: Option<String>,
}

impl From<QuestionRow> for Question {
    fn from(row: QuestionRow) -> Self {
        let relation = match (row.relation_ordinal, row.relation_answer) {
            (Some(prerequisite), Some(required_answer)) => Some(Relation {
                prerequisite,
                required_answer,
            }),
            _ => None,
        };
        Question {
            ordinal: row.ordinal,
            text: row.text,
            answers: AnswerSpec::decode(&row.options),
            relation,
        }
    }
}

const USER_COLUMNS: &str = "internal_id, tg_user_id, role, is_banned, mailing, \
     session_quiz_id, session_ordinal, session_rewrite";

pub(crate) trait ManageUsers {
    async fn user_by_tg_id(&self, tg_id: i64) -> Result<Option<User>, BotError>;

    async fn user_by_internal_id(&self, internal_id: i64) -> Result<Option<User>, BotError>;

    /// Users are created on first contact and never deleted.
    async fn get_or_create_user(&self, tg_id: i64) -> Result<User, BotError>;

    async fn set_role(&self, internal_id: i64, role: Role) -> Result<(), BotError>;

    async fn set_banned(&self, internal_id: i64, banned: bool) -> Result<(), BotError>;

    async fn set_mailing(&self, internal_id: i64, enabled: bool) -> Result<(), BotError>;

    async fn set_session(
        &self,
        internal_id: i64,
        session: Option<SessionState>,
    ) -> Result<(), BotError>;

    /// Chat ids of unbanned users who opted into the mailing list.
    async fn mailing_recipients(&self) -> Result<Vec<i64>, BotError>;
}

pub(crate) trait RetrieveQuiz {
    async fn quiz_by_id(&self, quiz_id: i64) -> Result<Option<Quiz>, BotError>;

    async fn quiz_by_name(&self, name: &str) -> Result<Option<Quiz>, BotError>;

    async fn visible_quizzes(&self) -> Result<Vec<Quiz>, BotError>;

    /// All questions of a quiz in ordinal order (dense 1..N by construction).
    async fn questions(&self, quiz_id: i64) -> Result<Vec<Question>, BotError>;
}

pub(crate) trait PublishQuiz {
    /// Stores a compiled quiz atomically. Quizzes are immutable once
    /// published; a duplicate name is a conflict.
    async fn publish_quiz(&self, quiz: &CompiledQuiz, visible: bool) -> Result<i64, BotError>;
}

pub(crate) trait RecordAnswers {
    async fn recorded_answers(
        &self,
        internal_user_id: i64,
        quiz_id: i64,
    ) -> Result<Vec<AnswerRow>, BotError>;

    /// Quiz ids the user has at least one answer row for.
    async fn answered_quiz_ids(&self, internal_user_id: i64) -> Result<Vec<i64>, BotError>;

    /// Appends answer rows and replaces the user's session in one
    /// transaction; on error nothing is committed.
    async fn commit_progress(
        &self,
        internal_user_id: i64,
        quiz_id: i64,
        rows: &[(i32, String)],
        session: Option<SessionState>,
    ) -> Result<(), BotError>;

    /// Overwrites one existing answer in place and clears the session, as a
    /// single transaction. Fails with `NotFound` when there is no row.
    async fn commit_rewrite(
        &self,
        internal_user_id: i64,
        quiz_id: i64,
        ordinal: i32,
        answer: &str,
    ) -> Result<(), BotError>;

    /// Raw per-quiz dump, the seam the export adapter consumes.
    async fn answers_for_quiz(&self, quiz_id: i64) -> Result<Vec<AnswerRow>, BotError>;
}

pub(crate) trait ManageBans {
    async fn insert_ban(&self, ban: &NewBan) -> Result<i64, BotError>;

    async fn active_ban(&self, internal_user_id: i64) -> Result<Option<BanRecord>, BotError>;

    async fn expired_active_bans(&self, now: DateTime<Utc>) -> Result<Vec<BanRecord>, BotError>;

    /// Marks a record inactive. Returns false when it already was, so
    /// concurrent unbans stay idempotent.
    async fn deactivate_ban(&self, ban_id: i64, reason: &str) -> Result<bool, BotError>;
}

pub(crate) trait LogMessages {
    async fn log_message(&self, tg_id: i64, text: &str, at: DateTime<Utc>) -> Result<(), BotError>;
}

impl ManageUsers for Connection {
    async fn user_by_tg_id(&self, tg_id: i64) -> Result<Option<User>, BotError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE tg_user_id = $1"
        ))
        .bind(tg_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    async fn user_by_internal_id(&self, internal_id: i64) -> Result<Option<User>, BotError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE internal_id = $1"
        ))
        .bind(internal_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    async fn get_or_create_user(&self, tg_id: i64) -> Result<User, BotError> {
        sqlx::query(
            "INSERT INTO users (tg_user_id) VALUES ($1) ON CONFLICT (tg_user_id) DO NOTHING",
        )
        .bind(tg_id)
        .execute(&self.pool)
        .await?;
        self.user_by_tg_id(tg_id)
            .await?
            .ok_or_else(|| BotError::NotFound(format!("user {tg_id}")))
    }

    async fn set_role(&self, internal_id: i64, role: Role) -> Result<(), BotError> {
        sqlx::query("UPDATE users SET role = $2 WHERE internal_id = $1")
            .bind(internal_id)
            .bind(role.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_banned(&self, internal_id: i64, banned: bool) -> Result<(), BotError> {
        sqlx::query("UPDATE users SET is_banned = $2 WHERE internal_id = $1")
            .bind(internal_id)
            .bind(banned)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_mailing(&self, internal_id: i64, enabled: bool) -> Result<(), BotError> {
        sqlx::query("UPDATE users SET mailing = $2 WHERE internal_id = $1")
            .bind(internal_id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_session(
        &self,
        internal_id: i64,
        session: Option<SessionState>,
    ) -> Result<(), BotError> {
        sqlx::query(
            "UPDATE users SET session_quiz_id = $2, session_ordinal = $3, session_rewrite = $4 \
             WHERE internal_id = $1",
        )
        .bind(internal_id)
        .bind(session.map(|s| s.quiz_id))
        .bind(session.map(|s| s.ordinal))
        .bind(session.map(|s| s.rewrite).unwrap_or(false))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mailing_recipients(&self) -> Result<Vec<i64>, BotError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT tg_user_id FROM users WHERE mailing AND NOT is_banned",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

impl RetrieveQuiz for Connection {
    async fn quiz_by_id(&self, quiz_id: i64) -> Result<Option<Quiz>, BotError> {
        let quiz = sqlx::query_as::<_, Quiz>(
            "SELECT quiz_id, name, title, gratitude, visible FROM quizzes WHERE quiz_id = $1",
        )
        .bind(quiz_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(quiz)
    }

    async fn quiz_by_name(&self, name: &str) -> Result<Option<Quiz>, BotError> {
        let quiz = sqlx::query_as::<_, Quiz>(
            "SELECT quiz_id, name, title, gratitude, visible FROM quizzes WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(quiz)
    }

    async fn visible_quizzes(&self) -> Result<Vec<Quiz>, BotError> {
        let quizzes = sqlx::query_as::<_, Quiz>(
            "SELECT quiz_id, name, title, gratitude, visible FROM quizzes WHERE visible \
             ORDER BY quiz_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(quizzes)
    }

    async fn questions(&self, quiz_id: i64) -> Result<Vec<Question>, BotError> {
        let rows = sqlx::query_as::<_, QuestionRow>(
            "SELECT ordinal, text, options, relation_ordinal, relation_answer \
             FROM questions WHERE quiz_id = $1 ORDER BY ordinal",
        )
        .bind(quiz_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Question::from).collect())
    }
}

impl PublishQuiz for Connection {
    async fn publish_quiz(&self, quiz: &CompiledQuiz, visible: bool) -> Result<i64, BotError> {
        log::debug!("publishing quiz '{}'", quiz.name);
        let mut tx = self.pool.begin().await?;

        let quiz_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO quizzes (name, title, gratitude, visible) VALUES ($1, $2, $3, $4) \
             RETURNING quiz_id",
        )
        .bind(&quiz.name)
        .bind(&quiz.title)
        .bind(&quiz.gratitude)
        .bind(visible)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_store_err(e, &format!("quiz '{}'", quiz.name)))?;

        for question in &quiz.questions {
            sqlx::query(
                "INSERT INTO questions \
                 (quiz_id, ordinal, text, options, relation_ordinal, relation_answer) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(quiz_id)
            .bind(question.ordinal)
            .bind(&question.text)
            .bind(question.answers.encode())
            .bind(question.relation.as_ref().map(|r| r.prerequisite))
            .bind(question.relation.as_ref().map(|r| r.required_answer.as_str()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(quiz_id)
    }
}

impl RecordAnswers for Connection {
    async fn recorded_answers(
        &self,
        internal_user_id: i64,
        quiz_id: i64,
    ) -> Result<Vec<AnswerRow>, BotError> {
        let rows = sqlx::query_as::<_, AnswerRow>(
            "SELECT internal_user_id, quiz_id, ordinal, answer FROM answers \
             WHERE internal_user_id = $1 AND quiz_id = $2 ORDER BY ordinal",
        )
        .bind(internal_user_id)
        .bind(quiz_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn answered_quiz_ids(&self, internal_user_id: i64) -> Result<Vec<i64>, BotError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT DISTINCT quiz_id FROM answers WHERE internal_user_id = $1",
        )
        .bind(internal_user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn commit_progress(
        &self,
        internal_user_id: i64,
        quiz_id: i64,
        rows: &[(i32, String)],
        session: Option<SessionState>,
    ) -> Result<(), BotError> {
        let mut tx = self.pool.begin().await?;

        for (ordinal, answer) in rows {
            sqlx::query(
                "INSERT INTO answers (internal_user_id, quiz_id, ordinal, answer) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(internal_user_id)
            .bind(quiz_id)
            .bind(ordinal)
            .bind(answer)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_store_err(e, &format!("answer to question {ordinal}")))?;
        }

        sqlx::query(
            "UPDATE users SET session_quiz_id = $2, session_ordinal = $3, session_rewrite = $4 \
             WHERE internal_id = $1",
        )
        .bind(internal_user_id)
        .bind(session.map(|s| s.quiz_id))
        .bind(session.map(|s| s.ordinal))
        .bind(session.map(|s| s.rewrite).unwrap_or(false))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn commit_rewrite(
        &self,
        internal_user_id: i64,
        quiz_id: i64,
        ordinal: i32,
        answer: &str,
    ) -> Result<(), BotError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE answers SET answer = $4 \
             WHERE internal_user_id = $1 AND quiz_id = $2 AND ordinal = $3",
        )
        .bind(internal_user_id)
        .bind(quiz_id)
        .bind(ordinal)
        .bind(answer)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(BotError::NotFound(format!(
                "answer to question {ordinal} of quiz {quiz_id}"
            )));
        }

        sqlx::query(
            "UPDATE users SET session_quiz_id = NULL, session_ordinal = NULL, \
             session_rewrite = FALSE WHERE internal_id = $1",
        )
        .bind(internal_user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn answers_for_quiz(&self, quiz_id: i64) -> Result<Vec<AnswerRow>, BotError> {
        let rows = sqlx::query_as::<_, AnswerRow>(
            "SELECT internal_user_id, quiz_id, ordinal, answer FROM answers \
             WHERE quiz_id = $1 ORDER BY internal_user_id, ordinal",
        )
        .bind(quiz_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

impl ManageBans for Connection {
    async fn insert_ban(&self, ban: &NewBan) -> Result<i64, BotError> {
        let ban_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO bans (internal_user_id, initiator, reason, banned_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING ban_id",
        )
        .bind(ban.internal_user_id)
        .bind(&ban.initiator)
        .bind(&ban.reason)
        .bind(ban.banned_at)
        .bind(ban.expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(ban_id)
    }

    async fn active_ban(&self, internal_user_id: i64) -> Result<Option<BanRecord>, BotError> {
        let ban = sqlx::query_as::<_, BanRecord>(
            "SELECT ban_id, internal_user_id, initiator, reason, banned_at, expires_at, \
             active, unban_reason FROM bans \
             WHERE internal_user_id = $1 AND active ORDER BY ban_id DESC LIMIT 1",
        )
        .bind(internal_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(ban)
    }

    async fn expired_active_bans(&self, now: DateTime<Utc>) -> Result<Vec<BanRecord>, BotError> {
        let bans = sqlx::query_as::<_, BanRecord>(
            "SELECT ban_id, internal_user_id, initiator, reason, banned_at, expires_at, \
             active, unban_reason FROM bans WHERE active AND expires_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(bans)
    }

    async fn deactivate_ban(&self, ban_id: i64, reason: &str) -> Result<bool, BotError> {
        let updated = sqlx::query(
            "UPDATE bans SET active = FALSE, unban_reason = $2 WHERE ban_id = $1 AND active",
        )
        .bind(ban_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }
}

impl LogMessages for Connection {
    async fn log_message(&self, tg_id: i64, text: &str, at: DateTime<Utc>) -> Result<(), BotError> {
        sqlx::query("INSERT INTO message_log (tg_user_id, text, sent_at) VALUES ($1, $2, $3)")
            .bind(tg_id)
            .bind(text)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
