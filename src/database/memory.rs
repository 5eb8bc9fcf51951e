//! In-memory store used by the engine and moderation tests. Implements the
//! same traits as the Postgres connection, with the same conflict and
//! not-found semantics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::compiler::CompiledQuiz;
use crate::database::connection::{
    LogMessages, ManageBans, ManageUsers, PublishQuiz, RecordAnswers, RetrieveQuiz,
};
use crate::database::models::{
    AnswerRow, BanRecord, NewBan, Question, Quiz, Role, SessionState, User,
};
use crate::error::BotError;

#[derive(Default)]
pub(crate) struct MemoryStore {
    inner: Mutex<Inner>,
    fail_next_commit: AtomicBool,
}

#[derive(Default)]
struct Inner {
    users: Vec<User>,
    quizzes: Vec<Quiz>,
    questions: Vec<(i64, Question)>,
    answers: Vec<AnswerRow>,
    bans: Vec<BanRecord>,
    log: Vec<(i64, String, DateTime<Utc>)>,
}

impl MemoryStore {
    /// Makes the next transactional commit fail, simulating a store outage.
    pub(crate) fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    fn take_failure(&self) -> Result<(), BotError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(BotError::Store(sqlx::Error::PoolClosed));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store poisoned")
    }

    pub(crate) fn logged_messages(&self) -> usize {
        self.lock().log.len()
    }
}

impl ManageUsers for MemoryStore {
    async fn user_by_tg_id(&self, tg_id: i64) -> Result<Option<User>, BotError> {
        Ok(self.lock().users.iter().find(|u| u.tg_user_id == tg_id).cloned())
    }

    async fn user_by_internal_id(&self, internal_id: i64) -> Result<Option<User>, BotError> {
        Ok(self
            .lock()
            .users
            .iter()
            .find(|u| u.internal_id == internal_id)
            .cloned())
    }

    async fn get_or_create_user(&self, tg_id: i64) -> Result<User, BotError> {
        let mut inner = self.lock();
        if let Some(user) = inner.users.iter().find(|u| u.tg_user_id == tg_id) {
            return Ok(user.clone());
        }
        let user = User {
            internal_id: inner.users.len() as i64 + 1,
            tg_user_id: tg_id,
            role: Role::User,
            is_banned: false,
            mailing: false,
            session: None,
        };
        inner.users.push(user.clone());
        Ok(user)
    }

    async fn set_role(&self, internal_id: i64, role: Role) -> Result<(), BotError> {
        self.with_user(internal_id, |u| u.role = role)
    }

    async fn set_banned(&self, internal_id: i64, banned: bool) -> Result<(), BotError> {
        self.with_user(internal_id, |u| u.is_banned = banned)
    }

    async fn set_mailing(&self, internal_id: i64, enabled: bool) -> Result<(), BotError> {
        self.with_user(internal_id, |u| u.mailing = enabled)
    }

    async fn set_session(
        &self,
        internal_id: i64,
        session: Option<SessionState>,
    ) -> Result<(), BotError> {
        self.with_user(internal_id, |u| u.session = session)
    }

    async fn mailing_recipients(&self) -> Result<Vec<i64>, BotError> {
        Ok(self
            .lock()
            .users
            .iter()
            .filter(|u| u.mailing && !u.is_banned)
            .map(|u| u.tg_user_id)
            .collect())
    }
}

impl MemoryStore {
    fn with_user(&self, internal_id: i64, f: impl FnOnce(&mut User)) -> Result<(), BotError> {
        let mut inner = self.lock();
        let user = inner
            .users
            .iter_mut()
            .find(|u| u.internal_id == internal_id)
            .ok_or_else(|| BotError::NotFound(format!("user {internal_id}")))?;
        f(user);
        Ok(())
    }
}

impl RetrieveQuiz for MemoryStore {
    async fn quiz_by_id(&self, quiz_id: i64) -> Result<Option<Quiz>, BotError> {
        Ok(self.lock().quizzes.iter().find(|q| q.quiz_id == quiz_id).cloned())
    }

    async fn quiz_by_name(&self, name: &str) -> Result<Option<Quiz>, BotError> {
        Ok(self.lock().quizzes.iter().find(|q| q.name == name).cloned())
    }

    async fn visible_quizzes(&self) -> Result<Vec<Quiz>, BotError> {
        Ok(self.lock().quizzes.iter().filter(|q| q.visible).cloned().collect())
    }

    async fn questions(&self, quiz_id: i64) -> Result<Vec<Question>, BotError> {
        Ok(self
            .lock()
            .questions
            .iter()
            .filter(|(id, _)| *id == quiz_id)
            .map(|(_, q)| q.clone())
            .collect())
    }
}

impl PublishQuiz for MemoryStore {
    async fn publish_quiz(&self, quiz: &CompiledQuiz, visible: bool) -> Result<i64, BotError> {
        let mut inner = self.lock();
        if inner.quizzes.iter().any(|q| q.name == quiz.name) {
            return Err(BotError::Conflict(format!("quiz '{}' already exists", quiz.name)));
        }
        let quiz_id = inner.quizzes.len() as i64 + 1;
        inner.quizzes.push(Quiz {
            quiz_id,
            name: quiz.name.clone(),
            title: quiz.title.clone(),
            gratitude: quiz.gratitude.clone(),
            visible,
        });
        for question in &quiz.questions {
            inner.questions.push((quiz_id, question.clone()));
        }
        Ok(quiz_id)
    }
}

impl RecordAnswers for MemoryStore {
    async fn recorded_answers(
        &self,
        internal_user_id: i64,
        quiz_id: i64,
    ) -> Result<Vec<AnswerRow>, BotError> {
        let mut rows: Vec<AnswerRow> = self
            .lock()
            .answers
            .iter()
            .filter(|a| a.internal_user_id == internal_user_id && a.quiz_id == quiz_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.ordinal);
        Ok(rows)
    }

    async fn answered_quiz_ids(&self, internal_user_id: i64) -> Result<Vec<i64>, BotError> {
        let mut ids: Vec<i64> = self
            .lock()
            .answers
            .iter()
            .filter(|a| a.internal_user_id == internal_user_id)
            .map(|a| a.quiz_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn commit_progress(
        &self,
        internal_user_id: i64,
        quiz_id: i64,
        rows: &[(i32, String)],
        session: Option<SessionState>,
    ) -> Result<(), BotError> {
        self.take_failure()?;
        let mut inner = self.lock();
        for (ordinal, _) in rows {
            let duplicate = inner.answers.iter().any(|a| {
                a.internal_user_id == internal_user_id
                    && a.quiz_id == quiz_id
                    && a.ordinal == *ordinal
            });
            if duplicate {
                return Err(BotError::Conflict(format!(
                    "answer to question {ordinal} already exists"
                )));
            }
        }
        for (ordinal, answer) in rows {
            inner.answers.push(AnswerRow {
                internal_user_id,
                quiz_id,
                ordinal: *ordinal,
                answer: answer.clone(),
            });
        }
        if let Some(user) = inner.users.iter_mut().find(|u| u.internal_id == internal_user_id) {
            user.session = session;
        }
        Ok(())
    }

    async fn commit_rewrite(
        &self,
        internal_user_id: i64,
        quiz_id: i64,
        ordinal: i32,
        answer: &str,
    ) -> Result<(), BotError> {
        self.take_failure()?;
        let mut inner = self.lock();
        let row = inner
            .answers
            .iter_mut()
            .find(|a| {
                a.internal_user_id == internal_user_id
                    && a.quiz_id == quiz_id
                    && a.ordinal == ordinal
            })
            .ok_or_else(|| {
                BotError::NotFound(format!("answer to question {ordinal} of quiz {quiz_id}"))
            })?;
        row.answer = answer.to_owned();
        if let Some(user) = inner.users.iter_mut().find(|u| u.internal_id == internal_user_id) {
            user.session = None;
        }
        Ok(())
    }

    async fn answers_for_quiz(&self, quiz_id: i64) -> Result<Vec<AnswerRow>, BotError> {
        let mut rows: Vec<AnswerRow> = self
            .lock()
            .answers
            .iter()
            .filter(|a| a.quiz_id == quiz_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| (a.internal_user_id, a.ordinal));
        Ok(rows)
    }
}

impl ManageBans for MemoryStore {
    async fn insert_ban(&self, ban: &NewBan) -> Result<i64, BotError> {
        let mut inner = self.lock();
        let ban_id = inner.bans.len() as i64 + 1;
        inner.bans.push(BanRecord {
            ban_id,
            internal_user_id: ban.internal_user_id,
            initiator: ban.initiator.clone(),
            reason: ban.reason.clone(),
            banned_at: ban.banned_at,
            expires_at: ban.expires_at,
            active: true,
            unban_reason: None,
        });
        Ok(ban_id)
    }

    async fn active_ban(&self, internal_user_id: i64) -> Result<Option<BanRecord>, BotError> {
        Ok(self
            .lock()
            .bans
            .iter()
            .rev()
            .find(|b| b.internal_user_id == internal_user_id && b.active)
            .cloned())
    }

    async fn expired_active_bans(&self, now: DateTime<Utc>) -> Result<Vec<BanRecord>, BotError> {
        Ok(self
            .lock()
            .bans
            .iter()
            .filter(|b| b.active && b.expires_at <= now)
            .cloned()
            .collect())
    }

    async fn deactivate_ban(&self, ban_id: i64, reason: &str) -> Result<bool, BotError> {
        let mut inner = self.lock();
        match inner.bans.iter_mut().find(|b| b.ban_id == ban_id && b.active) {
            Some(ban) => {
                ban.active = false;
                ban.unban_reason = Some(reason.to_owned());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl LogMessages for MemoryStore {
    async fn log_message(&self, tg_id: i64, text: &str, at: DateTime<Utc>) -> Result<(), BotError> {
        self.lock().log.push((tg_id, text.to_owned(), at));
        Ok(())
    }
}
