//! Per-user quiz progress: question sequencing, conditional skipping,
//! answer persistence and completion detection.
//!
//! Every mutating operation runs under that user's lock, so two concurrent
//! events from the same chat cannot both read the same ordinal and advance
//! it twice. The store writes for one transition go through a single
//! transactional call; a failure leaves the session exactly where it was.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::database::connection::{ManageUsers, RecordAnswers, RetrieveQuiz};
use crate::database::models::{
    AnswerSpec, Question, Quiz, SessionState, User, SKIP_PLACEHOLDER,
};
use crate::error::BotError;

/// Keyed mutual exclusion by telegram user id. Shared between the engine
/// and the ban sweep so both serialize writes to the same subject.
#[derive(Clone, Default)]
pub(crate) struct UserLocks {
    inner: Arc<Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>>,
}

impl UserLocks {
    pub(crate) async fn acquire(&self, tg_id: i64) -> OwnedMutexGuard<()> {
        let cell = {
            let mut map = self.inner.lock().expect("user lock map poisoned");
            map.entry(tg_id).or_default().clone()
        };
        cell.lock_owned().await
    }
}

/// The next question to pose to a user.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Prompt {
    pub ordinal: i32,
    pub text: String,
    pub answers: AnswerSpec,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Progress {
    Ask(Prompt),
    Finished { gratitude: String },
    Rewritten,
}

pub(crate) struct SessionEngine<S> {
    store: Arc<S>,
    locks: UserLocks,
}

impl<S> SessionEngine<S>
where
    S: ManageUsers + RetrieveQuiz + RecordAnswers,
{
    pub(crate) fn new(store: Arc<S>, locks: UserLocks) -> Self {
        Self { store, locks }
    }

    pub(crate) async fn start_quiz(&self, tg_id: i64, quiz_id: i64) -> Result<Progress, BotError> {
        let _guard = self.locks.acquire(tg_id).await;
        let user = self.known_user(tg_id).await?;

        if user.session.is_some() {
            return Err(BotError::Conflict(
                "You already have a survey in progress. Finish it or /cancel first.".into(),
            ));
        }

        let quiz = self.known_quiz(quiz_id).await?;
        let questions = self.store.questions(quiz_id).await?;
        if questions.is_empty() {
            return Err(BotError::Validation(format!(
                "survey '{}' has no questions",
                quiz.name
            )));
        }
        if !self.store.recorded_answers(user.internal_id, quiz_id).await?.is_empty() {
            return Err(BotError::Conflict(
                "You have already taken this survey.".into(),
            ));
        }

        log::info!("user {tg_id} starts survey '{}'", quiz.name);
        let recorded = HashMap::new();
        let walk = walk_to_poseable(&questions, &recorded, 1);
        self.commit_walk(&user, &quiz, &questions, Vec::new(), walk).await
    }

    pub(crate) async fn submit_answer(&self, tg_id: i64, text: &str) -> Result<Progress, BotError> {
        let _guard = self.locks.acquire(tg_id).await;
        let user = self.known_user(tg_id).await?;

        let session = user.session.ok_or_else(|| {
            BotError::Conflict("There is no survey in progress. Pick one from the menu.".into())
        })?;
        let quiz = self.known_quiz(session.quiz_id).await?;
        let questions = self.store.questions(session.quiz_id).await?;

        if session.rewrite {
            self.store
                .commit_rewrite(user.internal_id, session.quiz_id, session.ordinal, text)
                .await?;
            log::info!(
                "user {tg_id} rewrote answer {} of survey '{}'",
                session.ordinal,
                quiz.name
            );
            return Ok(Progress::Rewritten);
        }

        let mut recorded: HashMap<i32, String> = self
            .store
            .recorded_answers(user.internal_id, session.quiz_id)
            .await?
            .into_iter()
            .map(|row| (row.ordinal, row.answer))
            .collect();
        recorded.insert(session.ordinal, text.to_owned());

        let rows = vec![(session.ordinal, text.to_owned())];
        let walk = walk_to_poseable(&questions, &recorded, session.ordinal + 1);
        self.commit_walk(&user, &quiz, &questions, rows, walk).await
    }

    pub(crate) async fn begin_rewrite(
        &self,
        tg_id: i64,
        quiz_id: i64,
        ordinal: i32,
    ) -> Result<Prompt, BotError> {
        let _guard = self.locks.acquire(tg_id).await;
        let user = self.known_user(tg_id).await?;

        if user.session.is_some() {
            return Err(BotError::Conflict(
                "Finish the survey in progress before rewriting answers.".into(),
            ));
        }

        let quiz = self.known_quiz(quiz_id).await?;
        let questions = self.store.questions(quiz_id).await?;
        let question = questions
            .iter()
            .find(|q| q.ordinal == ordinal)
            .ok_or_else(|| BotError::NotFound(format!("question {ordinal}")))?
            .clone();

        let rows = self.store.recorded_answers(user.internal_id, quiz_id).await?;
        if rows.len() != questions.len() {
            return Err(BotError::Conflict(
                "You can only rewrite answers of a survey you completed.".into(),
            ));
        }

        self.store
            .set_session(
                user.internal_id,
                Some(SessionState {
                    quiz_id,
                    ordinal,
                    rewrite: true,
                }),
            )
            .await?;
        log::info!(
            "user {tg_id} rewrites answer {ordinal} of survey '{}'",
            quiz.name
        );
        Ok(prompt_for(&question))
    }

    /// Drops an in-flight session, if any. Recorded answers stay.
    pub(crate) async fn abandon(&self, tg_id: i64) -> Result<bool, BotError> {
        let _guard = self.locks.acquire(tg_id).await;
        let user = self.known_user(tg_id).await?;
        match user.session {
            Some(_) => {
                self.store.set_session(user.internal_id, None).await?;
                log::info!("user {tg_id} abandoned their survey");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Visible quizzes the user has not started yet.
    pub(crate) async fn available_quizzes(&self, tg_id: i64) -> Result<Vec<Quiz>, BotError> {
        let user = self.known_user(tg_id).await?;
        let answered = self.store.answered_quiz_ids(user.internal_id).await?;
        let quizzes = self.store.visible_quizzes().await?;
        Ok(quizzes
            .into_iter()
            .filter(|q| !answered.contains(&q.quiz_id))
            .collect())
    }

    /// Quizzes the user has completed, hidden ones included.
    pub(crate) async fn completed_quizzes(&self, tg_id: i64) -> Result<Vec<Quiz>, BotError> {
        let user = self.known_user(tg_id).await?;
        let mut completed = Vec::new();
        for quiz_id in self.store.answered_quiz_ids(user.internal_id).await? {
            let Some(quiz) = self.store.quiz_by_id(quiz_id).await? else {
                continue;
            };
            let questions = self.store.questions(quiz_id).await?;
            let rows = self.store.recorded_answers(user.internal_id, quiz_id).await?;
            if !questions.is_empty() && rows.len() == questions.len() {
                completed.push(quiz);
            }
        }
        Ok(completed)
    }

    /// Questions of a completed quiz, relations included, for the rewrite
    /// menu.
    pub(crate) async fn completed_quiz_summary(
        &self,
        tg_id: i64,
        quiz_id: i64,
    ) -> Result<Vec<Question>, BotError> {
        let user = self.known_user(tg_id).await?;
        self.known_quiz(quiz_id).await?;
        let questions = self.store.questions(quiz_id).await?;
        let rows = self.store.recorded_answers(user.internal_id, quiz_id).await?;
        if questions.is_empty() || rows.len() != questions.len() {
            return Err(BotError::Conflict(
                "You can only rewrite answers of a survey you completed.".into(),
            ));
        }
        Ok(questions)
    }

    async fn known_user(&self, tg_id: i64) -> Result<User, BotError> {
        self.store
            .user_by_tg_id(tg_id)
            .await?
            .ok_or_else(|| BotError::NotFound(format!("user {tg_id}")))
    }

    async fn known_quiz(&self, quiz_id: i64) -> Result<Quiz, BotError> {
        self.store
            .quiz_by_id(quiz_id)
            .await?
            .ok_or_else(|| BotError::NotFound(format!("survey {quiz_id}")))
    }

    /// Commits the pending answer rows plus the placeholders produced by the
    /// walk, then either advances the session or closes it out.
    async fn commit_walk(
        &self,
        user: &User,
        quiz: &Quiz,
        questions: &[Question],
        mut rows: Vec<(i32, String)>,
        walk: Walk,
    ) -> Result<Progress, BotError> {
        rows.extend(
            walk.skipped
                .iter()
                .map(|ordinal| (*ordinal, SKIP_PLACEHOLDER.to_owned())),
        );

        match walk.next {
            Some(ordinal) => {
                let session = SessionState {
                    quiz_id: quiz.quiz_id,
                    ordinal,
                    rewrite: false,
                };
                self.store
                    .commit_progress(user.internal_id, quiz.quiz_id, &rows, Some(session))
                    .await?;
                let question = questions
                    .iter()
                    .find(|q| q.ordinal == ordinal)
                    .ok_or_else(|| BotError::NotFound(format!("question {ordinal}")))?;
                Ok(Progress::Ask(prompt_for(question)))
            }
            None => {
                self.store
                    .commit_progress(user.internal_id, quiz.quiz_id, &rows, None)
                    .await?;
                log::info!("user {} completed survey '{}'", user.tg_user_id, quiz.name);
                Ok(Progress::Finished {
                    gratitude: quiz.gratitude.clone(),
                })
            }
        }
    }
}

struct Walk {
    /// Ordinals skipped over because their relation was unmet.
    skipped: Vec<i32>,
    /// First poseable ordinal, or None when the quiz is exhausted.
    next: Option<i32>,
}

/// Walks forward from `from`, collecting skip placeholders, until a question
/// with a satisfied (or absent) relation is found. Bounded by quiz length,
/// so a pathological relation chain cannot recurse or loop.
fn walk_to_poseable(questions: &[Question], recorded: &HashMap<i32, String>, from: i32) -> Walk {
    let mut skipped = Vec::new();
    let last = questions.len() as i32;
    let mut current = from;

    while current <= last {
        let Some(question) = questions.iter().find(|q| q.ordinal == current) else {
            break;
        };
        match &question.relation {
            Some(relation)
                if recorded.get(&relation.prerequisite).map(String::as_str)
                    != Some(relation.required_answer.as_str()) =>
            {
                // A skipped prerequisite stores the placeholder, which can
                // never equal a literal required answer, so chains off a
                // skipped question cascade here as well.
                skipped.push(current);
                current += 1;
            }
            _ => {
                return Walk {
                    skipped,
                    next: Some(current),
                }
            }
        }
    }

    Walk {
        skipped,
        next: None,
    }
}

fn prompt_for(question: &Question) -> Prompt {
    Prompt {
        ordinal: question.ordinal,
        text: question.text.clone(),
        answers: question.answers.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;
    use crate::database::connection::PublishQuiz;
    use crate::database::memory::MemoryStore;

    const TG_ID: i64 = 100;

    async fn publish(store: &MemoryStore, raw: &str, visible: bool) -> i64 {
        let compiled = compiler::compile(raw).expect("test quiz must compile");
        store.publish_quiz(&compiled, visible).await.unwrap()
    }

    async fn engine_with(raw: &str) -> (Arc<MemoryStore>, SessionEngine<MemoryStore>, i64) {
        let store = Arc::new(MemoryStore::default());
        let quiz_id = publish(&store, raw, true).await;
        let engine = SessionEngine::new(Arc::clone(&store), UserLocks::default());
        store.get_or_create_user(TG_ID).await.unwrap();
        (store, engine, quiz_id)
    }

    fn demo_raw() -> &'static str {
        "demo\nDemo survey\n1. Color?//\\\\Red/\\Blue/\\Green\n2. Confirm?//\\\\Yes/\\No\nThanks"
    }

    fn branching_raw() -> &'static str {
        "branching\nBranching survey\n1. Pick?//\\\\A/\\B\n[{1 -> A}]2. Why A?//\\\\MANUAL_INPUT\n3. Done?//\\\\Yes/\\No\nThanks"
    }

    #[tokio::test]
    async fn full_run_records_every_ordinal() {
        let (store, engine, quiz_id) = engine_with(demo_raw()).await;

        let first = engine.start_quiz(TG_ID, quiz_id).await.unwrap();
        match first {
            Progress::Ask(prompt) => {
                assert_eq!(prompt.ordinal, 1);
                assert_eq!(prompt.text, "Color?");
            }
            other => panic!("expected first question, got {other:?}"),
        }

        match engine.submit_answer(TG_ID, "Blue").await.unwrap() {
            Progress::Ask(prompt) => assert_eq!(prompt.ordinal, 2),
            other => panic!("expected second question, got {other:?}"),
        }

        match engine.submit_answer(TG_ID, "Yes").await.unwrap() {
            Progress::Finished { gratitude } => assert_eq!(gratitude, "Thanks"),
            other => panic!("expected completion, got {other:?}"),
        }

        let user = store.user_by_tg_id(TG_ID).await.unwrap().unwrap();
        assert_eq!(user.session, None);

        let rows = store.recorded_answers(user.internal_id, quiz_id).await.unwrap();
        let recorded: Vec<(i32, &str)> = rows.iter().map(|r| (r.ordinal, r.answer.as_str())).collect();
        assert_eq!(recorded, vec![(1, "Blue"), (2, "Yes")]);

        // The raw dump an exporter would consume sees the same rows.
        let dump = store.answers_for_quiz(quiz_id).await.unwrap();
        assert_eq!(dump.len(), 2);
        assert!(dump.iter().all(|r| r.internal_user_id == user.internal_id));
    }

    #[tokio::test]
    async fn unmet_relation_skips_with_placeholder() {
        let (store, engine, quiz_id) = engine_with(branching_raw()).await;

        engine.start_quiz(TG_ID, quiz_id).await.unwrap();
        match engine.submit_answer(TG_ID, "B").await.unwrap() {
            Progress::Ask(prompt) => assert_eq!(prompt.ordinal, 3),
            other => panic!("expected question 3, got {other:?}"),
        }

        let user = store.user_by_tg_id(TG_ID).await.unwrap().unwrap();
        let rows = store.recorded_answers(user.internal_id, quiz_id).await.unwrap();
        assert_eq!(rows[1].ordinal, 2);
        assert_eq!(rows[1].answer, SKIP_PLACEHOLDER);

        engine.submit_answer(TG_ID, "Yes").await.unwrap();
        let rows = store.recorded_answers(user.internal_id, quiz_id).await.unwrap();
        let ordinals: Vec<i32> = rows.iter().map(|r| r.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn met_relation_poses_the_question() {
        let (_, engine, quiz_id) = engine_with(branching_raw()).await;

        engine.start_quiz(TG_ID, quiz_id).await.unwrap();
        match engine.submit_answer(TG_ID, "A").await.unwrap() {
            Progress::Ask(prompt) => {
                assert_eq!(prompt.ordinal, 2);
                assert_eq!(prompt.answers, AnswerSpec::FreeText);
            }
            other => panic!("expected question 2, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relation_chains_cascade_off_skipped_questions() {
        let raw = "cascade\nCascade survey\n\
                   1. Pick?//\\\\A/\\B\n\
                   [{1 -> A}]2. Detail?//\\\\MANUAL_INPUT\n\
                   [{2 -> X}]3. More?//\\\\MANUAL_INPUT\n\
                   4. Done?//\\\\Yes/\\No\nThanks";
        let (store, engine, quiz_id) = engine_with(raw).await;

        engine.start_quiz(TG_ID, quiz_id).await.unwrap();
        match engine.submit_answer(TG_ID, "B").await.unwrap() {
            Progress::Ask(prompt) => assert_eq!(prompt.ordinal, 4),
            other => panic!("expected question 4, got {other:?}"),
        }

        let user = store.user_by_tg_id(TG_ID).await.unwrap().unwrap();
        let rows = store.recorded_answers(user.internal_id, quiz_id).await.unwrap();
        assert_eq!(rows[1].answer, SKIP_PLACEHOLDER);
        assert_eq!(rows[2].answer, SKIP_PLACEHOLDER);
    }

    #[tokio::test]
    async fn trailing_skip_completes_the_quiz() {
        let raw = "tail\nTail survey\n1. Pick?//\\\\A/\\B\n[{1 -> A}]2. Why?//\\\\MANUAL_INPUT\nThanks";
        let (store, engine, quiz_id) = engine_with(raw).await;

        engine.start_quiz(TG_ID, quiz_id).await.unwrap();
        match engine.submit_answer(TG_ID, "B").await.unwrap() {
            Progress::Finished { gratitude } => assert_eq!(gratitude, "Thanks"),
            other => panic!("expected completion, got {other:?}"),
        }

        let user = store.user_by_tg_id(TG_ID).await.unwrap().unwrap();
        assert_eq!(user.session, None);
        let rows = store.recorded_answers(user.internal_id, quiz_id).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn second_start_conflicts_while_active() {
        let (store, engine, quiz_id) = engine_with(demo_raw()).await;
        let other = publish(&store, "other\nOther survey\n1. Ok?//\\\\Yes/\\No\nBye", true).await;

        engine.start_quiz(TG_ID, quiz_id).await.unwrap();
        assert!(matches!(
            engine.start_quiz(TG_ID, other).await,
            Err(BotError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn completed_quiz_cannot_be_retaken() {
        let (_, engine, quiz_id) = engine_with(demo_raw()).await;

        engine.start_quiz(TG_ID, quiz_id).await.unwrap();
        engine.submit_answer(TG_ID, "Blue").await.unwrap();
        engine.submit_answer(TG_ID, "Yes").await.unwrap();

        assert!(matches!(
            engine.start_quiz(TG_ID, quiz_id).await,
            Err(BotError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn discovery_hides_hidden_and_taken_quizzes() {
        let (store, engine, quiz_id) = engine_with(demo_raw()).await;
        publish(&store, "hidden\nHidden survey\n1. Ok?//\\\\Yes/\\No\nBye", false).await;

        let available = engine.available_quizzes(TG_ID).await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].quiz_id, quiz_id);

        engine.start_quiz(TG_ID, quiz_id).await.unwrap();
        engine.submit_answer(TG_ID, "Blue").await.unwrap();
        assert!(engine.available_quizzes(TG_ID).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rewrite_updates_exactly_one_row() {
        let (store, engine, quiz_id) = engine_with(demo_raw()).await;

        engine.start_quiz(TG_ID, quiz_id).await.unwrap();
        engine.submit_answer(TG_ID, "Blue").await.unwrap();
        engine.submit_answer(TG_ID, "Yes").await.unwrap();

        let prompt = engine.begin_rewrite(TG_ID, quiz_id, 1).await.unwrap();
        assert_eq!(prompt.ordinal, 1);

        assert_eq!(
            engine.submit_answer(TG_ID, "Green").await.unwrap(),
            Progress::Rewritten
        );

        let user = store.user_by_tg_id(TG_ID).await.unwrap().unwrap();
        assert_eq!(user.session, None);
        let rows = store.recorded_answers(user.internal_id, quiz_id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].answer, "Green");
        assert_eq!(rows[1].answer, "Yes");
    }

    #[tokio::test]
    async fn rewrite_requires_a_completed_quiz() {
        let (_, engine, quiz_id) = engine_with(demo_raw()).await;

        assert!(matches!(
            engine.begin_rewrite(TG_ID, quiz_id, 1).await,
            Err(BotError::Conflict(_))
        ));

        engine.start_quiz(TG_ID, quiz_id).await.unwrap();
        assert!(matches!(
            engine.begin_rewrite(TG_ID, quiz_id, 1).await,
            Err(BotError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn store_failure_leaves_session_unchanged() {
        let (store, engine, quiz_id) = engine_with(demo_raw()).await;

        engine.start_quiz(TG_ID, quiz_id).await.unwrap();
        store.fail_next_commit();

        assert!(matches!(
            engine.submit_answer(TG_ID, "Blue").await,
            Err(BotError::Store(_))
        ));

        let user = store.user_by_tg_id(TG_ID).await.unwrap().unwrap();
        let session = user.session.expect("session must survive the failure");
        assert_eq!(session.ordinal, 1);
        assert!(store
            .recorded_answers(user.internal_id, quiz_id)
            .await
            .unwrap()
            .is_empty());

        // Retry goes through.
        match engine.submit_answer(TG_ID, "Blue").await.unwrap() {
            Progress::Ask(prompt) => assert_eq!(prompt.ordinal, 2),
            other => panic!("expected question 2, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_submits_advance_exactly_once() {
        let raw = "solo\nSolo survey\n1. Ok?//\\\\Yes/\\No\nThanks";
        let (store, engine, quiz_id) = engine_with(raw).await;
        let engine = Arc::new(engine);

        engine.start_quiz(TG_ID, quiz_id).await.unwrap();

        let a = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.submit_answer(TG_ID, "Yes").await }
        });
        let b = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.submit_answer(TG_ID, "No").await }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let finished = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Ok(Progress::Finished { .. })))
            .count();
        let stale = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(BotError::Conflict(_))))
            .count();
        assert_eq!((finished, stale), (1, 1));

        let user = store.user_by_tg_id(TG_ID).await.unwrap().unwrap();
        assert_eq!(
            store.recorded_answers(user.internal_id, quiz_id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn summary_lists_questions_with_relations() {
        let (_, engine, quiz_id) = engine_with(branching_raw()).await;

        engine.start_quiz(TG_ID, quiz_id).await.unwrap();
        engine.submit_answer(TG_ID, "B").await.unwrap();
        engine.submit_answer(TG_ID, "Yes").await.unwrap();

        let summary = engine.completed_quiz_summary(TG_ID, quiz_id).await.unwrap();
        assert_eq!(summary.len(), 3);
        let relation = summary[1].relation.as_ref().expect("question 2 has a relation");
        assert_eq!(relation.prerequisite, 1);
        assert_eq!(relation.required_answer, "A");

        let completed = engine.completed_quizzes(TG_ID).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].quiz_id, quiz_id);
    }

    #[tokio::test]
    async fn abandon_clears_only_an_active_session() {
        let (store, engine, quiz_id) = engine_with(demo_raw()).await;

        assert!(!engine.abandon(TG_ID).await.unwrap());
        engine.start_quiz(TG_ID, quiz_id).await.unwrap();
        assert!(engine.abandon(TG_ID).await.unwrap());

        let user = store.user_by_tg_id(TG_ID).await.unwrap().unwrap();
        assert_eq!(user.session, None);
    }
}
