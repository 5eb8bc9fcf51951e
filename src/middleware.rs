//! Interceptor chain applied to every inbound message before any handler
//! runs: audit log, flood control, ban gate. Each stage either passes or
//! short-circuits with a user-facing reply.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use teloxide::prelude::Requester;
use teloxide::types::Message;
use teloxide::Bot;

use crate::database::connection::{Connection, LogMessages, ManageUsers};
use crate::database::models::User;
use crate::error::BotError;

/// Minimum gap between two accepted messages from the same user.
pub(crate) const MIN_MESSAGE_GAP: Duration = Duration::from_secs(2);

/// Advisory flood control against an in-process last-seen map. Not
/// correctness-critical: it never touches the per-user session lock.
pub(crate) struct RateGuard {
    min_gap: Duration,
    last_seen: Mutex<HashMap<i64, Instant>>,
}

impl RateGuard {
    pub(crate) fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Records the event and reports whether it arrived far enough after
    /// the previous accepted one.
    pub(crate) fn admit(&self, tg_id: i64) -> bool {
        let now = Instant::now();
        let mut seen = self.last_seen.lock().expect("rate guard poisoned");
        match seen.get(&tg_id) {
            Some(previous) if now.duration_since(*previous) < self.min_gap => false,
            _ => {
                seen.insert(tg_id, now);
                true
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Gate {
    Pass,
    Reject(String),
}

/// Stage 1: every message creates the user on first contact and lands in
/// the audit log before anything can reject it.
async fn audit_stage<S>(store: &S, tg_id: i64, text: &str, at: DateTime<Utc>) -> Result<User, BotError>
where
    S: ManageUsers + LogMessages,
{
    let user = store.get_or_create_user(tg_id).await?;
    store.log_message(tg_id, text, at).await?;
    Ok(user)
}

/// Stage 2: flood control.
fn rate_stage(guard: &RateGuard, tg_id: i64) -> Gate {
    if guard.admit(tg_id) {
        Gate::Pass
    } else {
        Gate::Reject("You are sending messages too fast. Slow down a little.".into())
    }
}

/// Stage 3: banned users are cut off, except for the help/unban-request
/// path.
fn ban_stage(user: &User, text: &str) -> Gate {
    if user.is_banned && !text.starts_with("/help") {
        Gate::Reject("You are banned. Use /help to request an unban.".into())
    } else {
        Gate::Pass
    }
}

pub(crate) async fn run<S>(
    store: &S,
    guard: &RateGuard,
    tg_id: i64,
    text: &str,
    at: DateTime<Utc>,
) -> Result<Gate, BotError>
where
    S: ManageUsers + LogMessages,
{
    let user = audit_stage(store, tg_id, text, at).await?;
    if let Gate::Reject(reply) = rate_stage(guard, tg_id) {
        return Ok(Gate::Reject(reply));
    }
    Ok(ban_stage(&user, text))
}

/// dptree filter placed in front of the whole message tree. A rejected
/// message is answered here and never reaches a handler.
pub(crate) async fn admit(
    bot: Bot,
    msg: Message,
    store: Arc<Connection>,
    guard: Arc<RateGuard>,
) -> bool {
    let tg_id = msg.chat.id.0;
    let text = msg.text().unwrap_or_default();
    match run(store.as_ref(), guard.as_ref(), tg_id, text, msg.date).await {
        Ok(Gate::Pass) => true,
        Ok(Gate::Reject(reply)) => {
            log::info!("rejected message from {tg_id}");
            if let Err(e) = bot.send_message(msg.chat.id, reply).await {
                log::error!("failed to deliver rejection to {tg_id}: {e}");
            }
            false
        }
        Err(e) => {
            e.log("inbound gate");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryStore;

    #[tokio::test]
    async fn rate_guard_rejects_rapid_fire() {
        let guard = RateGuard::new(Duration::from_millis(50));
        assert!(guard.admit(1));
        assert!(!guard.admit(1));
        // Another user is tracked independently.
        assert!(guard.admit(2));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(guard.admit(1));
    }

    #[tokio::test]
    async fn chain_logs_then_rates_then_gates() {
        let store = MemoryStore::default();
        let guard = RateGuard::new(Duration::from_millis(10));

        let gate = run(&store, &guard, 7, "hello", Utc::now()).await.unwrap();
        assert_eq!(gate, Gate::Pass);
        assert_eq!(store.logged_messages(), 1);

        // Flooding is rejected but still logged.
        let gate = run(&store, &guard, 7, "again", Utc::now()).await.unwrap();
        assert!(matches!(gate, Gate::Reject(_)));
        assert_eq!(store.logged_messages(), 2);
    }

    #[tokio::test]
    async fn banned_users_only_reach_help() {
        let store = MemoryStore::default();
        let guard = RateGuard::new(Duration::from_millis(0));
        let user = store.get_or_create_user(9).await.unwrap();
        store.set_banned(user.internal_id, true).await.unwrap();

        let gate = run(&store, &guard, 9, "Take a survey", Utc::now()).await.unwrap();
        assert!(matches!(gate, Gate::Reject(_)));

        let gate = run(&store, &guard, 9, "/help", Utc::now()).await.unwrap();
        assert_eq!(gate, Gate::Pass);
    }
}
