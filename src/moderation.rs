//! Role and ban gating: who may trigger which operation, ban lifecycle, and
//! the expiry sweep.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use once_cell::sync::Lazy;

use crate::database::connection::{ManageBans, ManageUsers};
use crate::database::models::{NewBan, Role, User};
use crate::error::BotError;
use crate::session::UserLocks;

/// How often the expiry sweep rescans active bans.
pub(crate) const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(30);

/// Reason recorded for a human-initiated unban without one.
const MERCY_REASON: &str = "mercy";

/// Reason recorded when the sweep lifts an expired ban.
const EXPIRED_REASON: &str = "expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Capability {
    TakeQuiz,
    RewriteAnswer,
    ToggleMailing,
    ViewStatus,
    RequestHelp,
    UploadQuiz,
    Broadcast,
    BanUsers,
    ManageRoles,
}

static USER_CAPABILITIES: Lazy<HashSet<Capability>> = Lazy::new(|| {
    HashSet::from([
        Capability::TakeQuiz,
        Capability::RewriteAnswer,
        Capability::ToggleMailing,
        Capability::ViewStatus,
        Capability::RequestHelp,
    ])
});

static EDITOR_CAPABILITIES: Lazy<HashSet<Capability>> = Lazy::new(|| {
    let mut capabilities = USER_CAPABILITIES.clone();
    capabilities.insert(Capability::UploadQuiz);
    capabilities
});

static ADMIN_CAPABILITIES: Lazy<HashSet<Capability>> = Lazy::new(|| {
    let mut capabilities = EDITOR_CAPABILITIES.clone();
    capabilities.insert(Capability::Broadcast);
    capabilities.insert(Capability::BanUsers);
    capabilities.insert(Capability::ManageRoles);
    capabilities
});

impl Role {
    pub(crate) fn capabilities(&self) -> &'static HashSet<Capability> {
        match self {
            Role::User => &USER_CAPABILITIES,
            Role::Editor => &EDITOR_CAPABILITIES,
            Role::Admin | Role::SuperAdmin => &ADMIN_CAPABILITIES,
        }
    }
}

/// Banned users keep only the help/unban-request path; everyone else is
/// gated by their role's capability set.
pub(crate) fn authorize(user: &User, capability: Capability) -> Result<(), BotError> {
    if user.is_banned && capability != Capability::RequestHelp {
        return Err(BotError::Permission(
            "You are banned. Use /help to request an unban.".into(),
        ));
    }
    if user.role.capabilities().contains(&capability) {
        Ok(())
    } else {
        Err(BotError::Permission("You are not allowed to do that.".into()))
    }
}

/// Compact duration grammar: integer plus one of `s m h d`.
pub(crate) fn parse_ban_duration(input: &str) -> Result<Duration, BotError> {
    let input = input.trim();
    if input.len() < 2 || !input.is_ascii() {
        return Err(BotError::Validation(format!(
            "bad duration '{input}', expected forms like 30s, 5m, 2h, 7d"
        )));
    }
    let (value, unit) = input.split_at(input.len() - 1);
    let value: i64 = value
        .parse()
        .map_err(|_| BotError::Validation(format!("bad duration value '{value}'")))?;
    if value <= 0 {
        return Err(BotError::Validation("duration must be positive".into()));
    }
    match unit {
        "s" => Ok(Duration::seconds(value)),
        "m" => Ok(Duration::minutes(value)),
        "h" => Ok(Duration::hours(value)),
        "d" => Ok(Duration::days(value)),
        other => Err(BotError::Validation(format!(
            "bad duration unit '{other}', expected one of s, m, h, d"
        ))),
    }
}

pub(crate) async fn ban<S>(
    store: &S,
    locks: &UserLocks,
    initiator: &User,
    subject_tg_id: i64,
    reason: &str,
    duration: Duration,
) -> Result<(), BotError>
where
    S: ManageUsers + ManageBans,
{
    authorize(initiator, Capability::BanUsers)?;

    let _guard = locks.acquire(subject_tg_id).await;
    let subject = store
        .user_by_tg_id(subject_tg_id)
        .await?
        .ok_or_else(|| BotError::NotFound(format!("user {subject_tg_id}")))?;
    if subject.role == Role::SuperAdmin {
        return Err(BotError::Permission("The super admin cannot be banned.".into()));
    }

    let now = Utc::now();
    store
        .insert_ban(&NewBan {
            internal_user_id: subject.internal_id,
            initiator: initiator.internal_id.to_string(),
            reason: reason.to_owned(),
            banned_at: now,
            expires_at: now + duration,
        })
        .await?;
    store.set_role(subject.internal_id, Role::User).await?;
    store.set_banned(subject.internal_id, true).await?;
    log::info!(
        "user {} banned {subject_tg_id} until {}: {reason}",
        initiator.tg_user_id,
        now + duration
    );
    Ok(())
}

/// Idempotent: unbanning an unbanned user reports false and changes
/// nothing. Returns true when a ban was actually lifted.
pub(crate) async fn unban<S>(
    store: &S,
    locks: &UserLocks,
    initiator: &User,
    subject_tg_id: i64,
    reason: Option<&str>,
) -> Result<bool, BotError>
where
    S: ManageUsers + ManageBans,
{
    authorize(initiator, Capability::BanUsers)?;

    let _guard = locks.acquire(subject_tg_id).await;
    let subject = store
        .user_by_tg_id(subject_tg_id)
        .await?
        .ok_or_else(|| BotError::NotFound(format!("user {subject_tg_id}")))?;
    let lifted = release_ban(store, &subject, reason.unwrap_or(MERCY_REASON)).await?;
    if lifted {
        log::info!("user {} unbanned {subject_tg_id}", initiator.tg_user_id);
    }
    Ok(lifted)
}

async fn release_ban<S>(store: &S, subject: &User, reason: &str) -> Result<bool, BotError>
where
    S: ManageUsers + ManageBans,
{
    let mut lifted = false;
    if let Some(ban) = store.active_ban(subject.internal_id).await? {
        lifted = store.deactivate_ban(ban.ban_id, reason).await?;
    }
    if subject.is_banned {
        store.set_banned(subject.internal_id, false).await?;
        lifted = true;
    }
    Ok(lifted)
}

/// One sweep pass: lifts every active ban whose end has passed. The
/// per-subject lock plus the idempotent deactivation make a concurrent
/// human unban a harmless no-op.
pub(crate) async fn sweep_once<S>(store: &S, locks: &UserLocks) -> Result<usize, BotError>
where
    S: ManageUsers + ManageBans,
{
    let now = Utc::now();
    let mut lifted = 0;
    for ban in store.expired_active_bans(now).await? {
        let Some(subject) = store.user_by_internal_id(ban.internal_user_id).await? else {
            continue;
        };
        let _guard = locks.acquire(subject.tg_user_id).await;
        if store.deactivate_ban(ban.ban_id, EXPIRED_REASON).await? {
            store.set_banned(subject.internal_id, false).await?;
            lifted += 1;
        }
    }
    Ok(lifted)
}

/// Background reconciliation loop. Transient store errors are logged and
/// retried on the next tick; the loop never exits.
pub(crate) async fn ban_sweep<S>(store: Arc<S>, locks: UserLocks)
where
    S: ManageUsers + ManageBans,
{
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        match sweep_once(store.as_ref(), &locks).await {
            Ok(0) => {}
            Ok(lifted) => log::info!("ban sweep lifted {lifted} expired bans"),
            Err(e) => e.log("ban sweep"),
        }
    }
}

pub(crate) async fn set_user_role<S>(
    store: &S,
    locks: &UserLocks,
    initiator: &User,
    subject_tg_id: i64,
    role: Role,
) -> Result<(), BotError>
where
    S: ManageUsers,
{
    authorize(initiator, Capability::ManageRoles)?;
    if role == Role::SuperAdmin {
        return Err(BotError::Permission("There is only one super admin.".into()));
    }

    let _guard = locks.acquire(subject_tg_id).await;
    let subject = store
        .user_by_tg_id(subject_tg_id)
        .await?
        .ok_or_else(|| BotError::NotFound(format!("user {subject_tg_id}")))?;
    if subject.role == Role::SuperAdmin {
        return Err(BotError::Permission(
            "The super admin role cannot be changed.".into(),
        ));
    }
    store.set_role(subject.internal_id, role).await?;
    log::info!(
        "user {} set role of {subject_tg_id} to {role}",
        initiator.tg_user_id
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryStore;

    async fn user_with_role(store: &MemoryStore, tg_id: i64, role: Role) -> User {
        let user = store.get_or_create_user(tg_id).await.unwrap();
        store.set_role(user.internal_id, role).await.unwrap();
        store.user_by_tg_id(tg_id).await.unwrap().unwrap()
    }

    #[test]
    fn duration_grammar() {
        assert_eq!(parse_ban_duration("30s").unwrap(), Duration::seconds(30));
        assert_eq!(parse_ban_duration("5m").unwrap(), Duration::minutes(5));
        assert_eq!(parse_ban_duration("2h").unwrap(), Duration::hours(2));
        assert_eq!(parse_ban_duration("7d").unwrap(), Duration::days(7));

        for bad in ["3x", "m", "", "-5m", "d7", "5 m"] {
            assert!(
                matches!(parse_ban_duration(bad), Err(BotError::Validation(_))),
                "'{bad}' must be rejected"
            );
        }
    }

    #[test]
    fn capabilities_follow_roles() {
        let store_less_user = User {
            internal_id: 1,
            tg_user_id: 1,
            role: Role::User,
            is_banned: false,
            mailing: false,
            session: None,
        };
        assert!(authorize(&store_less_user, Capability::TakeQuiz).is_ok());
        assert!(matches!(
            authorize(&store_less_user, Capability::UploadQuiz),
            Err(BotError::Permission(_))
        ));

        let editor = User {
            role: Role::Editor,
            ..store_less_user.clone()
        };
        assert!(authorize(&editor, Capability::UploadQuiz).is_ok());
        assert!(authorize(&editor, Capability::Broadcast).is_err());

        let admin = User {
            role: Role::Admin,
            ..store_less_user.clone()
        };
        assert!(authorize(&admin, Capability::Broadcast).is_ok());
        assert!(authorize(&admin, Capability::BanUsers).is_ok());
    }

    #[test]
    fn banned_users_keep_only_the_help_path() {
        let banned = User {
            internal_id: 1,
            tg_user_id: 1,
            role: Role::Admin,
            is_banned: true,
            mailing: false,
            session: None,
        };
        assert!(authorize(&banned, Capability::RequestHelp).is_ok());
        for denied in [Capability::TakeQuiz, Capability::Broadcast, Capability::BanUsers] {
            assert!(matches!(
                authorize(&banned, denied),
                Err(BotError::Permission(_))
            ));
        }
    }

    #[tokio::test]
    async fn ban_demotes_and_flags_the_subject() {
        let store = MemoryStore::default();
        let locks = UserLocks::default();
        let admin = user_with_role(&store, 1, Role::Admin).await;
        user_with_role(&store, 2, Role::Editor).await;

        ban(&store, &locks, &admin, 2, "spam", Duration::minutes(5))
            .await
            .unwrap();

        let subject = store.user_by_tg_id(2).await.unwrap().unwrap();
        assert!(subject.is_banned);
        assert_eq!(subject.role, Role::User);
        let record = store.active_ban(subject.internal_id).await.unwrap().unwrap();
        assert_eq!(record.reason, "spam");
        assert_eq!(record.initiator, admin.internal_id.to_string());
    }

    #[tokio::test]
    async fn super_admin_cannot_be_banned() {
        let store = MemoryStore::default();
        let locks = UserLocks::default();
        let admin = user_with_role(&store, 1, Role::Admin).await;
        user_with_role(&store, 2, Role::SuperAdmin).await;

        assert!(matches!(
            ban(&store, &locks, &admin, 2, "coup", Duration::days(1)).await,
            Err(BotError::Permission(_))
        ));
        let subject = store.user_by_tg_id(2).await.unwrap().unwrap();
        assert!(!subject.is_banned);
    }

    #[tokio::test]
    async fn unban_is_idempotent() {
        let store = MemoryStore::default();
        let locks = UserLocks::default();
        let admin = user_with_role(&store, 1, Role::Admin).await;
        user_with_role(&store, 2, Role::User).await;

        ban(&store, &locks, &admin, 2, "spam", Duration::minutes(5))
            .await
            .unwrap();

        assert!(unban(&store, &locks, &admin, 2, None).await.unwrap());
        assert!(!unban(&store, &locks, &admin, 2, None).await.unwrap());

        let subject = store.user_by_tg_id(2).await.unwrap().unwrap();
        assert!(!subject.is_banned);
        let records_active = store.active_ban(subject.internal_id).await.unwrap();
        assert!(records_active.is_none());
    }

    #[tokio::test]
    async fn sweep_lifts_only_expired_bans() {
        let store = MemoryStore::default();
        let locks = UserLocks::default();
        let expired = user_with_role(&store, 2, Role::User).await;
        let fresh = user_with_role(&store, 3, Role::User).await;

        let now = Utc::now();
        store
            .insert_ban(&NewBan {
                internal_user_id: expired.internal_id,
                initiator: "1".into(),
                reason: "old".into(),
                banned_at: now - Duration::hours(2),
                expires_at: now - Duration::hours(1),
            })
            .await
            .unwrap();
        store.set_banned(expired.internal_id, true).await.unwrap();
        store
            .insert_ban(&NewBan {
                internal_user_id: fresh.internal_id,
                initiator: "1".into(),
                reason: "new".into(),
                banned_at: now,
                expires_at: now + Duration::hours(1),
            })
            .await
            .unwrap();
        store.set_banned(fresh.internal_id, true).await.unwrap();

        assert_eq!(sweep_once(&store, &locks).await.unwrap(), 1);
        assert!(!store.user_by_tg_id(2).await.unwrap().unwrap().is_banned);
        assert!(store.user_by_tg_id(3).await.unwrap().unwrap().is_banned);

        // Nothing left to do on the next pass.
        assert_eq!(sweep_once(&store, &locks).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweep_tolerates_a_concurrent_human_unban() {
        let store = MemoryStore::default();
        let locks = UserLocks::default();
        let admin = user_with_role(&store, 1, Role::Admin).await;
        let subject = user_with_role(&store, 2, Role::User).await;

        let now = Utc::now();
        store
            .insert_ban(&NewBan {
                internal_user_id: subject.internal_id,
                initiator: admin.internal_id.to_string(),
                reason: "old".into(),
                banned_at: now - Duration::hours(2),
                expires_at: now - Duration::hours(1),
            })
            .await
            .unwrap();
        store.set_banned(subject.internal_id, true).await.unwrap();

        assert!(unban(&store, &locks, &admin, 2, Some("appeal")).await.unwrap());
        assert_eq!(sweep_once(&store, &locks).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn role_changes_guard_the_super_admin() {
        let store = MemoryStore::default();
        let locks = UserLocks::default();
        let admin = user_with_role(&store, 1, Role::Admin).await;
        user_with_role(&store, 2, Role::User).await;
        user_with_role(&store, 3, Role::SuperAdmin).await;

        set_user_role(&store, &locks, &admin, 2, Role::Editor).await.unwrap();
        assert_eq!(
            store.user_by_tg_id(2).await.unwrap().unwrap().role,
            Role::Editor
        );

        assert!(matches!(
            set_user_role(&store, &locks, &admin, 3, Role::User).await,
            Err(BotError::Permission(_))
        ));
        assert!(matches!(
            set_user_role(&store, &locks, &admin, 2, Role::SuperAdmin).await,
            Err(BotError::Permission(_))
        ));
    }
}
