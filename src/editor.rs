//! Editor and admin handlers: survey upload and publishing, broadcast to
//! the mailing list, ban/unban and role changes.

use std::sync::Arc;

use teloxide::{
    net::Download,
    prelude::Requester,
    types::{ChatId, Message},
    Bot,
};
use tracing::instrument;

use crate::compiler::{self, CompiledQuiz};
use crate::database::connection::{Connection, ManageUsers, PublishQuiz};
use crate::database::models::{parse_bool_flag, Role, User};
use crate::moderation::{self, authorize, Capability};
use crate::runner::{back_to_menu, report};
use crate::session::UserLocks;
use crate::state::SurveyState;
use crate::{HandlerResult, SurveyDialogue};

async fn known_user(
    bot: &Bot,
    msg: &Message,
    connection: &Connection,
) -> Result<Option<User>, Box<dyn std::error::Error + Send + Sync>> {
    match connection.user_by_tg_id(msg.chat.id.0).await? {
        Some(user) => Ok(Some(user)),
        None => {
            bot.send_message(msg.chat.id, "Please send /start first.").await?;
            Ok(None)
        }
    }
}

#[instrument(level = "info", skip_all, fields(chat = msg.chat.id.0))]
pub(crate) async fn receive_upload(
    bot: Bot,
    dialogue: SurveyDialogue,
    msg: Message,
    connection: Arc<Connection>,
) -> HandlerResult {
    let Some(user) = known_user(&bot, &msg, &connection).await? else {
        return Ok(());
    };
    let chat = msg.chat.id;

    if let Err(e) = authorize(&user, Capability::UploadQuiz) {
        report(&bot, chat, &e, "upload").await?;
        return back_to_menu(&bot, &dialogue, chat, user.role).await;
    }

    let Some(document) = msg.document() else {
        bot.send_message(chat, "Please send the definition as a plain-text document.")
            .await?;
        return Ok(());
    };

    let file = bot.get_file(document.file.id.clone()).await?;
    let mut raw = Vec::new();
    bot.download_file(&file.path, &mut raw).await?;
    let Ok(raw) = String::from_utf8(raw) else {
        bot.send_message(chat, "The document is not valid UTF-8 text.").await?;
        return Ok(());
    };

    match compiler::compile(&raw) {
        Ok(compiled) => {
            log::info!(
                "user {} compiled survey '{}' with {} questions",
                user.tg_user_id,
                compiled.name,
                compiled.questions.len()
            );
            bot.send_message(
                chat,
                format!(
                    "Compiled survey '{}' with {} questions. Publish as visible? (true/false)",
                    compiled.name,
                    compiled.questions.len()
                ),
            )
            .await?;
            dialogue
                .update(SurveyState::AwaitVisibility { pending: compiled })
                .await?;
        }
        Err(e) => {
            log::info!("user {} sent a malformed survey: {e}", user.tg_user_id);
            bot.send_message(chat, format!("Rejected: {e}. Fix the file and send it again."))
                .await?;
        }
    }

    Ok(())
}

#[instrument(level = "info", skip_all, fields(chat = msg.chat.id.0))]
pub(crate) async fn receive_visibility(
    bot: Bot,
    dialogue: SurveyDialogue,
    msg: Message,
    pending: CompiledQuiz,
    connection: Arc<Connection>,
) -> HandlerResult {
    let Some(user) = known_user(&bot, &msg, &connection).await? else {
        return Ok(());
    };
    let chat = msg.chat.id;

    let visible = match msg.text().ok_or(()).and_then(|t| parse_bool_flag(t).map_err(|_| ())) {
        Ok(visible) => visible,
        Err(()) => {
            bot.send_message(chat, "Please answer 'true' or 'false'.").await?;
            return Ok(());
        }
    };

    match connection.publish_quiz(&pending, visible).await {
        Ok(_) => {
            log::info!("user {} published survey '{}'", user.tg_user_id, pending.name);
            bot.send_message(
                chat,
                format!("Survey '{}' published{}.", pending.name, if visible { "" } else { " (hidden)" }),
            )
            .await?;
        }
        Err(e) => report(&bot, chat, &e, "publish survey").await?,
    }
    back_to_menu(&bot, &dialogue, chat, user.role).await
}

#[instrument(level = "info", skip_all, fields(chat = msg.chat.id.0))]
pub(crate) async fn receive_broadcast(
    bot: Bot,
    dialogue: SurveyDialogue,
    msg: Message,
    connection: Arc<Connection>,
) -> HandlerResult {
    let Some(user) = known_user(&bot, &msg, &connection).await? else {
        return Ok(());
    };
    let chat = msg.chat.id;

    if let Err(e) = authorize(&user, Capability::Broadcast) {
        report(&bot, chat, &e, "broadcast").await?;
        return back_to_menu(&bot, &dialogue, chat, user.role).await;
    }

    let Some(text) = msg.text() else {
        bot.send_message(chat, "Please send the broadcast as text.").await?;
        return Ok(());
    };

    let recipients = connection.mailing_recipients().await?;
    let total = recipients.len();
    let mut delivered = 0usize;
    for recipient in recipients {
        match bot.send_message(ChatId(recipient), text).await {
            Ok(_) => delivered += 1,
            Err(e) => log::warn!("broadcast to {recipient} failed: {e}"),
        }
    }
    log::info!(
        "user {} broadcast a message to {delivered}/{total} recipients",
        user.tg_user_id
    );
    bot.send_message(chat, format!("Broadcast delivered to {delivered} of {total} recipients."))
        .await?;
    back_to_menu(&bot, &dialogue, chat, user.role).await
}

#[instrument(level = "info", skip_all, fields(chat = msg.chat.id.0))]
pub(crate) async fn receive_ban(
    bot: Bot,
    dialogue: SurveyDialogue,
    msg: Message,
    connection: Arc<Connection>,
    locks: UserLocks,
) -> HandlerResult {
    let Some(user) = known_user(&bot, &msg, &connection).await? else {
        return Ok(());
    };
    let chat = msg.chat.id;

    let text = msg.text().unwrap_or_default();
    let mut parts = text.split_whitespace();
    let subject = parts.next().and_then(|id| id.parse::<i64>().ok());
    let duration = parts.next().map(moderation::parse_ban_duration);

    let (Some(subject), Some(duration)) = (subject, duration) else {
        bot.send_message(chat, "Expected: <telegram id> <duration like 30s, 5m, 2h, 7d> [reason]")
            .await?;
        return Ok(());
    };
    let duration = match duration {
        Ok(duration) => duration,
        Err(e) => {
            report(&bot, chat, &e, "ban").await?;
            return Ok(());
        }
    };
    let reason = parts.collect::<Vec<_>>().join(" ");
    let reason = if reason.is_empty() { "unspecified".to_owned() } else { reason };

    match moderation::ban(connection.as_ref(), &locks, &user, subject, &reason, duration).await {
        Ok(()) => {
            bot.send_message(chat, format!("User {subject} banned.")).await?;
        }
        Err(e) => report(&bot, chat, &e, "ban").await?,
    }
    back_to_menu(&bot, &dialogue, chat, user.role).await
}

#[instrument(level = "info", skip_all, fields(chat = msg.chat.id.0))]
pub(crate) async fn receive_unban(
    bot: Bot,
    dialogue: SurveyDialogue,
    msg: Message,
    connection: Arc<Connection>,
    locks: UserLocks,
) -> HandlerResult {
    let Some(user) = known_user(&bot, &msg, &connection).await? else {
        return Ok(());
    };
    let chat = msg.chat.id;

    let text = msg.text().unwrap_or_default();
    let mut parts = text.split_whitespace();
    let Some(subject) = parts.next().and_then(|id| id.parse::<i64>().ok()) else {
        bot.send_message(chat, "Expected: <telegram id> [reason]").await?;
        return Ok(());
    };
    let reason = parts.collect::<Vec<_>>().join(" ");
    let reason = (!reason.is_empty()).then_some(reason);

    match moderation::unban(connection.as_ref(), &locks, &user, subject, reason.as_deref()).await {
        Ok(true) => {
            bot.send_message(chat, format!("User {subject} unbanned.")).await?;
        }
        Ok(false) => {
            bot.send_message(chat, format!("User {subject} is not banned.")).await?;
        }
        Err(e) => report(&bot, chat, &e, "unban").await?,
    }
    back_to_menu(&bot, &dialogue, chat, user.role).await
}

#[instrument(level = "info", skip_all, fields(chat = msg.chat.id.0))]
pub(crate) async fn receive_role_change(
    bot: Bot,
    dialogue: SurveyDialogue,
    msg: Message,
    connection: Arc<Connection>,
    locks: UserLocks,
) -> HandlerResult {
    let Some(user) = known_user(&bot, &msg, &connection).await? else {
        return Ok(());
    };
    let chat = msg.chat.id;

    let text = msg.text().unwrap_or_default();
    let mut parts = text.split_whitespace();
    let subject = parts.next().and_then(|id| id.parse::<i64>().ok());
    let role = parts.next().map(Role::from_str);

    let (Some(subject), Some(role)) = (subject, role) else {
        bot.send_message(chat, "Expected: <telegram id> <user|editor|admin>").await?;
        return Ok(());
    };
    let role = match role {
        Ok(role) => role,
        Err(e) => {
            report(&bot, chat, &e, "role change").await?;
            return Ok(());
        }
    };

    match moderation::set_user_role(connection.as_ref(), &locks, &user, subject, role).await {
        Ok(()) => {
            bot.send_message(chat, format!("User {subject} is now {role}.")).await?;
        }
        Err(e) => report(&bot, chat, &e, "role change").await?,
    }
    back_to_menu(&bot, &dialogue, chat, user.role).await
}
