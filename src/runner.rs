//! Message handlers that drive the session engine: menu routing, survey
//! selection, answering, and the rewrite flow.

use std::sync::Arc;

use teloxide::{
    payloads::SendMessageSetters,
    prelude::Requester,
    types::{ChatId, Message, ReplyMarkup},
    Bot,
};
use tracing::instrument;

use crate::database::connection::{Connection, ManageUsers};
use crate::database::models::{AnswerSpec, Question, Role, User};
use crate::error::BotError;
use crate::keyboard;
use crate::moderation::{authorize, Capability};
use crate::session::{Progress, Prompt, SessionEngine};
use crate::state::SurveyState;
use crate::{HandlerResult, SurveyDialogue};

/// Logs a rejected operation and tells the user why.
pub(crate) async fn report(bot: &Bot, chat: ChatId, e: &BotError, ctx: &str) -> HandlerResult {
    e.log(ctx);
    bot.send_message(chat, e.user_message()).await?;
    Ok(())
}

pub(crate) async fn back_to_menu(
    bot: &Bot,
    dialogue: &SurveyDialogue,
    chat: ChatId,
    role: Role,
) -> HandlerResult {
    bot.send_message(chat, "What do you want to do now?")
        .reply_markup(keyboard::main_menu(role))
        .await?;
    dialogue.update(SurveyState::Menu).await?;
    Ok(())
}

async fn send_prompt(bot: &Bot, chat: ChatId, prompt: &Prompt) -> HandlerResult {
    let text = format!("Question #{}\n{}", prompt.ordinal, prompt.text);
    match &prompt.answers {
        AnswerSpec::Options(options) => {
            bot.send_message(chat, text)
                .reply_markup(keyboard::options_keyboard(options))
                .await?;
        }
        AnswerSpec::FreeText => {
            bot.send_message(chat, text)
                .reply_markup(ReplyMarkup::kb_remove())
                .await?;
        }
    }
    Ok(())
}

async fn deliver(
    bot: &Bot,
    dialogue: &SurveyDialogue,
    chat: ChatId,
    role: Role,
    progress: Progress,
) -> HandlerResult {
    match progress {
        Progress::Ask(prompt) => {
            send_prompt(bot, chat, &prompt).await?;
            dialogue.update(SurveyState::InQuiz).await?;
        }
        Progress::Finished { gratitude } => {
            bot.send_message(chat, gratitude).await?;
            back_to_menu(bot, dialogue, chat, role).await?;
        }
        Progress::Rewritten => {
            bot.send_message(chat, "Your answer has been rewritten.✅").await?;
            back_to_menu(bot, dialogue, chat, role).await?;
        }
    }
    Ok(())
}

async fn known_user(bot: &Bot, msg: &Message, connection: &Connection) -> Result<Option<User>, Box<dyn std::error::Error + Send + Sync>> {
    match connection.user_by_tg_id(msg.chat.id.0).await? {
        Some(user) => Ok(Some(user)),
        None => {
            bot.send_message(msg.chat.id, "Please send /start first.").await?;
            Ok(None)
        }
    }
}

#[instrument(level = "info", skip_all, fields(chat = msg.chat.id.0))]
pub(crate) async fn menu(
    bot: Bot,
    dialogue: SurveyDialogue,
    msg: Message,
    connection: Arc<Connection>,
    engine: Arc<SessionEngine<Connection>>,
) -> HandlerResult {
    let Some(user) = known_user(&bot, &msg, &connection).await? else {
        return Ok(());
    };
    let chat = msg.chat.id;

    match msg.text() {
        Some(keyboard::TAKE_SURVEY) => {
            if let Err(e) = authorize(&user, Capability::TakeQuiz) {
                return report(&bot, chat, &e, "menu").await;
            }
            let quizzes = engine.available_quizzes(user.tg_user_id).await?;
            if quizzes.is_empty() {
                bot.send_message(chat, "No surveys available right now.").await?;
            } else {
                log::info!("user {} browses surveys", user.tg_user_id);
                bot.send_message(chat, "Please choose a survey:")
                    .reply_markup(keyboard::quizzes_keyboard(&quizzes))
                    .await?;
                dialogue.update(SurveyState::SelectQuiz).await?;
            }
        }
        Some(keyboard::REWRITE_ANSWER) => {
            if let Err(e) = authorize(&user, Capability::RewriteAnswer) {
                return report(&bot, chat, &e, "menu").await;
            }
            let completed = engine.completed_quizzes(user.tg_user_id).await?;
            if completed.is_empty() {
                bot.send_message(chat, "You have not completed any surveys yet.").await?;
            } else {
                bot.send_message(chat, "Which survey do you want to correct?")
                    .reply_markup(keyboard::quizzes_keyboard(&completed))
                    .await?;
                dialogue.update(SurveyState::RewriteSelectQuiz).await?;
            }
        }
        Some(keyboard::MAILING_SETTINGS) => {
            if let Err(e) = authorize(&user, Capability::ToggleMailing) {
                return report(&bot, chat, &e, "menu").await;
            }
            let current = if user.mailing { "on" } else { "off" };
            bot.send_message(chat, format!("Mailing is {current} for you. Change it?"))
                .reply_markup(keyboard::mailing_keyboard())
                .await?;
            dialogue.update(SurveyState::ToggleMailing).await?;
        }
        Some(keyboard::MY_STATUS) => {
            if let Err(e) = authorize(&user, Capability::ViewStatus) {
                return report(&bot, chat, &e, "menu").await;
            }
            let mut status = format!(
                "Role: {}\nBanned: {}\nMailing: {}",
                user.role,
                if user.is_banned { "yes" } else { "no" },
                if user.mailing { "on" } else { "off" },
            );
            if user.session.is_some() {
                status.push_str("\nYou have a survey in progress.");
            }
            bot.send_message(chat, status).await?;
        }
        Some(keyboard::UPLOAD_SURVEY) => {
            if let Err(e) = authorize(&user, Capability::UploadQuiz) {
                return report(&bot, chat, &e, "menu").await;
            }
            bot.send_message(chat, "Send the survey definition as a plain-text document.")
                .reply_markup(ReplyMarkup::kb_remove())
                .await?;
            dialogue.update(SurveyState::AwaitUpload).await?;
        }
        Some(keyboard::BROADCAST) => {
            if let Err(e) = authorize(&user, Capability::Broadcast) {
                return report(&bot, chat, &e, "menu").await;
            }
            bot.send_message(chat, "Send the text to broadcast to the mailing list.")
                .reply_markup(ReplyMarkup::kb_remove())
                .await?;
            dialogue.update(SurveyState::AwaitBroadcast).await?;
        }
        Some(keyboard::BAN_USER) => {
            if let Err(e) = authorize(&user, Capability::BanUsers) {
                return report(&bot, chat, &e, "menu").await;
            }
            bot.send_message(chat, "Send: <telegram id> <duration like 30s, 5m, 2h, 7d> [reason]")
                .reply_markup(ReplyMarkup::kb_remove())
                .await?;
            dialogue.update(SurveyState::AwaitBanTarget).await?;
        }
        Some(keyboard::UNBAN_USER) => {
            if let Err(e) = authorize(&user, Capability::BanUsers) {
                return report(&bot, chat, &e, "menu").await;
            }
            bot.send_message(chat, "Send: <telegram id> [reason]")
                .reply_markup(ReplyMarkup::kb_remove())
                .await?;
            dialogue.update(SurveyState::AwaitUnbanTarget).await?;
        }
        Some(keyboard::CHANGE_ROLE) => {
            if let Err(e) = authorize(&user, Capability::ManageRoles) {
                return report(&bot, chat, &e, "menu").await;
            }
            bot.send_message(chat, "Send: <telegram id> <user|editor|admin>")
                .reply_markup(ReplyMarkup::kb_remove())
                .await?;
            dialogue.update(SurveyState::AwaitRoleChange).await?;
        }
        other => {
            log::info!("invalid menu input {other:?} from {}", user.tg_user_id);
            bot.send_message(chat, "Invalid input. Please use the menu.")
                .reply_markup(keyboard::main_menu(user.role))
                .await?;
        }
    }

    Ok(())
}

#[instrument(level = "info", skip_all, fields(chat = msg.chat.id.0))]
pub(crate) async fn select_quiz(
    bot: Bot,
    dialogue: SurveyDialogue,
    msg: Message,
    connection: Arc<Connection>,
    engine: Arc<SessionEngine<Connection>>,
) -> HandlerResult {
    let Some(user) = known_user(&bot, &msg, &connection).await? else {
        return Ok(());
    };
    let chat = msg.chat.id;

    let Some(title) = msg.text() else {
        bot.send_message(chat, "Please pick a survey from the keyboard.").await?;
        return Ok(());
    };

    let available = engine.available_quizzes(user.tg_user_id).await?;
    let Some(quiz) = available.into_iter().find(|q| q.title == title) else {
        bot.send_message(chat, format!("No survey called '{title}'. Pick one from the keyboard."))
            .await?;
        return Ok(());
    };

    match engine.start_quiz(user.tg_user_id, quiz.quiz_id).await {
        Ok(progress) => deliver(&bot, &dialogue, chat, user.role, progress).await,
        Err(e) => {
            report(&bot, chat, &e, "start survey").await?;
            back_to_menu(&bot, &dialogue, chat, user.role).await
        }
    }
}

#[instrument(level = "info", skip_all, fields(chat = msg.chat.id.0))]
pub(crate) async fn take_answer(
    bot: Bot,
    dialogue: SurveyDialogue,
    msg: Message,
    connection: Arc<Connection>,
    engine: Arc<SessionEngine<Connection>>,
) -> HandlerResult {
    let Some(user) = known_user(&bot, &msg, &connection).await? else {
        return Ok(());
    };
    let chat = msg.chat.id;

    let Some(text) = msg.text() else {
        bot.send_message(chat, "Please answer with a text message.").await?;
        return Ok(());
    };

    match engine.submit_answer(user.tg_user_id, text).await {
        Ok(progress) => deliver(&bot, &dialogue, chat, user.role, progress).await,
        Err(e @ BotError::Store(_)) => {
            // Session state is untouched, so the user can simply resend.
            report(&bot, chat, &e, "submit answer").await
        }
        Err(e) => {
            report(&bot, chat, &e, "submit answer").await?;
            back_to_menu(&bot, &dialogue, chat, user.role).await
        }
    }
}

#[instrument(level = "info", skip_all, fields(chat = msg.chat.id.0))]
pub(crate) async fn rewrite_select_quiz(
    bot: Bot,
    dialogue: SurveyDialogue,
    msg: Message,
    connection: Arc<Connection>,
    engine: Arc<SessionEngine<Connection>>,
) -> HandlerResult {
    let Some(user) = known_user(&bot, &msg, &connection).await? else {
        return Ok(());
    };
    let chat = msg.chat.id;

    let Some(title) = msg.text() else {
        bot.send_message(chat, "Please pick a survey from the keyboard.").await?;
        return Ok(());
    };

    let completed = engine.completed_quizzes(user.tg_user_id).await?;
    let Some(quiz) = completed.into_iter().find(|q| q.title == title) else {
        bot.send_message(chat, format!("You have not completed a survey called '{title}'."))
            .await?;
        return Ok(());
    };

    match engine.completed_quiz_summary(user.tg_user_id, quiz.quiz_id).await {
        Ok(questions) => {
            bot.send_message(chat, summary_text(&questions))
                .reply_markup(keyboard::questions_keyboard(&questions))
                .await?;
            dialogue
                .update(SurveyState::RewriteSelectQuestion { quiz_id: quiz.quiz_id })
                .await?;
            Ok(())
        }
        Err(e) => {
            report(&bot, chat, &e, "rewrite menu").await?;
            back_to_menu(&bot, &dialogue, chat, user.role).await
        }
    }
}

fn summary_text(questions: &[Question]) -> String {
    let mut text = String::from("Which answer do you want to rewrite?\n");
    for question in questions {
        text.push_str(&format!("\n{}. {}", question.ordinal, question.text));
        if let Some(relation) = &question.relation {
            text.push_str(&format!(
                " (asked when #{} = {})",
                relation.prerequisite, relation.required_answer
            ));
        }
    }
    text
}

#[instrument(level = "info", skip_all, fields(chat = msg.chat.id.0))]
pub(crate) async fn rewrite_select_question(
    bot: Bot,
    dialogue: SurveyDialogue,
    msg: Message,
    quiz_id: i64,
    connection: Arc<Connection>,
    engine: Arc<SessionEngine<Connection>>,
) -> HandlerResult {
    let Some(user) = known_user(&bot, &msg, &connection).await? else {
        return Ok(());
    };
    let chat = msg.chat.id;

    let ordinal = msg
        .text()
        .and_then(|t| t.split('.').next())
        .and_then(|n| n.trim().parse::<i32>().ok());
    let Some(ordinal) = ordinal else {
        bot.send_message(chat, "Please pick a question from the keyboard.").await?;
        return Ok(());
    };

    match engine.begin_rewrite(user.tg_user_id, quiz_id, ordinal).await {
        Ok(prompt) => {
            send_prompt(&bot, chat, &prompt).await?;
            dialogue.update(SurveyState::InQuiz).await?;
            Ok(())
        }
        Err(e) => {
            report(&bot, chat, &e, "begin rewrite").await?;
            back_to_menu(&bot, &dialogue, chat, user.role).await
        }
    }
}

#[instrument(level = "info", skip_all, fields(chat = msg.chat.id.0))]
pub(crate) async fn toggle_mailing(
    bot: Bot,
    dialogue: SurveyDialogue,
    msg: Message,
    connection: Arc<Connection>,
) -> HandlerResult {
    let Some(user) = known_user(&bot, &msg, &connection).await? else {
        return Ok(());
    };
    let chat = msg.chat.id;

    match msg.text() {
        Some(keyboard::MAILING_ON) => {
            connection.set_mailing(user.internal_id, true).await?;
            bot.send_message(chat, "Mailing enabled.").await?;
        }
        Some(keyboard::MAILING_OFF) => {
            connection.set_mailing(user.internal_id, false).await?;
            bot.send_message(chat, "Mailing disabled.").await?;
        }
        _ => {
            bot.send_message(chat, "Please use the keyboard.").await?;
            return Ok(());
        }
    }
    back_to_menu(&bot, &dialogue, chat, user.role).await
}
