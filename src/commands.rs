use std::sync::Arc;

use teloxide::{
    payloads::SendMessageSetters, prelude::Requester, types::Message,
    utils::command::BotCommands, Bot,
};

use crate::database::connection::{Connection, ManageUsers};
use crate::keyboard::main_menu;
use crate::session::SessionEngine;
use crate::state::SurveyState;
use crate::{HandlerResult, SurveyDialogue};

#[derive(Debug, Clone, BotCommands)]
#[command(rename_rule = "lowercase")]
pub(crate) enum Command {
    #[command(description = "display help.")]
    Help,
    #[command(description = "open the main menu.")]
    Start,
    #[command(description = "abandon the survey in progress.")]
    Cancel,
}

pub(crate) async fn help(bot: Bot, msg: Message) -> HandlerResult {
    let text = format!(
        "{}\nIf you are banned and want to appeal, reply to this chat and an admin will review it.",
        Command::descriptions()
    );
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

pub(crate) async fn start(
    bot: Bot,
    dialogue: SurveyDialogue,
    msg: Message,
    connection: Arc<Connection>,
) -> HandlerResult {
    let user = connection.get_or_create_user(msg.chat.id.0).await?;
    bot.send_message(msg.chat.id, "Hi! Please choose what to do:")
        .reply_markup(main_menu(user.role))
        .await?;
    dialogue.update(SurveyState::Menu).await?;
    Ok(())
}

pub(crate) async fn cancel(
    bot: Bot,
    dialogue: SurveyDialogue,
    msg: Message,
    connection: Arc<Connection>,
    engine: Arc<SessionEngine<Connection>>,
) -> HandlerResult {
    let abandoned = engine.abandon(msg.chat.id.0).await?;
    let text = if abandoned {
        "Survey abandoned. Your recorded answers are kept."
    } else {
        "Nothing to cancel."
    };
    let user = connection.get_or_create_user(msg.chat.id.0).await?;
    bot.send_message(msg.chat.id, text)
        .reply_markup(main_menu(user.role))
        .await?;
    dialogue.update(SurveyState::Menu).await?;
    Ok(())
}
