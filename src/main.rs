use std::net::SocketAddr;
use std::sync::Arc;

use dotenvy::dotenv;
use teloxide::dispatching::dialogue::{self, InMemStorage};
use teloxide::dispatching::UpdateHandler;
use teloxide::dptree;
use teloxide::error_handlers::IgnoringErrorHandlerSafe;
use teloxide::prelude::*;
use teloxide::update_listeners::webhooks::{self, Options};
use tracing::instrument;
use tracing_subscriber::EnvFilter;
use url::Url;

mod commands;
mod compiler;
mod database;
mod editor;
mod error;
mod keyboard;
mod middleware;
mod moderation;
mod runner;
mod session;
mod state;

use commands::{cancel, help, start, Command};
use database::connection::{Connection, ManageUsers};
use database::models::Role;
use middleware::RateGuard;
use session::{SessionEngine, UserLocks};
use state::SurveyState;

pub(crate) type SurveyDialogue = Dialogue<SurveyState, InMemStorage<SurveyState>>;
pub(crate) type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>;

#[tokio::main]
async fn main() {
    dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let connection_string = std::env::var("DATABASE_URL").expect("DATABASE_URL should be set.");
    let connection = Connection::connect(&connection_string)
        .await
        .expect("Failed to connect to the database.");
    connection.migrate().await.expect("Migrations failed.");
    let connection = Arc::new(connection);

    if let Ok(super_admin) = std::env::var("SUPER_ADMIN_ID") {
        let tg_id: i64 = super_admin.parse().expect("SUPER_ADMIN_ID must be numeric.");
        let user = connection
            .get_or_create_user(tg_id)
            .await
            .expect("Failed to bootstrap the super admin.");
        connection
            .set_role(user.internal_id, Role::SuperAdmin)
            .await
            .expect("Failed to bootstrap the super admin.");
        log::info!("super admin is {tg_id}");
    }

    let teloxide_token = std::env::var("TELOXIDE_TOKEN").expect("TELOXIDE_TOKEN should be set.");
    let bot = Bot::new(teloxide_token);
    log::info!("Starting survey bot...");

    let locks = UserLocks::default();
    let engine = Arc::new(SessionEngine::new(Arc::clone(&connection), locks.clone()));
    let guard = Arc::new(RateGuard::new(middleware::MIN_MESSAGE_GAP));

    tokio::spawn(moderation::ban_sweep(Arc::clone(&connection), locks.clone()));

    let mut dispatcher = Dispatcher::builder(bot.clone(), schema())
        .dependencies(dptree::deps![
            InMemStorage::<SurveyState>::new(),
            connection,
            engine,
            guard,
            locks
        ])
        .enable_ctrlc_handler()
        .build();

    let webhook_url = std::env::var("WEBHOOK_URL")
        .ok()
        .map(|u| u.parse::<Url>().expect("WEBHOOK_URL can't be parsed."));
    let webhook_addr = std::env::var("WEBHOOK_ADDR")
        .ok()
        .map(|a| a.parse::<SocketAddr>().expect("WEBHOOK_ADDR can't be parsed."));

    if let (Some(url), Some(addr)) = (webhook_url, webhook_addr) {
        let listener = webhooks::axum(bot, Options::new(addr, url))
            .await
            .expect("Failed to build a webhook listener.");
        dispatcher
            .dispatch_with_listener(listener, Arc::new(IgnoringErrorHandlerSafe))
            .await
    } else {
        // The polling listener reconnects with backoff on transient
        // transport errors, so a network hiccup never exits the process.
        dispatcher.dispatch().await
    }
}

fn schema() -> UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    use teloxide::dptree::case;

    let command_handler = teloxide::filter_command::<Command, _>()
        .branch(case![Command::Help].endpoint(help))
        .branch(case![Command::Start].endpoint(start))
        .branch(case![Command::Cancel].endpoint(cancel));

    let message_handler = Update::filter_message()
        .filter_async(middleware::admit)
        .branch(command_handler)
        .branch(case![SurveyState::Menu].endpoint(runner::menu))
        .branch(case![SurveyState::SelectQuiz].endpoint(runner::select_quiz))
        .branch(case![SurveyState::InQuiz].endpoint(runner::take_answer))
        .branch(case![SurveyState::RewriteSelectQuiz].endpoint(runner::rewrite_select_quiz))
        .branch(
            case![SurveyState::RewriteSelectQuestion { quiz_id }]
                .endpoint(runner::rewrite_select_question),
        )
        .branch(case![SurveyState::ToggleMailing].endpoint(runner::toggle_mailing))
        .branch(case![SurveyState::AwaitUpload].endpoint(editor::receive_upload))
        .branch(case![SurveyState::AwaitVisibility { pending }].endpoint(editor::receive_visibility))
        .branch(case![SurveyState::AwaitBroadcast].endpoint(editor::receive_broadcast))
        .branch(case![SurveyState::AwaitBanTarget].endpoint(editor::receive_ban))
        .branch(case![SurveyState::AwaitUnbanTarget].endpoint(editor::receive_unban))
        .branch(case![SurveyState::AwaitRoleChange].endpoint(editor::receive_role_change))
        .endpoint(invalid_state);

    dialogue::enter::<Update, InMemStorage<SurveyState>, SurveyState, _>().branch(message_handler)
}

#[instrument(level = "info", skip_all, fields(chat = msg.chat.id.0))]
async fn invalid_state(bot: Bot, msg: Message) -> HandlerResult {
    log::info!("unhandled input {:?} from {}", msg.text(), msg.chat.id.0);
    bot.send_message(
        msg.chat.id,
        "Unable to handle the message. Enter /help to see usages.",
    )
    .await?;
    Ok(())
}
