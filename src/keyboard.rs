//! Reply-keyboard builders. All of them are pure functions of role or data,
//! so there is nothing to cache or invalidate.

use teloxide::types::{KeyboardButton, KeyboardMarkup};

use crate::database::models::{Question, Quiz, Role};
use crate::moderation::Capability;

pub(crate) const TAKE_SURVEY: &str = "Take a survey📝";
pub(crate) const REWRITE_ANSWER: &str = "Rewrite an answer✏️";
pub(crate) const MAILING_SETTINGS: &str = "Mailing settings✉️";
pub(crate) const MY_STATUS: &str = "My status ℹ️";
pub(crate) const UPLOAD_SURVEY: &str = "Upload a survey📄";
pub(crate) const BROADCAST: &str = "Broadcast📢";
pub(crate) const BAN_USER: &str = "Ban a user🚫";
pub(crate) const UNBAN_USER: &str = "Unban a user🕊️";
pub(crate) const CHANGE_ROLE: &str = "Change a role⭐";
pub(crate) const MAILING_ON: &str = "Mailing on✅";
pub(crate) const MAILING_OFF: &str = "Mailing off❌";

pub(crate) fn main_menu(role: Role) -> KeyboardMarkup {
    let mut keyboard = vec![
        vec![KeyboardButton::new(TAKE_SURVEY)],
        vec![KeyboardButton::new(REWRITE_ANSWER)],
        vec![
            KeyboardButton::new(MAILING_SETTINGS),
            KeyboardButton::new(MY_STATUS),
        ],
    ];

    if role.capabilities().contains(&Capability::UploadQuiz) {
        keyboard.push(vec![KeyboardButton::new(UPLOAD_SURVEY)]);
    }
    if role.capabilities().contains(&Capability::Broadcast) {
        keyboard.push(vec![KeyboardButton::new(BROADCAST)]);
        keyboard.push(vec![
            KeyboardButton::new(BAN_USER),
            KeyboardButton::new(UNBAN_USER),
        ]);
        keyboard.push(vec![KeyboardButton::new(CHANGE_ROLE)]);
    }

    KeyboardMarkup::new(keyboard)
}

pub(crate) fn quizzes_keyboard(quizzes: &[Quiz]) -> KeyboardMarkup {
    let keyboard = quizzes
        .iter()
        .map(|quiz| vec![KeyboardButton::new(&quiz.title)]);

    KeyboardMarkup::new(keyboard)
}

/// One button per question, labeled with its ordinal so the selection can
/// be parsed back.
pub(crate) fn questions_keyboard(questions: &[Question]) -> KeyboardMarkup {
    let keyboard = questions
        .iter()
        .map(|question| vec![KeyboardButton::new(format!("{}. {}", question.ordinal, question.text))]);

    KeyboardMarkup::new(keyboard)
}

pub(crate) fn options_keyboard(options: &[String]) -> KeyboardMarkup {
    let keyboard = options.iter().map(|option| vec![KeyboardButton::new(option)]);

    KeyboardMarkup::new(keyboard)
}

pub(crate) fn mailing_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![vec![
        KeyboardButton::new(MAILING_ON),
        KeyboardButton::new(MAILING_OFF),
    ]])
}
