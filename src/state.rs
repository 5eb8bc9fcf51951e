use crate::compiler::CompiledQuiz;

/// Transport-side routing state for one chat. The authoritative quiz
/// position lives in the store; these states only decide which handler an
/// incoming message lands in.
#[derive(Debug, Clone, Default)]
pub(crate) enum SurveyState {
    #[default]
    Menu,

    // --- TAKING A SURVEY ---
    SelectQuiz,
    InQuiz,

    // --- REWRITING AN ANSWER ---
    RewriteSelectQuiz,
    RewriteSelectQuestion {
        quiz_id: i64,
    },

    // --- ACCOUNT ---
    ToggleMailing,

    // --- EDITOR / ADMIN ---
    AwaitUpload,
    AwaitVisibility {
        pending: CompiledQuiz,
    },
    AwaitBroadcast,
    AwaitBanTarget,
    AwaitUnbanTarget,
    AwaitRoleChange,
}
