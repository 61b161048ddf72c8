//! Session state machine.
//!
//! The controller reports what just happened as a [`Step`]; this module decides
//! the next [`SessionState`] and rejects anything the loop must never do (for
//! example, generating again after the budget is exhausted).

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    Generating,
    Materializing,
    Executing,
    SuccessAwaitInput,
    FailedRetry,
    Exhausted,
    Terminated,
}

impl SessionState {
    /// States in which the session has stopped for good.
    pub fn is_final(self) -> bool {
        matches!(self, SessionState::Exhausted | SessionState::Terminated)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "INIT",
            SessionState::Generating => "GENERATING",
            SessionState::Materializing => "MATERIALIZING",
            SessionState::Executing => "EXECUTING",
            SessionState::SuccessAwaitInput => "SUCCESS_AWAIT_INPUT",
            SessionState::FailedRetry => "FAILED_RETRY",
            SessionState::Exhausted => "EXHAUSTED",
            SessionState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// Something that happened in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// First requirement submitted.
    Begin,
    /// The model returned a response.
    ResponseReceived,
    /// The provider failed, or the response held no usable file blocks.
    ProviderFailed,
    /// Files are on disk and dependencies were resolved.
    Materialized,
    /// The supervisor classified the run as a success.
    Succeeded,
    /// The supervisor classified the run as a crash.
    Crashed,
    /// A failure was recorded against the budget. `budget_left` says whether
    /// another generation is allowed.
    Retry { budget_left: bool },
    /// The operator submitted a new requirement after a success.
    NewRequirement,
    /// The operator ended the session.
    Exit,
    /// An operator interrupt arrived while no project was running.
    Interrupt,
}

/// Compute the next state, or describe why the step is illegal in `state`.
pub fn transition(state: SessionState, step: Step) -> Result<SessionState, String> {
    use SessionState as S;

    let next = match (state, step) {
        (S::Init, Step::Begin) => S::Generating,
        (S::Init, Step::Exit) => S::Terminated,
        (S::Generating, Step::ResponseReceived) => S::Materializing,
        (S::Generating, Step::ProviderFailed) => S::FailedRetry,
        (S::Materializing, Step::Materialized) => S::Executing,
        (S::Materializing, Step::ProviderFailed) => S::FailedRetry,
        (S::Executing, Step::Succeeded) => S::SuccessAwaitInput,
        (S::Executing, Step::Crashed) => S::FailedRetry,
        (S::FailedRetry, Step::Retry { budget_left: true }) => S::Generating,
        (S::FailedRetry, Step::Retry { budget_left: false }) => S::Exhausted,
        (S::SuccessAwaitInput, Step::NewRequirement) => S::Generating,
        (S::SuccessAwaitInput, Step::Exit) => S::Terminated,
        (from, Step::Interrupt) if !from.is_final() => S::Terminated,
        (from, step) => {
            return Err(format!("illegal step {step:?} in state {from}"));
        }
    };
    Ok(next)
}
