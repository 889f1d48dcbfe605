//! Agent loop and session state.

mod grid_agent;
mod repetition;
mod state;

pub use grid_agent::{AgentConfig, AgentError, GridAgent, RetryPolicy};
pub use repetition::{RepetitionDetector, DEFAULT_REPEAT_RADIUS_PX, DEFAULT_REPEAT_THRESHOLD};
pub use state::{
    AgentState, FailureReason, SessionState, StepOutcome, StepRecord, TerminalState,
};
