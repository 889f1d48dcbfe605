//! Session state and step records.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::actions::Action;
use crate::model::TokenUsage;

/// Phases of one step of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Capturing,
    Annotating,
    Deciding,
    Validating,
    RepeatCheck,
    Executing,
    Recording,
    Looping,
    Terminal(TerminalState),
}

/// Why a session failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum FailureReason {
    CaptureFailed,
    MalformedAction,
    DecisionService,
    StepLimit,
    Cancelled,
    /// The session log could not be written.
    SessionLog,
    /// A capture could not be annotated or encoded.
    Annotate,
    /// The model finished with `success: false`.
    ModelReported(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::CaptureFailed => write!(f, "capture-failed"),
            FailureReason::MalformedAction => write!(f, "malformed-action"),
            FailureReason::DecisionService => write!(f, "decision-service"),
            FailureReason::StepLimit => write!(f, "step-limit"),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::SessionLog => write!(f, "session-log-failed"),
            FailureReason::Annotate => write!(f, "annotate-failed"),
            FailureReason::ModelReported(reason) => {
                write!(f, "model-reported-failure: {}", reason)
            }
        }
    }
}

impl From<FailureReason> for String {
    fn from(reason: FailureReason) -> Self {
        reason.to_string()
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TerminalState {
    Success,
    Failure(FailureReason),
}

impl TerminalState {
    pub fn is_success(&self) -> bool {
        matches!(self, TerminalState::Success)
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            TerminalState::Success => None,
            TerminalState::Failure(reason) => Some(reason),
        }
    }
}

/// Result of one recorded decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Executed,
    DeviceFailed { error: String },
    Malformed { raw: String, error: String },
    Completed,
}

/// One decision and what came of it.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: usize,
    pub timestamp: DateTime<Local>,
    pub action: Option<Action>,
    /// Pixel target of a click.
    pub target: Option<(u32, u32)>,
    pub inference_latency: Duration,
    pub execution_latency: Duration,
    pub explain: String,
    pub summary: Option<String>,
    pub annotated_image: Option<PathBuf>,
    pub outcome: StepOutcome,
}

impl StepRecord {
    /// History line shown to the model in later requests.
    pub fn history_line(&self) -> Option<String> {
        let action = self.action.as_ref()?;
        let mut line = if self.explain.is_empty() {
            action.to_string()
        } else {
            format!("{} - {}", action, self.explain)
        };
        if let StepOutcome::DeviceFailed { error } = &self.outcome {
            line.push_str(&format!(" (failed: {})", error));
        }
        Some(line)
    }
}

/// Everything the loop knows about one task run.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub session_id: String,
    pub task: String,
    /// Steps started so far.
    pub step: usize,
    pub records: Vec<StepRecord>,
    pub usage: TokenUsage,
    pub cost: f64,
    pub elapsed: Duration,
    #[serde(skip)]
    state: AgentState,
    terminal: Option<TerminalState>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            task: task.into(),
            step: 0,
            records: Vec::new(),
            usage: TokenUsage::default(),
            cost: 0.0,
            elapsed: Duration::ZERO,
            state: AgentState::Idle,
            terminal: None,
        }
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Move to the next phase. Ignored once the session is terminal.
    pub fn enter(&mut self, next: AgentState) {
        if self.is_terminal() {
            tracing::warn!(?next, "Ignoring transition after terminal state");
            return;
        }
        tracing::trace!(from = ?self.state, to = ?next, "State transition");
        if let AgentState::Terminal(terminal) = &next {
            self.terminal = Some(terminal.clone());
        }
        self.state = next;
    }

    pub fn finish(&mut self, terminal: TerminalState) {
        self.enter(AgentState::Terminal(terminal));
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn terminal(&self) -> Option<&TerminalState> {
        self.terminal.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.terminal.as_ref().is_some_and(TerminalState::is_success)
    }

    pub fn record(&mut self, record: StepRecord) {
        self.records.push(record);
    }

    pub fn add_usage(&mut self, usage: TokenUsage, cost: f64) {
        self.usage += usage;
        self.cost += cost;
    }

    /// History lines of the last `window` recorded actions, oldest first.
    pub fn recent_history(&self, window: usize) -> Vec<String> {
        let lines: Vec<String> = self
            .records
            .iter()
            .filter_map(StepRecord::history_line)
            .collect();
        let skip = lines.len().saturating_sub(window);
        lines.into_iter().skip(skip).collect()
    }
}
