//! The step loop: capture, annotate, decide, act, record.

use chrono::Local;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use super::repetition::{RepetitionDetector, DEFAULT_REPEAT_RADIUS_PX, DEFAULT_REPEAT_THRESHOLD};
use super::state::{
    AgentState, FailureReason, SessionState, StepOutcome, StepRecord, TerminalState,
};
use crate::actions::{Action, DeviceExecutor, ExecutorConfig};
use crate::adb::{AdbError, DeviceChannel, Screenshot};
use crate::decision::{Decision, DecisionAdapter, DecisionContext, DecisionError};
use crate::grid::{
    encode_for_model, AnnotateError, Annotator, GridSpec, GridStyle, DEFAULT_JPEG_QUALITY,
    DEFAULT_MODEL_IMAGE_SIDE,
};
use crate::logger::{SessionLogError, SessionLogger};
use crate::model::{DecisionService, EncodedImage, TokenUsage};

/// Errors that prevent a session from starting.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Task must not be empty")]
    EmptyTask,
}

/// Failures of the loop's own bookkeeping. They end the session.
#[derive(Error, Debug)]
enum StepError {
    #[error("session log failed: {0}")]
    Log(#[from] SessionLogError),
    #[error("image encoding failed: {0}")]
    Image(#[from] AnnotateError),
}

impl StepError {
    fn reason(&self) -> FailureReason {
        match self {
            StepError::Log(_) => FailureReason::SessionLog,
            StepError::Image(_) => FailureReason::Annotate,
        }
    }
}

/// Retry limits for recoverable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra capture attempts after the first failure.
    pub capture_retries: u32,
    pub capture_backoff: Duration,
    /// Extra decision attempts after a malformed reply.
    pub malformed_retries: u32,
}

/// Loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum number of steps before giving up.
    pub max_steps: u32,
    /// Pause between steps, in seconds.
    pub delay_after_action_secs: f64,
    pub capture_retries: u32,
    pub capture_backoff_ms: u64,
    pub malformed_retries: u32,
    /// Clicks within this distance count as the same target.
    pub repeat_radius_px: f64,
    /// Consecutive same-target clicks that trigger a warning.
    pub repeat_threshold: usize,
    pub detect_scroll_repetition: bool,
    /// Number of past actions shown to the model.
    pub history_window: usize,
    /// Send the previous screen with its action marked.
    pub include_previous_image: bool,
    /// Save annotated captures next to the session log.
    pub save_images: bool,
    pub model_image_side: u32,
    pub jpeg_quality: u8,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            delay_after_action_secs: 2.0,
            capture_retries: 2,
            capture_backoff_ms: 500,
            malformed_retries: 1,
            repeat_radius_px: DEFAULT_REPEAT_RADIUS_PX,
            repeat_threshold: DEFAULT_REPEAT_THRESHOLD,
            detect_scroll_repetition: false,
            history_window: 5,
            include_previous_image: true,
            save_images: true,
            model_image_side: DEFAULT_MODEL_IMAGE_SIDE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl AgentConfig {
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_delay(mut self, secs: f64) -> Self {
        self.delay_after_action_secs = secs;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            capture_retries: self.capture_retries,
            capture_backoff: Duration::from_millis(self.capture_backoff_ms),
            malformed_retries: self.malformed_retries,
        }
    }

    pub fn delay_after_action(&self) -> Duration {
        Duration::from_secs_f64(self.delay_after_action_secs.max(0.0))
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(1..=100).contains(&self.max_steps) {
            return Err(format!("max_steps must be 1-100, got {}", self.max_steps));
        }
        if !(0.0..=10.0).contains(&self.delay_after_action_secs) {
            return Err(format!(
                "delay_after_action_secs must be 0-10, got {}",
                self.delay_after_action_secs
            ));
        }
        if self.repeat_threshold < 2 {
            return Err("repeat_threshold must be at least 2".to_string());
        }
        if self.repeat_radius_px < 0.0 {
            return Err("repeat_radius_px must not be negative".to_string());
        }
        if self.model_image_side < 64 {
            return Err(format!(
                "model_image_side must be at least 64, got {}",
                self.model_image_side
            ));
        }
        Ok(())
    }
}

/// Context carried from one step into the next request.
#[derive(Default)]
struct Carry {
    previous_image: Option<EncodedImage>,
    summary: Option<String>,
    device_failure: Option<String>,
    warning: Option<String>,
}

/// Drives a device toward a task, one grid action at a time.
pub struct GridAgent {
    config: AgentConfig,
    grid: GridSpec,
    channel: Arc<dyn DeviceChannel>,
    decision: DecisionAdapter,
    executor: DeviceExecutor,
    annotator: Annotator,
    logger: Option<SessionLogger>,
    /// Set once a log write fails; later writes are skipped.
    log_failed: AtomicBool,
}

impl GridAgent {
    pub fn new(
        config: AgentConfig,
        grid: GridSpec,
        channel: Arc<dyn DeviceChannel>,
        service: Arc<dyn DecisionService>,
    ) -> Self {
        Self {
            decision: DecisionAdapter::new(service, grid),
            executor: DeviceExecutor::new(channel.clone()),
            annotator: Annotator::with_bitmap_font(GridStyle::default()),
            config,
            grid,
            channel,
            logger: None,
            log_failed: AtomicBool::new(false),
        }
    }

    pub fn with_annotator(mut self, annotator: Annotator) -> Self {
        self.annotator = annotator;
        self
    }

    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = DeviceExecutor::with_config(self.channel.clone(), config);
        self
    }

    pub fn with_logger(mut self, logger: SessionLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn logger(&self) -> Option<&SessionLogger> {
        self.logger.as_ref()
    }

    /// Run a task to a terminal state.
    ///
    /// `cancel` is checked between steps and interrupts the pause after an
    /// action. Every failure once the task has started, including failures
    /// of the session log, ends the session with a failure reason; only an
    /// empty task is returned as `Err`.
    pub async fn run(
        &self,
        task: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<SessionState, AgentError> {
        let task = task.trim();
        if task.is_empty() {
            return Err(AgentError::EmptyTask);
        }

        let session_id = self
            .logger
            .as_ref()
            .map(|l| l.session_id().to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut session = SessionState::new(session_id, task);
        let started = Instant::now();
        self.log_failed.store(false, Ordering::Relaxed);

        if let Err(e) = self.log(|l| {
            l.log_task_start(
                task,
                json!({
                    "agent": &self.config,
                    "grid": &self.grid,
                }),
            )
        }) {
            self.abort(&mut session, e.into());
        }
        tracing::info!(
            session_id = %session.session_id,
            max_steps = self.config.max_steps,
            columns = self.grid.columns(),
            rows = self.grid.rows(),
            "Starting task: {}",
            task
        );

        let mut detector =
            RepetitionDetector::new(self.config.repeat_radius_px, self.config.repeat_threshold)
                .with_scroll_tracking(self.config.detect_scroll_repetition);
        let mut carry = Carry::default();
        let max_steps = self.config.max_steps as usize;

        while !session.is_terminal() {
            if *cancel.borrow() {
                session.finish(TerminalState::Failure(FailureReason::Cancelled));
                break;
            }
            if session.step >= max_steps {
                session.finish(TerminalState::Failure(FailureReason::StepLimit));
                break;
            }

            if let Err(e) = self.run_step(&mut session, &mut carry, &mut detector).await {
                self.abort(&mut session, e);
            }
            if session.is_terminal() {
                break;
            }
            if session.step >= max_steps {
                session.finish(TerminalState::Failure(FailureReason::StepLimit));
                break;
            }

            session.enter(AgentState::Looping);
            let delay = self.config.delay_after_action();
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancelled(&mut cancel) => {}
                }
            }
        }

        session.elapsed = started.elapsed();
        let terminal = session
            .terminal()
            .cloned()
            .unwrap_or(TerminalState::Failure(FailureReason::Cancelled));
        let reason = terminal.failure().map(|r| r.to_string());
        if let Err(e) = self.log(|l| {
            l.log_task_complete(
                terminal.is_success(),
                reason.as_deref(),
                session.step,
                session.elapsed.as_secs_f64(),
                session.cost,
            )
        }) {
            tracing::error!("Failed to record task completion: {}", e);
        }

        match &reason {
            None => tracing::info!(
                steps = session.step,
                cost = session.cost,
                elapsed_secs = session.elapsed.as_secs_f64(),
                "Task completed"
            ),
            Some(reason) => tracing::error!(
                steps = session.step,
                cost = session.cost,
                elapsed_secs = session.elapsed.as_secs_f64(),
                "Task failed: {}",
                reason
            ),
        }
        Ok(session)
    }

    async fn run_step(
        &self,
        session: &mut SessionState,
        carry: &mut Carry,
        detector: &mut RepetitionDetector,
    ) -> Result<(), StepError> {
        session.step += 1;
        let step = session.step;
        let step_started = Instant::now();
        self.log(|l| l.log_step_start(step))?;
        tracing::info!(step, max_steps = self.config.max_steps, "Step started");

        session.enter(AgentState::Capturing);
        let screenshot = match self.capture().await {
            Ok(screenshot) => screenshot,
            Err(e) => {
                tracing::error!(step, "Screen capture failed: {}", e);
                self.log(|l| l.log_error(step, &format!("capture failed: {}", e)))?;
                session.finish(TerminalState::Failure(FailureReason::CaptureFailed));
                return Ok(());
            }
        };
        if (screenshot.width, screenshot.height)
            != (self.grid.screen_width(), self.grid.screen_height())
        {
            tracing::warn!(
                width = screenshot.width,
                height = screenshot.height,
                "Capture size differs from the grid's screen size"
            );
        }

        session.enter(AgentState::Annotating);
        let annotated = self.annotator.annotate(&screenshot.image, &self.grid);
        let annotated_path = self.save_image(&annotated, step, "annotated")?;
        let encoded = self.encode(&annotated)?;

        let Some(decision) = self
            .decide(session, carry, step, &encoded, annotated_path.clone())
            .await?
        else {
            return Ok(());
        };

        let cost = self.decision.pricing().cost(&decision.usage);
        session.add_usage(decision.usage, cost);
        self.log(|l| {
            l.log_llm_response(
                step,
                json!({
                    "action": &decision.action,
                    "explain": &decision.explain,
                    "summary": &decision.summary,
                }),
                decision.latency.as_secs_f64(),
                &decision.usage,
            )
        })?;
        tracing::info!(step, action = %decision.action, "{}", decision.explain);
        if decision.summary.is_some() {
            carry.summary = decision.summary.clone();
        }

        let action = decision.action.clone();
        let mut record = StepRecord {
            step,
            timestamp: Local::now(),
            action: Some(action.clone()),
            target: None,
            inference_latency: decision.latency,
            execution_latency: Duration::ZERO,
            explain: decision.explain,
            summary: decision.summary,
            annotated_image: annotated_path,
            outcome: StepOutcome::Completed,
        };

        if let Action::Complete { success, reason } = &action {
            session.enter(AgentState::Recording);
            session.record(record);
            self.log(|l| l.log_step_complete(step, step_started.elapsed().as_secs_f64()))?;
            session.finish(if *success {
                TerminalState::Success
            } else {
                TerminalState::Failure(FailureReason::ModelReported(reason.clone()))
            });
            return Ok(());
        }

        session.enter(AgentState::RepeatCheck);
        let target = action
            .cell()
            .and_then(|cell| self.grid.cell_to_pixel(cell).ok());
        detector.observe(&action, target);
        carry.warning = detector.warning();
        if carry.warning.is_some() {
            tracing::warn!(step, run = detector.run(), action = %action, "Repeated action");
        }

        session.enter(AgentState::Executing);
        let exec_started = Instant::now();
        let result = self.executor.execute(&action, &self.grid).await;
        record.execution_latency = exec_started.elapsed();
        record.target = target;
        match result {
            Ok(outcome) => {
                tracing::debug!(step, commands = outcome.commands.len(), "Action executed");
                record.target = outcome.target.or(target);
                record.outcome = StepOutcome::Executed;
                carry.device_failure = None;
            }
            Err(e) => {
                tracing::warn!(step, action = %action, "Device command failed: {}", e);
                self.log(|l| l.log_error(step, &e.to_string()))?;
                record.outcome = StepOutcome::DeviceFailed {
                    error: e.to_string(),
                };
                carry.device_failure = Some(e.to_string());
            }
        }

        session.enter(AgentState::Recording);
        self.log(|l| {
            l.log_action_execution(
                step,
                json!(&action),
                record.execution_latency.as_secs_f64(),
                json!(&record.outcome),
            )
        })?;
        session.record(record);

        carry.previous_image = if self.config.include_previous_image {
            let marked = self.annotator.mark_action(&annotated, &action, &self.grid);
            self.save_image(&marked, step, "marked")?;
            Some(self.encode(&marked)?)
        } else {
            None
        };

        self.log(|l| l.log_step_complete(step, step_started.elapsed().as_secs_f64()))?;
        Ok(())
    }

    /// Ask for a decision, retrying malformed replies with a format hint.
    ///
    /// Returns `None` once the session has reached a terminal state.
    async fn decide(
        &self,
        session: &mut SessionState,
        carry: &Carry,
        step: usize,
        image: &EncodedImage,
        annotated_path: Option<PathBuf>,
    ) -> Result<Option<Decision>, StepError> {
        let history = session.recent_history(self.config.history_window);
        let policy = self.config.retry_policy();
        let mut malformed = 0;

        loop {
            session.enter(AgentState::Deciding);
            let context = DecisionContext {
                task: &session.task,
                image,
                previous_image: carry.previous_image.as_ref(),
                previous_summary: carry.summary.as_deref(),
                history: &history,
                repetition_warning: carry.warning.as_deref(),
                device_failure: carry.device_failure.as_deref(),
                format_hint: malformed > 0,
            };
            let result = self.decision.decide(&context).await;

            session.enter(AgentState::Validating);
            match result {
                Ok(decision) => return Ok(Some(decision)),
                Err(DecisionError::Malformed {
                    error,
                    usage,
                    latency,
                }) => {
                    self.account_malformed(session, usage);
                    malformed += 1;
                    tracing::warn!(step, attempt = malformed, "Malformed reply: {}", error);
                    self.log(|l| l.log_error(step, &error.to_string()))?;
                    session.record(StepRecord {
                        step,
                        timestamp: Local::now(),
                        action: None,
                        target: None,
                        inference_latency: latency,
                        execution_latency: Duration::ZERO,
                        explain: String::new(),
                        summary: None,
                        annotated_image: annotated_path.clone(),
                        outcome: StepOutcome::Malformed {
                            raw: error.raw().to_string(),
                            error: error.to_string(),
                        },
                    });
                    if malformed > policy.malformed_retries {
                        session.finish(TerminalState::Failure(FailureReason::MalformedAction));
                        return Ok(None);
                    }
                }
                Err(DecisionError::Service(e)) => {
                    tracing::error!(step, "Decision service failed: {}", e);
                    self.log(|l| l.log_error(step, &e.to_string()))?;
                    session.finish(TerminalState::Failure(FailureReason::DecisionService));
                    return Ok(None);
                }
            }
        }
    }

    fn account_malformed(&self, session: &mut SessionState, usage: TokenUsage) {
        let cost = self.decision.pricing().cost(&usage);
        session.add_usage(usage, cost);
    }

    async fn capture(&self) -> Result<Screenshot, AdbError> {
        let policy = self.config.retry_policy();
        let mut attempt = 0;
        loop {
            match self.channel.capture().await {
                Ok(screenshot) => return Ok(screenshot),
                Err(e) if attempt < policy.capture_retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        retries = policy.capture_retries,
                        "Capture failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(policy.capture_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn encode(&self, image: &RgbImage) -> Result<EncodedImage, AnnotateError> {
        encode_for_model(image, self.config.model_image_side, self.config.jpeg_quality)
    }

    fn save_image(
        &self,
        image: &RgbImage,
        step: usize,
        kind: &str,
    ) -> Result<Option<PathBuf>, StepError> {
        match &self.logger {
            Some(logger) if self.config.save_images && !self.log_failed.load(Ordering::Relaxed) => {
                Ok(Some(logger.save_image(image, step, kind)?))
            }
            _ => Ok(None),
        }
    }

    fn log(
        &self,
        write: impl FnOnce(&SessionLogger) -> Result<(), SessionLogError>,
    ) -> Result<(), SessionLogError> {
        match &self.logger {
            Some(logger) if !self.log_failed.load(Ordering::Relaxed) => write(logger).map_err(|e| {
                self.log_failed.store(true, Ordering::Relaxed);
                e
            }),
            _ => Ok(()),
        }
    }

    /// End the session after a bookkeeping failure.
    fn abort(&self, session: &mut SessionState, error: StepError) {
        tracing::error!(step = session.step, "Stopping: {}", error);
        let step = session.step;
        if let Err(e) = self.log(|l| l.log_error(step, &error.to_string())) {
            tracing::error!(step, "Failed to record error: {}", e);
        }
        session.finish(TerminalState::Failure(error.reason()));
    }
}

/// Resolves once cancellation is requested. Never resolves if the sender is
/// gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}
