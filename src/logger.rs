//! Session audit log.
//!
//! Every task run writes one JSON object per line to
//! `<logs>/task_<timestamp>/<session_id>.jsonl`, plus JPEG captures under
//! `images/` next to it. The log is the audit trail of a run; diagnostics go
//! through `tracing`.

use chrono::{DateTime, Local};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::grid::{encode_jpeg, AnnotateError, DEFAULT_JPEG_QUALITY};
use crate::model::TokenUsage;

/// Session log errors.
#[derive(Error, Debug)]
pub enum SessionLogError {
    #[error("Log I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize log event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Corrupt log line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
    #[error("Failed to save image: {0}")]
    Image(#[from] AnnotateError),
}

/// Kinds of logged events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskStart,
    StepStart,
    LlmResponse,
    ActionExecution,
    StepComplete,
    Error,
    TaskComplete,
    /// A capture saved next to the log.
    Screenshot,
}

/// One line of the session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub session_id: String,
    pub timestamp: DateTime<Local>,
    pub event_type: EventType,
    pub data: Value,
}

/// Totals computed from a session log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub task: Option<String>,
    pub total_steps: usize,
    pub success: bool,
    pub reason: Option<String>,
    pub total_time_secs: f64,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub avg_step_time_secs: f64,
}

/// Appends events for one session.
#[derive(Debug)]
pub struct SessionLogger {
    session_id: String,
    log_file: PathBuf,
    image_dir: PathBuf,
}

impl SessionLogger {
    /// Create the task directory under `logs_dir` and a fresh session id.
    pub fn create(logs_dir: &Path) -> Result<Self, SessionLogError> {
        Self::with_session_id(logs_dir, Uuid::new_v4().to_string())
    }

    pub fn with_session_id(
        logs_dir: &Path,
        session_id: impl Into<String>,
    ) -> Result<Self, SessionLogError> {
        let session_id = session_id.into();
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let task_dir = logs_dir.join(format!("task_{}", timestamp));
        let image_dir = task_dir.join("images");
        fs::create_dir_all(&image_dir)?;

        let log_file = task_dir.join(format!("{}.jsonl", session_id));
        File::create(&log_file)?;
        tracing::info!(path = %log_file.display(), "Session log created");

        Ok(Self {
            session_id,
            log_file,
            image_dir,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    /// Append one event.
    pub fn log_event(&self, event_type: EventType, data: Value) -> Result<(), SessionLogError> {
        let event = LogEvent {
            session_id: self.session_id.clone(),
            timestamp: Local::now(),
            event_type,
            data,
        };
        let line = serde_json::to_string(&event)?;

        let mut file = OpenOptions::new().append(true).open(&self.log_file)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    pub fn log_task_start(&self, task: &str, config: Value) -> Result<(), SessionLogError> {
        self.log_event(EventType::TaskStart, json!({ "task": task, "config": config }))
    }

    pub fn log_step_start(&self, step: usize) -> Result<(), SessionLogError> {
        self.log_event(EventType::StepStart, json!({ "step": step }))
    }

    pub fn log_llm_response(
        &self,
        step: usize,
        action: Value,
        inference_secs: f64,
        usage: &TokenUsage,
    ) -> Result<(), SessionLogError> {
        self.log_event(
            EventType::LlmResponse,
            json!({
                "step": step,
                "action": action,
                "inference_time": inference_secs,
                "tokens": {
                    "input_tokens": usage.prompt_tokens,
                    "output_tokens": usage.completion_tokens,
                    "total_tokens": usage.total(),
                },
            }),
        )
    }

    pub fn log_action_execution(
        &self,
        step: usize,
        action: Value,
        execution_secs: f64,
        outcome: Value,
    ) -> Result<(), SessionLogError> {
        self.log_event(
            EventType::ActionExecution,
            json!({
                "step": step,
                "action": action,
                "execution_time": execution_secs,
                "outcome": outcome,
            }),
        )
    }

    pub fn log_step_complete(&self, step: usize, total_secs: f64) -> Result<(), SessionLogError> {
        self.log_event(
            EventType::StepComplete,
            json!({ "step": step, "total_time": total_secs }),
        )
    }

    pub fn log_error(&self, step: usize, error: &str) -> Result<(), SessionLogError> {
        self.log_event(EventType::Error, json!({ "step": step, "error": error }))
    }

    pub fn log_task_complete(
        &self,
        success: bool,
        reason: Option<&str>,
        total_steps: usize,
        total_secs: f64,
        total_cost: f64,
    ) -> Result<(), SessionLogError> {
        self.log_event(
            EventType::TaskComplete,
            json!({
                "success": success,
                "reason": reason,
                "total_steps": total_steps,
                "total_time": total_secs,
                "total_cost": total_cost,
            }),
        )
    }

    /// Save a capture as JPEG and log a `screenshot` event pointing at it.
    /// Returns the path written.
    pub fn save_image(
        &self,
        image: &RgbImage,
        step: usize,
        kind: &str,
    ) -> Result<PathBuf, SessionLogError> {
        let path = self
            .image_dir
            .join(format!("{}_step{:02}_{}.jpg", self.session_id, step, kind));
        let bytes = encode_jpeg(image, DEFAULT_JPEG_QUALITY)?;
        fs::write(&path, bytes)?;
        self.log_event(
            EventType::Screenshot,
            json!({ "step": step, "kind": kind, "path": path }),
        )?;
        Ok(path)
    }

    /// Read back this session's events.
    pub fn read_events(&self) -> Result<Vec<LogEvent>, SessionLogError> {
        read_session_log(&self.log_file)
    }
}

/// Read a session log.
///
/// A process killed mid-write can leave a truncated last line; that line is
/// skipped. An unparseable line anywhere else is an error.
pub fn read_session_log(path: &Path) -> Result<Vec<LogEvent>, SessionLogError> {
    // Raw bytes: a cut can land inside a multi-byte character.
    let reader = BufReader::new(File::open(path)?);
    let lines: Vec<Vec<u8>> = reader.split(b'\n').collect::<Result<_, _>>()?;
    let is_blank = |line: &[u8]| line.iter().all(u8::is_ascii_whitespace);
    let last_content = lines.iter().rposition(|l| !is_blank(l));

    let mut events = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        if is_blank(line) {
            continue;
        }
        match serde_json::from_slice::<LogEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) if Some(index) == last_content => {
                tracing::warn!(line = index + 1, "Skipping truncated last log line: {}", e);
            }
            Err(e) => {
                return Err(SessionLogError::Corrupt {
                    line: index + 1,
                    reason: e.to_string(),
                })
            }
        }
    }
    Ok(events)
}

/// Compute totals for a session from its events.
pub fn summarize(events: &[LogEvent]) -> SessionSummary {
    let mut summary = SessionSummary {
        session_id: events.first().map(|e| e.session_id.clone()).unwrap_or_default(),
        ..SessionSummary::default()
    };

    let mut step_time_total = 0.0;
    for event in events {
        let data = &event.data;
        match event.event_type {
            EventType::TaskStart => {
                summary.task = data["task"].as_str().map(str::to_string);
            }
            EventType::StepComplete => {
                summary.total_steps += 1;
                step_time_total += data["total_time"].as_f64().unwrap_or(0.0);
            }
            EventType::LlmResponse => {
                let tokens = &data["tokens"];
                summary.total_tokens += tokens["total_tokens"].as_u64().unwrap_or_else(|| {
                    tokens["input_tokens"].as_u64().unwrap_or(0)
                        + tokens["output_tokens"].as_u64().unwrap_or(0)
                });
            }
            EventType::TaskComplete => {
                summary.success = data["success"].as_bool().unwrap_or(false);
                summary.reason = data["reason"].as_str().map(str::to_string);
                summary.total_time_secs = data["total_time"].as_f64().unwrap_or(0.0);
                summary.total_cost = data["total_cost"].as_f64().unwrap_or(0.0);
            }
            EventType::StepStart
            | EventType::ActionExecution
            | EventType::Error
            | EventType::Screenshot => {}
        }
    }

    if summary.total_steps > 0 {
        summary.avg_step_time_secs = step_time_total / summary.total_steps as f64;
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_logs_dir() -> PathBuf {
        std::env::temp_dir().join(format!("grid-agent-logs-{}", Uuid::new_v4()))
    }

    fn usage(prompt: u64, completion: u64) -> TokenUsage {
        TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
        }
    }

    #[test]
    fn test_write_and_summarize() {
        let dir = temp_logs_dir();
        let logger = SessionLogger::with_session_id(&dir, "abc").unwrap();
        assert!(logger.log_file().ends_with("abc.jsonl"));

        logger.log_task_start("Order coffee", json!({ "max_steps": 5 })).unwrap();
        for step in 1..=2 {
            logger.log_step_start(step).unwrap();
            logger
                .log_llm_response(step, json!({ "action": "CLICK" }), 1.5, &usage(1000, 50))
                .unwrap();
            logger
                .log_action_execution(step, json!({ "action": "CLICK" }), 0.2, json!("executed"))
                .unwrap();
            logger.log_step_complete(step, step as f64).unwrap();
        }
        logger.log_task_complete(true, None, 2, 3.5, 0.0125).unwrap();

        let events = logger.read_events().unwrap();
        assert_eq!(events.len(), 10);
        assert!(events.iter().all(|e| e.session_id == "abc"));

        let summary = summarize(&events);
        assert_eq!(summary.task.as_deref(), Some("Order coffee"));
        assert_eq!(summary.total_steps, 2);
        assert!(summary.success);
        assert_eq!(summary.total_tokens, 2100);
        assert!((summary.avg_step_time_secs - 1.5).abs() < 1e-9);
        assert!((summary.total_cost - 0.0125).abs() < 1e-9);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_truncated_last_line_is_skipped() {
        let dir = temp_logs_dir();
        let logger = SessionLogger::create(&dir).unwrap();
        logger.log_step_start(1).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(logger.log_file()).unwrap();
            write!(file, "{{\"session_id\": \"x\", \"timest").unwrap();
        }

        let events = read_session_log(logger.log_file()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::StepStart);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_last_line_cut_inside_character_is_skipped() {
        let dir = temp_logs_dir();
        let logger = SessionLogger::create(&dir).unwrap();
        logger.log_task_start("打开设置", json!({})).unwrap();
        logger.log_step_start(1).unwrap();

        let event = LogEvent {
            session_id: logger.session_id().to_string(),
            timestamp: Local::now(),
            event_type: EventType::Error,
            data: json!({ "step": 1, "error": "屏幕截图失败" }),
        };
        let line = serde_json::to_string(&event).unwrap();
        let cut = line.find('屏').unwrap() + 1;
        {
            let mut file = OpenOptions::new().append(true).open(logger.log_file()).unwrap();
            file.write_all(&line.as_bytes()[..cut]).unwrap();
        }

        let events = read_session_log(logger.log_file()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data["task"], "打开设置");
        assert_eq!(events[1].event_type, EventType::StepStart);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_corrupt_middle_line_is_error() {
        let dir = temp_logs_dir();
        let logger = SessionLogger::create(&dir).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(logger.log_file()).unwrap();
            writeln!(file, "not json").unwrap();
        }
        logger.log_step_start(1).unwrap();

        let err = read_session_log(logger.log_file()).unwrap_err();
        assert!(matches!(err, SessionLogError::Corrupt { line: 1, .. }));

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_save_image() {
        let dir = temp_logs_dir();
        let logger = SessionLogger::with_session_id(&dir, "s1").unwrap();
        let path = logger.save_image(&RgbImage::new(64, 128), 3, "annotated").unwrap();
        assert!(path.ends_with("images/s1_step03_annotated.jpg"));
        assert!(path.exists());

        let events = logger.read_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Screenshot);
        assert_eq!(events[0].data["step"], 3);
        assert_eq!(events[0].data["kind"], "annotated");
        assert_eq!(events[0].data["path"], json!(path));

        fs::remove_dir_all(dir).ok();
    }
}
