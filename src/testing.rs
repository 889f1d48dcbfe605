//! In-memory fakes for the device and the decision service.

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::adb::{AdbError, CommandOutput, DeviceChannel, DeviceCommand, Screenshot};
use crate::model::{DecisionService, EncodedImage, ModelError, ModelResponse, TokenUsage};

pub(crate) fn test_image() -> EncodedImage {
    EncodedImage {
        mime_type: "image/jpeg".to_string(),
        data: "AAAA".to_string(),
        width: 1,
        height: 1,
    }
}

/// Decision service that replays scripted replies in order.
///
/// Once the script runs out it returns a 503 error, or keeps repeating the
/// last reply when built with [`ScriptedModel::repeating`].
pub(crate) struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    repeat: Option<String>,
    requests: Mutex<Vec<Vec<Value>>>,
}

impl ScriptedModel {
    pub const USAGE: TokenUsage = TokenUsage {
        prompt_tokens: 1000,
        completion_tokens: 50,
    };

    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(reply: impl Into<String>) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            repeat: Some(reply.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Text part of the user message of every request.
    pub fn user_texts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|messages| {
                let content = messages.get(1)?.get("content")?.as_array()?;
                content.last()?.get("text")?.as_str().map(str::to_string)
            })
            .collect()
    }
}

#[async_trait]
impl DecisionService for ScriptedModel {
    async fn complete(&self, messages: &[Value]) -> Result<ModelResponse, ModelError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let next = self.replies.lock().unwrap().pop_front();
        let content = next.or_else(|| self.repeat.clone()).ok_or(ModelError::ApiError {
            status: 503,
            body: "script exhausted".to_string(),
        })?;
        Ok(ModelResponse {
            content,
            usage: Self::USAGE,
            latency: Duration::from_millis(5),
        })
    }
}

/// Device that records commands and serves blank captures.
pub(crate) struct FakeDevice {
    width: u32,
    height: u32,
    ime: String,
    fail_commands: bool,
    capture_failures: AtomicUsize,
    captures: AtomicUsize,
    commands: Mutex<Vec<DeviceCommand>>,
}

impl FakeDevice {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ime: "com.android.adbkeyboard/.AdbIME".to_string(),
            fail_commands: false,
            capture_failures: AtomicUsize::new(0),
            captures: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn with_ime(mut self, ime: impl Into<String>) -> Self {
        self.ime = ime.into();
        self
    }

    /// Every command exits with a non-zero status.
    pub fn fail_commands(mut self) -> Self {
        self.fail_commands = true;
        self
    }

    /// The next `count` captures fail.
    pub fn failing_captures(self, count: usize) -> Self {
        self.capture_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.commands().iter().map(|c| c.to_string()).collect()
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceChannel for FakeDevice {
    async fn run(&self, command: &DeviceCommand) -> Result<CommandOutput, AdbError> {
        self.commands.lock().unwrap().push(command.clone());
        if self.fail_commands {
            return Err(AdbError::CommandFailed {
                command: command.to_string(),
                code: Some(1),
                stderr: "error: device offline".to_string(),
            });
        }
        let stdout = match command {
            DeviceCommand::GetInputMethod => format!("{}\n", self.ime),
            DeviceCommand::WindowSize => format!("Physical size: {}x{}\n", self.width, self.height),
            _ => String::new(),
        };
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
        })
    }

    async fn capture(&self) -> Result<Screenshot, AdbError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        let remaining = self.capture_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.capture_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(AdbError::InvalidScreenshot("secure window".to_string()));
        }
        Ok(Screenshot::new(RgbImage::from_pixel(
            self.width,
            self.height,
            Rgb([240, 240, 240]),
        )))
    }

    async fn screen_size(&self) -> Result<(u32, u32), AdbError> {
        Ok((self.width, self.height))
    }
}
