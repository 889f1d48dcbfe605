//! Device channel: the boundary between the agent and a physical device.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

use super::connection::{get_adb_prefix, AdbError};
use super::device::DeviceCommand;
use super::screenshot::{decode_screencap, Screenshot};

static WM_SIZE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(Physical|Override) size:\s*(\d+)x(\d+)").expect("valid wm size regex")
});

/// Output of a successful device command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Combined output for logging.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (_, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }
}

/// Commands, captures and screen metrics for one device.
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    /// Run a shell command. A non-zero exit status is an error.
    async fn run(&self, command: &DeviceCommand) -> Result<CommandOutput, AdbError>;

    /// Capture the current screen.
    async fn capture(&self) -> Result<Screenshot, AdbError>;

    /// Screen size in pixels as reported by the device.
    async fn screen_size(&self) -> Result<(u32, u32), AdbError>;
}

/// Parse `wm size` output. An override size wins over the physical size.
pub fn parse_wm_size(output: &str) -> Option<(u32, u32)> {
    let mut physical = None;
    let mut overridden = None;
    for caps in WM_SIZE_PATTERN.captures_iter(output) {
        let size = (caps[2].parse().ok()?, caps[3].parse().ok()?);
        match &caps[1] {
            "Override" => overridden = Some(size),
            _ => physical = Some(size),
        }
    }
    overridden.or(physical)
}

/// [`DeviceChannel`] backed by the `adb` command-line tool.
#[derive(Debug, Clone)]
pub struct AdbChannel {
    adb_path: String,
    device_id: Option<String>,
    timeout: Duration,
}

impl AdbChannel {
    pub fn new(device_id: Option<String>) -> Self {
        Self {
            adb_path: "adb".to_string(),
            device_id,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_adb_path(mut self, adb_path: impl Into<String>) -> Self {
        self.adb_path = adb_path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    async fn exec(&self, args: &[String]) -> Result<Output, AdbError> {
        let prefix = get_adb_prefix(&self.adb_path, self.device_id.as_deref());
        let description = args.join(" ");
        tracing::debug!(command = %description, "adb");

        let mut cmd = Command::new(&prefix[0]);
        cmd.args(&prefix[1..]).args(args).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| AdbError::Timeout {
                command: description.clone(),
                timeout_secs: self.timeout.as_secs(),
            })?
            .map_err(|e| AdbError::Spawn(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("device") && stderr.contains("not found") {
                return Err(AdbError::DeviceNotFound(
                    self.device_id.clone().unwrap_or_else(|| "default".to_string()),
                ));
            }
            if stderr.contains("no devices/emulators found") {
                return Err(AdbError::NoDevice);
            }
            return Err(AdbError::CommandFailed {
                command: description,
                code: output.status.code(),
                stderr,
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl DeviceChannel for AdbChannel {
    async fn run(&self, command: &DeviceCommand) -> Result<CommandOutput, AdbError> {
        let mut args = vec!["shell".to_string()];
        args.extend(command.shell_args());
        let output = self.exec(&args).await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn capture(&self) -> Result<Screenshot, AdbError> {
        // exec-out streams the PNG straight to stdout without touching disk.
        let args: Vec<String> = ["exec-out", "screencap", "-p"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self.exec(&args).await?;
        decode_screencap(&output.stdout)
    }

    async fn screen_size(&self) -> Result<(u32, u32), AdbError> {
        let output = self.run(&DeviceCommand::WindowSize).await?;
        parse_wm_size(&output.stdout).ok_or(AdbError::ScreenSize(output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wm_size() {
        assert_eq!(parse_wm_size("Physical size: 1080x2400\n"), Some((1080, 2400)));
        assert_eq!(
            parse_wm_size("Physical size: 1440x3200\nOverride size: 1080x2400\n"),
            Some((1080, 2400))
        );
        assert_eq!(parse_wm_size("error: closed"), None);
    }

    #[test]
    fn test_command_output_combined() {
        let output = CommandOutput {
            stdout: "Events injected: 1\n".into(),
            stderr: String::new(),
        };
        assert_eq!(output.combined(), "Events injected: 1");
    }

    #[test]
    fn test_adb_channel_builder() {
        let channel = AdbChannel::new(Some("emulator-5554".into()))
            .with_adb_path("/opt/platform-tools/adb")
            .with_timeout(Duration::from_secs(3));
        assert_eq!(channel.device_id(), Some("emulator-5554"));
        assert_eq!(channel.timeout, Duration::from_secs(3));
    }
}
