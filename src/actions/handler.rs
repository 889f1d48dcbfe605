//! Device executor: turns validated actions into device commands.

use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::action::{Action, ScrollDirection, DEFAULT_SCROLL_AMOUNT};
use crate::adb::input::{clear_field_commands, needs_unicode_input, type_unicode};
use crate::adb::{AdbError, CommandOutput, DeviceChannel, DeviceCommand};
use crate::grid::{GridError, GridSpec};

/// Errors raised while executing an action on the device.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device command failed: {0}")]
    Adb(#[from] AdbError),
    #[error("Invalid target: {0}")]
    Grid(#[from] GridError),
}

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Duration of scroll swipes.
    pub scroll_duration_ms: u64,
    /// Pause around input method switches.
    pub ime_settle: Duration,
    /// Pause between stopping and relaunching an app.
    pub launch_settle: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            scroll_duration_ms: 300,
            ime_settle: Duration::from_millis(500),
            launch_settle: Duration::from_millis(500),
        }
    }
}

/// What the device did for one action.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    /// Commands run, in order.
    pub commands: Vec<DeviceCommand>,
    /// Combined command output.
    pub output: String,
    /// Resolved pixel target, for clicks.
    pub target: Option<(u32, u32)>,
    pub latency: Duration,
}

/// Swipe for a scroll of `amount` (fraction of screen height) through the
/// screen center.
///
/// Scrolling down moves the content up, so the finger travels from the lower
/// part of the screen to the upper part.
pub fn scroll_swipe(
    direction: ScrollDirection,
    amount: Option<f64>,
    grid: &GridSpec,
    duration_ms: u64,
) -> DeviceCommand {
    let amount = amount.unwrap_or(DEFAULT_SCROLL_AMOUNT).clamp(0.0, 1.0);
    let width = grid.screen_width() as f64;
    let height = grid.screen_height() as f64;
    let max_y = grid.screen_height().saturating_sub(1);

    let x = (width / 2.0).round() as u32;
    let low = ((height * (0.5 + amount / 2.0)).round() as u32).min(max_y);
    let high = (height * (0.5 - amount / 2.0)).round() as u32;

    let (start_y, end_y) = match direction {
        ScrollDirection::Down => (low, high),
        ScrollDirection::Up => (high, low),
    };
    DeviceCommand::Swipe {
        start: (x, start_y),
        end: (x, end_y),
        duration_ms,
    }
}

/// Executes actions through a [`DeviceChannel`].
pub struct DeviceExecutor {
    channel: Arc<dyn DeviceChannel>,
    config: ExecutorConfig,
}

impl DeviceExecutor {
    pub fn new(channel: Arc<dyn DeviceChannel>) -> Self {
        Self::with_config(channel, ExecutorConfig::default())
    }

    pub fn with_config(channel: Arc<dyn DeviceChannel>, config: ExecutorConfig) -> Self {
        Self { channel, config }
    }

    /// Execute an action.
    ///
    /// The first failing device command aborts the action and is returned as
    /// an error; nothing is retried here.
    pub async fn execute(
        &self,
        action: &Action,
        grid: &GridSpec,
    ) -> Result<ExecutionOutcome, DeviceError> {
        let start = Instant::now();
        let mut outcome = ExecutionOutcome::default();
        let mut outputs: Vec<CommandOutput> = Vec::new();

        match action {
            Action::Click { cell } => {
                let (x, y) = grid.cell_to_pixel(*cell)?;
                outcome.target = Some((x, y));
                let command = DeviceCommand::Tap { x, y };
                outputs.push(self.run(&command).await?);
                outcome.commands.push(command);
            }
            Action::Type { text, clear_first } => {
                if *clear_first {
                    for command in clear_field_commands() {
                        outputs.push(self.run(&command).await?);
                        outcome.commands.push(command);
                    }
                }
                if needs_unicode_input(text) {
                    tracing::debug!("Typing through ADB Keyboard");
                    outputs.extend(
                        type_unicode(self.channel.as_ref(), text, self.config.ime_settle).await?,
                    );
                    outcome.commands.push(DeviceCommand::BroadcastText { text: text.clone() });
                } else {
                    let command = DeviceCommand::InputText { text: text.clone() };
                    outputs.push(self.run(&command).await?);
                    outcome.commands.push(command);
                }
            }
            Action::Scroll { direction, amount } => {
                let command = scroll_swipe(*direction, *amount, grid, self.config.scroll_duration_ms);
                outputs.push(self.run(&command).await?);
                outcome.commands.push(command);
            }
            Action::Awake { package } => {
                let stop = DeviceCommand::ForceStop {
                    package: package.clone(),
                };
                outputs.push(self.run(&stop).await?);
                outcome.commands.push(stop);
                tokio::time::sleep(self.config.launch_settle).await;

                let launch = DeviceCommand::LaunchApp {
                    package: package.clone(),
                };
                outputs.push(self.run(&launch).await?);
                outcome.commands.push(launch);
            }
            Action::Complete { .. } => {}
        }

        outcome.output = outputs
            .iter()
            .map(CommandOutput::combined)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        outcome.latency = start.elapsed();
        Ok(outcome)
    }

    async fn run(&self, command: &DeviceCommand) -> Result<CommandOutput, AdbError> {
        tracing::debug!(command = %command, "Executing device command");
        self.channel.run(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::ADB_KEYBOARD_IME;
    use crate::grid::CellLabel;
    use crate::testing::FakeDevice;

    fn grid() -> GridSpec {
        GridSpec::new(10, 20, 1080, 2400).unwrap()
    }

    fn executor(device: &Arc<FakeDevice>) -> DeviceExecutor {
        DeviceExecutor::with_config(
            device.clone(),
            ExecutorConfig {
                scroll_duration_ms: 300,
                ime_settle: Duration::ZERO,
                launch_settle: Duration::ZERO,
            },
        )
    }

    #[tokio::test]
    async fn test_click_taps_cell_center() {
        let device = Arc::new(FakeDevice::new(1080, 2400));
        let outcome = executor(&device)
            .execute(
                &Action::Click {
                    cell: CellLabel::new(4, 4),
                },
                &grid(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.target, Some((486, 540)));
        assert_eq!(device.command_lines(), vec!["input tap 486 540"]);
    }

    #[tokio::test]
    async fn test_type_ascii_with_clear() {
        let device = Arc::new(FakeDevice::new(1080, 2400));
        executor(&device)
            .execute(
                &Action::Type {
                    text: "iced latte".into(),
                    clear_first: true,
                },
                &grid(),
            )
            .await
            .unwrap();
        assert_eq!(
            device.command_lines(),
            vec![
                "input keycombination 113 29",
                "input keyevent 67",
                "input text iced%slatte",
            ]
        );
    }

    #[tokio::test]
    async fn test_type_percent_uses_adb_keyboard() {
        let device = Arc::new(FakeDevice::new(1080, 2400));
        executor(&device)
            .execute(
                &Action::Type {
                    text: "100%sure".into(),
                    clear_first: false,
                },
                &grid(),
            )
            .await
            .unwrap();

        let commands = device.commands();
        assert!(commands.contains(&DeviceCommand::BroadcastText {
            text: "100%sure".into()
        }));
        assert!(!commands
            .iter()
            .any(|c| matches!(c, DeviceCommand::InputText { .. })));
    }

    #[tokio::test]
    async fn test_type_unicode_switches_and_restores_ime() {
        let device = Arc::new(FakeDevice::new(1080, 2400).with_ime("com.google.android.inputmethod.latin/.LatinIME"));
        executor(&device)
            .execute(
                &Action::Type {
                    text: "生椰拿铁".into(),
                    clear_first: false,
                },
                &grid(),
            )
            .await
            .unwrap();

        let commands = device.commands();
        assert_eq!(commands.len(), 4);
        assert_eq!(commands[0], DeviceCommand::GetInputMethod);
        assert_eq!(
            commands[1],
            DeviceCommand::SetInputMethod {
                ime: ADB_KEYBOARD_IME.into()
            }
        );
        assert_eq!(
            commands[2],
            DeviceCommand::BroadcastText {
                text: "生椰拿铁".into()
            }
        );
        assert_eq!(
            commands[3],
            DeviceCommand::SetInputMethod {
                ime: "com.google.android.inputmethod.latin/.LatinIME".into()
            }
        );
    }

    #[tokio::test]
    async fn test_scroll_and_awake() {
        let device = Arc::new(FakeDevice::new(1080, 2400));
        let exec = executor(&device);
        exec.execute(
            &Action::Scroll {
                direction: ScrollDirection::Down,
                amount: None,
            },
            &grid(),
        )
        .await
        .unwrap();
        exec.execute(
            &Action::Awake {
                package: "com.sankuai.meituan".into(),
            },
            &grid(),
        )
        .await
        .unwrap();
        assert_eq!(
            device.command_lines(),
            vec![
                "input swipe 540 1680 540 720 300",
                "am force-stop com.sankuai.meituan",
                "monkey -p com.sankuai.meituan -c android.intent.category.LAUNCHER 1",
            ]
        );
    }

    #[tokio::test]
    async fn test_complete_runs_nothing() {
        let device = Arc::new(FakeDevice::new(1080, 2400));
        let outcome = executor(&device)
            .execute(
                &Action::Complete {
                    success: true,
                    reason: "done".into(),
                },
                &grid(),
            )
            .await
            .unwrap();
        assert!(outcome.commands.is_empty());
        assert!(device.commands().is_empty());
    }

    #[tokio::test]
    async fn test_command_failure_is_error() {
        let device = Arc::new(FakeDevice::new(1080, 2400).fail_commands());
        let err = executor(&device)
            .execute(
                &Action::Click {
                    cell: CellLabel::new(0, 0),
                },
                &grid(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Adb(AdbError::CommandFailed { .. })));
    }

    #[test]
    fn test_scroll_swipe_geometry() {
        let g = grid();
        assert_eq!(
            scroll_swipe(ScrollDirection::Up, None, &g, 300),
            DeviceCommand::Swipe {
                start: (540, 720),
                end: (540, 1680),
                duration_ms: 300
            }
        );
        assert_eq!(
            scroll_swipe(ScrollDirection::Down, Some(1.0), &g, 300),
            DeviceCommand::Swipe {
                start: (540, 2399),
                end: (540, 0),
                duration_ms: 300
            }
        );
    }
}
