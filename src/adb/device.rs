//! Typed device commands and their `adb shell` argument lists.

use base64::{engine::general_purpose::STANDARD, Engine};
use std::fmt;

use super::input::escape_input_text;

/// IME id of ADB Keyboard, used for Unicode text input.
pub const ADB_KEYBOARD_IME: &str = "com.android.adbkeyboard/.AdbIME";

pub const KEYCODE_A: u32 = 29;
pub const KEYCODE_DEL: u32 = 67;
pub const KEYCODE_CTRL_LEFT: u32 = 113;

/// A single shell command run on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    Tap {
        x: u32,
        y: u32,
    },
    Swipe {
        start: (u32, u32),
        end: (u32, u32),
        duration_ms: u64,
    },
    /// Plain `input text`. The text is escaped when building arguments.
    InputText {
        text: String,
    },
    KeyEvent {
        keycode: u32,
    },
    KeyCombination {
        keycodes: Vec<u32>,
    },
    /// Send text through ADB Keyboard as a base64 broadcast.
    BroadcastText {
        text: String,
    },
    GetInputMethod,
    SetInputMethod {
        ime: String,
    },
    ForceStop {
        package: String,
    },
    LaunchApp {
        package: String,
    },
    WindowSize,
}

impl DeviceCommand {
    /// Arguments following `adb [-s serial] shell`.
    pub fn shell_args(&self) -> Vec<String> {
        match self {
            DeviceCommand::Tap { x, y } => vec![
                "input".into(),
                "tap".into(),
                x.to_string(),
                y.to_string(),
            ],
            DeviceCommand::Swipe {
                start,
                end,
                duration_ms,
            } => vec![
                "input".into(),
                "swipe".into(),
                start.0.to_string(),
                start.1.to_string(),
                end.0.to_string(),
                end.1.to_string(),
                duration_ms.to_string(),
            ],
            DeviceCommand::InputText { text } => {
                vec!["input".into(), "text".into(), escape_input_text(text)]
            }
            DeviceCommand::KeyEvent { keycode } => {
                vec!["input".into(), "keyevent".into(), keycode.to_string()]
            }
            DeviceCommand::KeyCombination { keycodes } => {
                let mut args = vec!["input".to_string(), "keycombination".to_string()];
                args.extend(keycodes.iter().map(u32::to_string));
                args
            }
            DeviceCommand::BroadcastText { text } => vec![
                "am".into(),
                "broadcast".into(),
                "-a".into(),
                "ADB_INPUT_B64".into(),
                "--es".into(),
                "msg".into(),
                STANDARD.encode(text.as_bytes()),
            ],
            DeviceCommand::GetInputMethod => vec![
                "settings".into(),
                "get".into(),
                "secure".into(),
                "default_input_method".into(),
            ],
            DeviceCommand::SetInputMethod { ime } => {
                vec!["ime".into(), "set".into(), ime.clone()]
            }
            DeviceCommand::ForceStop { package } => {
                vec!["am".into(), "force-stop".into(), package.clone()]
            }
            DeviceCommand::LaunchApp { package } => vec![
                "monkey".into(),
                "-p".into(),
                package.clone(),
                "-c".into(),
                "android.intent.category.LAUNCHER".into(),
                "1".into(),
            ],
            DeviceCommand::WindowSize => vec!["wm".into(), "size".into()],
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.shell_args().join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_args() {
        assert_eq!(
            DeviceCommand::Tap { x: 486, y: 540 }.to_string(),
            "input tap 486 540"
        );
        assert_eq!(
            DeviceCommand::Swipe {
                start: (540, 1680),
                end: (540, 720),
                duration_ms: 300
            }
            .to_string(),
            "input swipe 540 1680 540 720 300"
        );
        assert_eq!(
            DeviceCommand::KeyCombination {
                keycodes: vec![KEYCODE_CTRL_LEFT, KEYCODE_A]
            }
            .to_string(),
            "input keycombination 113 29"
        );
        assert_eq!(
            DeviceCommand::LaunchApp {
                package: "com.tencent.mm".into()
            }
            .to_string(),
            "monkey -p com.tencent.mm -c android.intent.category.LAUNCHER 1"
        );
    }

    #[test]
    fn test_broadcast_text_is_base64() {
        let args = DeviceCommand::BroadcastText {
            text: "你好".into(),
        }
        .shell_args();
        assert_eq!(args[3], "ADB_INPUT_B64");
        assert_eq!(args[6], STANDARD.encode("你好".as_bytes()));
    }

    #[test]
    fn test_input_text_is_escaped() {
        let args = DeviceCommand::InputText {
            text: "hello world".into(),
        }
        .shell_args();
        assert_eq!(args, vec!["input", "text", "hello%sworld"]);
    }
}
