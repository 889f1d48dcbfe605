//! Text input helpers: plain `input text` escaping and ADB Keyboard input.

use std::time::Duration;

use super::channel::{CommandOutput, DeviceChannel};
use super::connection::AdbError;
use super::device::{DeviceCommand, ADB_KEYBOARD_IME, KEYCODE_A, KEYCODE_CTRL_LEFT, KEYCODE_DEL};

/// Characters the device shell would otherwise interpret.
const SHELL_SPECIAL: &[char] = &[
    '\\', '"', '\'', '`', '$', '&', '|', ';', '<', '>', '(', ')', '*', '?', '~', '#', '!', '[', ']',
    '{', '}',
];

/// Escape text for `input text`: spaces become `%s`, shell metacharacters are
/// backslash-escaped.
pub fn escape_input_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() * 2);
    for c in text.chars() {
        if c == ' ' {
            escaped.push_str("%s");
        } else {
            if SHELL_SPECIAL.contains(&c) {
                escaped.push('\\');
            }
            escaped.push(c);
        }
    }
    escaped
}

/// Whether `text` cannot be sent through plain `input text`.
///
/// `input text` only handles printable ASCII, and reads `%s` as a space, so
/// any `%` goes through ADB Keyboard as well.
pub fn needs_unicode_input(text: &str) -> bool {
    !text.chars().all(|c| c == ' ' || (c.is_ascii_graphic() && c != '%'))
}

/// Commands that select all text in the focused field and delete it.
pub fn clear_field_commands() -> Vec<DeviceCommand> {
    vec![
        DeviceCommand::KeyCombination {
            keycodes: vec![KEYCODE_CTRL_LEFT, KEYCODE_A],
        },
        DeviceCommand::KeyEvent {
            keycode: KEYCODE_DEL,
        },
    ]
}

/// Type arbitrary Unicode text through ADB Keyboard.
///
/// Switches to ADB Keyboard if it is not the current IME, broadcasts the
/// text, then restores the previous IME. The previous IME is restored even
/// when the broadcast fails.
///
/// # Note
/// Requires ADB Keyboard to be installed on the device.
/// See: https://github.com/senzhk/ADBKeyBoard
pub async fn type_unicode(
    channel: &dyn DeviceChannel,
    text: &str,
    settle: Duration,
) -> Result<Vec<CommandOutput>, AdbError> {
    let mut outputs = Vec::new();

    let current = channel.run(&DeviceCommand::GetInputMethod).await?;
    let original_ime = current.stdout.trim().to_string();
    outputs.push(current);

    let switched = !original_ime.contains(ADB_KEYBOARD_IME);
    if switched {
        outputs.push(
            channel
                .run(&DeviceCommand::SetInputMethod {
                    ime: ADB_KEYBOARD_IME.to_string(),
                })
                .await?,
        );
        tokio::time::sleep(settle).await;
    }

    let typed = channel
        .run(&DeviceCommand::BroadcastText {
            text: text.to_string(),
        })
        .await;

    let mut restored = None;
    if switched && !original_ime.is_empty() && original_ime != "null" {
        tokio::time::sleep(settle).await;
        match channel
            .run(&DeviceCommand::SetInputMethod {
                ime: original_ime.clone(),
            })
            .await
        {
            Ok(output) => restored = Some(output),
            Err(e) => tracing::warn!(ime = %original_ime, "Failed to restore input method: {}", e),
        }
    }

    outputs.push(typed?);
    outputs.extend(restored);
    Ok(outputs)
}
