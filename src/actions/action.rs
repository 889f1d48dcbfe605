//! Closed set of device actions and the strict parser for model replies.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::get_package;
use crate::grid::{CellLabel, GridError, GridSpec};

/// Default scroll magnitude as a fraction of the screen height.
pub const DEFAULT_SCROLL_AMOUNT: f64 = 0.4;

static PACKAGE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+(\.[A-Za-z0-9_]+)*$").expect("valid package regex"));

/// Errors produced while turning a model reply into an [`Action`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("Malformed action reply: {reason}")]
    Malformed { raw: String, reason: String },
    #[error("Action targets a cell outside the grid: {source}")]
    OutOfRange {
        raw: String,
        #[source]
        source: GridError,
    },
}

impl ActionError {
    fn malformed(raw: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }

    /// The raw reply that failed to parse.
    pub fn raw(&self) -> &str {
        match self {
            Self::Malformed { raw, .. } | Self::OutOfRange { raw, .. } => raw,
        }
    }
}

/// Scroll direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

impl fmt::Display for ScrollDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScrollDirection::Up => write!(f, "up"),
            ScrollDirection::Down => write!(f, "down"),
        }
    }
}

/// A single device action chosen by the decision model.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Tap the center of a grid cell.
    Click { cell: CellLabel },
    /// Type text into the focused field, optionally clearing it first.
    Type { text: String, clear_first: bool },
    /// Swipe vertically. `amount` is a fraction of the screen height.
    Scroll {
        direction: ScrollDirection,
        amount: Option<f64>,
    },
    /// Launch an app by package name.
    Awake { package: String },
    /// Finish the task.
    Complete { success: bool, reason: String },
}

impl Action {
    /// Upper-case action name as used in the reply format.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Click { .. } => "CLICK",
            Action::Type { .. } => "TYPE",
            Action::Scroll { .. } => "SCROLL",
            Action::Awake { .. } => "AWAKE",
            Action::Complete { .. } => "COMPLETE",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Action::Complete { .. })
    }

    /// Click target, if this is a click.
    pub fn cell(&self) -> Option<CellLabel> {
        match self {
            Action::Click { cell } => Some(*cell),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Click { cell } => write!(f, "CLICK {}", cell),
            Action::Type { text, clear_first } => {
                if *clear_first {
                    write!(f, "TYPE {:?} (clear first)", text)
                } else {
                    write!(f, "TYPE {:?}", text)
                }
            }
            Action::Scroll { direction, .. } => write!(f, "SCROLL {}", direction),
            Action::Awake { package } => write!(f, "AWAKE {}", package),
            Action::Complete { success: true, .. } => write!(f, "COMPLETE"),
            Action::Complete { success: false, .. } => write!(f, "COMPLETE (failed)"),
        }
    }
}

/// A parsed model reply: the action plus the model's own commentary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionReply {
    pub action: Action,
    /// One-sentence rationale for this action.
    pub explain: String,
    /// Progress summary of the overall task.
    pub summary: Option<String>,
}

/// Reply fields as emitted by the model.
#[derive(Debug, Deserialize)]
struct RawReply {
    action: String,
    #[serde(default)]
    grid: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    clear_first: Option<bool>,
    #[serde(default)]
    amount: Option<f64>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    explain: Option<String>,
    #[serde(default)]
    summary: Option<String>,
}

/// Strip markdown code fences or surrounding prose from a JSON reply.
fn extract_json(response: &str) -> &str {
    let trimmed = response.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        // Drop the fence line (e.g. "```json") and the closing fence.
        let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
        return body.trim_end().trim_end_matches("```").trim();
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}

/// Parse a model reply into an [`ActionReply`], validating it against the grid.
///
/// Unknown action names and missing or invalid parameters are rejected;
/// nothing is coerced into a different action.
pub fn parse_action_reply(response: &str, grid: &GridSpec) -> Result<ActionReply, ActionError> {
    let json = extract_json(response);
    let raw: RawReply = serde_json::from_str(json)
        .map_err(|e| ActionError::malformed(response, format!("invalid JSON: {}", e)))?;

    let action = match raw.action.trim().to_uppercase().as_str() {
        "CLICK" => {
            let label = raw
                .grid
                .as_deref()
                .ok_or_else(|| ActionError::malformed(response, "CLICK requires a 'grid' field"))?;
            let cell = grid.parse_cell(label).map_err(|e| match e {
                GridError::OutOfRange { .. } => ActionError::OutOfRange {
                    raw: response.to_string(),
                    source: e,
                },
                other => ActionError::malformed(response, other.to_string()),
            })?;
            Action::Click { cell }
        }
        "TYPE" => {
            let text = raw
                .value
                .ok_or_else(|| ActionError::malformed(response, "TYPE requires a 'value' field"))?;
            if text.is_empty() {
                return Err(ActionError::malformed(response, "TYPE value must not be empty"));
            }
            Action::Type {
                text,
                clear_first: raw.clear_first.unwrap_or(false),
            }
        }
        "SCROLL" => {
            let direction = match raw.value.as_deref().map(|v| v.trim().to_lowercase()) {
                Some(v) if v == "up" => ScrollDirection::Up,
                Some(v) if v == "down" => ScrollDirection::Down,
                Some(v) => {
                    return Err(ActionError::malformed(
                        response,
                        format!("SCROLL value must be 'up' or 'down', got '{}'", v),
                    ))
                }
                None => {
                    return Err(ActionError::malformed(response, "SCROLL requires a 'value' field"))
                }
            };
            if let Some(amount) = raw.amount {
                if !(amount > 0.0 && amount <= 1.0) {
                    return Err(ActionError::malformed(
                        response,
                        format!("SCROLL amount must be in (0, 1], got {}", amount),
                    ));
                }
            }
            Action::Scroll {
                direction,
                amount: raw.amount,
            }
        }
        "AWAKE" => {
            let value = raw
                .value
                .map(|v| v.trim().to_string())
                .ok_or_else(|| ActionError::malformed(response, "AWAKE requires a 'value' field"))?;
            // Models sometimes name the app instead of its package.
            let package = get_package(&value).map(str::to_string).unwrap_or(value);
            if !PACKAGE_PATTERN.is_match(&package) {
                return Err(ActionError::malformed(
                    response,
                    format!("AWAKE value '{}' is not a package name", package),
                ));
            }
            Action::Awake { package }
        }
        "COMPLETE" => Action::Complete {
            success: raw.success.unwrap_or(true),
            reason: raw
                .reason
                .or_else(|| raw.explain.clone())
                .unwrap_or_default(),
        },
        other => {
            return Err(ActionError::malformed(
                response,
                format!(
                    "unknown action '{}', expected one of CLICK, TYPE, SCROLL, AWAKE, COMPLETE",
                    other
                ),
            ))
        }
    };

    Ok(ActionReply {
        action,
        explain: raw.explain.unwrap_or_default(),
        summary: raw.summary.filter(|s| !s.trim().is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> GridSpec {
        GridSpec::new(10, 20, 1080, 2400).unwrap()
    }

    #[test]
    fn test_parse_click() {
        let reply = parse_action_reply(
            r#"{"action": "CLICK", "grid": "E5", "explain": "Open search", "summary": "On home page"}"#,
            &grid(),
        )
        .unwrap();
        assert_eq!(reply.action, Action::Click { cell: CellLabel::new(4, 4) });
        assert_eq!(reply.explain, "Open search");
        assert_eq!(reply.summary.as_deref(), Some("On home page"));
    }

    #[test]
    fn test_parse_fenced_and_lowercase() {
        let response = "```json\n{\"action\": \"click\", \"grid\": \"a1\"}\n```";
        let reply = parse_action_reply(response, &grid()).unwrap();
        assert_eq!(reply.action.cell(), Some(CellLabel::new(0, 0)));
    }

    #[test]
    fn test_parse_json_with_surrounding_prose() {
        let response = "Next step:\n{\"action\": \"SCROLL\", \"value\": \"down\"}\nDone.";
        let reply = parse_action_reply(response, &grid()).unwrap();
        assert_eq!(
            reply.action,
            Action::Scroll {
                direction: ScrollDirection::Down,
                amount: None
            }
        );
    }

    #[test]
    fn test_parse_type_unicode() {
        let reply = parse_action_reply(
            r#"{"action": "TYPE", "value": "瑞幸咖啡 ☕", "clear_first": true}"#,
            &grid(),
        )
        .unwrap();
        assert_eq!(
            reply.action,
            Action::Type {
                text: "瑞幸咖啡 ☕".to_string(),
                clear_first: true
            }
        );
    }

    #[test]
    fn test_parse_awake_and_complete() {
        let awake =
            parse_action_reply(r#"{"action": "AWAKE", "value": "com.sankuai.meituan"}"#, &grid()).unwrap();
        assert_eq!(
            awake.action,
            Action::Awake {
                package: "com.sankuai.meituan".to_string()
            }
        );

        let by_name = parse_action_reply(r#"{"action": "AWAKE", "value": "美团"}"#, &grid()).unwrap();
        assert_eq!(by_name.action, awake.action);

        let complete =
            parse_action_reply(r#"{"action": "COMPLETE", "explain": "Order placed"}"#, &grid()).unwrap();
        assert_eq!(
            complete.action,
            Action::Complete {
                success: true,
                reason: "Order placed".to_string()
            }
        );

        let failed = parse_action_reply(
            r#"{"action": "COMPLETE", "success": false, "reason": "App not installed"}"#,
            &grid(),
        )
        .unwrap();
        assert!(matches!(failed.action, Action::Complete { success: false, .. }));
    }

    #[test]
    fn test_rejects_unknown_action() {
        let err = parse_action_reply(r#"{"action": "LONG_PRESS", "grid": "A1"}"#, &grid()).unwrap_err();
        assert!(matches!(err, ActionError::Malformed { .. }));
        assert!(err.to_string().contains("unknown action"));
    }

    #[test]
    fn test_rejects_missing_and_invalid_fields() {
        let g = grid();
        for response in [
            r#"{"action": "CLICK"}"#,
            r#"{"action": "CLICK", "grid": "middle"}"#,
            r#"{"action": "TYPE", "value": ""}"#,
            r#"{"action": "TYPE"}"#,
            r#"{"action": "SCROLL", "value": "left"}"#,
            r#"{"action": "SCROLL", "value": "up", "amount": 1.5}"#,
            r#"{"action": "AWAKE", "value": "com.app; reboot"}"#,
            r#"{"grid": "A1"}"#,
            "I think we should tap the search box",
        ] {
            let err = parse_action_reply(response, &g).unwrap_err();
            assert_eq!(err.raw(), response);
        }
    }

    #[test]
    fn test_out_of_range_cell() {
        let err = parse_action_reply(r#"{"action": "CLICK", "grid": "Z99"}"#, &grid()).unwrap_err();
        assert!(matches!(err, ActionError::OutOfRange { .. }));
    }

    #[test]
    fn test_display() {
        assert_eq!(Action::Click { cell: CellLabel::new(4, 4) }.to_string(), "CLICK E5");
        assert_eq!(
            Action::Scroll {
                direction: ScrollDirection::Up,
                amount: None
            }
            .to_string(),
            "SCROLL up"
        );
    }
}
