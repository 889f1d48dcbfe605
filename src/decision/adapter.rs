//! Decision adapter: builds model requests and parses replies into actions.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::actions::{parse_action_reply, Action, ActionError};
use crate::config::{build_system_prompt, FORMAT_CORRECTION_HINT};
use crate::grid::GridSpec;
use crate::model::{DecisionService, EncodedImage, MessageBuilder, ModelError, Pricing, TokenUsage};

/// Decision errors.
#[derive(Error, Debug)]
pub enum DecisionError {
    /// The service replied, but the reply is not a usable action.
    #[error("{error}")]
    Malformed {
        error: ActionError,
        usage: TokenUsage,
        latency: Duration,
    },
    /// The service could not be reached or returned an error.
    #[error("Decision service failed: {0}")]
    Service(#[from] ModelError),
}

/// Everything the model sees for one decision.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub task: &'a str,
    /// Current capture with the grid overlay.
    pub image: &'a EncodedImage,
    /// Previous capture with its action marked.
    pub previous_image: Option<&'a EncodedImage>,
    /// Progress summary from the last decision.
    pub previous_summary: Option<&'a str>,
    /// One line per recent step, oldest first.
    pub history: &'a [String],
    pub repetition_warning: Option<&'a str>,
    /// Error from the last device command, if it failed.
    pub device_failure: Option<&'a str>,
    /// Set after a malformed reply.
    pub format_hint: bool,
}

/// A validated decision.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: Action,
    pub explain: String,
    pub summary: Option<String>,
    pub raw: String,
    pub usage: TokenUsage,
    pub latency: Duration,
}

/// Asks the decision service for the next action on a fixed grid.
pub struct DecisionAdapter {
    service: Arc<dyn DecisionService>,
    grid: GridSpec,
    system_prompt: String,
}

impl DecisionAdapter {
    pub fn new(service: Arc<dyn DecisionService>, grid: GridSpec) -> Self {
        let system_prompt = build_system_prompt(&grid);
        Self {
            service,
            grid,
            system_prompt,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn pricing(&self) -> Pricing {
        self.service.pricing()
    }

    /// Build the chat messages for one request.
    pub fn build_messages(&self, context: &DecisionContext<'_>) -> Vec<Value> {
        let mut images = Vec::with_capacity(2);
        if let Some(previous) = context.previous_image {
            images.push(previous);
        }
        images.push(context.image);

        vec![
            MessageBuilder::create_system_message(&self.system_prompt),
            MessageBuilder::create_user_message(&build_user_text(context), &images),
        ]
    }

    /// Request and validate the next action.
    pub async fn decide(&self, context: &DecisionContext<'_>) -> Result<Decision, DecisionError> {
        let messages = self.build_messages(context);
        let response = self.service.complete(&messages).await?;
        tracing::debug!(
            latency_ms = response.latency.as_millis() as u64,
            tokens = response.usage.total(),
            "Model replied: {}",
            response.content
        );

        match parse_action_reply(&response.content, &self.grid) {
            Ok(reply) => Ok(Decision {
                action: reply.action,
                explain: reply.explain,
                summary: reply.summary,
                raw: response.content,
                usage: response.usage,
                latency: response.latency,
            }),
            Err(error) => Err(DecisionError::Malformed {
                error,
                usage: response.usage,
                latency: response.latency,
            }),
        }
    }
}

/// Text part of the user message.
pub fn build_user_text(context: &DecisionContext<'_>) -> String {
    let mut message = format!("**User Goal:** {}\n\n", context.task);

    if let Some(summary) = context.previous_summary {
        message.push_str(&format!("**Progress so far:** {}\n\n", summary));
    }

    if !context.history.is_empty() {
        message.push_str("**Previous Actions:**\n");
        for (i, line) in context.history.iter().enumerate() {
            message.push_str(&format!("{}. {}\n", i + 1, line));
        }
        message.push('\n');
    }

    if let Some(error) = context.device_failure {
        message.push_str(&format!(
            "**Note**: The last action failed on the device: {}\n\n",
            error
        ));
    }

    if let Some(warning) = context.repetition_warning {
        message.push_str(&format!("⚠️ **Warning**: {}\n\n", warning));
    }

    if context.previous_image.is_some() {
        message.push_str(
            "The first image is the previous screen with the executed action marked; \
            the second image is the current screen.\n\n",
        );
    }

    if context.format_hint {
        message.push_str(FORMAT_CORRECTION_HINT);
        message.push_str("\n\n");
    }

    message.push_str("**What is the next action?** (Output JSON only)");
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::CellLabel;
    use crate::testing::{test_image, ScriptedModel};

    fn grid() -> GridSpec {
        GridSpec::new(10, 20, 1080, 2400).unwrap()
    }

    fn context<'a>(image: &'a EncodedImage, history: &'a [String]) -> DecisionContext<'a> {
        DecisionContext {
            task: "Order a latte on Meituan",
            image,
            previous_image: None,
            previous_summary: None,
            history,
            repetition_warning: None,
            device_failure: None,
            format_hint: false,
        }
    }

    #[test]
    fn test_user_text_sections() {
        let image = test_image();
        let history = vec!["AWAKE com.sankuai.meituan - Open Meituan".to_string()];
        let mut ctx = context(&image, &history);
        ctx.previous_summary = Some("Meituan is open");
        ctx.repetition_warning = Some("You clicked E5 3 times in a row.");
        ctx.device_failure = Some("input tap failed");
        ctx.format_hint = true;

        let text = build_user_text(&ctx);
        assert!(text.starts_with("**User Goal:** Order a latte on Meituan"));
        assert!(text.contains("**Progress so far:** Meituan is open"));
        assert!(text.contains("1. AWAKE com.sankuai.meituan - Open Meituan"));
        assert!(text.contains("You clicked E5 3 times in a row."));
        assert!(text.contains("input tap failed"));
        assert!(text.contains(FORMAT_CORRECTION_HINT));
        assert!(text.ends_with("(Output JSON only)"));
    }

    #[test]
    fn test_minimal_user_text() {
        let image = test_image();
        let text = build_user_text(&context(&image, &[]));
        assert!(!text.contains("Previous Actions"));
        assert!(!text.contains("Warning"));
    }

    #[test]
    fn test_messages_put_previous_image_first() {
        let adapter = DecisionAdapter::new(Arc::new(ScriptedModel::new(Vec::<String>::new())), grid());
        let image = test_image();
        let previous = EncodedImage {
            data: "previous".into(),
            ..test_image()
        };
        let mut ctx = context(&image, &[]);
        ctx.previous_image = Some(&previous);

        let messages = adapter.build_messages(&ctx);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert!(messages[0]["content"].as_str().unwrap().contains("Columns: A-J"));
        let url = messages[1]["content"][0]["image_url"]["url"].as_str().unwrap();
        assert!(url.ends_with("previous"));
        assert_eq!(messages[1]["content"][2]["type"], "text");
    }

    #[tokio::test]
    async fn test_decide_parses_reply() {
        let model = Arc::new(ScriptedModel::new([
            r#"{"action": "CLICK", "grid": "B3", "explain": "Open search", "summary": "Home page"}"#,
        ]));
        let adapter = DecisionAdapter::new(model.clone(), grid());
        let image = test_image();

        let decision = adapter.decide(&context(&image, &[])).await.unwrap();
        assert_eq!(decision.action, Action::Click { cell: CellLabel::new(1, 2) });
        assert_eq!(decision.summary.as_deref(), Some("Home page"));
        assert_eq!(decision.usage, ScriptedModel::USAGE);
        assert_eq!(model.requests(), 1);
    }

    #[tokio::test]
    async fn test_decide_reports_malformed_and_service_errors() {
        let model = Arc::new(ScriptedModel::new(["I would tap the search box"]));
        let adapter = DecisionAdapter::new(model, grid());
        let image = test_image();

        let err = adapter.decide(&context(&image, &[])).await.unwrap_err();
        match err {
            DecisionError::Malformed { error, usage, .. } => {
                assert_eq!(error.raw(), "I would tap the search box");
                assert_eq!(usage, ScriptedModel::USAGE);
            }
            other => panic!("unexpected error: {other}"),
        }

        // The script is exhausted, so the fake reports a service failure.
        let err = adapter.decide(&context(&image, &[])).await.unwrap_err();
        assert!(matches!(err, DecisionError::Service(_)));
    }
}
