//! Model client for AI inference using OpenAI-compatible API.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::ops::AddAssign;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;

/// Default number of retry attempts for failed requests.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between retry attempts in seconds. Doubles per attempt.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 2;

/// Upper bound for a single backoff delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Model client errors.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("Request timed out after {0}s")]
    Timeout(u64),
    #[error("API error (HTTP {status}): {body}")]
    ApiError { status: u16, body: String },
    #[error("Failed to parse response: {0}")]
    ParseError(String),
    #[error("Response contained no choices")]
    EmptyResponse,
    #[error("Max retries exceeded after {0} attempts: {1}")]
    MaxRetriesExceeded(u32, String),
}

/// Price per million tokens, in dollars.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_per_million: 5.0,
            output_per_million: 25.0,
        }
    }
}

impl Pricing {
    /// Dollar cost of `usage`.
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        usage.prompt_tokens as f64 / 1_000_000.0 * self.input_per_million
            + usage.completion_tokens as f64 / 1_000_000.0 * self.output_per_million
    }
}

/// Token counts reported by the API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Configuration for the AI model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Maximum number of retry attempts for failed requests.
    pub max_retries: u32,
    /// Base delay between retry attempts in seconds.
    pub retry_delay_secs: u64,
    pub pricing: Pricing,
    /// Extra fields merged into the request body.
    pub extra_body: HashMap<String, Value>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model_name: "gpt-4o".to_string(),
            max_tokens: 1024,
            temperature: 0.0,
            timeout_secs: 60,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            pricing: Pricing::default(),
            extra_body: HashMap::new(),
        }
    }
}

impl ModelConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    /// Set the maximum number of retry attempts for failed requests.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base delay between retry attempts in seconds.
    pub fn with_retry_delay(mut self, delay_secs: u64) -> Self {
        self.retry_delay_secs = delay_secs;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_secs(self.retry_delay_secs.saturating_mul(factor)).min(MAX_RETRY_DELAY)
    }
}

/// An image prepared for the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime_type: String,
    /// Base64 payload.
    pub data: String,
    pub width: u32,
    pub height: u32,
}

impl EncodedImage {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// Response from the AI model.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: String,
    pub usage: TokenUsage,
    /// Wall time including retries.
    pub latency: Duration,
}

/// A chat-completion backend that chooses the agent's next action.
#[async_trait]
pub trait DecisionService: Send + Sync {
    /// Send `messages` (OpenAI chat format) and return the reply.
    async fn complete(&self, messages: &[Value]) -> Result<ModelResponse, ModelError>;

    /// Pricing used for cost accounting.
    fn pricing(&self) -> Pricing {
        Pricing::default()
    }
}

/// OpenAI API response structures.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

/// Client for interacting with OpenAI-compatible vision-language models.
pub struct ModelClient {
    config: ModelConfig,
    client: Client,
}

impl ModelClient {
    /// Create a new ModelClient with the given configuration.
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Send a request to the model, retrying transient failures with
    /// exponential backoff.
    pub async fn request(&self, messages: &[Value]) -> Result<ModelResponse, ModelError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let mut body = json!({
            "messages": messages,
            "model": self.config.model_name,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        });

        if let Value::Object(ref mut map) = body {
            for (key, value) in &self.config.extra_body {
                map.insert(key.clone(), value.clone());
            }
        }

        let start = Instant::now();
        let mut last_error: Option<ModelError> = None;
        let max_attempts = self.config.max_retries + 1; // +1 for the initial attempt

        for attempt in 1..=max_attempts {
            match self.send_request(&url, &body).await {
                Ok((content, usage)) => {
                    return Ok(ModelResponse {
                        content,
                        usage,
                        latency: start.elapsed(),
                    })
                }
                Err(e) if !Self::is_retryable_error(&e) => return Err(e),
                Err(e) => {
                    if attempt < max_attempts {
                        let delay = self.config.retry_delay(attempt);
                        tracing::warn!(
                            attempt,
                            max_attempts,
                            delay_secs = delay.as_secs(),
                            "Model request failed, retrying: {}",
                            e
                        );
                        sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(ModelError::MaxRetriesExceeded(
            max_attempts,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
        ))
    }

    /// Network errors, timeouts, rate limits and server errors are retryable.
    fn is_retryable_error(error: &ModelError) -> bool {
        match error {
            ModelError::RequestFailed(e) => !e.is_decode() && !e.is_builder(),
            ModelError::Timeout(_) => true,
            ModelError::ApiError { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
            }
            ModelError::ParseError(_)
            | ModelError::EmptyResponse
            | ModelError::MaxRetriesExceeded(_, _) => false,
        }
    }

    /// Send a single request to the API.
    async fn send_request(&self, url: &str, body: &Value) -> Result<(String, TokenUsage), ModelError> {
        let mut request = self
            .client
            .post(url)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request.send().await.map_err(|e| self.map_transport(e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ModelError::ApiError {
                status: status.as_u16(),
                body: error_text,
            });
        }

        let text = response.text().await.map_err(|e| self.map_transport(e))?;
        parse_completion(&text)
    }

    fn map_transport(&self, error: reqwest::Error) -> ModelError {
        if error.is_timeout() {
            ModelError::Timeout(self.config.timeout_secs)
        } else {
            ModelError::RequestFailed(error)
        }
    }
}

/// Extract the first choice's content and the token usage.
fn parse_completion(text: &str) -> Result<(String, TokenUsage), ModelError> {
    let completion: ChatCompletionResponse =
        serde_json::from_str(text).map_err(|e| ModelError::ParseError(e.to_string()))?;
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or(ModelError::EmptyResponse)?;
    Ok((
        choice.message.content.unwrap_or_default(),
        completion.usage.unwrap_or_default(),
    ))
}

#[async_trait]
impl DecisionService for ModelClient {
    async fn complete(&self, messages: &[Value]) -> Result<ModelResponse, ModelError> {
        self.request(messages).await
    }

    fn pricing(&self) -> Pricing {
        self.config.pricing
    }
}

/// Helper for building conversation messages.
pub struct MessageBuilder;

impl MessageBuilder {
    /// Create a system message.
    pub fn create_system_message(content: &str) -> Value {
        json!({
            "role": "system",
            "content": content
        })
    }

    /// Create a user message with images followed by text.
    pub fn create_user_message(text: &str, images: &[&EncodedImage]) -> Value {
        let mut content: Vec<Value> = images
            .iter()
            .map(|image| {
                json!({
                    "type": "image_url",
                    "image_url": { "url": image.data_url() }
                })
            })
            .collect();

        content.push(json!({
            "type": "text",
            "text": text
        }));

        json!({
            "role": "user",
            "content": content
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve canned HTTP responses in order, one per connection.
    async fn serve(responses: Vec<(u16, String)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                counter.fetch_add(1, Ordering::SeqCst);

                // Read the full request so the client never sees a reset.
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let n = socket.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&buf);
                    if let Some(header_end) = text.find("\r\n\r\n") {
                        let length = text[..header_end]
                            .lines()
                            .find_map(|l| {
                                let lower = l.to_ascii_lowercase();
                                lower
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                            })
                            .unwrap_or(0);
                        if buf.len() >= header_end + 4 + length {
                            break;
                        }
                    }
                }

                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}/v1", addr), hits)
    }

    fn completion(content: &str) -> String {
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 1200, "completion_tokens": 80}
        })
        .to_string()
    }

    fn client(base_url: String) -> ModelClient {
        ModelClient::new(
            ModelConfig::default()
                .with_base_url(base_url)
                .with_api_key("test-key")
                .with_max_retries(2)
                .with_retry_delay(0)
                .with_timeout(5),
        )
    }

    #[tokio::test]
    async fn test_request_parses_content_and_usage() {
        let (url, hits) = serve(vec![(200, completion(r#"{"action": "CLICK", "grid": "E5"}"#))]).await;
        let response = client(url).request(&[]).await.unwrap();
        assert_eq!(response.content, r#"{"action": "CLICK", "grid": "E5"}"#);
        assert_eq!(response.usage.prompt_tokens, 1200);
        assert_eq!(response.usage.completion_tokens, 80);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_retries_server_errors() {
        let (url, hits) = serve(vec![
            (503, "overloaded".to_string()),
            (429, "slow down".to_string()),
            (200, completion("ok")),
        ])
        .await;
        let response = client(url).request(&[]).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_request_does_not_retry_client_errors() {
        let (url, hits) = serve(vec![(401, "bad key".to_string()), (200, completion("ok"))]).await;
        let err = client(url).request(&[]).await.unwrap_err();
        assert!(matches!(err, ModelError::ApiError { status: 401, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_gives_up_after_max_retries() {
        let (url, _) = serve(vec![
            (500, "a".to_string()),
            (500, "b".to_string()),
            (500, "c".to_string()),
        ])
        .await;
        let err = client(url).request(&[]).await.unwrap_err();
        assert!(matches!(err, ModelError::MaxRetriesExceeded(3, _)));
    }

    #[test]
    fn test_parse_completion_errors() {
        assert!(matches!(
            parse_completion(r#"{"choices": []}"#),
            Err(ModelError::EmptyResponse)
        ));
        assert!(matches!(parse_completion("not json"), Err(ModelError::ParseError(_))));
        let (content, usage) = parse_completion(r#"{"choices": [{"message": {"content": "hi"}}]}"#).unwrap();
        assert_eq!(content, "hi");
        assert_eq!(usage, TokenUsage::default());
    }

    #[test]
    fn test_retry_delay_backoff() {
        let config = ModelConfig::default().with_retry_delay(2);
        assert_eq!(config.retry_delay(1), Duration::from_secs(2));
        assert_eq!(config.retry_delay(2), Duration::from_secs(4));
        assert_eq!(config.retry_delay(3), Duration::from_secs(8));
        assert_eq!(config.retry_delay(10), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_pricing_cost() {
        let usage = TokenUsage {
            prompt_tokens: 1_000_000,
            completion_tokens: 200_000,
        };
        let cost = Pricing::default().cost(&usage);
        assert!((cost - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_message_builder() {
        let system_msg = MessageBuilder::create_system_message("You are an assistant");
        assert_eq!(system_msg["role"], "system");

        let image = EncodedImage {
            mime_type: "image/jpeg".into(),
            data: "abc".into(),
            width: 1,
            height: 1,
        };
        let user_msg = MessageBuilder::create_user_message("Look at this", &[&image]);
        assert_eq!(user_msg["content"][0]["type"], "image_url");
        assert_eq!(user_msg["content"][0]["image_url"]["url"], "data:image/jpeg;base64,abc");
        assert_eq!(user_msg["content"][1]["text"], "Look at this");
    }
}
