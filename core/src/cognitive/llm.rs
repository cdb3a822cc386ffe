//! OpenAI-compatible chat-completions client: the minimal `generate`/`chat`/
//! `generate_stream` contract the cognitive loop depends on.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::Instrument;

use crate::{CognitiveError, CognitiveResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }
}

/// `{base_url, model, api_key?, temperature, max_tokens, timeout_ms}`.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/v1".to_string(),
            model: "default".to_string(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 4096,
            timeout_ms: 30_000,
        }
    }
}

impl LlmConfig {
    pub fn deepseek() -> Self {
        Self {
            base_url: "https://api.deepseek.com/v1".to_string(),
            model: "deepseek-chat".to_string(),
            api_key: std::env::var("DEEPSEEK_API_KEY").ok(),
            ..Default::default()
        }
    }

    pub fn openai() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            ..Default::default()
        }
    }

    pub fn local() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/v1".to_string(),
            model: "local-model".to_string(),
            api_key: None,
            ..Default::default()
        }
    }

    /// Resolves a preset by name (`"deepseek" | "openai" | "local"`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "deepseek" => Some(Self::deepseek()),
            "openai" => Some(Self::openai()),
            "local" => Some(Self::local()),
            _ => None,
        }
    }

    /// As `from_name`, but lets a project-level `[llm.<name>]` override
    /// section (caller-supplied, since parsing the project's own config
    /// file is out of scope for this crate) take precedence field-by-field.
    pub fn from_project_config(name: &str, overrides: Option<&serde_json::Value>) -> Option<Self> {
        let mut config = Self::from_name(name)?;
        if let Some(overrides) = overrides {
            if let Some(v) = overrides.get("base_url").and_then(|v| v.as_str()) {
                config.base_url = v.to_string();
            }
            if let Some(v) = overrides.get("model").and_then(|v| v.as_str()) {
                config.model = v.to_string();
            }
            if let Some(v) = overrides.get("api_key").and_then(|v| v.as_str()) {
                config.api_key = Some(v.to_string());
            }
            if let Some(v) = overrides.get("temperature").and_then(|v| v.as_f64()) {
                config.temperature = v as f32;
            }
            if let Some(v) = overrides.get("max_tokens").and_then(|v| v.as_u64()) {
                config.max_tokens = v as u32;
            }
            if let Some(v) = overrides.get("timeout_ms").and_then(|v| v.as_u64()) {
                config.timeout_ms = v;
            }
        }
        Some(config)
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: Option<ChatMessage>,
    delta: Option<ChatDelta>,
}

#[derive(Debug, Deserialize)]
struct ChatDelta {
    content: Option<String>,
}

/// Minimal LLM contract the cognitive loop relies on.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, prompt: &str, system: Option<&str>, temperature: Option<f32>, max_tokens: Option<u32>) -> CognitiveResult<String>;

    async fn chat(&self, messages: Vec<ChatMessage>, temperature: Option<f32>, max_tokens: Option<u32>) -> CognitiveResult<String>;

    async fn generate_stream(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> CognitiveResult<BoxStream<'static, CognitiveResult<String>>>;
}

/// HTTP implementation speaking the OpenAI-compatible `/chat/completions` contract.
pub struct HttpLlmProvider {
    client: reqwest::Client,
    config: LlmConfig,
}

impl HttpLlmProvider {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn request_builder(&self, body: serde_json::Value) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let mut builder = self.client.post(url).json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn chat_completion(&self, messages: &[ChatMessage], temperature: Option<f32>, max_tokens: Option<u32>) -> CognitiveResult<String> {
        let span = tracing::info_span!("llm.generate", model = %self.config.model);

        async {
            let body = json!({
                "model": self.config.model,
                "messages": messages,
                "temperature": temperature.unwrap_or(self.config.temperature),
                "max_tokens": max_tokens.unwrap_or(self.config.max_tokens),
            });

            let timeout = std::time::Duration::from_millis(self.config.timeout_ms);
            let response = tokio::time::timeout(timeout, self.request_builder(body).send())
                .await
                .map_err(|_| CognitiveError::LlmTimeout)??;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(CognitiveError::LlmHttpError { status: status.as_u16(), body });
            }

            let parsed: ChatCompletionResponse = response.json().await?;
            let content = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message)
                .map(|m| m.content)
                .unwrap_or_default();
            Ok(content)
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn generate(&self, prompt: &str, system: Option<&str>, temperature: Option<f32>, max_tokens: Option<u32>) -> CognitiveResult<String> {
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));
        self.chat_completion(&messages, temperature, max_tokens).await
    }

    async fn chat(&self, messages: Vec<ChatMessage>, temperature: Option<f32>, max_tokens: Option<u32>) -> CognitiveResult<String> {
        self.chat_completion(&messages, temperature, max_tokens).await
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> CognitiveResult<BoxStream<'static, CognitiveResult<String>>> {
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));

        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": temperature.unwrap_or(self.config.temperature),
            "max_tokens": max_tokens.unwrap_or(self.config.max_tokens),
            "stream": true,
        });

        let response = self.request_builder(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CognitiveError::LlmHttpError { status: status.as_u16(), body });
        }

        let byte_stream = response.bytes_stream();
        let token_stream = byte_stream
            .map(|chunk| chunk.map_err(CognitiveError::from))
            .flat_map(|chunk| {
                let tokens: Vec<CognitiveResult<String>> = match chunk {
                    Ok(bytes) => parse_sse_chunk(&bytes).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(tokens)
            });

        Ok(Box::pin(token_stream))
    }
}

/// Parses one SSE chunk of `data: {...}` lines (possibly several, possibly
/// partial) into the `delta.content` fragments they carry. `data: [DONE]`
/// yields nothing.
fn parse_sse_chunk(bytes: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(bytes);
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data: ") else { continue };
        if data.trim() == "[DONE]" {
            continue;
        }
        if let Ok(parsed) = serde_json::from_str::<ChatCompletionResponse>(data) {
            if let Some(choice) = parsed.choices.into_iter().next() {
                if let Some(delta) = choice.delta {
                    if let Some(content) = delta.content {
                        out.push(content);
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_carry_distinct_defaults() {
        let deepseek = LlmConfig::deepseek();
        let openai = LlmConfig::openai();
        assert_ne!(deepseek.base_url, openai.base_url);
        assert_ne!(deepseek.model, openai.model);
    }

    #[test]
    fn from_name_resolves_known_presets_only() {
        assert!(LlmConfig::from_name("deepseek").is_some());
        assert!(LlmConfig::from_name("openai").is_some());
        assert!(LlmConfig::from_name("local").is_some());
        assert!(LlmConfig::from_name("nonexistent").is_none());
    }

    #[test]
    fn project_config_overrides_preset_fields() {
        let overrides = json!({ "model": "custom-model", "temperature": 0.2 });
        let config = LlmConfig::from_project_config("local", Some(&overrides)).unwrap();
        assert_eq!(config.model, "custom-model");
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.base_url, LlmConfig::local().base_url);
    }

    #[test]
    fn parses_sse_delta_content_and_ignores_done() {
        let chunk = b"data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\ndata: [DONE]\n\n";
        let tokens = parse_sse_chunk(chunk);
        assert_eq!(tokens, vec!["hel".to_string(), "lo".to_string()]);
    }
}
