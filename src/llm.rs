use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// Per-call generation hints. Soft limits; implementations may clamp.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 1024,
        }
    }
}

/// Text generator used for aspect extraction, sub-query generation, and
/// synthesis. Optional everywhere: on `Err` the engine falls back to
/// heuristics, so implementations should fail fast rather than retry
/// forever.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    /// Servers send `content: null` for some finish reasons.
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client (LM Studio, Ollama, vLLM, etc.).
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpLlmClient {
    /// Read `LLM_BASE_URL`, `LLM_MODEL`, and `LLM_API_KEY` from the
    /// environment (via dotenv), with local-server defaults.
    pub fn from_env() -> Result<Self> {
        let base_url = dotenv::var("LLM_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:1234/v1".to_string());
        let model = dotenv::var("LLM_MODEL").unwrap_or_else(|_| "local-model".to_string());
        let api_key = dotenv::var("LLM_API_KEY").ok().filter(|k| !k.is_empty());

        Self::build(base_url, model, api_key)
    }

    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Self::build(base_url.into(), model.into(), None)
    }

    fn build(base_url: String, model: String, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            model,
            api_key,
        })
    }

    /// Build the completions URL from the configured base. Accepts a bare
    /// host, a `/v1` base, or an already-complete endpoint; whatever path
    /// segments are missing get appended.
    fn chat_url(&self) -> String {
        let mut url = self.base_url.trim_end_matches('/').to_string();
        if !url.ends_with("/chat/completions") {
            if !url.ends_with("/v1") {
                url.push_str("/v1");
            }
            url.push_str("/chat/completions");
        }
        url
    }

    async fn chat(&self, messages: &[Message], options: &GenerateOptions) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let mut builder = self.client.post(self.chat_url()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let reply: ChatResponse = builder
            .send()
            .await
            .context("LLM request failed")?
            .error_for_status()
            .context("LLM returned an error status")?
            .json()
            .await
            .context("LLM reply was not valid chat-completion JSON")?;

        Ok(reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if !system_prompt.is_empty() {
            messages.push(Message {
                role: "system".to_string(),
                content: system_prompt.to_string(),
            });
        }
        messages.push(Message {
            role: "user".to_string(),
            content: user_prompt.to_string(),
        });
        self.chat(&messages, options).await
    }
}
