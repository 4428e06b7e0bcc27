mod completion;

pub use completion::{CompletionClient, CompletionOptions, Oracle, Redactor, SYSTEM_PROMPT};

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::runtime::Runtime;

const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Program handed back by the offline provider for code-generation prompts:
/// every loaded table stacked into one result.
const LOCAL_PROGRAM: &str = r#"{
  "steps": [
    {"let": "result_table", "value": {"table": {"from": {"all_files": true}}}},
    {"let": "summary", "value": {"text": "{result_table.rows} records in total"}}
  ]
}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Deepseek,
    Local,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Deepseek => "deepseek",
            LlmProvider::Local => "local",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "openai" => Some(LlmProvider::OpenAi),
            "deepseek" => Some(LlmProvider::Deepseek),
            "local" => Some(LlmProvider::Local),
            _ => None,
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !matches!(self, LlmProvider::Local)
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "gpt-4.1-mini",
            LlmProvider::Deepseek => "deepseek-reasoner",
            LlmProvider::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub user: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl LlmResponse {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    provider: LlmProvider,
    model: String,
    config: ProviderConfig,
}

#[derive(Clone)]
enum ProviderConfig {
    ChatCompletions(ChatCompletionsConfig),
    Local,
}

#[derive(Clone)]
struct ChatCompletionsConfig {
    api_key: String,
    base_url: String,
}

impl LlmClient {
    pub fn new(
        provider: LlmProvider,
        model: impl Into<String>,
        api_key: Option<&str>,
        base_url: Option<&str>,
    ) -> Result<Self> {
        let model = model.into();
        let http = Client::new();
        let config = match provider {
            LlmProvider::OpenAi | LlmProvider::Deepseek => {
                let api_key = api_key
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .ok_or_else(|| anyhow!("api_key is not set for provider {}", provider.as_str()))?;
                validate_api_key(provider, api_key)?;
                let default_base = if provider == LlmProvider::OpenAi {
                    OPENAI_BASE_URL
                } else {
                    DEEPSEEK_BASE_URL
                };
                ProviderConfig::ChatCompletions(ChatCompletionsConfig {
                    api_key: api_key.to_string(),
                    base_url: base_url
                        .filter(|url| !url.trim().is_empty())
                        .unwrap_or(default_base)
                        .to_string(),
                })
            }
            LlmProvider::Local => ProviderConfig::Local,
        };
        Ok(Self {
            http,
            provider,
            model,
            config,
        })
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn chat(&self, req: &LlmRequest) -> Result<LlmResponse> {
        match &self.config {
            ProviderConfig::ChatCompletions(cfg) => self.chat_completions(cfg, req).await,
            ProviderConfig::Local => Ok(chat_local(req)),
        }
    }

    pub fn chat_blocking(&self, req: &LlmRequest) -> Result<LlmResponse> {
        let rt = Runtime::new().context("failed to create tokio runtime")?;
        rt.block_on(self.chat(req))
    }

    async fn chat_completions(
        &self,
        cfg: &ChatCompletionsConfig,
        req: &LlmRequest,
    ) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", cfg.base_url.trim_end_matches('/'));
        let mut messages = Vec::new();
        if let Some(system) = &req.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": req.user }));
        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });
        if let Some(max_tokens) = req.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = req.temperature {
            payload["temperature"] = json!(temperature);
        }
        let response = self
            .http
            .post(&url)
            .bearer_auth(&cfg.api_key)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("{} request failed", self.provider.as_str()))?;
        let value = decode_body(self.provider, response).await?;
        let content = extract_chat_text(&value).ok_or_else(|| {
            anyhow!("missing text in {} response", self.provider.as_str())
        })?;
        let usage: ChatUsage = value
            .get("usage")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default();
        Ok(LlmResponse {
            content,
            prompt_tokens: usage.prompt_tokens.unwrap_or(0),
            completion_tokens: usage.completion_tokens.unwrap_or(0),
        })
    }
}

impl Oracle for LlmClient {
    fn complete(&self, req: &LlmRequest) -> Result<LlmResponse> {
        self.chat_blocking(req)
    }
}

fn chat_local(req: &LlmRequest) -> LlmResponse {
    let content = if req.user.contains("data_dict") {
        LOCAL_PROGRAM.to_string()
    } else {
        summarize_text(&req.user, 60)
    };
    LlmResponse {
        content,
        prompt_tokens: 0,
        completion_tokens: 0,
    }
}

async fn decode_body(provider: LlmProvider, response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(anyhow!(
            "{} returned error (status {}): {}",
            provider.as_str(),
            status,
            body
        ));
    }
    serde_json::from_str(&body)
        .with_context(|| format!("failed to decode {} response", provider.as_str()))
}

fn summarize_text(text: &str, max_words: usize) -> String {
    if max_words == 0 {
        return String::new();
    }
    let cleaned = text
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<&str>>()
        .join(" ");
    cleaned
        .split_whitespace()
        .take(max_words)
        .collect::<Vec<&str>>()
        .join(" ")
}

fn validate_api_key(provider: LlmProvider, value: &str) -> Result<()> {
    match provider {
        LlmProvider::OpenAi | LlmProvider::Deepseek if !value.starts_with("sk-") => Err(anyhow!(
            "{} api_key must start with 'sk-'",
            provider.as_str()
        )),
        _ => Ok(()),
    }
}

fn extract_chat_text(value: &Value) -> Option<String> {
    let choice = value.get("choices")?.as_array()?.first()?;
    if let Some(text) = choice.get("text").and_then(|t| t.as_str()) {
        return Some(text.to_string());
    }
    let content = choice.get("message")?.get("content")?;
    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }
    content
        .as_array()?
        .iter()
        .find_map(|part| part.get("text").and_then(|t| t.as_str()))
        .map(str::to_string)
}

#[derive(Default, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}
