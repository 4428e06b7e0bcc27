use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::{LlmRequest, LlmResponse};

pub const SYSTEM_PROMPT: &str = "You are a professional information-security log analysis expert.";

/// A remote (or stand-in) text completion service.
pub trait Oracle: Send + Sync {
    fn complete(&self, req: &LlmRequest) -> Result<LlmResponse>;
}

impl<F> Oracle for F
where
    F: Fn(&LlmRequest) -> Result<LlmResponse> + Send + Sync,
{
    fn complete(&self, req: &LlmRequest) -> Result<LlmResponse> {
        self(req)
    }
}

/// Reversible text rewriting applied around every oracle round trip.
pub trait Redactor: Send + Sync {
    fn redact(&self, text: &str) -> String;
    fn restore(&self, text: &str) -> String;
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub retry_limit: u32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 5000,
            temperature: 0.3,
            retry_limit: 3,
        }
    }
}

#[derive(Clone)]
pub struct CompletionClient {
    oracle: Arc<dyn Oracle>,
    redactor: Option<Arc<dyn Redactor>>,
    retry_delay: Duration,
}

impl CompletionClient {
    pub fn new(oracle: Arc<dyn Oracle>, retry_delay: Duration) -> Self {
        Self {
            oracle,
            redactor: None,
            retry_delay,
        }
    }

    pub fn with_redactor(mut self, redactor: Arc<dyn Redactor>) -> Self {
        self.redactor = Some(redactor);
        self
    }

    /// Sends `prompt` as the single user message and returns the response text.
    ///
    /// Fails immediately on an empty prompt. Transport failures are retried up to
    /// `options.retry_limit` attempts with a constant pause between attempts.
    pub fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        if prompt.trim().is_empty() {
            return Err(anyhow!("prompt must not be empty"));
        }
        let outbound = match &self.redactor {
            Some(redactor) => redactor.redact(prompt),
            None => prompt.to_string(),
        };
        let request = LlmRequest {
            system: Some(SYSTEM_PROMPT.to_string()),
            user: outbound,
            max_tokens: Some(options.max_tokens),
            temperature: Some(options.temperature),
        };
        let limit = options.retry_limit.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.oracle.complete(&request) {
                Ok(response) => {
                    tracing::debug!(
                        attempt,
                        prompt_tokens = response.prompt_tokens,
                        completion_tokens = response.completion_tokens,
                        total_tokens = response.total_tokens(),
                        "oracle call succeeded"
                    );
                    return Ok(match &self.redactor {
                        Some(redactor) => redactor.restore(&response.content),
                        None => response.content,
                    });
                }
                Err(err) => {
                    tracing::warn!("oracle call failed (attempt {attempt}/{limit}): {err}");
                    if attempt >= limit {
                        return Err(anyhow!(
                            "oracle call failed after {limit} attempts: {err}"
                        ));
                    }
                    thread::sleep(self.retry_delay);
                }
            }
        }
    }
}
