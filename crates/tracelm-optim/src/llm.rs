//! The text-generation capability used to propose parameter updates.
//!
//! [`LlmProvider`] is the seam: the optimizer only needs "prompt in, text
//! out". [`OpenAiCompatibleProvider`] talks to any OpenAI-compatible
//! chat-completions endpoint; [`ScriptedProvider`] replays canned replies.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::LlmConfig;
use crate::error::OptimError;

/// One request to the provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposalRequest {
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    /// Ask the provider to answer with a JSON object.
    pub json_mode: bool,
}

/// Proposes new parameter values as free text.
pub trait LlmProvider {
    fn propose(
        &self,
        request: &ProposalRequest,
    ) -> impl Future<Output = Result<String, OptimError>> + Send;
}

impl<P: LlmProvider + Sync> LlmProvider for &P {
    fn propose(
        &self,
        request: &ProposalRequest,
    ) -> impl Future<Output = Result<String, OptimError>> + Send {
        (**self).propose(request)
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat completions
// ---------------------------------------------------------------------------

/// Chat-completions client for `openrouter` and `openai_compatible`.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleProvider {
    config: LlmConfig,
    endpoint: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    /// Resolves the endpoint up front so misconfiguration fails before the
    /// first step.
    pub fn new(config: LlmConfig) -> Result<Self, OptimError> {
        let provider = config.provider.as_deref().unwrap_or_default();
        let base_url = match provider {
            "openrouter" => config
                .api_base_url
                .clone()
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string()),
            "openai_compatible" => config.api_base_url.clone().ok_or_else(|| {
                OptimError::Config("openai_compatible provider requires api_base_url".to_string())
            })?,
            other => {
                return Err(OptimError::Config(format!(
                    "unsupported provider '{}': use openrouter or openai_compatible",
                    other
                )))
            }
        };
        if config.model.is_none() {
            return Err(OptimError::Config("no model configured".to_string()));
        }

        Ok(OpenAiCompatibleProvider {
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            config,
            client: reqwest::Client::new(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_body(&self, request: &ProposalRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        let system_prompt = request
            .system_prompt
            .as_ref()
            .or(self.config.system_prompt.as_ref());
        if let Some(system_prompt) = system_prompt {
            messages.push(json!({ "role": "system", "content": system_prompt }));
        }
        messages.push(json!({ "role": "user", "content": request.user_prompt }));

        let mut body = json!({
            "model": self.config.model.clone().unwrap_or_default(),
            "messages": messages,
        });
        if request.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }
}

impl LlmProvider for OpenAiCompatibleProvider {
    async fn propose(&self, request: &ProposalRequest) -> Result<String, OptimError> {
        let api_key = self.config.api_key.clone().unwrap_or_default();
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&self.request_body(request));

        if self.config.provider.as_deref() == Some("openrouter") {
            req = req.header("X-Title", "tracelm");
        }

        let response = req
            .send()
            .await
            .map_err(|err| OptimError::Provider(format!("request failed: {}", err)))?;

        let status = response.status();
        let body_text = response
            .text()
            .await
            .map_err(|err| OptimError::Provider(format!("response read failed: {}", err)))?;

        if !status.is_success() {
            return Err(OptimError::Provider(format!(
                "request failed ({}): {}",
                status, body_text
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&body_text)
            .map_err(|err| OptimError::Provider(format!("response parse failed: {}", err)))?;

        // An empty reply is a valid (if useless) proposal.
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|s| s.trim().to_string())
            .unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// Scripted replies
// ---------------------------------------------------------------------------

/// Replays queued replies in order and records every request it receives.
/// Once the queue is empty it answers with an empty string.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<ProposalRequest>>,
}

impl ScriptedProvider {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScriptedProvider {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(reply.into());
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ProposalRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl LlmProvider for ScriptedProvider {
    async fn propose(&self, request: &ProposalRequest) -> Result<String, OptimError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        Ok(self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_default())
    }
}
