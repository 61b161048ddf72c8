//! Model provider abstraction.
//!
//! The [`ModelClient`] trait decouples the session loop from the actual model
//! backend (an OpenAI-compatible chat completions API). Tests use scripted
//! clients that return predetermined responses without touching the network.

use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Role, Turn};
use crate::io::config::ProviderConfig;

/// Failure to obtain a usable response from the model.
///
/// Every variant is model-correctable from the loop's point of view: the
/// attempt is recorded as failed and the next request asks for the full
/// project again.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("provider returned an empty response")]
    EmptyResponse,
    #[error("malformed response: {reason}")]
    Malformed { reason: String },
}

/// Abstraction over model backends.
pub trait ModelClient {
    /// Send the full conversation and return the model's reply verbatim.
    fn complete(&self, history: &[Turn]) -> Result<String, ProviderError>;
}

impl<T: ModelClient + ?Sized> ModelClient for &T {
    fn complete(&self, history: &[Turn]) -> Result<String, ProviderError> {
        (**self).complete(history)
    }
}

/// Client for OpenAI-compatible `/chat/completions` endpoints (DeepSeek by default).
pub struct OpenAiCompatibleClient {
    client: Client,
    endpoint: String,
    api_key: String,
    config: ProviderConfig,
}

impl OpenAiCompatibleClient {
    /// Build a client, reading the API key from the configured environment variable.
    pub fn from_env(config: &ProviderConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow!("environment variable {} is not set", config.api_key_env))?;
        Self::new(config, api_key)
    }

    pub fn new(config: &ProviderConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: chat_endpoint(&config.base_url),
            api_key,
            config: config.clone(),
        })
    }
}

impl ModelClient for OpenAiCompatibleClient {
    #[instrument(skip_all, fields(model = %self.config.model, turns = history.len()))]
    fn complete(&self, history: &[Turn]) -> Result<String, ProviderError> {
        let body = ChatRequest::from_history(&self.config, history);
        let started = Instant::now();
        info!(endpoint = %self.endpoint, "requesting completion");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        debug!(
            status = status.as_u16(),
            bytes = text.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "completion received"
        );

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(status = status.as_u16(), "provider rejected credentials");
            return Err(ProviderError::Authentication(text));
        }
        if !status.is_success() {
            warn!(status = status.as_u16(), "provider returned an error");
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        extract_content(&text)
    }
}

fn chat_endpoint(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

impl<'a> ChatRequest<'a> {
    fn from_history(config: &'a ProviderConfig, history: &'a [Turn]) -> Self {
        let messages = history
            .iter()
            .map(|turn| ChatMessage {
                role: match turn.role {
                    Role::User => "user",
                    Role::Model => "assistant",
                },
                content: &turn.content,
            })
            .collect();
        Self {
            model: &config.model,
            messages,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            stream: false,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

fn extract_content(body: &str) -> Result<String, ProviderError> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|err| ProviderError::Malformed {
            reason: format!("unreadable completion body: {err}"),
        })?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .unwrap_or_default();
    if content.is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_maps_roles_and_settings() {
        let config = ProviderConfig::default();
        let history = vec![Turn::user("build"), Turn::model("{}"), Turn::user("fix")];
        let body = serde_json::to_value(ChatRequest::from_history(&config, &history))
            .expect("serialize");

        assert_eq!(body["model"], "deepseek-chat");
        assert_eq!(body["stream"], false);
        assert_eq!(body["response_format"]["type"], "json_object");
        let roles: Vec<&str> = body["messages"]
            .as_array()
            .expect("messages")
            .iter()
            .map(|m| m["role"].as_str().expect("role"))
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert_eq!(body["messages"][2]["content"], "fix");
    }

    #[test]
    fn extracts_first_choice_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"  {\"out_file\":[]}\n"}}]}"#;
        assert_eq!(extract_content(body).expect("content"), r#"{"out_file":[]}"#);
    }

    #[test]
    fn empty_choices_is_empty_response() {
        assert_eq!(
            extract_content(r#"{"choices":[]}"#),
            Err(ProviderError::EmptyResponse)
        );
        assert_eq!(
            extract_content(r#"{"choices":[{"message":{"content":null}}]}"#),
            Err(ProviderError::EmptyResponse)
        );
    }

    #[test]
    fn unreadable_body_is_malformed() {
        let err = extract_content("<html>").unwrap_err();
        assert!(matches!(err, ProviderError::Malformed { .. }));
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        assert_eq!(
            chat_endpoint("https://api.deepseek.com/"),
            "https://api.deepseek.com/chat/completions"
        );
    }
}
