use reqwest::Client;
use std::env;
use std::error::Error;
use std::fmt;
use std::time::Duration;

use super::endpoints::{ChatCompletionRequest, ChatCompletionResponse, Provider};

const CHAT_REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug)]
pub enum ApiConnectionError {
    MissingApiKey(String),
    NetworkError(reqwest::Error),
    SerializationError(serde_json::Error),
    ApiError {
        status: reqwest::StatusCode,
        error_body: String,
    },
    EmptyResponse,
}

impl fmt::Display for ApiConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiConnectionError::MissingApiKey(key_name) => {
                write!(f, "API key not found in environment: {}", key_name)
            }
            ApiConnectionError::NetworkError(err) => write!(f, "Network error: {}", err),
            ApiConnectionError::SerializationError(err) => {
                write!(f, "Serialization error: {}", err)
            }
            ApiConnectionError::ApiError { status, error_body } => {
                write!(f, "API error {}: {}", status, error_body)
            }
            ApiConnectionError::EmptyResponse => {
                write!(f, "API returned no response choices")
            }
        }
    }
}

impl Error for ApiConnectionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ApiConnectionError::NetworkError(err) => Some(err),
            ApiConnectionError::SerializationError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiConnectionError {
    fn from(err: reqwest::Error) -> Self {
        ApiConnectionError::NetworkError(err)
    }
}

impl From<serde_json::Error> for ApiConnectionError {
    fn from(err: serde_json::Error) -> Self {
        ApiConnectionError::SerializationError(err)
    }
}

impl Provider {
    pub fn openai_compatible(api_key_env_var: &str, base_url: &str, model: &str) -> Self {
        Self::OpenAiCompatible {
            api_key_env_var: api_key_env_var.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Provider::OpenAiCompatible { model, .. } => model,
        }
    }

    pub async fn call_chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ApiConnectionError> {
        match self {
            Provider::OpenAiCompatible {
                api_key_env_var,
                base_url,
                ..
            } => {
                let actual_api_key = env::var(api_key_env_var)
                    .map_err(|_| ApiConnectionError::MissingApiKey(api_key_env_var.clone()))?;

                let client = Client::new();
                let url = format!("{}/chat/completions", base_url);

                let response = client
                    .post(&url)
                    .bearer_auth(actual_api_key)
                    .header("Content-Type", "application/json")
                    .timeout(Duration::from_secs(CHAT_REQUEST_TIMEOUT_SECS))
                    .json(&request)
                    .send()
                    .await?;

                if response.status().is_success() {
                    let chat_response = response.json::<ChatCompletionResponse>().await?;
                    Ok(chat_response)
                } else {
                    let status = response.status();
                    let error_body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Failed to read error body".to_string());
                    Err(ApiConnectionError::ApiError { status, error_body })
                }
            }
        }
    }

    /// Convenience wrapper that returns the first choice's content with any
    /// markdown code fences stripped.
    pub async fn chat_text(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<String, ApiConnectionError> {
        let response = self.call_chat_completion(request).await?;
        let choice = response
            .choices
            .first()
            .ok_or(ApiConnectionError::EmptyResponse)?;
        Ok(strip_code_fences(&choice.message.content).to_string())
    }
}

/// LLMs often wrap JSON payloads in ```json fences despite instructions not to.
pub fn strip_code_fences(content: &str) -> &str {
    let mut trimmed = content.trim();
    if trimmed.starts_with("```json") && trimmed.ends_with("```") {
        trimmed = trimmed
            .trim_start_matches("```json")
            .trim_end_matches("```")
            .trim();
    } else if trimmed.starts_with("```") && trimmed.ends_with("```") {
        trimmed = trimmed
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
    }
    trimmed
}
