//! OpenAI-compatible chat completions.

use super::sse::{read_events, Flow};
use super::{check_status, endpoint, send_cancellable, ChunkSink, DriverOptions, ProtocolDriver};
use crate::error::LlmError;
use crate::message::{LlmResponse, Message};
use crate::models::{display_name_from_id, AvailableModelEntry, ModelProfile};
use crate::service::ServiceConfiguration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Gemini's compatibility layer has no working models endpoint.
pub const GEMINI_MODELS_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai/models";

const GEMINI_MODELS: &[&str] = &[
    "gemini-2.0-flash-exp",
    "gemini-1.5-flash",
    "gemini-1.5-flash-8b",
    "gemini-1.5-pro",
];

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logit_bias: Option<&'a HashMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logprobs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_logprobs: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    store: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
    #[serde(default)]
    total_tokens: Option<u32>,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelData>,
}

#[derive(Debug, Deserialize)]
struct ModelData {
    id: String,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

// ============================================================================
// Driver
// ============================================================================

pub struct OpenAiDriver {
    configuration: ServiceConfiguration,
    api_key: Option<String>,
    client: Client,
    request_timeout: Duration,
    discovery_timeout: Duration,
    stream_idle_timeout: Duration,
}

impl OpenAiDriver {
    pub fn new(
        configuration: ServiceConfiguration,
        api_key: Option<String>,
        client: Client,
        options: &DriverOptions,
    ) -> Self {
        Self {
            configuration,
            api_key,
            client,
            request_timeout: options.request_timeout,
            discovery_timeout: options.discovery_timeout,
            stream_idle_timeout: options.stream_idle_timeout,
        }
    }

    fn build_body<'a>(
        messages: &'a [Message],
        profile: &'a ModelProfile,
        stream: bool,
    ) -> ChatCompletionRequest<'a> {
        let settings = &profile.model_settings;
        ChatCompletionRequest {
            model: &profile.model_entry.id,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream,
            temperature: settings.temperature,
            top_p: settings.top_p,
            n: settings.n,
            // Newer models reject max_tokens alongside max_completion_tokens.
            max_tokens: if settings.max_completion_tokens.is_some() {
                None
            } else {
                settings.max_tokens
            },
            max_completion_tokens: settings.max_completion_tokens,
            frequency_penalty: settings.frequency_penalty,
            presence_penalty: settings.presence_penalty,
            logit_bias: settings.logit_bias.as_ref(),
            logprobs: settings.logprobs,
            top_logprobs: settings.top_logprobs,
            reasoning_effort: settings.reasoning_effort.as_deref(),
            store: settings.store,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    fn chat_request(
        &self,
        messages: &[Message],
        profile: &ModelProfile,
        stream: bool,
    ) -> Result<reqwest::RequestBuilder, LlmError> {
        let url = endpoint(&self.configuration, "chat/completions")?;
        tracing::debug!(
            service = %self.configuration.id,
            model = %profile.model_entry.id,
            url = %url,
            stream,
            "Outgoing chat request"
        );
        let body = Self::build_body(messages, profile, stream);
        let request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(&body);
        Ok(self.authorize(request))
    }

    fn gemini_models(&self) -> Result<Vec<AvailableModelEntry>, LlmError> {
        if !self.api_key.as_deref().is_some_and(|k| !k.is_empty()) {
            return Err(LlmError::AuthenticationError);
        }
        let now = Utc::now();
        Ok(GEMINI_MODELS
            .iter()
            .map(|id| AvailableModelEntry {
                id: id.to_string(),
                display_name: None,
                provider: "Google Gemini".to_string(),
                created: Some(now),
                description: Some(
                    "Added from hardcoded list - Gemini's OpenAI compatibility doesn't support the models endpoint"
                        .to_string(),
                ),
            })
            .collect())
    }
}

fn into_response(body: ChatCompletionResponse) -> LlmResponse {
    let usage = body.usage.unwrap_or_default();
    let Some(choice) = body.choices.into_iter().next() else {
        return LlmResponse::complete("");
    };

    let mut response = LlmResponse::complete(choice.message.content.unwrap_or_default())
        .with_usage(usage.prompt_tokens, usage.completion_tokens, usage.total_tokens)
        .with_finish_reason(choice.finish_reason);
    response.refusal = choice.message.refusal;
    response.cache_read_input_tokens = usage.prompt_tokens_details.and_then(|d| d.cached_tokens);
    response
}

#[async_trait]
impl ProtocolDriver for OpenAiDriver {
    fn configuration(&self) -> &ServiceConfiguration {
        &self.configuration
    }

    async fn list_models(&self) -> Result<Vec<AvailableModelEntry>, LlmError> {
        let url = endpoint(&self.configuration, "models")?;
        if url.as_str() == GEMINI_MODELS_URL {
            return self.gemini_models();
        }

        tracing::debug!(service = %self.configuration.id, url = %url, "Listing models");
        let request = self.authorize(self.client.get(url).timeout(self.discovery_timeout));
        let response = request.send().await?;
        check_status(&response)?;

        let bytes = response.bytes().await?;
        tracing::debug!(service = %self.configuration.id, bytes = bytes.len(), "Models response");
        let listing: ModelsResponse = serde_json::from_slice(&bytes)?;

        let provider = self.configuration.name.clone();
        Ok(listing
            .data
            .into_iter()
            .filter(|m| !m.id.contains("audio"))
            .map(|m| AvailableModelEntry {
                display_name: Some(m.display_name.unwrap_or_else(|| display_name_from_id(&m.id))),
                created: m.created.and_then(|secs| DateTime::from_timestamp(secs, 0)),
                description: m.description,
                provider: provider.clone(),
                id: m.id,
            })
            .collect())
    }

    async fn send_message(
        &self,
        messages: &[Message],
        profile: &ModelProfile,
    ) -> Result<LlmResponse, LlmError> {
        let request = self
            .chat_request(messages, profile, false)?
            .timeout(self.request_timeout);
        let response = request.send().await?;
        check_status(&response)?;

        let bytes = response.bytes().await?;
        tracing::debug!(model = %profile.model_entry.id, bytes = bytes.len(), "Chat response");
        let body: ChatCompletionResponse = serde_json::from_slice(&bytes)?;
        Ok(into_response(body))
    }

    async fn stream_message(
        &self,
        messages: &[Message],
        profile: &ModelProfile,
        on_chunk: &mut ChunkSink<'_>,
        cancel: CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        let request = self
            .chat_request(messages, profile, true)?
            .header("Accept", "text/event-stream");
        let response = send_cancellable(request, &cancel).await?;
        check_status(&response)?;

        let mut accumulated = LlmResponse::partial();
        read_events(response, &cancel, self.stream_idle_timeout, |event| {
            if event.data.trim() == "[DONE]" {
                return Ok(Flow::Stop);
            }
            let chunk: StreamChunk = serde_json::from_str(&event.data)?;
            if let Some(usage) = chunk.usage {
                accumulated.prompt_tokens = usage.prompt_tokens;
                accumulated.completion_tokens = usage.completion_tokens;
                accumulated.total_tokens = usage.total_tokens;
            }
            if let Some(choice) = chunk.choices.into_iter().next() {
                if let Some(text) = choice.delta.and_then(|d| d.content) {
                    if !text.is_empty() {
                        on_chunk(&text);
                        accumulated.push_chunk(text);
                    }
                }
                if choice.finish_reason.is_some() {
                    accumulated.finish_reason = choice.finish_reason;
                }
            }
            Ok(Flow::Continue)
        })
        .await?;

        accumulated.finish();
        Ok(accumulated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelSettings;

    fn profile_with(settings: ModelSettings) -> ModelProfile {
        ModelProfile::new(AvailableModelEntry::new("gpt-4o", "OpenAI"), settings)
    }

    #[test]
    fn unset_knobs_are_left_out_of_the_body() {
        let messages = [Message::user("hi")];
        let profile = profile_with(ModelSettings::named("gpt-4o"));
        let body = serde_json::to_value(OpenAiDriver::build_body(&messages, &profile, false)).unwrap();

        assert_eq!(
            body,
            serde_json::json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": false
            })
        );
    }

    #[test]
    fn max_completion_tokens_replaces_max_tokens() {
        let mut settings = ModelSettings::named("gpt-4o");
        settings.max_tokens = Some(100);
        settings.max_completion_tokens = Some(50);
        settings.temperature = Some(0.2);
        settings.reasoning_effort = Some("low".to_string());
        let messages = [Message::system("be brief"), Message::user("hi")];
        let profile = profile_with(settings);

        let body = serde_json::to_value(OpenAiDriver::build_body(&messages, &profile, true)).unwrap();

        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["max_completion_tokens"], 50);
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["reasoning_effort"], "low");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn max_tokens_is_sent_alone() {
        let mut settings = ModelSettings::named("gpt-4o");
        settings.max_tokens = Some(100);
        let messages = [Message::user("hi")];
        let profile = profile_with(settings);

        let body = serde_json::to_value(OpenAiDriver::build_body(&messages, &profile, false)).unwrap();
        assert_eq!(body["max_tokens"], 100);
        assert!(body.get("max_completion_tokens").is_none());
    }

    #[test]
    fn cached_prompt_tokens_are_reported() {
        let body: ChatCompletionResponse = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"content": "ok", "refusal": null}, "finish_reason": "stop"}],
            "usage": {
                "prompt_tokens": 10, "completion_tokens": 1, "total_tokens": 11,
                "prompt_tokens_details": {"cached_tokens": 8}
            }
        }))
        .unwrap();

        let response = into_response(body);
        assert_eq!(response.cache_read_input_tokens, Some(8));
        assert_eq!(response.refusal, None);
    }
}
