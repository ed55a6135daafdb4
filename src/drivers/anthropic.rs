//! Anthropic Messages API.

use super::sse::{read_events, Flow};
use super::{check_status, endpoint, send_cancellable, ChunkSink, DriverOptions, ProtocolDriver};
use crate::error::LlmError;
use crate::message::{LlmResponse, Message, Role};
use crate::models::{AvailableModelEntry, ModelProfile};
use crate::service::ServiceConfiguration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MAX_TOKENS: u32 = 1024;
const PAGE_LIMIT: &str = "100";

/// Where `system` messages go in a Messages request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemPromptMode {
    /// Sent inline with the `assistant` role.
    #[default]
    AsAssistant,
    /// Joined into the top-level `system` field.
    TopLevel,
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
    #[serde(default)]
    cache_read_input_tokens: Option<u32>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart { message: StreamMessage },
    ContentBlockDelta { delta: TextDelta },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<Usage>,
    },
    MessageStop,
    Error { error: StreamError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct TextDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ModelsPage {
    data: Vec<ModelData>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelData {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

// ============================================================================
// Driver
// ============================================================================

pub struct AnthropicDriver {
    configuration: ServiceConfiguration,
    api_key: Option<String>,
    client: Client,
    request_timeout: Duration,
    discovery_timeout: Duration,
    stream_idle_timeout: Duration,
    system_prompt_mode: SystemPromptMode,
    default_max_tokens: u32,
}

impl AnthropicDriver {
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
            system_prompt_mode: options.system_prompt_mode,
            default_max_tokens: options.anthropic_max_tokens,
        }
    }

    fn build_body<'a>(
        &self,
        messages: &'a [Message],
        profile: &'a ModelProfile,
        stream: bool,
    ) -> MessagesRequest<'a> {
        let settings = &profile.model_settings;
        let mut system_parts: Vec<&str> = Vec::new();
        let mut wire = Vec::with_capacity(messages.len());

        for message in messages {
            match (&message.role, self.system_prompt_mode) {
                (Role::System, SystemPromptMode::TopLevel) => system_parts.push(&message.content),
                (Role::System, SystemPromptMode::AsAssistant) => wire.push(WireMessage {
                    role: "assistant",
                    content: &message.content,
                }),
                (role, _) => wire.push(WireMessage {
                    role: role.as_str(),
                    content: &message.content,
                }),
            }
        }

        MessagesRequest {
            model: &profile.model_entry.id,
            messages: wire,
            max_tokens: settings.max_tokens.unwrap_or(self.default_max_tokens),
            temperature: settings.temperature,
            top_p: settings.top_p,
            top_k: settings.top_k,
            stream,
            system: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("anthropic-version", ANTHROPIC_VERSION);
        match &self.api_key {
            Some(key) => request.header("x-api-key", key),
            None => request,
        }
    }

    fn messages_request(
        &self,
        messages: &[Message],
        profile: &ModelProfile,
        stream: bool,
    ) -> Result<reqwest::RequestBuilder, LlmError> {
        let url = endpoint(&self.configuration, "messages")?;
        tracing::debug!(
            service = %self.configuration.id,
            model = %profile.model_entry.id,
            url = %url,
            stream,
            "Outgoing messages request"
        );
        let body = self.build_body(messages, profile, stream);
        let request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(&body);
        Ok(self.authorize(request))
    }

    async fn fetch_page(&self, after_id: Option<&str>) -> Result<ModelsPage, LlmError> {
        let mut url = endpoint(&self.configuration, "models")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", PAGE_LIMIT);
            if let Some(after) = after_id {
                query.append_pair("after_id", after);
            }
        }
        tracing::debug!(service = %self.configuration.id, url = %url, "Listing models");

        let request = self.authorize(self.client.get(url).timeout(self.discovery_timeout));
        let response = request.send().await?;
        check_status(&response)?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn apply_usage(response: &mut LlmResponse, usage: &Usage) {
    if usage.input_tokens.is_some() {
        response.prompt_tokens = usage.input_tokens;
    }
    if usage.output_tokens.is_some() {
        response.completion_tokens = usage.output_tokens;
    }
    if usage.cache_read_input_tokens.is_some() {
        response.cache_read_input_tokens = usage.cache_read_input_tokens;
    }
    if usage.cache_creation_input_tokens.is_some() {
        response.cache_creation_input_tokens = usage.cache_creation_input_tokens;
    }
    response.total_tokens = match (response.prompt_tokens, response.completion_tokens) {
        (Some(input), Some(output)) => Some(input + output),
        _ => None,
    };
}

#[async_trait]
impl ProtocolDriver for AnthropicDriver {
    fn configuration(&self) -> &ServiceConfiguration {
        &self.configuration
    }

    async fn list_models(&self) -> Result<Vec<AvailableModelEntry>, LlmError> {
        let mut entries = Vec::new();
        let mut after_id: Option<String> = None;

        loop {
            let page = self.fetch_page(after_id.as_deref()).await?;
            entries.extend(page.data.into_iter().map(|m| AvailableModelEntry {
                created: m
                    .created_at
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|d| d.with_timezone(&Utc)),
                display_name: m.display_name,
                provider: "Anthropic".to_string(),
                description: None,
                id: m.id,
            }));

            match (page.has_more, page.last_id) {
                (true, Some(last)) => after_id = Some(last),
                _ => break,
            }
        }
        Ok(entries)
    }

    async fn send_message(
        &self,
        messages: &[Message],
        profile: &ModelProfile,
    ) -> Result<LlmResponse, LlmError> {
        let request = self
            .messages_request(messages, profile, false)?
            .timeout(self.request_timeout);
        let response = request.send().await?;
        check_status(&response)?;

        let bytes = response.bytes().await?;
        tracing::debug!(model = %profile.model_entry.id, bytes = bytes.len(), "Messages response");
        let body: MessagesResponse = serde_json::from_slice(&bytes)?;

        let text = body
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .and_then(|block| block.text)
            .unwrap_or_default();
        let mut response = LlmResponse::complete(text).with_finish_reason(body.stop_reason);
        if let Some(usage) = body.usage {
            apply_usage(&mut response, &usage);
        }
        Ok(response)
    }

    async fn stream_message(
        &self,
        messages: &[Message],
        profile: &ModelProfile,
        on_chunk: &mut ChunkSink<'_>,
        cancel: CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        let request = self
            .messages_request(messages, profile, true)?
            .header("Accept", "text/event-stream");
        let response = send_cancellable(request, &cancel).await?;
        check_status(&response)?;

        let mut accumulated = LlmResponse::partial();
        read_events(response, &cancel, self.stream_idle_timeout, |event| {
            match serde_json::from_str::<StreamEvent>(&event.data)? {
                StreamEvent::MessageStart { message } => {
                    if let Some(usage) = message.usage {
                        apply_usage(&mut accumulated, &usage);
                    }
                }
                StreamEvent::ContentBlockDelta { delta } => {
                    if let Some(text) = delta.text.filter(|t| !t.is_empty()) {
                        on_chunk(&text);
                        accumulated.push_chunk(text);
                    }
                }
                StreamEvent::MessageDelta { delta, usage } => {
                    if delta.stop_reason.is_some() {
                        accumulated.finish_reason = delta.stop_reason;
                    }
                    if let Some(usage) = usage {
                        apply_usage(&mut accumulated, &usage);
                    }
                }
                StreamEvent::MessageStop => return Ok(Flow::Stop),
                StreamEvent::Error { error } => return Err(LlmError::InvalidResponse(error.message)),
                StreamEvent::Other => {}
            }
            Ok(Flow::Continue)
        })
        .await?;

        accumulated.finish();
        Ok(accumulated)
    }
}
