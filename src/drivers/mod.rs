//! Protocol drivers.
//!
//! A driver speaks one vendor wire protocol for one configured service:
//! - `OpenAiDriver`: `/chat/completions` and compatible endpoints
//! - `AnthropicDriver`: `/messages`
//!
//! Both normalize into [`LlmResponse`] and [`LlmError`].

mod anthropic;
mod openai;
pub mod sse;


pub use anthropic::{AnthropicDriver, SystemPromptMode, ANTHROPIC_VERSION, DEFAULT_MAX_TOKENS};
pub use openai::{OpenAiDriver, GEMINI_MODELS_URL};

use crate::credentials::CredentialManager;
use crate::error::LlmError;
use crate::http::{DEFAULT_TIMEOUT, DISCOVERY_TIMEOUT, STREAM_IDLE_TIMEOUT};
use crate::message::{LlmResponse, Message};
use crate::models::{AvailableModelEntry, ModelProfile};
use crate::service::{ProtocolKind, ServiceConfiguration};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Receives each decoded text delta of a stream.
pub type ChunkSink<'a> = dyn FnMut(&str) + Send + 'a;

/// Uniform interface over vendor protocols.
#[async_trait]
pub trait ProtocolDriver: Send + Sync {
    fn configuration(&self) -> &ServiceConfiguration;

    async fn list_models(&self) -> Result<Vec<AvailableModelEntry>, LlmError>;

    async fn send_message(
        &self,
        messages: &[Message],
        profile: &ModelProfile,
    ) -> Result<LlmResponse, LlmError>;

    /// Stream a reply, calling `on_chunk` once per text delta. Resolves with the
    /// accumulated response, or `LlmError::Cancelled` once `cancel` fires.
    async fn stream_message(
        &self,
        messages: &[Message],
        profile: &ModelProfile,
        on_chunk: &mut ChunkSink<'_>,
        cancel: CancellationToken,
    ) -> Result<LlmResponse, LlmError>;
}

/// Knobs shared by every driver built from one configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverOptions {
    /// Deadline for a whole non-streaming call.
    pub request_timeout: Duration,
    pub discovery_timeout: Duration,
    /// Streams have no overall deadline; they fail after this long without a read.
    pub stream_idle_timeout: Duration,
    pub system_prompt_mode: SystemPromptMode,
    pub anthropic_max_tokens: u32,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_TIMEOUT,
            discovery_timeout: DISCOVERY_TIMEOUT,
            stream_idle_timeout: STREAM_IDLE_TIMEOUT,
            system_prompt_mode: SystemPromptMode::default(),
            anthropic_max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// Build the driver for a service's protocol.
pub fn create_driver(
    configuration: ServiceConfiguration,
    api_key: Option<String>,
    client: Client,
    options: &DriverOptions,
) -> Arc<dyn ProtocolDriver> {
    match configuration.protocol {
        ProtocolKind::OpenAi => Arc::new(OpenAiDriver::new(configuration, api_key, client, options)),
        ProtocolKind::Anthropic => {
            Arc::new(AnthropicDriver::new(configuration, api_key, client, options))
        }
    }
}

/// Source of drivers for orchestration code.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn driver_for(&self, configuration: &ServiceConfiguration) -> Arc<dyn ProtocolDriver>;
}

/// Builds HTTP drivers over one shared client, reading keys on demand.
#[derive(Clone)]
pub struct HttpDriverFactory {
    client: Client,
    credentials: CredentialManager,
    options: DriverOptions,
}

impl HttpDriverFactory {
    pub fn new(client: Client, credentials: CredentialManager, options: DriverOptions) -> Self {
        Self {
            client,
            credentials,
            options,
        }
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }
}

#[async_trait]
impl DriverFactory for HttpDriverFactory {
    async fn driver_for(&self, configuration: &ServiceConfiguration) -> Arc<dyn ProtocolDriver> {
        let api_key = match self.credentials.api_key(&configuration.id).await {
            Ok(key) => key,
            Err(e) => {
                // The vendor will answer 401, which is reported per service.
                tracing::warn!(service = %configuration.id, error = %e, "Could not read API key");
                None
            }
        };
        create_driver(configuration.clone(), api_key, self.client.clone(), &self.options)
    }
}

/// A running stream started by [`spawn_stream`].
pub struct StreamHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl StreamHandle {
    /// Stop the stream. Completion then receives `LlmError::Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the completion callback has run.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Stream task failed");
        }
    }
}

/// Start a stream in the background.
///
/// `on_chunk` sees zero or more deltas, then `on_complete` runs exactly once
/// with the accumulated response or the first fatal error.
pub fn spawn_stream<C, F>(
    driver: Arc<dyn ProtocolDriver>,
    messages: Vec<Message>,
    profile: ModelProfile,
    mut on_chunk: C,
    on_complete: F,
) -> StreamHandle
where
    C: FnMut(&str) + Send + 'static,
    F: FnOnce(Result<LlmResponse, LlmError>) + Send + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let result = driver
            .stream_message(&messages, &profile, &mut on_chunk, token)
            .await;
        on_complete(result);
    });
    StreamHandle { cancel, task }
}

/// Map a non-200 status before any body is read.
pub(crate) fn check_status(response: &reqwest::Response) -> Result<(), LlmError> {
    match LlmError::from_status(response.status().as_u16()) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Join a path onto a service base URL.
pub(crate) fn endpoint(configuration: &ServiceConfiguration, path: &str) -> Result<reqwest::Url, LlmError> {
    let url = format!("{}/{}", configuration.base_url(), path);
    reqwest::Url::parse(&url).map_err(|_| LlmError::InvalidEndpoint)
}

/// Send a request unless `cancel` fires first.
pub(crate) async fn send_cancellable(
    request: reqwest::RequestBuilder,
    cancel: &CancellationToken,
) -> Result<reqwest::Response, LlmError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LlmError::Cancelled),
        response = request.send() => Ok(response?),
    }
}
