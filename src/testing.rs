//! Scripted drivers for orchestration tests.

use crate::drivers::{ChunkSink, DriverFactory, ProtocolDriver};
use crate::error::LlmError;
use crate::message::{LlmResponse, Message};
use crate::models::{AvailableModelEntry, ModelProfile};
use crate::service::{ProtocolKind, ServiceConfiguration};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub(crate) fn service(id: &str) -> ServiceConfiguration {
    ServiceConfiguration::new(
        Some(id.to_string()),
        id.to_uppercase(),
        ProtocolKind::OpenAi,
        format!("http://{}.invalid/v1", id),
    )
}

pub(crate) struct FakeDriver {
    configuration: ServiceConfiguration,
    listing: Result<Vec<AvailableModelEntry>, LlmError>,
    replies: Mutex<HashMap<String, VecDeque<Result<String, LlmError>>>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
}

impl FakeDriver {
    pub(crate) fn new(configuration: ServiceConfiguration) -> Self {
        Self {
            configuration,
            listing: Ok(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay: Duration::ZERO,
            gate: None,
        }
    }

    pub(crate) fn with_models(mut self, ids: &[&str]) -> Self {
        let provider = self.configuration.name.clone();
        self.listing = Ok(ids
            .iter()
            .map(|id| AvailableModelEntry::new(*id, provider.clone()))
            .collect());
        self
    }

    pub(crate) fn failing_listing(mut self, error: LlmError) -> Self {
        self.listing = Err(error);
        self
    }

    /// Queue one scripted outcome for `model`; unscripted calls echo the model id.
    pub(crate) fn with_reply(self, model: &str, reply: Result<&str, LlmError>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(reply.map(str::to_string));
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Listing waits for a permit on `gate`.
    pub(crate) fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, model: &str) -> Result<String, LlmError> {
        self.replies
            .lock()
            .unwrap()
            .get_mut(model)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Ok(format!("reply from {}", model)))
    }
}

#[async_trait]
impl ProtocolDriver for FakeDriver {
    fn configuration(&self) -> &ServiceConfiguration {
        &self.configuration
    }

    async fn list_models(&self) -> Result<Vec<AvailableModelEntry>, LlmError> {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }
        self.listing.clone()
    }

    async fn send_message(
        &self,
        _messages: &[Message],
        profile: &ModelProfile,
    ) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.next_reply(&profile.model_entry.id).map(LlmResponse::complete)
    }

    async fn stream_message(
        &self,
        messages: &[Message],
        profile: &ModelProfile,
        on_chunk: &mut ChunkSink<'_>,
        cancel: CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        let reply = self.send_message(messages, profile).await?;
        let mut response = LlmResponse::partial();
        for word in reply.message.content.split_inclusive(' ') {
            on_chunk(word);
            response.push_chunk(word);
        }
        response.finish();
        Ok(response)
    }
}

#[derive(Default)]
pub(crate) struct FakeFactory {
    drivers: HashMap<String, Arc<FakeDriver>>,
}

impl FakeFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with(mut self, driver: FakeDriver) -> Self {
        self.drivers
            .insert(driver.configuration.id.clone(), Arc::new(driver));
        self
    }

    pub(crate) fn driver(&self, service_id: &str) -> Arc<FakeDriver> {
        self.drivers[service_id].clone()
    }
}

#[async_trait]
impl DriverFactory for FakeFactory {
    async fn driver_for(&self, configuration: &ServiceConfiguration) -> Arc<dyn ProtocolDriver> {
        match self.drivers.get(&configuration.id) {
            Some(driver) => driver.clone() as Arc<dyn ProtocolDriver>,
            None => Arc::new(
                FakeDriver::new(configuration.clone())
                    .failing_listing(LlmError::NetworkError("unknown service".to_string())),
            ),
        }
    }
}
