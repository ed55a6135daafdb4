//! Fan one prompt out to many models and collect each outcome independently.

use crate::drivers::DriverFactory;
use crate::error::{ChallengeError, LlmError};
use crate::message::{LlmResponse, Message};
use crate::models::LlmModel;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

/// Point-in-time view of the challenge board.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChallengeReport {
    pub prompt: Option<String>,
    pub responses: BTreeMap<String, LlmResponse>,
    pub errors: BTreeMap<String, LlmError>,
    pub pending: Vec<String>,
}

impl ChallengeReport {
    fn from_outcomes(prompt: &str, outcomes: Vec<(String, Result<LlmResponse, LlmError>)>) -> Self {
        let mut report = ChallengeReport {
            prompt: Some(prompt.to_string()),
            ..Default::default()
        };
        for (model_id, result) in outcomes {
            match result {
                Ok(response) => {
                    report.responses.insert(model_id, response);
                }
                Err(error) => {
                    report.errors.insert(model_id, error);
                }
            }
        }
        report
    }
}

#[derive(Default)]
struct Board {
    generation: u64,
    prompt: Option<String>,
    messages: Vec<Message>,
    models: BTreeMap<String, LlmModel>,
    responses: BTreeMap<String, LlmResponse>,
    errors: BTreeMap<String, LlmError>,
    pending: BTreeSet<String>,
}

impl Board {
    fn report(&self) -> ChallengeReport {
        ChallengeReport {
            prompt: self.prompt.clone(),
            responses: self.responses.clone(),
            errors: self.errors.clone(),
            pending: self.pending.iter().cloned().collect(),
        }
    }

    /// Store one outcome unless a newer challenge replaced the board.
    fn record(&mut self, generation: u64, model_id: &str, result: &Result<LlmResponse, LlmError>) {
        if generation != self.generation || !self.models.contains_key(model_id) {
            return;
        }
        self.pending.remove(model_id);
        match result {
            Ok(response) => {
                self.errors.remove(model_id);
                self.responses.insert(model_id.to_string(), response.clone());
            }
            Err(error) => {
                self.responses.remove(model_id);
                self.errors.insert(model_id.to_string(), error.clone());
            }
        }
    }
}

pub struct ChallengeOrchestrator {
    factory: Arc<dyn DriverFactory>,
    max_concurrency: usize,
    request_timeout: Duration,
    board: Arc<Mutex<Board>>,
}

impl ChallengeOrchestrator {
    /// `max_concurrency` of 0 means no limit.
    pub fn new(factory: Arc<dyn DriverFactory>, max_concurrency: usize, request_timeout: Duration) -> Self {
        Self {
            factory,
            max_concurrency,
            request_timeout,
            board: Arc::new(Mutex::new(Board::default())),
        }
    }

    /// Send `prompt` to every model and wait for all of them.
    pub async fn run(&self, prompt: &str, models: Vec<LlmModel>) -> ChallengeReport {
        let messages = vec![Message::user(prompt)];
        let generation = {
            let mut board = self.board.lock().await;
            board.generation += 1;
            board.prompt = Some(prompt.to_string());
            board.messages = messages.clone();
            board.models = models.iter().map(|m| (m.id.clone(), m.clone())).collect();
            board.responses.clear();
            board.errors.clear();
            board.pending = board.models.keys().cloned().collect();
            board.generation
        };
        tracing::info!(models = models.len(), "Challenge started");

        let limiter = (self.max_concurrency > 0).then(|| Arc::new(Semaphore::new(self.max_concurrency)));
        let mut tasks = JoinSet::new();
        for model in models {
            let factory = self.factory.clone();
            let board = self.board.clone();
            let messages = messages.clone();
            let limiter = limiter.clone();
            let timeout = self.request_timeout;

            tasks.spawn(async move {
                let _permit = match &limiter {
                    Some(limiter) => limiter.clone().acquire_owned().await.ok(),
                    None => None,
                };
                let result = ask(factory.as_ref(), &model, &messages, timeout).await;
                board.lock().await.record(generation, &model.id, &result);
                (model.id, result)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!(error = %e, "Challenge task failed"),
            }
        }

        // Once a newer challenge owns the board, answer from this run's own outcomes.
        let report = {
            let board = self.board.lock().await;
            if board.generation == generation {
                board.report()
            } else {
                ChallengeReport::from_outcomes(prompt, outcomes)
            }
        };
        tracing::info!(
            responses = report.responses.len(),
            errors = report.errors.len(),
            "Challenge finished"
        );
        report
    }

    /// Re-ask one model with the last prompt. Other models' outcomes are untouched.
    pub async fn retry(&self, model_id: &str) -> Result<LlmResponse, ChallengeError> {
        let (generation, model, messages) = {
            let mut board = self.board.lock().await;
            if board.prompt.is_none() {
                return Err(ChallengeError::NoChallenge);
            }
            let model = board
                .models
                .get(model_id)
                .cloned()
                .ok_or_else(|| ChallengeError::UnknownModel(model_id.to_string()))?;
            board.responses.remove(model_id);
            board.errors.remove(model_id);
            board.pending.insert(model_id.to_string());
            (board.generation, model, board.messages.clone())
        };
        tracing::info!(model = %model_id, "Retrying model");

        let result = ask(self.factory.as_ref(), &model, &messages, self.request_timeout).await;
        self.board.lock().await.record(generation, model_id, &result);
        Ok(result?)
    }

    /// Drop a model and its outcome from the board. Returns whether it was there.
    pub async fn deselect(&self, model_id: &str) -> bool {
        let mut board = self.board.lock().await;
        board.responses.remove(model_id);
        board.errors.remove(model_id);
        board.pending.remove(model_id);
        board.models.remove(model_id).is_some()
    }

    pub async fn report(&self) -> ChallengeReport {
        self.board.lock().await.report()
    }
}

async fn ask(
    factory: &dyn DriverFactory,
    model: &LlmModel,
    messages: &[Message],
    timeout: Duration,
) -> Result<LlmResponse, LlmError> {
    let driver = factory.driver_for(&model.configuration).await;
    let profile = model.profile();
    let result = match tokio::time::timeout(timeout, driver.send_message(messages, &profile)).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::NetworkError(format!(
            "request timed out after {}s",
            timeout.as_secs_f64()
        ))),
    };
    if let Err(error) = &result {
        tracing::warn!(model = %model.id, error = %error, "Model request failed");
    }
    result
}
