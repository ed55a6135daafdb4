//! Battleground - send one prompt to many LLM vendors and compare the answers.
//!
//! Features:
//! - Services speaking the OpenAI or Anthropic wire protocol, with keys kept apart
//! - Model discovery across every configured service, tolerant of per-service failures
//! - Challenges: one prompt fanned out to many models, each outcome recorded independently
//! - Streaming replies with cancellation
//! - A local HTTP API and a CLI over the same core

pub mod api;
pub mod challenge;
pub mod config;
pub mod credentials;
pub mod discovery;
pub mod drivers;
pub mod error;
pub mod http;
pub mod logger;
pub mod message;
pub mod models;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;
