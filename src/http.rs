//! Shared HTTP client factory.
//!
//! Every driver reuses one pooled client so a challenge against several
//! models on the same vendor shares connections. The client itself carries
//! only a connect timeout: non-streaming calls set a deadline per request and
//! streams are bounded by the idle gap between reads.

use reqwest::Client;
use std::time::Duration;

/// Default per-request timeout for chat completions (2 minutes).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for model listing calls (30 seconds).
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest silence tolerated between reads of a streaming body (60 seconds).
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Connect timeout applied to every client.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Create the shared HTTP client.
pub fn create_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(concat!("battleground/", env!("CARGO_PKG_VERSION")))
        .build()
}
