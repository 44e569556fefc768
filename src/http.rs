//! Outbound HTTP used by notification channels, the status reporter and the
//! network checker.
//!
//! Everything goes through the [`HttpClient`] trait so that delivery logic
//! can be tested without a network. [`UreqClient`] is the production
//! implementation; `ureq` is blocking, so each request runs on the blocking
//! thread pool and never stalls a subscriber's executor thread.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// `User-Agent` sent with every request.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Minimal HTTP surface needed by the crate.
///
/// Both methods treat any non-2xx status as an [`Error::Http`].
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// POST `body` as JSON to `url`.
    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<()>;

    /// GET `url` and return the response body.
    async fn get(&self, url: &str) -> Result<String>;
}

/// [`HttpClient`] backed by a shared `ureq` agent.
#[derive(Clone)]
pub struct UreqClient {
    agent: ureq::Agent,
}

impl UreqClient {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build();
        Self { agent }
    }
}

impl Default for UreqClient {
    fn default() -> Self {
        Self::new()
    }
}

fn map_ureq_error(url: &str, error: ureq::Error) -> Error {
    match error {
        ureq::Error::Status(code, _) => Error::Http(format!("{} returned status {}", url, code)),
        ureq::Error::Transport(transport) => {
            Error::Http(format!("Request to {} failed: {}", url, transport))
        }
    }
}

#[async_trait]
impl HttpClient for UreqClient {
    #[tracing::instrument(skip(self, body))]
    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<()> {
        let agent = self.agent.clone();
        let target = url.to_string();
        let body = body.clone();

        tokio::task::spawn_blocking(move || {
            agent
                .post(&target)
                .send_json(body)
                .map(|_| ())
                .map_err(|e| map_ureq_error(&target, e))
        })
        .await
        .map_err(|e| Error::Other(format!("HTTP worker failed: {}", e)))?
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, url: &str) -> Result<String> {
        let agent = self.agent.clone();
        let target = url.to_string();

        tokio::task::spawn_blocking(move || {
            let response = agent.get(&target).call().map_err(|e| map_ureq_error(&target, e))?;
            response
                .into_string()
                .map_err(|e| Error::Http(format!("Failed to read response from {}: {}", target, e)))
        })
        .await
        .map_err(|e| Error::Other(format!("HTTP worker failed: {}", e)))?
    }
}
