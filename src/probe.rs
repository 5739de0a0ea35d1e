//! Health probing and readiness polling.
use crate::errors::OrchestratorError;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Empty;
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Answers "is something serving at this URL?"
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `true` when the endpoint answered within `timeout` with a non-5xx status.
    async fn probe(&self, url: &str, timeout: Duration) -> bool;
}

/// Plain HTTP GET probe.
///
/// Any status below 500 counts as ready: servers that answer 404 on the probe path are up,
/// they just don't implement it.
#[derive(Clone)]
pub struct HttpProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HttpProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProbe").finish_non_exhaustive()
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> bool {
        let uri: hyper::Uri = match url.parse() {
            Ok(uri) => uri,
            Err(e) => {
                debug!(url = %url, error = %e, "Invalid probe URL");
                return false;
            }
        };

        let request = match hyper::Request::builder()
            .method("GET")
            .uri(uri)
            .body(Empty::new())
        {
            Ok(request) => request,
            Err(e) => {
                debug!(url = %url, error = %e, "Failed to build probe request");
                return false;
            }
        };

        match tokio::time::timeout(timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let status = response.status();
                debug!(url = %url, status = %status, "Probe answered");
                !status.is_server_error()
            }
            Ok(Err(e)) => {
                debug!(url = %url, error = %e, "Probe request failed");
                false
            }
            Err(_) => {
                debug!(url = %url, "Probe timed out");
                false
            }
        }
    }
}

/// Readiness polling parameters.
#[derive(Debug, Clone, Copy)]
pub struct ReadyPolicy {
    /// Overall deadline
    pub timeout: Duration,
    /// Cap on a single probe attempt
    pub attempt_timeout: Duration,
    pub poll_interval: Duration,
}

/// Poll `url` until it answers, the deadline passes, or `alive` reports the process gone.
///
/// `alive` is checked before every attempt and after every failed one so a crashed launch
/// fails fast instead of waiting out the deadline.
pub async fn wait_ready<P, F>(
    probe: &P,
    url: &str,
    policy: ReadyPolicy,
    mut alive: F,
) -> Result<(), OrchestratorError>
where
    P: HealthProbe + ?Sized,
    F: FnMut() -> bool,
{
    let started = Instant::now();
    // No deadline when the timeout runs past what the clock can represent
    let deadline = started.checked_add(policy.timeout);
    let time_left =
        || deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()));
    info!(url = %url, timeout = ?policy.timeout, "Waiting for backend to become ready");

    loop {
        if !alive() {
            return Err(OrchestratorError::ProcessExited {
                url: url.to_string(),
            });
        }

        let remaining = time_left();
        if remaining.is_zero() {
            break;
        }

        if probe
            .probe(url, policy.attempt_timeout.min(remaining))
            .await
        {
            info!(url = %url, elapsed = ?started.elapsed(), "Backend is ready");
            return Ok(());
        }

        if !alive() {
            return Err(OrchestratorError::ProcessExited {
                url: url.to_string(),
            });
        }

        let remaining = time_left();
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(policy.poll_interval.min(remaining)).await;
    }

    Err(OrchestratorError::BackendTimeout {
        url: url.to_string(),
        elapsed: started.elapsed(),
    })
}
