use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Serialize;

use crate::config::READY_REQUEST_TIMEOUT;
use crate::error::Result;
use crate::util::CliOutput;

/// Blocking client shared by readiness polling and traffic generation. The
/// target is a local process, so environment proxies are ignored.
pub fn http_client() -> Result<Client> {
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(2))
        .no_proxy()
        .build()?;
    Ok(client)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub request_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(2),
            request_timeout: READY_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadinessOutcome {
    pub ready: bool,
    pub attempts: u32,
    /// HTTP status of the poll that succeeded.
    pub status: Option<u16>,
}

/// Fixed-interval poll: the first completed HTTP exchange counts as ready,
/// whatever its status code.
pub fn wait_for_ready(
    client: &Client,
    endpoint: &str,
    policy: &ReadinessPolicy,
    ui: &CliOutput,
) -> ReadinessOutcome {
    for attempt in 1..=policy.max_attempts {
        match client
            .get(endpoint)
            .timeout(policy.request_timeout)
            .send()
        {
            Ok(response) => {
                let status = response.status().as_u16();
                ui.success(&format!(
                    "application ready at {endpoint} (attempt {attempt}, status {status})"
                ));
                return ReadinessOutcome {
                    ready: true,
                    attempts: attempt,
                    status: Some(status),
                };
            }
            Err(error) => {
                ui.info(&format!(
                    "waiting for application ({attempt}/{}): {error}",
                    policy.max_attempts
                ));
            }
        }

        if attempt < policy.max_attempts {
            thread::sleep(policy.interval);
        }
    }

    ReadinessOutcome {
        ready: false,
        attempts: policy.max_attempts,
        status: None,
    }
}
