use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Serialize;

use crate::config::TRAFFIC_REQUEST_TIMEOUT;
use crate::util::CliOutput;

const PROGRESS_EVERY: u32 = 10;
const MAX_LOGGED_FAILURES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficPlan {
    pub calls: u32,
    pub pause: Duration,
    pub request_timeout: Duration,
}

impl TrafficPlan {
    #[must_use]
    pub fn new(calls: u32, pause: Duration) -> Self {
        Self {
            calls,
            pause,
            request_timeout: TRAFFIC_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficTally {
    pub successful: u32,
    pub failed: u32,
}

impl TrafficTally {
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.successful.saturating_add(self.failed)
    }
}

/// Progress is logged on every tenth success.
#[must_use]
pub fn logs_progress(successful: u32) -> bool {
    successful > 0 && successful % PROGRESS_EVERY == 0
}

/// Only the first few failures are logged individually.
#[must_use]
pub fn logs_failure(failed: u32) -> bool {
    failed <= MAX_LOGGED_FAILURES
}

/// A response counts as a success unless the application answered with a
/// 4xx or 5xx.
#[must_use]
pub fn status_succeeded(status: StatusCode) -> bool {
    !(status.is_client_error() || status.is_server_error())
}

/// Send exactly `plan.calls` sequential GETs. Failures are tallied, never
/// retried, and never stop the run.
pub fn generate_traffic(
    client: &Client,
    endpoint: &str,
    plan: &TrafficPlan,
    ui: &CliOutput,
) -> TrafficTally {
    let mut tally = TrafficTally::default();
    ui.info(&format!("sending {} requests to {endpoint}", plan.calls));

    for call in 1..=plan.calls {
        let failure = match client
            .get(endpoint)
            .timeout(plan.request_timeout)
            .send()
        {
            Ok(response) if status_succeeded(response.status()) => None,
            Ok(response) => Some(format!("status {}", response.status().as_u16())),
            Err(error) => Some(error.to_string()),
        };

        match failure {
            None => {
                tally.successful += 1;
                if logs_progress(tally.successful) {
                    ui.info(&format!(
                        "{} requests succeeded ({call}/{})",
                        tally.successful, plan.calls
                    ));
                }
            }
            Some(reason) => {
                tally.failed += 1;
                if logs_failure(tally.failed) {
                    ui.warning(&format!("request {call} failed: {reason}"));
                }
                if tally.failed == MAX_LOGGED_FAILURES {
                    ui.warning("further request failures will not be logged");
                }
            }
        }

        if call < plan.calls {
            thread::sleep(plan.pause);
        }
    }

    ui.info(&format!(
        "traffic complete: {} succeeded, {} failed",
        tally.successful, tally.failed
    ));
    tally
}
