//! Scraping the progress counter from a node's monitoring gateway.

use std::time::Duration;

use thiserror::Error;
use tracing::trace;

use crate::{Height, SimulationResult};

/// Path of the plaintext metrics endpoint on the monitoring gateway
pub const METRICS_PATH: &str = "/monitoring/metrics";

/// The counter line exists but cannot be read as a height
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScrapeError {
    #[error("metric line {line:?} has no value")]
    MissingValue { line: String },
    #[error("metric {metric} has non-integer value {value:?}")]
    InvalidValue { metric: String, value: String },
}

/// Find `metric_name` in a plaintext exposition body.
///
/// Returns `Ok(None)` when the counter is not present yet. Comment lines and
/// other metrics are skipped; labels after the name are allowed.
pub fn parse_counter(body: &str, metric_name: &str) -> Result<Option<Height>, ScrapeError> {
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let name_end = line
            .find(|c: char| c == '{' || c.is_whitespace())
            .unwrap_or(line.len());
        if &line[..name_end] != metric_name {
            continue;
        }

        let rest = &line[name_end..];
        let rest = match rest.strip_prefix('{') {
            Some(labelled) => labelled.split_once('}').map(|(_, tail)| tail).unwrap_or(""),
            None => rest,
        };

        let value = rest.split_whitespace().next().ok_or_else(|| ScrapeError::MissingValue {
            line: line.to_string(),
        })?;

        return parse_height(metric_name, value).map(Some);
    }

    Ok(None)
}

fn parse_height(metric: &str, value: &str) -> Result<Height, ScrapeError> {
    if let Ok(height) = value.parse::<Height>() {
        return Ok(height);
    }

    // Some exporters render integral counters as floats ("12" vs "12.0").
    match value.parse::<f64>() {
        Ok(float) if float.is_finite() && float >= 0.0 && float.fract() == 0.0 => Ok(float as Height),
        _ => Err(ScrapeError::InvalidValue {
            metric: metric.to_string(),
            value: value.to_string(),
        }),
    }
}

/// HTTP client reading one counter from monitoring gateways
#[derive(Debug, Clone)]
pub struct MetricsClient {
    client: reqwest::Client,
    metric_name: String,
}

impl MetricsClient {
    pub fn new(metric_name: impl Into<String>, timeout: Duration) -> SimulationResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            metric_name: metric_name.into(),
        })
    }

    /// Fetch the counter from `base_url`.
    ///
    /// Connection failures, timeouts and non-success statuses all mean the
    /// node is not ready and yield `Ok(None)`.
    pub async fn fetch(&self, base_url: &str) -> Result<Option<Height>, ScrapeError> {
        let url = format!("{}{}", base_url, METRICS_PATH);

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                trace!(%url, error = %err, "monitoring endpoint unreachable");
                return Ok(None);
            }
        };

        if !response.status().is_success() {
            trace!(%url, status = %response.status(), "monitoring endpoint not ready");
            return Ok(None);
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                trace!(%url, error = %err, "monitoring body interrupted");
                return Ok(None);
            }
        };

        parse_counter(&body, &self.metric_name)
    }
}
