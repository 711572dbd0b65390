use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{AdapterError, AdapterResult};

pub(crate) fn build_client(provider: &str, timeout: Duration) -> AdapterResult<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .build()
        .map_err(|e| {
            AdapterError::invalid_request(provider, format!("Failed to create HTTP client: {}", e))
                .with_code("CLIENT_BUILD_ERROR")
        })
}

/// Send the request and hand back the response if its status is a success.
/// Failure statuses are read and passed to `classify` together with the body.
pub(crate) async fn send<C>(provider: &str, request: RequestBuilder, classify: C) -> AdapterResult<Response>
where
    C: FnOnce(u16, &str) -> AdapterError,
{
    let started = Instant::now();
    let response = request
        .send()
        .await
        .map_err(|e| AdapterError::from_transport(provider, &e))?;
    debug!("'{}' responded {} in {:?}", provider, response.status(), started.elapsed());

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let err = classify(status.as_u16(), &body);
    warn!("'{}' API error {}: {}", provider, status, err.message);
    Err(err)
}

pub(crate) async fn read_json<T: DeserializeOwned>(provider: &str, response: Response) -> AdapterResult<T> {
    let status = response.status().as_u16();
    let body = response
        .bytes()
        .await
        .map_err(|e| AdapterError::from_transport(provider, &e))?;

    serde_json::from_slice(&body).map_err(|e| {
        AdapterError::invalid_response(provider, format!("Failed to parse response: {}", e))
            .with_code("RESPONSE_PARSE_ERROR")
            .with_status(status)
    })
}

/// Status-only classification with the body kept as the message, plus the
/// "timeout" body hint some gateways return with generic statuses.
pub(crate) fn classify_status(provider: &str, status: u16, body: &str) -> AdapterError {
    let message = if body.trim().is_empty() {
        format!("HTTP status {}", status)
    } else {
        truncate(body, 512)
    };

    let err = AdapterError::from_status(provider, status, message);
    if body.to_ascii_lowercase().contains("timeout") {
        return AdapterError {
            kind: crate::error::ErrorKind::Timeout,
            retryable: true,
            ..err
        };
    }
    err
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
