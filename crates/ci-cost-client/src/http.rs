//! Shared request plumbing for the HTTP clients.

use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{ClientError, Result};

/// Build a reqwest client with the given per-request timeout.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("ci-cost/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(ClientError::from)
}

/// Send a request and decode a JSON body, classifying failures.
pub(crate) async fn get_json<T: DeserializeOwned>(
    service: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<T> {
    let response = request.send().await.map_err(|e| classify_transport(service, e))?;
    let status = response.status();
    debug!(service, status = status.as_u16(), url = %response.url(), "response received");

    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::from_http_status(
            service,
            status.as_u16(),
            retry_after,
            &body,
        ));
    }

    let bytes = response.bytes().await.map_err(|e| classify_transport(service, e))?;
    serde_json::from_slice(&bytes).map_err(|e| ClientError::invalid_payload(service, e.to_string()))
}

fn classify_transport(service: &'static str, e: reqwest::Error) -> ClientError {
    if e.is_timeout() || e.is_connect() {
        ClientError::Upstream {
            service,
            message: e.to_string(),
        }
    } else {
        ClientError::Http(e)
    }
}
