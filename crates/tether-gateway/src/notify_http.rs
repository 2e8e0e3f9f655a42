//! HTTP notification sink.
//!
//! Delivers outbox notifications as JSON POSTs to the URLs tenants
//! declared in `notifications.webhooks`. Delivery errors surface as
//! `Transient` so the dispatcher's backoff applies; they can never block
//! or revert a reconcile commit.

use std::time::Duration;

use async_trait::async_trait;

use tether_core::error::{Error, Result};
use tether_core::notify::{Notification, NotificationSink};

/// Per-delivery request timeout.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Notification sink posting JSON over HTTP(S).
pub struct HttpSink {
    client: reqwest::Client,
}

impl HttpSink {
    /// Creates a sink with a dedicated client.
    ///
    /// # Errors
    ///
    /// Returns `Fatal` if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .map_err(|e| Error::fatal("HttpClientInit", e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NotificationSink for HttpSink {
    async fn deliver(&self, url: &str, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(notification)
            .send()
            .await
            .map_err(|e| Error::transient("SinkUnreachable", e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::transient(
                "SinkRejected",
                format!("sink returned {}", response.status()),
            ))
        }
    }
}
