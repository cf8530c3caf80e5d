//! Forwarding of readings to the home-automation endpoint.
//!
//! The reader hands each finished reading to a [`ForwardingSink`]. Delivery
//! happens once; a failure is reported and the reading is dropped until the
//! next scheduled cycle produces a new one.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::SensorReading;

/// Placeholder for the calibrated value in a URL template.
pub const RADON_PLACEHOLDER: &str = "{radon}";
/// Placeholder for the HomeMatic system variable id in a URL template.
pub const ISE_ID_PLACEHOLDER: &str = "{ise_id}";

/// Destination of finished readings.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ForwardingSink: Send + Sync {
    /// Deliver one reading.
    async fn deliver(&self, reading: &SensorReading) -> Result<()>;
}

/// Sets a HomeMatic system variable through an XML-API style GET request.
///
/// The URL is built from a template such as
/// `http://ccu/addons/xmlapi/statechange.cgi?ise_id={ise_id}&new_value={radon}`.
#[derive(Debug, Clone)]
pub struct HomematicSink {
    client: reqwest::Client,
    url_template: String,
    ise_id: String,
}

impl HomematicSink {
    /// Default request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a sink for the given URL template and system variable id.
    pub fn new(url_template: impl Into<String>, ise_id: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Self::DEFAULT_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            url_template: url_template.into(),
            ise_id: ise_id.into(),
        })
    }

    /// Build the request URL for a reading.
    pub fn url_for(&self, reading: &SensorReading) -> String {
        render_url(&self.url_template, reading.value, &self.ise_id)
    }
}

/// Substitute the placeholders of a URL template.
pub fn render_url(template: &str, value: f32, ise_id: &str) -> String {
    template
        .replace(RADON_PLACEHOLDER, &value.to_string())
        .replace(ISE_ID_PLACEHOLDER, ise_id)
}

#[async_trait]
impl ForwardingSink for HomematicSink {
    async fn deliver(&self, reading: &SensorReading) -> Result<()> {
        let url = self.url_for(reading);
        info!("Sending HTTP request: {}", url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            Error::Forwarding {
                reason: format!("could not reach HomeMatic: {}", e),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Forwarding {
                reason: format!("HomeMatic answered {}", status),
            });
        }

        debug!("HomeMatic accepted reading ({})", status);
        Ok(())
    }
}

/// Sink that only logs readings, for dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl ForwardingSink for LogSink {
    async fn deliver(&self, reading: &SensorReading) -> Result<()> {
        info!("Radon reading: {} (raw {})", reading, reading.raw_value);
        Ok(())
    }
}
