//! Network connectivity checks before a readout cycle.

use async_trait::async_trait;
use reqwest::Url;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::NetworkCredentials;

/// Brings the uplink to the forwarding endpoint up, or reports that it is.
#[async_trait]
pub trait ConnectivityProvider: Send + Sync {
    /// Ensure connectivity within `timeout`. Returns whether the uplink is usable.
    async fn connect(&self, credentials: &NetworkCredentials, timeout: Duration) -> bool;
}

/// Checks that a TCP endpoint is reachable.
///
/// On hosts the operating system manages the wireless association, so the
/// credentials are only logged; reachability of the forwarding endpoint is
/// what decides whether a cycle runs.
#[derive(Debug, Clone)]
pub struct TcpReachability {
    target: String,
}

impl TcpReachability {
    /// Check reachability of `host:port`.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    /// Derive the `host:port` target from an HTTP(S) URL template.
    ///
    /// Returns `None` if the URL does not parse or has no host or port.
    pub fn from_url(url: &str) -> Option<Self> {
        let url = Url::parse(url).ok()?;
        let host = url.host_str().filter(|host| !host.is_empty())?;
        let port = url.port_or_known_default()?;
        Some(Self::new(format!("{}:{}", host, port)))
    }

    /// The `host:port` being checked.
    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl ConnectivityProvider for TcpReachability {
    async fn connect(&self, credentials: &NetworkCredentials, timeout: Duration) -> bool {
        debug!(
            "Checking uplink via {} (network {:?})",
            self.target, credentials.ssid
        );

        match tokio::time::timeout(timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(_)) => {
                info!("Connected. Uplink to {} is reachable", self.target);
                true
            }
            Ok(Err(e)) => {
                warn!("Connection failed while reaching {}: {}", self.target, e);
                false
            }
            Err(_) => {
                warn!("Timeout while reaching {}", self.target);
                false
            }
        }
    }
}

/// Connectivity provider that always reports a usable uplink.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

#[async_trait]
impl ConnectivityProvider for AlwaysOnline {
    async fn connect(&self, _credentials: &NetworkCredentials, _timeout: Duration) -> bool {
        true
    }
}
