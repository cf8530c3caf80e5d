//! Reader configuration.
//!
//! The configuration is a flat JSON object:
//!
//! ```json
//! {
//!     "ssid": "home",
//!     "pass": "secret",
//!     "radoneye_addr": "AA:BB:CC:DD:EE:FF",
//!     "radoneye_addr_type": 0,
//!     "readout_interval": 600,
//!     "reset_timer": 24,
//!     "homematic_addr": "http://ccu/addons/xmlapi/statechange.cgi?ise_id={ise_id}&new_value={radon}",
//!     "homematic_ise_id": "4711"
//! }
//! ```
//!
//! `readout_interval` is in seconds, `reset_timer` in hours (0 disables the
//! restart). Timing overrides for the central state machine are optional.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::ble::address::{AddressType, BdAddress};
use crate::error::{Error, Result};
use crate::gatt::CentralTimings;

/// Longest accepted readout interval (one week).
pub const MAX_READOUT_INTERVAL_SECS: u64 = 7 * 24 * 3600;
/// Longest accepted restart period (one year).
pub const MAX_RESET_TIMER_HOURS: u64 = 365 * 24;
/// Longest accepted connection attempt timeout.
pub const MAX_CONNECT_TIMEOUT_MS: u64 = 60_000;
/// Longest accepted settle delay.
pub const MAX_SETTLE_DELAY_MS: u64 = 60_000;
/// Longest accepted connection watchdog.
pub const MAX_WATCHDOG_SECS: u64 = 3600;
/// Longest accepted uplink timeout.
pub const MAX_WIFI_TIMEOUT_SECS: u64 = 3600;

fn default_connect_timeout_ms() -> u64 {
    CentralTimings::DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}

fn default_settle_delay_ms() -> u64 {
    CentralTimings::DEFAULT_SETTLE_DELAY.as_millis() as u64
}

fn default_watchdog_secs() -> u64 {
    CentralTimings::DEFAULT_WATCHDOG_TIMEOUT.as_secs()
}

fn default_wifi_timeout_secs() -> u64 {
    30
}

/// Wireless network credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredentials {
    /// Network name.
    pub ssid: String,
    /// Passphrase.
    #[serde(rename = "pass")]
    pub password: String,
}

/// Complete reader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Uplink credentials, stored as top-level `ssid` and `pass` keys.
    #[serde(flatten)]
    pub network: NetworkCredentials,
    /// Sensor address in colon-hex form.
    pub radoneye_addr: String,
    /// Sensor address type (0 public, 1 random).
    #[serde(default)]
    pub radoneye_addr_type: u8,
    /// Seconds between readout cycles.
    pub readout_interval: u64,
    /// Hours until the process exits for a restart; 0 disables.
    #[serde(default)]
    pub reset_timer: u64,
    /// URL template with `{radon}` and `{ise_id}` placeholders.
    pub homematic_addr: String,
    /// HomeMatic system variable id.
    pub homematic_ise_id: String,
    /// Connection attempt timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Wait before characteristic discovery and the trigger write, in milliseconds.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Seconds a connection may stay open before it is forcibly closed.
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,
    /// Seconds to wait for the uplink before a cycle is skipped.
    #[serde(default = "default_wifi_timeout_secs")]
    pub wifi_timeout_secs: u64,
}

impl ReaderConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json(&content)?;
        debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Parse and validate a configuration from JSON text.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        self.address()?;
        self.address_type()?;

        if self.readout_interval == 0 {
            return Err(Error::config("readout_interval must be at least 1 second"));
        }
        if self.watchdog_secs == 0 {
            return Err(Error::config("watchdog_secs must be at least 1 second"));
        }
        check_max("readout_interval", self.readout_interval, MAX_READOUT_INTERVAL_SECS)?;
        check_max("reset_timer", self.reset_timer, MAX_RESET_TIMER_HOURS)?;
        check_max("connect_timeout_ms", self.connect_timeout_ms, MAX_CONNECT_TIMEOUT_MS)?;
        check_max("settle_delay_ms", self.settle_delay_ms, MAX_SETTLE_DELAY_MS)?;
        check_max("watchdog_secs", self.watchdog_secs, MAX_WATCHDOG_SECS)?;
        check_max("wifi_timeout_secs", self.wifi_timeout_secs, MAX_WIFI_TIMEOUT_SECS)?;
        if self.homematic_addr.trim().is_empty() {
            return Err(Error::config("homematic_addr is empty"));
        }

        Ok(())
    }

    /// The sensor address.
    pub fn address(&self) -> Result<BdAddress> {
        self.radoneye_addr.parse()
    }

    /// The sensor address type.
    pub fn address_type(&self) -> Result<AddressType> {
        match self.radoneye_addr_type {
            0 | 1 => Ok(AddressType::from_raw(self.radoneye_addr_type)),
            other => Err(Error::config(format!(
                "radoneye_addr_type must be 0 or 1, got {}",
                other
            ))),
        }
    }

    /// Time between readout cycles.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.readout_interval)
    }

    /// Time until the process should exit for a restart, if enabled.
    pub fn reset_interval(&self) -> Option<Duration> {
        (self.reset_timer > 0).then(|| Duration::from_secs(self.reset_timer.saturating_mul(3600)))
    }

    /// Timeout for bringing the uplink up.
    pub fn wifi_timeout(&self) -> Duration {
        Duration::from_secs(self.wifi_timeout_secs)
    }

    /// Timings for the central state machine.
    pub fn timings(&self) -> CentralTimings {
        CentralTimings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            watchdog_timeout: Duration::from_secs(self.watchdog_secs),
        }
    }
}

fn check_max(key: &str, value: u64, max: u64) -> Result<()> {
    if value > max {
        return Err(Error::config(format!(
            "{} must be at most {}, got {}",
            key, max, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"{
        "ssid": "home",
        "pass": "secret",
        "radoneye_addr": "aa:bb:cc:dd:ee:ff",
        "radoneye_addr_type": 1,
        "readout_interval": 600,
        "reset_timer": 24,
        "homematic_addr": "http://ccu/x?ise_id={ise_id}&new_value={radon}",
        "homematic_ise_id": "4711"
    }"#;

    #[test]
    fn test_parse_sample() {
        let config = ReaderConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.network.ssid, "home");
        assert_eq!(config.network.password, "secret");
        assert_eq!(
            config.address().unwrap(),
            BdAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF])
        );
        assert_eq!(config.address_type().unwrap(), AddressType::Random);
        assert_eq!(config.poll_interval(), Duration::from_secs(600));
        assert_eq!(config.reset_interval(), Some(Duration::from_secs(24 * 3600)));
        assert_eq!(config.timings(), CentralTimings::default());
        assert_eq!(config.wifi_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_reset_timer_zero_disables() {
        let json = SAMPLE.replace("\"reset_timer\": 24", "\"reset_timer\": 0");
        let config = ReaderConfig::from_json(&json).unwrap();
        assert_eq!(config.reset_interval(), None);
    }

    #[test]
    fn test_timing_overrides() {
        let json = SAMPLE.replace(
            "\"homematic_ise_id\": \"4711\"",
            "\"homematic_ise_id\": \"4711\", \"settle_delay_ms\": 50, \"watchdog_secs\": 3",
        );
        let timings = ReaderConfig::from_json(&json).unwrap().timings();
        assert_eq!(timings.settle_delay, Duration::from_millis(50));
        assert_eq!(timings.watchdog_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_rejects_bad_address() {
        let json = SAMPLE.replace("aa:bb:cc:dd:ee:ff", "aa:bb:cc");
        assert!(matches!(
            ReaderConfig::from_json(&json),
            Err(Error::Format { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_address_type() {
        let json = SAMPLE.replace("\"radoneye_addr_type\": 1", "\"radoneye_addr_type\": 7");
        assert!(matches!(
            ReaderConfig::from_json(&json),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_rejects_out_of_range_timings() {
        for (key, value) in [
            ("watchdog_secs", u64::MAX),
            ("connect_timeout_ms", MAX_CONNECT_TIMEOUT_MS + 1),
            ("settle_delay_ms", u64::MAX),
            ("wifi_timeout_secs", MAX_WIFI_TIMEOUT_SECS + 1),
        ] {
            let json = SAMPLE.replace(
                "\"homematic_ise_id\": \"4711\"",
                &format!("\"homematic_ise_id\": \"4711\", \"{}\": {}", key, value),
            );
            match ReaderConfig::from_json(&json) {
                Err(Error::Config { reason }) => assert!(reason.starts_with(key), "{}", reason),
                other => panic!("{} = {} accepted: {:?}", key, value, other),
            }
        }
    }

    #[test]
    fn test_huge_reset_timer() {
        let json = SAMPLE.replace("\"reset_timer\": 24", &format!("\"reset_timer\": {}", u64::MAX));
        assert!(matches!(
            ReaderConfig::from_json(&json),
            Err(Error::Config { .. })
        ));

        // An unvalidated value saturates instead of overflowing
        let mut config = ReaderConfig::from_json(SAMPLE).unwrap();
        config.reset_timer = u64::MAX;
        assert_eq!(config.reset_interval(), Some(Duration::from_secs(u64::MAX)));

        config.reset_timer = MAX_RESET_TIMER_HOURS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_missing_key() {
        let json = SAMPLE.replace("\"homematic_ise_id\": \"4711\"", "\"x\": 1");
        assert!(matches!(ReaderConfig::from_json(&json), Err(Error::Json(_))));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir()
            .join(format!("radoneye-config-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, SAMPLE).unwrap();
        let config = ReaderConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.homematic_ise_id, "4711");
    }
}
