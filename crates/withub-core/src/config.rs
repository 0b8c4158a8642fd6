/*!
 * Configuration management for withub.
 *
 * This module provides functionality to load, validate, and access configuration
 * settings for the gateway: radio scanning, broker topics and the access point.
 */
use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{AccessPoint, QoS};
use crate::utils::RetryPolicy;

/// Gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Peripheral discovery and connection
    #[serde(default)]
    pub ble: BleConfig,

    /// Broker connection and topic layout
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Access point and link reconnection
    #[serde(default)]
    pub wifi: WifiConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Print the module path of each event
    #[serde(default = "default_true")]
    pub show_target: bool,
}

/// Retry settings as written in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts; absent means no limit
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Delay between attempts in milliseconds
    #[serde(default)]
    pub backoff_ms: u64,
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

/// Peripheral discovery and connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleConfig {
    /// Advertised name a peripheral must carry to be connected
    #[serde(default = "default_target_name")]
    pub target_name: String,

    /// Registry capacity
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,

    /// Service exposing the sensor attributes
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,

    /// Attribute the sensor notifies readings on
    #[serde(default = "default_notify_uuid")]
    pub notify_uuid: Uuid,

    /// Attribute accepting control writes
    #[serde(default = "default_write_uuid")]
    pub write_uuid: Uuid,

    /// Length of one scan window in milliseconds
    #[serde(default = "default_scan_window_ms")]
    pub scan_window_ms: u64,

    /// Pause between scan windows in milliseconds
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    /// Timeout of a single connection attempt in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Retry policy of the per-peripheral connect workflow
    #[serde(default = "default_connect_retry")]
    pub connect_retry: RetryConfig,

    /// Drop failed registry entries at the start of every scan window
    #[serde(default)]
    pub evict_failed_on_scan: bool,
}

impl BleConfig {
    /// Scan window as a duration
    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    /// Scan interval as a duration
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Client identifier; generated when absent
    #[serde(default)]
    pub client_id: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// First topic segment(s) of every gateway topic
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Last segment of outbound sensor data topics
    #[serde(default = "default_data_suffix")]
    pub data_suffix: String,

    /// Last segment of inbound control topics
    #[serde(default = "default_control_suffix")]
    pub control_suffix: String,

    /// Topics subscribed whenever the broker connects
    #[serde(default = "default_subscriptions")]
    pub subscriptions: Vec<String>,

    /// Delivery guarantee used for subscriptions
    #[serde(default)]
    pub qos: QoS,

    /// Depth of the inbound message queue
    #[serde(default = "default_inbound_queue_depth")]
    pub inbound_queue_depth: usize,

    /// Notifications waiting to be published; further ones are dropped
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,
}

/// Access point configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiConfig {
    /// Access point to join; the gateway waits for one to be set when absent
    #[serde(default)]
    pub access_point: Option<AccessPoint>,

    /// Retry policy of the link reconnect loop
    #[serde(default = "default_reconnect")]
    pub reconnect: RetryConfig,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            show_target: true,
        }
    }
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            target_name: default_target_name(),
            max_devices: default_max_devices(),
            service_uuid: default_service_uuid(),
            notify_uuid: default_notify_uuid(),
            write_uuid: default_write_uuid(),
            scan_window_ms: default_scan_window_ms(),
            scan_interval_ms: default_scan_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_retry: default_connect_retry(),
            evict_failed_on_scan: false,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: None,
            keep_alive_secs: default_keep_alive_secs(),
            topic_prefix: default_topic_prefix(),
            data_suffix: default_data_suffix(),
            control_suffix: default_control_suffix(),
            subscriptions: default_subscriptions(),
            qos: QoS::AtMostOnce,
            inbound_queue_depth: default_inbound_queue_depth(),
            outbound_queue_depth: default_outbound_queue_depth(),
        }
    }
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            access_point: None,
            reconnect: default_reconnect(),
        }
    }
}

fn default_app_name() -> String {
    "withub".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_target_name() -> String {
    "WT901BLE67".to_string()
}

fn default_max_devices() -> usize {
    12
}

fn default_service_uuid() -> Uuid {
    Uuid::from_u128(0x0000ffe5_0000_1000_8000_00805f9a34fb)
}

fn default_notify_uuid() -> Uuid {
    Uuid::from_u128(0x0000ffe4_0000_1000_8000_00805f9a34fb)
}

fn default_write_uuid() -> Uuid {
    Uuid::from_u128(0x0000ffe9_0000_1000_8000_00805f9a34fb)
}

fn default_scan_window_ms() -> u64 {
    5_000
}

fn default_scan_interval_ms() -> u64 {
    1_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_connect_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: Some(1),
        backoff_ms: 0,
    }
}

fn default_mqtt_host() -> String {
    "weihua-iot.cn".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_topic_prefix() -> String {
    "/wit".to_string()
}

fn default_data_suffix() -> String {
    "data".to_string()
}

fn default_control_suffix() -> String {
    "control".to_string()
}

fn default_subscriptions() -> Vec<String> {
    vec!["/wit/+/control".to_string()]
}

fn default_inbound_queue_depth() -> usize {
    8
}

fn default_outbound_queue_depth() -> usize {
    64
}

fn default_reconnect() -> RetryConfig {
    RetryConfig {
        max_attempts: None,
        backoff_ms: 1_000,
    }
}

impl Config {
    /// Check values the rest of the gateway relies on
    pub fn validate(&self) -> Result<()> {
        if self.ble.target_name.is_empty() {
            return Err(Error::config("ble.target_name must not be empty"));
        }
        if self.ble.max_devices == 0 {
            return Err(Error::config("ble.max_devices must be at least 1"));
        }
        if self.mqtt.host.is_empty() {
            return Err(Error::config("mqtt.host must not be empty"));
        }
        if self.mqtt.keep_alive_secs < 5 {
            return Err(Error::config("mqtt.keep_alive_secs must be at least 5"));
        }
        if self.mqtt.inbound_queue_depth == 0 {
            return Err(Error::config("mqtt.inbound_queue_depth must be at least 1"));
        }
        if self.mqtt.outbound_queue_depth == 0 {
            return Err(Error::config("mqtt.outbound_queue_depth must be at least 1"));
        }
        if let Some(ap) = &self.wifi.access_point {
            ap.validate()
                .map_err(|e| Error::config(format!("wifi.access_point: {}", e)))?;
        }
        Ok(())
    }
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

        // Start with default values
        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "withub");
        assert_eq!(config.ble.target_name, "WT901BLE67");
        assert_eq!(config.ble.max_devices, 12);
        assert_eq!(
            config.ble.service_uuid.to_string(),
            "0000ffe5-0000-1000-8000-00805f9a34fb"
        );
        assert_eq!(config.mqtt.topic_prefix, "/wit");
        assert_eq!(config.mqtt.inbound_queue_depth, 8);
        assert_eq!(config.mqtt.outbound_queue_depth, 64);
        assert!(config.wifi.access_point.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_config_into_policy() {
        let policy: RetryPolicy = Config::default().wifi.reconnect.into();
        assert_eq!(policy, RetryPolicy::forever(Duration::from_secs(1)));

        let policy: RetryPolicy = Config::default().ble.connect_retry.into();
        assert_eq!(policy, RetryPolicy::once());
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.general.app_name, "withub");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.subscriptions, vec!["/wit/+/control".to_string()]);
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("withub.toml");

        {
            let mut file = File::create(&file_path)?;
            file.write_all(
                br#"
                [ble]
                target_name = "WT901BLE68"
                max_devices = 4
                evict_failed_on_scan = true

                [mqtt]
                host = "localhost"
                qos = 1
                subscriptions = ["/wit/+/control", "/wit/broadcast"]

                [wifi.access_point]
                ssid = "lab"
                password = "secret"
            "#,
            )?;
        }

        let config = ConfigBuilder::new().with_config_file(file_path).build()?;

        assert_eq!(config.ble.target_name, "WT901BLE68");
        assert_eq!(config.ble.max_devices, 4);
        assert!(config.ble.evict_failed_on_scan);
        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.qos, QoS::AtLeastOnce);
        assert_eq!(config.mqtt.subscriptions.len(), 2);
        assert_eq!(
            config.wifi.access_point,
            Some(AccessPoint::new("lab", "secret"))
        );

        Ok(())
    }

    #[test]
    fn test_config_builder_rejects_invalid_values() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("withub.toml");
        File::create(&file_path)?.write_all(b"[ble]\nmax_devices = 0\n")?;

        let result = ConfigBuilder::new().with_config_file(file_path).build();
        assert!(matches!(result, Err(Error::Config(_))));
        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("WITHUBTEST__MQTT__HOST", "broker.local");
        env::set_var("WITHUBTEST__BLE__MAX_DEVICES", "3");

        let config = ConfigBuilder::new()
            .with_environment_prefix("withubtest")
            .build()?;

        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.ble.max_devices, 3);

        env::remove_var("WITHUBTEST__MQTT__HOST");
        env::remove_var("WITHUBTEST__BLE__MAX_DEVICES");

        Ok(())
    }
}
