/*!
 * Core data types for withub.
 *
 * This module defines the value types shared by the radio side and the
 * broker side of the gateway.
 */
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Hardware address of a peripheral
///
/// The address is the unique key for a peripheral everywhere in the gateway.
/// On the broker side it is spelled as 12 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceAddress([u8; DeviceAddress::LEN]);

impl DeviceAddress {
    /// Number of bytes in an address
    pub const LEN: usize = 6;

    /// Number of characters in the hex spelling of an address
    pub const HEX_LEN: usize = Self::LEN * 2;

    /// Create an address from raw bytes
    pub const fn new(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Encode as 12 lowercase hex characters without separators
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decode from exactly 12 hex characters
    ///
    /// Either case is accepted. The canonical spelling is the lowercase one
    /// produced by [`to_hex`](Self::to_hex), so only lowercase input
    /// re-encodes to the same string.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != Self::HEX_LEN {
            return Err(Error::invalid_argument(format!(
                "address must be {} hex characters, got {:?}",
                Self::HEX_LEN,
                s
            )));
        }

        let mut bytes = [0u8; Self::LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| Error::invalid_argument(format!("invalid address {:?}: {}", s, e)))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceAddress({})", self)
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    /// Accepts both `aa:bb:cc:dd:ee:ff` and `aabbccddeeff`
    fn from_str(s: &str) -> Result<Self> {
        if s.contains(':') {
            Self::from_hex(&s.replace(':', ""))
        } else {
            Self::from_hex(s)
        }
    }
}

impl From<[u8; DeviceAddress::LEN]> for DeviceAddress {
    fn from(bytes: [u8; DeviceAddress::LEN]) -> Self {
        Self(bytes)
    }
}

impl From<DeviceAddress> for [u8; DeviceAddress::LEN] {
    fn from(address: DeviceAddress) -> Self {
        address.0
    }
}

/// Credentials of the wireless access point the gateway joins
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPoint {
    /// Network name
    pub ssid: String,
    /// Network passphrase, empty for open networks
    #[serde(default)]
    pub password: String,
}

impl AccessPoint {
    /// Longest accepted ssid in bytes
    pub const MAX_SSID_LEN: usize = 32;

    /// Longest accepted password in bytes
    pub const MAX_PASSWORD_LEN: usize = 64;

    /// Create a new access point configuration
    pub fn new<S: Into<String>, P: Into<String>>(ssid: S, password: P) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }

    /// Check the ssid and password against the link layer limits
    pub fn validate(&self) -> Result<()> {
        if self.ssid.is_empty() {
            return Err(Error::invalid_argument("ssid must not be empty"));
        }
        if self.ssid.len() > Self::MAX_SSID_LEN {
            return Err(Error::invalid_argument(format!(
                "ssid longer than {} bytes",
                Self::MAX_SSID_LEN
            )));
        }
        if self.password.len() > Self::MAX_PASSWORD_LEN {
            return Err(Error::invalid_argument(format!(
                "password longer than {} bytes",
                Self::MAX_PASSWORD_LEN
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for AccessPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessPoint")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Broker delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// Fire and forget
    #[default]
    AtMostOnce,
    /// Acknowledged delivery
    AtLeastOnce,
    /// Assured delivery
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(level: u8) -> Result<Self> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(Error::invalid_argument(format!("invalid qos level {}", other))),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// Outbound broker message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMessage {
    /// Destination topic
    pub topic: String,
    /// Message body
    pub payload: Bytes,
    /// Delivery guarantee
    pub qos: QoS,
    /// Whether the broker keeps the message for late subscribers
    pub retain: bool,
}

impl PublishMessage {
    /// Create a message with qos 0 and no retain flag
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    /// Set the delivery guarantee
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set the retain flag
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Inbound broker message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeMessage {
    /// Topic the message arrived on
    pub topic: String,
    /// Message body
    pub payload: Bytes,
}

impl SubscribeMessage {
    /// Create a new inbound message
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}
