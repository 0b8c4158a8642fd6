/*!
 * Error types for the withub gateway crate.
 */
use thiserror::Error;

/// Error type for gateway operations
#[derive(Error, Debug)]
pub enum Error {
    /// A topic does not follow the expected layout
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// The operation is not possible in the current network state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An argument failed validation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The broker refused an outbound message
    #[error("Failed to publish to {topic}: {reason}")]
    PublishFailure {
        /// Destination topic
        topic: String,
        /// What went wrong
        reason: String,
    },

    /// The broker refused one or more subscriptions
    #[error("Failed to subscribe to {topics:?}: {reason}")]
    BrokerSubscribeFailure {
        /// Topics that could not be subscribed
        topics: Vec<String>,
        /// What went wrong
        reason: String,
    },

    /// The broker client failed
    #[error("Broker error: {0}")]
    BrokerFailure(String),

    /// The network link failed
    #[error("Link error: {0}")]
    LinkFailure(String),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] withub_devices::DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] withub_core::error::Error),
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new invalid topic error
    pub fn invalid_topic<S: AsRef<str>>(msg: S) -> Self {
        Error::InvalidTopic(msg.as_ref().to_string())
    }

    /// Create a new invalid state error
    pub fn invalid_state<S: AsRef<str>>(msg: S) -> Self {
        Error::InvalidState(msg.as_ref().to_string())
    }

    /// Create a new broker error
    pub fn broker<S: AsRef<str>>(msg: S) -> Self {
        Error::BrokerFailure(msg.as_ref().to_string())
    }

    /// Create a new link error
    pub fn link<S: AsRef<str>>(msg: S) -> Self {
        Error::LinkFailure(msg.as_ref().to_string())
    }

    /// Convert a core validation error, keeping it an argument error
    pub fn from_validation(err: withub_core::error::Error) -> Self {
        match err {
            withub_core::error::Error::InvalidArgument(msg) => Error::InvalidArgument(msg),
            other => Error::Core(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_stay_argument_errors() {
        let err = Error::from_validation(withub_core::error::Error::invalid_argument("ssid"));
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = Error::from_validation(withub_core::error::Error::runtime("boom"));
        assert!(matches!(err, Error::Core(_)));
    }

    #[test]
    fn test_subscribe_failure_lists_topics() {
        let err = Error::BrokerSubscribeFailure {
            topics: vec!["/a".to_string(), "/b".to_string()],
            reason: "refused".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/a") && msg.contains("/b"));
    }
}
