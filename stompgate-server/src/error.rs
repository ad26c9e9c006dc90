//! Error types for the bridge, the broker collaborator and the server host.

use stompgate_protocol::version::UnsupportedVersion;
use stompgate_protocol::ParseError;
use thiserror::Error;

/// Failures raised by the broker collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("authentication failed for login '{0}'")]
    AuthenticationFailed(String),

    #[error("broker connection is not connected")]
    NotConnected,

    #[error("broker connection is closed")]
    Closed,

    #[error("invalid destination name '{0}'")]
    InvalidDestination(String),

    #[error("subscription '{0}' not found")]
    SubscriptionNotFound(String),

    #[error("subscription '{0}' already registered")]
    SubscriptionExists(String),

    #[error("durable subscription '{0}' is already active")]
    DurableSubscriptionActive(String),

    #[error("message '{message_id}' not pending on subscription '{subscription}'")]
    MessageNotFound {
        subscription: String,
        message_id: String,
    },

    #[error("transaction '{0}' not found")]
    TransactionNotFound(String),

    #[error("transaction '{0}' already started")]
    TransactionExists(String),

    #[error("unrecoverable acknowledgement failure: {0}")]
    UnrecoverableAck(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl BrokerError {
    /// Returns whether the connection cannot continue after this failure.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            BrokerError::UnrecoverableAck(_) | BrokerError::ResourceExhausted(_)
        )
    }
}

/// The outbound sink no longer accepts frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("outbound frame sink is closed")]
pub struct SinkClosed;

/// Failures of a single dispatched command.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("version negotiation failed")]
    Negotiation(#[from] UnsupportedVersion),

    #[error("unknown command {0}")]
    UnknownCommand(String),

    #[error("not connected, CONNECT must be the first frame")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("header '{header}' not specified for {command}")]
    MissingHeader {
        header: &'static str,
        command: &'static str,
    },

    #[error("invalid value '{value}' for header '{header}'")]
    InvalidHeaderValue { header: &'static str, value: String },

    #[error("subscription id '{0}' already exists on this connection")]
    DuplicateSubscription(String),

    #[error("subscription id '{0}' not found")]
    UnknownSubscription(String),

    #[error("UNSUBSCRIBE requires a 'destination' or 'id' header")]
    UnsubscribeTarget,

    #[error("invalid destination '{0}'")]
    InvalidDestination(String),

    #[error("temporary destination not found: {0}")]
    DestinationNotFound(String),

    #[error("malformed frame")]
    Parse(#[from] ParseError),

    #[error("broker failure")]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Sink(#[from] SinkClosed),
}

impl BridgeError {
    /// Returns whether reporting this error must close the connection.
    pub fn is_fatal(&self) -> bool {
        match self {
            BridgeError::Negotiation(_) => true,
            BridgeError::Parse(e) => e.is_fatal(),
            BridgeError::Broker(e) => e.is_unrecoverable(),
            _ => false,
        }
    }

    /// Renders the error and its causes, one per line.
    pub fn chain(&self) -> String {
        let mut rendered = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            rendered.push_str("\ncaused by: ");
            rendered.push_str(&cause.to_string());
            source = cause.source();
        }
        rendered
    }

    /// One-line summary including the direct cause.
    pub fn summary(&self) -> String {
        match std::error::Error::source(self) {
            Some(cause) => format!("{}: {}", self, cause),
            None => self.to_string(),
        }
    }
}

/// Host errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("server shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_policy() {
        let negotiation = BridgeError::from(UnsupportedVersion {
            requested: "9.9".to_string(),
            supported: "1.0,1.1,1.2".to_string(),
        });
        assert!(negotiation.is_fatal());

        assert!(BridgeError::from(ParseError::TooManyHeaders { max: 1000 }).is_fatal());
        assert!(!BridgeError::from(ParseError::InvalidHeader("x".to_string())).is_fatal());

        assert!(BridgeError::from(BrokerError::UnrecoverableAck("gone".to_string())).is_fatal());
        assert!(BridgeError::from(BrokerError::ResourceExhausted("heap".to_string())).is_fatal());
        assert!(!BridgeError::from(BrokerError::TransactionNotFound("t".to_string())).is_fatal());

        assert!(!BridgeError::DuplicateSubscription("s".to_string()).is_fatal());
        assert!(!BridgeError::UnknownCommand("NACK".to_string()).is_fatal());
    }

    #[test]
    fn test_chain_includes_causes() {
        let err = BridgeError::from(BrokerError::TransactionNotFound("tx-1".to_string()));
        let chain = err.chain();
        assert_eq!(chain, "broker failure\ncaused by: transaction 'tx-1' not found");
        assert_eq!(err.summary(), "broker failure: transaction 'tx-1' not found");
    }

    #[test]
    fn test_summary_without_cause() {
        let err = BridgeError::MissingHeader {
            header: "destination",
            command: "SEND",
        };
        assert_eq!(err.summary(), "header 'destination' not specified for SEND");
        assert_eq!(err.chain(), err.summary());
    }
}
