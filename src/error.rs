//! Error types for the MQTT client core
//!
//! One taxonomy covers the whole connection lifecycle: connect failures,
//! transport loss, keep-alive expiry, codec violations and per-operation
//! failures. Transport and keep-alive failures are terminal for the
//! connection and are never retried here; reconnection policy belongs to
//! the caller.

use thiserror::Error;

/// Main error type for MQTT client operations
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connect timed out waiting for CONNACK")]
    ConnectTimeout,

    #[error("Broker rejected CONNECT with return code {reason_code}")]
    ConnectRejected { reason_code: u8 },

    #[error("Transport lost: {0}")]
    TransportLost(String),

    #[error("Keep-alive expired without broker activity")]
    KeepAliveTimeout,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Publish failed: {reason}")]
    PublishFailed { reason: PublishFailure },

    #[error("Broker rejected SUBSCRIBE with return code {reason_code}")]
    SubscribeRejected { reason_code: u8 },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid topic filter: {0}")]
    InvalidFilter(String),

    #[error("Timed out waiting for {operation} acknowledgment")]
    ResponseTimeout { operation: &'static str },

    #[error("TLS setup failed: {0}")]
    Tls(String),
}

/// Why a QoS 1 publish did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishFailure {
    /// All retransmissions were exhausted without a PUBACK
    MaxRetriesExceeded,
    /// The connection went away while the publish was in flight
    ConnectionLost,
}

impl std::fmt::Display for PublishFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishFailure::MaxRetriesExceeded => write!(f, "max retries exceeded"),
            PublishFailure::ConnectionLost => write!(f, "connection lost"),
        }
    }
}

impl MqttError {
    /// Shorthand for the QoS 1 retry-exhaustion failure
    pub fn max_retries_exceeded() -> Self {
        MqttError::PublishFailed {
            reason: PublishFailure::MaxRetriesExceeded,
        }
    }
}

/// Why an established connection ended, delivered through the
/// disconnect-notification channel of the client facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called
    ClientRequested,
    /// A read or write against the transport failed
    TransportLost(String),
    /// No packet was received within 1.5x the keep-alive interval
    KeepAliveTimeout,
    /// Inbound bytes could not be decoded; not recoverable mid-stream
    MalformedPacket(String),
    /// The broker sent DISCONNECT
    ServerDisconnect,
}

impl DisconnectReason {
    /// Map the teardown reason onto the error surfaced to in-flight callers.
    pub fn as_error(&self) -> MqttError {
        match self {
            DisconnectReason::ClientRequested => MqttError::ConnectionClosed,
            DisconnectReason::TransportLost(detail) => MqttError::TransportLost(detail.clone()),
            DisconnectReason::KeepAliveTimeout => MqttError::KeepAliveTimeout,
            DisconnectReason::MalformedPacket(detail) => MqttError::MalformedPacket(detail.clone()),
            DisconnectReason::ServerDisconnect => MqttError::ConnectionClosed,
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ClientRequested => write!(f, "client requested"),
            DisconnectReason::TransportLost(detail) => write!(f, "transport lost: {detail}"),
            DisconnectReason::KeepAliveTimeout => write!(f, "keep-alive timeout"),
            DisconnectReason::MalformedPacket(detail) => write!(f, "malformed packet: {detail}"),
            DisconnectReason::ServerDisconnect => write!(f, "server disconnect"),
        }
    }
}

/// Result type for MQTT client operations
pub type MqttResult<T> = Result<T, MqttError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_is_nonempty() {
        let errors = vec![
            MqttError::ConnectTimeout,
            MqttError::ConnectRejected { reason_code: 5 },
            MqttError::TransportLost("broken pipe".to_string()),
            MqttError::KeepAliveTimeout,
            MqttError::MalformedPacket("bad length".to_string()),
            MqttError::max_retries_exceeded(),
            MqttError::SubscribeRejected { reason_code: 0x80 },
            MqttError::ConnectionClosed,
            MqttError::InvalidFilter("a/#/b".to_string()),
            MqttError::ResponseTimeout {
                operation: "subscribe",
            },
            MqttError::Tls("no key found".to_string()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_connect_rejected_carries_reason_code() {
        let error = MqttError::ConnectRejected { reason_code: 4 };
        assert!(error.to_string().contains('4'));
    }

    #[test]
    fn test_disconnect_reason_maps_to_errors() {
        assert!(matches!(
            DisconnectReason::ClientRequested.as_error(),
            MqttError::ConnectionClosed
        ));
        assert!(matches!(
            DisconnectReason::KeepAliveTimeout.as_error(),
            MqttError::KeepAliveTimeout
        ));
        assert!(matches!(
            DisconnectReason::TransportLost("x".to_string()).as_error(),
            MqttError::TransportLost(_)
        ));
        assert!(matches!(
            DisconnectReason::MalformedPacket("x".to_string()).as_error(),
            MqttError::MalformedPacket(_)
        ));
        assert!(matches!(
            DisconnectReason::ServerDisconnect.as_error(),
            MqttError::ConnectionClosed
        ));
    }

    #[test]
    fn test_publish_failure_display() {
        assert_eq!(
            PublishFailure::MaxRetriesExceeded.to_string(),
            "max retries exceeded"
        );
        assert_eq!(PublishFailure::ConnectionLost.to_string(), "connection lost");
    }
}
