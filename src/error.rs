//! # Error Types Module
//!
//! Centralized error handling for the fitsense core.
//! Each concern gets its own error type so callers can match on the failure
//! that actually matters to them.
//!
//! ## Error Types
//! - `DecodeError`: malformed sensor payloads (recovered locally)
//! - `TransportError`: faults reported by the wireless transport
//! - `ScanError`: scan could not start or found nothing
//! - `ConnectError`: tagged failure carried inside a `ConnectResult`
//! - `HealthError`: host health-data service failures
//! - `ConfigError`: configuration file I/O and parsing errors
//! - `ConnectionError`: connection thread start-up failures
//!
//! ## Propagation
//! Transport and query faults stop at the component boundary: the device
//! manager turns them into `ConnectResult`s and state transitions, the
//! health fetchers turn them into `None` fields. Only permission and
//! authorization denials are surfaced verbatim.

use std::fmt;

/// Errors that can occur when decoding a raw notification payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload carried no bytes
    Empty,
    /// Payload longer than any GATT attribute value can be
    Oversized(usize),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "Empty sensor payload"),
            DecodeError::Oversized(len) => {
                write!(f, "Sensor payload of {} bytes exceeds the attribute limit", len)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors reported by the wireless transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Bluetooth adapter not found or not available
    NoAdapter,
    /// Platform refused the Bluetooth permissions
    PermissionDenied,
    /// Scan could not be started or stopped
    Scan(String),
    /// Failed to open the link to a specific device
    Connect { device_id: String, reason: String },
    /// Service/characteristic enumeration failed
    Discovery(String),
    /// Could not subscribe to or unsubscribe from a characteristic
    Subscribe(String),
    /// Closing the link failed
    Disconnect(String),
    /// The transport has never seen a peripheral with this id
    UnknownPeripheral(String),
    /// A bounded operation did not finish in time
    Timeout(&'static str),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NoAdapter => {
                write!(f, "No Bluetooth adapter found. Please ensure Bluetooth is enabled.")
            }
            TransportError::PermissionDenied => write!(f, "Bluetooth permissions were denied"),
            TransportError::Scan(msg) => write!(f, "Scan operation failed: {}", msg),
            TransportError::Connect { device_id, reason } => {
                write!(f, "Failed to connect to device {}: {}", device_id, reason)
            }
            TransportError::Discovery(msg) => write!(f, "Service discovery failed: {}", msg),
            TransportError::Subscribe(msg) => write!(f, "Subscription failed: {}", msg),
            TransportError::Disconnect(msg) => write!(f, "Disconnect failed: {}", msg),
            TransportError::UnknownPeripheral(id) => write!(f, "Unknown peripheral {}", id),
            TransportError::Timeout(operation) => write!(f, "{} timed out", operation),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors that can occur when starting or completing a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// Bluetooth permissions were not granted
    PermissionDenied,
    /// Scan requested while the manager is busy with a connection
    InvalidState(String),
    /// The scan ran to completion without discovering anything
    NoPeripheralsFound,
    /// The transport failed to scan
    Transport(TransportError),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::PermissionDenied => {
                write!(f, "Bluetooth permissions are required to scan for sensors")
            }
            ScanError::InvalidState(state) => write!(f, "Cannot scan while {}", state),
            ScanError::NoPeripheralsFound => write!(
                f,
                "No sensors were found. Make sure your device is powered on and in range."
            ),
            ScanError::Transport(e) => write!(f, "Scan failed: {}", e),
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScanError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Tagged failure reason of a connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Bluetooth permissions were not granted
    PermissionDenied,
    /// The peripheral exposes no usable service or characteristic
    NoCompatiblePeripheral { device_id: String },
    /// Fault at the transport layer
    Transport(TransportError),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::PermissionDenied => {
                write!(f, "Bluetooth permissions are required to connect to the sensor")
            }
            ConnectError::NoCompatiblePeripheral { device_id } => {
                write!(f, "Device {} exposes no compatible sensor characteristic", device_id)
            }
            ConnectError::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for ConnectError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::PermissionDenied => ConnectError::PermissionDenied,
            other => ConnectError::Transport(other),
        }
    }
}

/// Errors raised by the host health-data service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthError {
    /// The platform has no health-data service
    Unavailable,
    /// The user has not granted access
    AuthorizationDenied,
    /// A read query failed
    Query(String),
    /// Writing a record failed
    Write(String),
    /// A query did not answer in time
    Timeout,
}

impl fmt::Display for HealthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthError::Unavailable => write!(f, "Health data is not available on this device"),
            HealthError::AuthorizationDenied => {
                write!(f, "Health data permissions are required to read and record activity")
            }
            HealthError::Query(msg) => write!(f, "Health query failed: {}", msg),
            HealthError::Write(msg) => write!(f, "Failed to record workout: {}", msg),
            HealthError::Timeout => write!(f, "Health query timed out"),
        }
    }
}

impl std::error::Error for HealthError {}

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(std::io::Error),
    /// Failed to write config file
    WriteFailed(std::io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::WriteFailed(e) => write!(f, "Failed to write config file: {}", e),
            ConfigError::ParseFailed(e) => write!(f, "Failed to parse config file: {}", e),
            ConfigError::SerializeFailed(e) => write!(f, "Failed to serialize config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
        }
    }
}

/// Errors that can occur while starting the connection thread
#[derive(Debug)]
pub enum ConnectionError {
    /// Failed to create Tokio runtime
    RuntimeCreation(String),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::RuntimeCreation(msg) => {
                write!(f, "Failed to create async runtime: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::NoAdapter;
        assert!(err.to_string().contains("Bluetooth"));
    }

    #[test]
    fn test_config_error_chain() {
        use std::error::Error;
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = ConfigError::ReadFailed(io_err);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_permission_denial_maps_to_connect_error() {
        let err: ConnectError = TransportError::PermissionDenied.into();
        assert_eq!(err, ConnectError::PermissionDenied);

        let err: ConnectError = TransportError::Timeout("connect").into();
        assert!(matches!(err, ConnectError::Transport(TransportError::Timeout(_))));
        assert_eq!(err.to_string(), "connect timed out");
    }

    #[test]
    fn test_scan_error_source() {
        use std::error::Error;
        let err = ScanError::Transport(TransportError::Scan("radio off".to_string()));
        assert!(err.source().is_some());
        assert!(ScanError::NoPeripheralsFound.source().is_none());
    }
}
