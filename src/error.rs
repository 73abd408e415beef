//! Error types for the benchmark driver adapter

/// Main error type for driver operations
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Session open or transport failure, fatal for that session
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Queue or topic setup failed
    #[error("Provisioning error: {message}")]
    Provisioning { message: String },

    /// A request the underlying broker cannot honor, failed before any network call
    #[error("Unsupported configuration: {message}")]
    UnsupportedConfiguration { message: String },

    /// A send was rejected or failed, reported through the send's completion
    #[error("Delivery error: {message}")]
    Delivery { message: String },

    /// Producer/consumer setup failed partway through
    #[error("Construction error: {message}")]
    Construction { message: String },

    /// A closed session was asked to create new resources
    #[error("Session is closed")]
    SessionClosed,

    /// Malformed or unexpected wire traffic
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Broker configuration could not be loaded or parsed
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Timeout errors
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// One or more resources failed to close during shutdown
    #[error(transparent)]
    Shutdown(#[from] ShutdownErrors),
}

impl DriverError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new provisioning error
    pub fn provisioning<S: Into<String>>(message: S) -> Self {
        Self::Provisioning {
            message: message.into(),
        }
    }

    /// Create a new unsupported-configuration error
    pub fn unsupported_configuration<S: Into<String>>(message: S) -> Self {
        Self::UnsupportedConfiguration {
            message: message.into(),
        }
    }

    /// Create a new delivery error
    pub fn delivery<S: Into<String>>(message: S) -> Self {
        Self::Delivery {
            message: message.into(),
        }
    }

    /// Create a new construction error
    pub fn construction<S: Into<String>>(message: S) -> Self {
        Self::Construction {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Io(_))
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error rejects an unsupported request
    pub fn is_unsupported_configuration(&self) -> bool {
        matches!(self, Self::UnsupportedConfiguration { .. })
    }
}

/// Aggregate of all errors encountered while closing registered resources.
///
/// `Driver::close_all` keeps closing past individual failures so that one
/// misbehaving resource cannot leak the rest; everything that went wrong is
/// collected here.
#[derive(Debug, thiserror::Error)]
#[error("{} resource(s) failed to close cleanly", .errors.len())]
pub struct ShutdownErrors {
    pub errors: Vec<DriverError>,
}

impl ShutdownErrors {
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Error code mapping for broker protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No error
    None = 0,
    /// Unknown broker error
    Unknown = -1,
    /// Queue already provisioned
    QueueAlreadyExists = 1,
    /// Queue does not exist
    QueueNotFound = 2,
    /// Subscription does not exist
    SubscriptionNotFound = 3,
    /// Credentials or permissions rejected
    AccessDenied = 4,
    /// Virtual host does not exist
    VirtualHostNotFound = 5,
    /// Broker could not parse the frame
    MalformedFrame = 6,
}

impl ErrorCode {
    /// Convert error code to a driver error
    pub fn to_driver_error(self, context: &str) -> DriverError {
        match self {
            ErrorCode::None => DriverError::protocol("error frame with no error code"),
            ErrorCode::Unknown => {
                DriverError::connection(format!("unknown broker error: {}", context))
            }
            ErrorCode::QueueAlreadyExists => {
                DriverError::provisioning(format!("queue already exists: {}", context))
            }
            ErrorCode::QueueNotFound => {
                DriverError::provisioning(format!("queue not found: {}", context))
            }
            ErrorCode::SubscriptionNotFound => {
                DriverError::construction(format!("subscription not found: {}", context))
            }
            ErrorCode::AccessDenied => {
                DriverError::connection(format!("access denied: {}", context))
            }
            ErrorCode::VirtualHostNotFound => {
                DriverError::connection(format!("virtual host not found: {}", context))
            }
            ErrorCode::MalformedFrame => {
                DriverError::protocol(format!("malformed frame: {}", context))
            }
        }
    }
}

impl From<i16> for ErrorCode {
    fn from(code: i16) -> Self {
        match code {
            0 => ErrorCode::None,
            1 => ErrorCode::QueueAlreadyExists,
            2 => ErrorCode::QueueNotFound,
            3 => ErrorCode::SubscriptionNotFound,
            4 => ErrorCode::AccessDenied,
            5 => ErrorCode::VirtualHostNotFound,
            6 => ErrorCode::MalformedFrame,
            _ => ErrorCode::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        assert_eq!(ErrorCode::from(1), ErrorCode::QueueAlreadyExists);
        assert_eq!(ErrorCode::from(4), ErrorCode::AccessDenied);
        assert_eq!(ErrorCode::from(99), ErrorCode::Unknown);
    }

    #[test]
    fn test_error_code_mapping() {
        let err = ErrorCode::VirtualHostNotFound.to_driver_error("vpn-1");
        assert!(err.is_connection_error());

        let err = ErrorCode::QueueAlreadyExists.to_driver_error("Q/x");
        assert!(matches!(err, DriverError::Provisioning { .. }));
    }

    #[test]
    fn test_shutdown_errors_display() {
        let agg = ShutdownErrors {
            errors: vec![
                DriverError::connection("gone"),
                DriverError::delivery("rejected"),
            ],
        };
        assert_eq!(agg.len(), 2);
        assert_eq!(agg.to_string(), "2 resource(s) failed to close cleanly");
    }

    #[test]
    fn test_predicates() {
        assert!(DriverError::timeout(100).is_timeout());
        assert!(DriverError::unsupported_configuration("partitions").is_unsupported_configuration());
        assert!(!DriverError::delivery("x").is_connection_error());
    }
}
