use thiserror::Error;

/// Errors surfaced by the relay core to protocol handlers.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid path name: {reason} ({name})")]
    InvalidName { name: String, reason: String },

    #[error("unable to find a valid configuration for path '{0}'")]
    NotFound(String),

    /// IP rejection or credential failure. Carries the wire-level status
    /// the protocol handler should relay (401).
    #[error("authentication failed: {message}")]
    AuthCritical { message: String, status: u16 },

    #[error("not allowed")]
    NotAllowed,

    #[error("someone is already publishing on path '{0}'")]
    AlreadyPublishing(String),

    #[error("terminated")]
    Terminated,

    #[error("external authentication request failed: {0}")]
    Upstream(String),

    #[error("configuration error: {message}")]
    Config { message: String },
}

impl RelayError {
    pub fn auth_critical(message: impl Into<String>) -> Self {
        RelayError::AuthCritical {
            message: message.into(),
            status: 401,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        RelayError::Config {
            message: message.into(),
        }
    }

    /// Status code the protocol handler should put on the wire, if any.
    pub fn wire_status(&self) -> Option<u16> {
        match self {
            RelayError::AuthCritical { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Client-caused failures are expected traffic and stay below the
    /// error log level.
    pub fn should_log_error(&self) -> bool {
        matches!(self, RelayError::Upstream(_) | RelayError::Config { .. })
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_status() {
        let err = RelayError::auth_critical("IP '10.1.1.1' not allowed");
        assert_eq!(err.wire_status(), Some(401));
        assert!(!err.should_log_error());

        assert_eq!(RelayError::NotAllowed.wire_status(), None);
        assert_eq!(RelayError::Terminated.wire_status(), None);
    }

    #[test]
    fn test_not_found_message() {
        let err = RelayError::NotFound("cam1".to_string());
        assert_eq!(
            err.to_string(),
            "unable to find a valid configuration for path 'cam1'"
        );
    }

    #[test]
    fn test_log_policy() {
        assert!(RelayError::Upstream("connection refused".into()).should_log_error());
        assert!(!RelayError::NotFound("x".into()).should_log_error());
        assert!(!RelayError::AlreadyPublishing("x".into()).should_log_error());
    }
}
