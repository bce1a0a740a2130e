use thiserror::Error;

/// Crate-wide error type.
///
/// The variants map onto how a failure is handled: `Config` aborts
/// startup, `Routing`/`Dial`/`Protocol` refuse a single session,
/// `Transport` tears down one channel pair, and `Internal` covers
/// recovered panics and other programming surprises. Errors are never
/// propagated across the agent/dst boundary; they are converted into
/// local teardown at the callback that observed them.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(String),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("dial error: {0}")]
    Dial(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// True when the error should abort process startup rather than a
    /// single session.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(self, AgentError::Config(_) | AgentError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::Routing("no location for pattern /x".to_string());
        assert_eq!(err.to_string(), "routing error: no location for pattern /x");
    }

    #[test]
    fn test_startup_fatal() {
        assert!(AgentError::Config("bad".into()).is_startup_fatal());
        assert!(!AgentError::Dial("refused".into()).is_startup_fatal());
    }
}
