use std::time::Duration;

/// Errors surfaced by the client core.
///
/// Transport-level failures are *recoverable*: the failover layer retries them locally and the
///  application only sees them for requests that were in flight at the time. Everything else is
///  reported as-is.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    /// A blocking call ran into its deadline. Resource state is unaffected.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// A one-shot request was issued while the connection was interrupted, and the configured
    ///  policy is to fail fast rather than wait for restoration
    #[error("connection is interrupted")]
    Interrupted,

    /// The remote peer closed the connection, asking the client to reconnect elsewhere
    #[error("connection redirected to {hostname} at {network_host}:{port}")]
    Redirected {
        hostname: String,
        network_host: String,
        port: u16,
    },

    #[error("remote peer closed the connection: {condition}: {description}")]
    RemoteClosed {
        condition: String,
        description: String,
    },

    #[error("{message}")]
    IllegalState {
        message: String,
        #[source]
        cause: Option<Box<ClientError>>,
    },

    #[error("giving up after {attempts} failed connection attempts")]
    ReconnectExhausted {
        attempts: u32,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("message listener failed: {0}")]
    Listener(String),

    #[error("transaction rolled back: {0}")]
    TransactionRolledBack(String),

    /// The broker rejected a request
    #[error("remote error: {0}")]
    Remote(String),
}

impl ClientError {
    pub fn illegal_state(message: impl Into<String>) -> ClientError {
        ClientError::IllegalState {
            message: message.into(),
            cause: None,
        }
    }

    pub fn illegal_state_caused_by(message: impl Into<String>, cause: Option<ClientError>) -> ClientError {
        ClientError::IllegalState {
            message: message.into(),
            cause: cause.map(Box::new),
        }
    }

    /// Transient failures are handled by reconnecting, all other errors are final for the
    ///  resource or request they refer to.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ClientError::TransportFailure(_) | ClientError::Interrupted)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout(_))
    }

    /// A fatal remote closure ends the connection instead of triggering a reconnect, unless
    ///  redirects are followed.
    pub fn is_remote_closure(&self) -> bool {
        matches!(self, ClientError::Redirected { .. } | ClientError::RemoteClosed { .. })
    }

    pub fn cause(&self) -> Option<&ClientError> {
        match self {
            ClientError::IllegalState { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for ClientError {
    fn from(value: anyhow::Error) -> Self {
        ClientError::Listener(format!("{:#}", value))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::timeout(ClientError::Timeout(Duration::from_millis(5)), false)]
    #[case::transport(ClientError::TransportFailure("reset".to_string()), true)]
    #[case::interrupted(ClientError::Interrupted, true)]
    #[case::redirect(ClientError::Redirected { hostname: "vhost".to_string(), network_host: "localhost".to_string(), port: 5677 }, false)]
    #[case::remote_closed(ClientError::RemoteClosed { condition: "amqp:resource-limit-exceeded".to_string(), description: "x".to_string() }, false)]
    #[case::illegal_state(ClientError::illegal_state("closed"), false)]
    fn test_is_recoverable(#[case] error: ClientError, #[case] expected: bool) {
        assert_eq!(error.is_recoverable(), expected);
    }

    #[test]
    fn test_illegal_state_carries_cause() {
        let cause = ClientError::RemoteClosed {
            condition: "amqp:resource-limit-exceeded".to_string(),
            description: "ErrorMessage".to_string(),
        };
        let error = ClientError::illegal_state_caused_by("The MessageConsumer was closed due to an unrecoverable error.", Some(cause.clone()));

        assert_eq!(error.cause(), Some(&cause));
        let source = error.source().map(|s| s.to_string()).unwrap_or_default();
        assert!(source.contains("amqp:resource-limit-exceeded"));
        assert!(source.contains("ErrorMessage"));
    }
}
