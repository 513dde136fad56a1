use std::sync::Arc;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
type SharedError = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Connect,
    Tls,
    Write,
    Read,
    RemotelyClosed,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Write => "write",
            Self::Read => "read",
            Self::RemotelyClosed => "remotely_closed",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutPhase {
    Request,
    Read,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Request => "request",
            Self::Read => "read",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    Timeout,
    Transport,
    Cancelled,
    TooManyConnections,
    TooManyConnectionsPerHost,
    Closed,
    BodyAlreadyFinished,
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    InvalidNoProxyRule,
    InvalidConfig,
    Handler,
    WaitTimeout,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Cancelled => "cancelled",
            Self::TooManyConnections => "too_many_connections",
            Self::TooManyConnectionsPerHost => "too_many_connections_per_host",
            Self::Closed => "closed",
            Self::BodyAlreadyFinished => "body_already_finished",
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::InvalidNoProxyRule => "invalid_no_proxy_rule",
            Self::InvalidConfig => "invalid_config",
            Self::Handler => "handler",
            Self::WaitTimeout => "wait_timeout",
        }
    }
}

/// Terminal and caller-facing failures.
///
/// The type is `Clone` so that a settled [`ResponseFuture`](crate::ResponseFuture)
/// can hand the same outcome to every consumer; wrapped sources are shared.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("{phase} timeout to {remote} after {elapsed_ms}ms")]
    Timeout {
        phase: TimeoutPhase,
        elapsed_ms: u128,
        remote: String,
    },
    #[error("transport error ({kind}) for {remote}: {source}")]
    Transport {
        kind: TransportErrorKind,
        remote: String,
        #[source]
        source: SharedError,
    },
    #[error("request was cancelled")]
    Cancelled,
    #[error("too many connections: global limit of {limit} reached")]
    TooManyConnections { limit: usize },
    #[error("too many connections to {partition}: per-host limit of {limit} reached")]
    TooManyConnectionsPerHost { partition: String, limit: usize },
    #[error("client is closed")]
    Closed,
    #[error("streaming body already received its last part")]
    BodyAlreadyFinished,
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}")]
    InvalidHeaderName { name: String },
    #[error("invalid header value for {name}")]
    InvalidHeaderValue { name: String },
    #[error("invalid no_proxy rule: {rule}")]
    InvalidNoProxyRule { rule: String },
    #[error("invalid client configuration: {message}")]
    InvalidConfig { message: &'static str },
    #[error("async handler failed: {source}")]
    Handler {
        #[source]
        source: SharedError,
    },
    #[error("response not available after waiting {timeout_ms}ms")]
    WaitTimeout { timeout_ms: u128 },
}

impl Error {
    pub(crate) fn transport(
        kind: TransportErrorKind,
        remote: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Transport {
            kind,
            remote: remote.into(),
            source: Arc::from(source.into()),
        }
    }

    pub(crate) fn handler(source: impl Into<BoxError>) -> Self {
        Self::Handler {
            source: Arc::from(source.into()),
        }
    }

    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::TooManyConnections { .. } => ErrorCode::TooManyConnections,
            Self::TooManyConnectionsPerHost { .. } => ErrorCode::TooManyConnectionsPerHost,
            Self::Closed => ErrorCode::Closed,
            Self::BodyAlreadyFinished => ErrorCode::BodyAlreadyFinished,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::InvalidNoProxyRule { .. } => ErrorCode::InvalidNoProxyRule,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::Handler { .. } => ErrorCode::Handler,
            Self::WaitTimeout { .. } => ErrorCode::WaitTimeout,
        }
    }

    pub const fn timeout_phase(&self) -> Option<TimeoutPhase> {
        match self {
            Self::Timeout { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub const fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_phase_remote_and_elapsed() {
        let error = Error::Timeout {
            phase: TimeoutPhase::Read,
            elapsed_ms: 150,
            remote: "api.example.com:443".to_owned(),
        };
        assert_eq!(
            error.to_string(),
            "read timeout to api.example.com:443 after 150ms"
        );
        assert_eq!(error.code(), ErrorCode::Timeout);
        assert_eq!(error.timeout_phase(), Some(TimeoutPhase::Read));
    }

    #[test]
    fn transport_error_keeps_source_after_clone() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let error = Error::transport(TransportErrorKind::Read, "127.0.0.1:80", io);
        let cloned = error.clone();
        let source = std::error::Error::source(&cloned).expect("source should be kept");
        assert_eq!(source.to_string(), "reset by peer");
        assert_eq!(cloned.transport_kind(), Some(TransportErrorKind::Read));
    }

    #[test]
    fn error_codes_are_stable_strings() {
        assert_eq!(Error::Cancelled.code().as_str(), "cancelled");
        assert_eq!(
            Error::TooManyConnectionsPerHost {
                partition: "http://a:80".to_owned(),
                limit: 1
            }
            .code()
            .as_str(),
            "too_many_connections_per_host"
        );
    }
}
