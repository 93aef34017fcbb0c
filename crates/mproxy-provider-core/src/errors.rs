use mproxy_translator::TranslateError;

pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Failure taxonomy shared by executors and the HTTP layer.
///
/// The variants deliberately mirror how the server must react: which ones map
/// to client-visible statuses, which ones are retryable, and which ones commit
/// the response (no retry once payload bytes reached the client).
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("no eligible auth for provider {provider}")]
    NoEligibleAuth { provider: String },

    /// 5xx, timeout, connection reset. Retryable before any payload byte.
    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    /// Upstream 4xx captured verbatim; passed through, never retried.
    #[error("upstream returned {status}")]
    UpstreamClientError {
        status: u16,
        headers: crate::Headers,
        body: bytes::Bytes,
    },

    /// 401/403 with a refresh-recoverable marker: refresh once, retry once.
    #[error("upstream auth expired: {0}")]
    UpstreamAuthExpired(String),

    #[error("subprocess transport unavailable: {0}")]
    SubprocessUnavailable(String),

    #[error("translation failed: {0}")]
    Translation(#[from] TranslateError),

    /// Stream failed after the first byte was forwarded; must not retry.
    #[error("stream aborted: {0}")]
    StreamAborted(String),

    #[error("missing auth attribute: {0}")]
    MissingAuthAttribute(&'static str),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

impl ExecutorError {
    pub fn other(message: impl std::fmt::Display) -> Self {
        ExecutorError::Other(message.to_string())
    }

    /// Whether the per-provider retry policy may re-issue the request,
    /// assuming no payload byte has crossed to the client yet.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutorError::UpstreamTransient(_) | ExecutorError::SubprocessUnavailable(_)
        )
    }
}
