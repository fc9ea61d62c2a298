/// Shared error type used across all Leon crates.
///
/// Variants map onto the runtime's failure classes rather than onto the
/// libraries that produced them: callers branch on [`ErrorKind`] to decide
/// whether to surface, retry, rebuild, or abort.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed input at a boundary. Surface to the caller, never retry.
    #[error("validation: {0}")]
    Validation(String),

    /// Thread/run/resource missing. Surface; never fatal.
    #[error("not found: {0}")]
    NotFound(String),

    /// Conflicting state, e.g. a run is already active or a lease is busy.
    /// Callers may retry after a delay.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Model-call timeout, provider 5xx, rate limit. Retried locally with
    /// bounded backoff; bubbled as an `error` event once retries exhaust.
    #[error("upstream: {0}")]
    TransientUpstream(String),

    /// Persisted state failed validation. Recovery rebuilds from the
    /// checkpoint store.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Log append failure, unrecoverable database lock. The run is aborted.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// The failure class of an [`Error`], used for `error` event payloads and
/// HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    TransientUpstream,
    Corruption,
    Fatal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::TransientUpstream(_) => ErrorKind::TransientUpstream,
            // Decoding persisted rows is the only place JSON errors escape.
            Self::Corruption(_) | Self::Json(_) => ErrorKind::Corruption,
            Self::Fatal(_) | Self::Io(_) => ErrorKind::Fatal,
        }
    }

    /// A run is already active for the thread.
    pub fn already_running(thread_id: &str) -> Self {
        Self::Conflict(format!("thread {thread_id} already has an active run"))
    }

    /// The lease did not converge to `active` before the deadline.
    pub fn sandbox_unavailable(thread_id: &str) -> Self {
        Self::Conflict(format!("sandbox for thread {thread_id} is unavailable"))
    }

    pub fn thread_not_found(thread_id: &str) -> Self {
        Self::NotFound(format!("thread {thread_id}"))
    }

    /// Whether a local bounded retry is worth attempting.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransientUpstream)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_classify() {
        assert_eq!(Error::Validation("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(Error::already_running("t1").kind(), ErrorKind::Conflict);
        assert_eq!(Error::thread_not_found("t1").kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::TransientUpstream("503".into()).kind(),
            ErrorKind::TransientUpstream
        );
        assert_eq!(Error::Corruption("bad row".into()).kind(), ErrorKind::Corruption);
        assert_eq!(Error::Fatal("log append".into()).kind(), ErrorKind::Fatal);
    }

    #[test]
    fn io_is_fatal_json_is_corruption() {
        let io: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(io.kind(), ErrorKind::Fatal);

        let json: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(json.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn only_upstream_is_retryable() {
        assert!(Error::TransientUpstream("timeout".into()).is_retryable());
        assert!(!Error::Conflict("busy".into()).is_retryable());
        assert!(!Error::Fatal("lock".into()).is_retryable());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let s = serde_json::to_string(&ErrorKind::TransientUpstream).unwrap();
        assert_eq!(s, "\"transient_upstream\"");
    }
}
