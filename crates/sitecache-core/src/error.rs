use thiserror::Error;

/// Result type alias for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Maximum length for response bodies quoted in log messages and errors
const MAX_ERROR_BODY_LENGTH: usize = 500;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to precache {url}: {reason}")]
    InstallFailure { url: String, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Replay of queued request #{seq} failed: {reason}")]
    ReplayFailure { seq: u64, reason: String },

    #[error("Queued request #{seq} to {url} expired before it could be replayed")]
    ExpiryDiscard { seq: u64, url: String },

    #[error("Worker registration failed: {0}")]
    Registration(String),

    #[error("Invalid worker transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Invalid asset manifest: {0}")]
    Manifest(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl WorkerError {
    /// Whether the error is surfaced to the host as a user-visible warning.
    /// Transport and replay failures are handled locally.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            WorkerError::InstallFailure { .. } | WorkerError::Registration(_)
        )
    }
}

/// A live fetch failed below HTTP: no connection, DNS, reset, TLS.
/// An HTTP error status is a response, never a `TransportError`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Network request to {url} failed: {reason}")]
pub struct TransportError {
    pub url: String,
    pub reason: String,
}

impl TransportError {
    pub fn new(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to (de)serialize stored record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Corrupt storage file {file}: {reason}")]
    Corrupt { file: String, reason: String },
}

/// Truncate a response body to avoid logging excessive data
pub fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= MAX_ERROR_BODY_LENGTH {
        text.into_owned()
    } else {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &text[..end], body.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_body_short() {
        assert_eq!(truncate_body(b"not found"), "not found");
    }

    #[test]
    fn test_truncate_body_long() {
        let body = vec![b'x'; 1200];
        let out = truncate_body(&body);
        assert!(out.starts_with(&"x".repeat(500)));
        assert!(out.ends_with("(truncated, 1200 total bytes)"));
    }

    #[test]
    fn test_truncate_body_respects_char_boundary() {
        let body = "é".repeat(400);
        let out = truncate_body(body.as_bytes());
        assert!(out.contains("truncated, 800 total bytes"));
    }

    #[test]
    fn test_user_visible_errors() {
        assert!(WorkerError::Registration("denied".into()).is_user_visible());
        assert!(WorkerError::InstallFailure {
            url: "/index.html".into(),
            reason: "offline".into()
        }
        .is_user_visible());
        assert!(!WorkerError::Transport(TransportError::new("/site", "reset")).is_user_visible());
        assert!(!WorkerError::ReplayFailure {
            seq: 1,
            reason: "reset".into()
        }
        .is_user_visible());
    }
}
