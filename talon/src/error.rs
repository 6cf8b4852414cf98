use serde_json::Value;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the client core.
///
/// `FingerprintMismatch` is security relevant: once raised, the transport
/// refuses every further authenticated call until the operator reconnects.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("server certificate fingerprint mismatch (pinned {pinned}, observed {observed})")]
    FingerprintMismatch { pinned: String, observed: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unexpected response: http status code {0}")]
    UnexpectedStatus(u16),

    #[error("malformed server response: {0}")]
    Protocol(String),

    #[error("duplicate registration: {kind} '{name}' already registered")]
    DuplicateRegistration { kind: &'static str, name: String },

    #[error("extension fault in '{name}': {message}")]
    Extension { name: String, message: String },

    #[error("{0}")]
    Server(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Pull a server-provided `{"error": ...}` message out of a response
    /// body, falling back to `fallback` when the body carries none.
    pub fn from_error_body(body: &[u8], fallback: &str) -> Error {
        if let Ok(object) = serde_json::from_slice::<Value>(body) {
            if let Some(message) = object.get("error").and_then(Value::as_str) {
                return Error::Server(message.to_string());
            }
        }

        Error::Server(fallback.to_string())
    }
}
