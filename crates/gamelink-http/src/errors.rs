use thiserror::Error;

/// Errors surfaced by the control-plane client.
///
/// `Status` carries the host's own `status_code`/`status_message` envelope and
/// is distinct from transport failures so callers can special-case "not
/// paired yet" (401) against genuine errors.
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("host returned status {code}: {message}")]
    Status { code: i32, message: String },

    #[error("malformed XML: {reason}")]
    MalformedXml { reason: String },

    #[error("missing field in host response: {field}")]
    MissingField { field: &'static str },

    #[error("malformed server version field: {version}")]
    MalformedVersion { version: String },

    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("another client owns the running session")]
    QuitNotAuthorized,

    #[error("client identity error: {reason}")]
    Identity { reason: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HttpError {
    pub fn malformed_xml(reason: impl Into<String>) -> Self {
        Self::MalformedXml {
            reason: reason.into(),
        }
    }

    pub fn identity(reason: impl Into<String>) -> Self {
        Self::Identity {
            reason: reason.into(),
        }
    }
}
