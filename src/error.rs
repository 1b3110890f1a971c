use serde_json::Value;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("upstream error {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        details: Value,
    },
    #[error("couldn't reach server: {0}")]
    Network(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Error::Upstream {
            status,
            message: message.into(),
            details: Value::Null,
        }
    }

    /// Transient failures that leave pagination armed for a later retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Upstream { .. } | Error::Network(_))
    }

    pub fn user_message(&self) -> String {
        match self {
            Error::Configuration(msg) => format!("Configuration error: {msg}"),
            Error::Auth(msg) => format!("Please sign in again: {msg}"),
            Error::Upstream { status, message, .. } => {
                format!("Failed to load more posts ({status}): {message}")
            }
            Error::Network(_) => "Couldn't reach the server. Check your connection.".to_string(),
            Error::NotFound(what) => format!("{what} not found"),
            Error::InvalidRequest(msg) => msg.clone(),
        }
    }

    /// HTTP status the backend answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Configuration(_) => 500,
            Error::Auth(_) => 401,
            Error::Upstream { status, .. } => *status,
            Error::Network(_) => 504,
            Error::NotFound(_) => 404,
            Error::InvalidRequest(_) => 400,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Error::Upstream {
                status: 502,
                message: format!("malformed response: {err}"),
                details: Value::Null,
            };
        }
        if let Some(status) = err.status() {
            return Error::upstream(status.as_u16(), err.to_string());
        }
        Error::Network(err.to_string())
    }
}
