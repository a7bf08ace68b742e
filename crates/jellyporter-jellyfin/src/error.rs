use thiserror::Error;

/// Failure classes of the remote API surface. Each class maps onto a stable
/// metrics label via [`ApiError::metric_label`].
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("API request to {path} failed with status {status}")]
    Status { path: String, status: u16 },

    #[error("could not read response from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("could not decode response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("user {0:?} not found on server")]
    UserNotFound(String),

    #[error("validation of query opts failed: {0}")]
    InvalidQueryOpts(String),
}

impl ApiError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ApiError::InvalidUrl(_) => "invalid_url",
            ApiError::Transport { .. } => "send_request_failed",
            ApiError::Status { .. } => "invalid_status",
            ApiError::Read { .. } => "read_data",
            ApiError::Decode { .. } => "decode_data",
            ApiError::UserNotFound(_) => "user_not_found",
            ApiError::InvalidQueryOpts(_) => "invalid_query_opts",
        }
    }
}
