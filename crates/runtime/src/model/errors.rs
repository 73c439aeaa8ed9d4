use thiserror::Error;

/// Why the reasoning engine could not produce a turn.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModelError {
    /// The request never got an HTTP response.
    #[error("network: {0}")]
    Network(String),

    /// The provider answered with a non-success status.
    #[error("provider api ({status}): {message}")]
    Api { status: u16, message: String },

    /// The provider answered, but not with a message we understand.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ModelError {
    /// Authentication failures will not go away on retry.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Api { status: 401 | 403, .. })
    }
}
