use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("reasoning service returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("reasoning service transport: {0}")]
    Transport(String),

    #[error("invalid reasoning response: {0}")]
    InvalidResponse(String),

    #[error("reasoning client is closed")]
    Closed,
}
