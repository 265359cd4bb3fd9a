use thiserror::Error;

/// Errors raised by [`crate::LinkStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to decode update: {0}")]
    DecodeUpdate(String),

    #[error("failed to integrate update: {0}")]
    ApplyUpdate(String),

    #[error("failed to decode state vector: {0}")]
    DecodeStateVector(String),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to register document observer: {0}")]
    Observer(String),
}

impl StoreError {
    pub(crate) fn decode_update(e: impl std::fmt::Display) -> Self {
        Self::DecodeUpdate(e.to_string())
    }

    pub(crate) fn apply_update(e: impl std::fmt::Display) -> Self {
        Self::ApplyUpdate(e.to_string())
    }

    pub(crate) fn decode_state_vector(e: impl std::fmt::Display) -> Self {
        Self::DecodeStateVector(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
