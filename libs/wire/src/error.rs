use thiserror::Error;

/// Errors raised by the wire layer.
#[derive(Debug, Error)]
pub enum WireError {
    /// Frame length prefix exceeds the configured cap.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Frame payload was not valid JSON for the envelope.
    #[error("frame codec: {0}")]
    Codec(#[from] serde_json::Error),

    /// Base64 certificate material in the connection info was invalid.
    #[error("connection info: {0}")]
    Material(#[from] base64::DecodeError),

    /// Underlying transport error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
