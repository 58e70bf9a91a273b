/// Errors raised while encoding or decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The envelope did not have exactly one top-level key.
    #[error("envelope must have exactly one top-level key")]
    MalformedEnvelope,

    /// `data` was not valid base64.
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    /// The envelope was not well-formed JSON.
    #[error("invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),
}
