use std::io;

/// Errors a [`crate::ZioObject`] operation can fail with.
#[derive(Debug, thiserror::Error)]
pub enum ZioError {
    /// A null/invalid handle, the wrong direction for the requested
    /// operation, or a malformed envelope.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation was attempted on a `Closed` object, or the object was
    /// destroyed while still attached to an event loop.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The underlying read/write syscall failed with something other than
    /// would-block.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// The ring was exhausted while enqueuing writer-side data. Fatal for
    /// the envelope that triggered it.
    #[error("ring buffer is full")]
    BufferFull,

    /// The send callback returned an error. The object remains usable
    /// unless the EOF frame had already been latched as sent.
    #[error("delivery failed: {0}")]
    DeliveryError(Box<ZioError>),
}

impl From<zio_buf::BufError> for ZioError {
    fn from(e: zio_buf::BufError) -> Self {
        match e {
            zio_buf::BufError::BufferFull => ZioError::BufferFull,
            zio_buf::BufError::Io(e) => ZioError::IoError(e),
        }
    }
}

impl From<zio_codec::CodecError> for ZioError {
    fn from(e: zio_codec::CodecError) -> Self {
        ZioError::InvalidArgument(e.to_string())
    }
}
