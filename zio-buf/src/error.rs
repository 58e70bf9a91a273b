use std::io;

/// Errors raised by [`crate::CircularByteBuffer`].
#[derive(Debug, thiserror::Error)]
pub enum BufError {
    /// A write would have exceeded `max_capacity`; the no-drop policy
    /// rejects it instead of discarding unread bytes.
    #[error("circular buffer is full")]
    BufferFull,

    /// The underlying fd read/write syscall failed with something other
    /// than would-block.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
