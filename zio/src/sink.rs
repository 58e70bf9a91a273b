use crate::{ZioError, ZioObject};

/// The delivery transport a reader's default send callback publishes
/// encoded envelopes through (the typed replacement for the original's
/// opaque `dstsock` handle).
pub trait DeliverySink {
    /// Publishes one already-encoded envelope frame.
    fn publish(&self, frame: &[u8]) -> std::io::Result<()>;
}

/// Invoked once per envelope a reader emits. Returns `Ok(())` on success,
/// `Err` to report a delivery failure (see [`ZioError::DeliveryError`]).
///
/// Takes the originating [`ZioObject`] so it's legal (per the concurrency
/// model) to call back into the zio from within this callback; just not
/// to destroy it.
pub type SendCallback = Box<dyn FnMut(&ZioObject, &[u8]) -> Result<(), ZioError>>;

/// Invoked exactly once when a zio's descriptor transitions to `Closed`.
pub type CloseCallback = Box<dyn FnMut(&ZioObject) -> Result<(), ZioError>>;
