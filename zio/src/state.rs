/// The protocol-level state of a [`crate::ZioObject`], kept separate from
/// its configuration (buffering mode, verbosity) so the two can't be
/// confused the way a single flag bitset would let them be.
///
/// Transitions are one-way: `Open -> EofSeen -> EofDelivered -> Closed`.
/// `EofDelivered -> Closed` is the only transition that closes the
/// descriptor and fires the close callback, and it does so atomically;
/// `EofSent`/"drained and observed" are one and the same instant, not two
/// separately observable steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZioState {
    /// Normal operation; no end-of-file has been observed.
    Open,
    /// End-of-file has been observed locally (reader: `read` returned `0`;
    /// writer: an `eof: true` envelope arrived), but it has not yet been
    /// fully delivered (reader: the `eof` frame hasn't been sent; writer:
    /// the ring still has unwritten bytes).
    EofSeen,
    /// Reader: the `eof: true` frame has been handed to the send callback
    /// and the local ring is empty. Writer: eof was observed and the ring
    /// has drained. The descriptor is closed in the same step that enters
    /// this state.
    EofDelivered,
    /// The descriptor is closed and will not be touched again.
    Closed,
}

impl ZioState {
    pub fn is_closed(self) -> bool {
        matches!(self, ZioState::Closed)
    }

    pub fn eof_seen(self) -> bool {
        !matches!(self, ZioState::Open)
    }

    pub fn eof_delivered(self) -> bool {
        matches!(self, ZioState::EofDelivered | ZioState::Closed)
    }

    /// Moves from `Open` to `EofSeen`. A no-op if EOF was already observed.
    pub fn observe_eof(&mut self) {
        if *self == ZioState::Open {
            *self = ZioState::EofSeen;
        }
    }

    /// Moves from `EofSeen` to `EofDelivered`. Only valid once EOF has been
    /// observed; panics otherwise, since that would mean delivering an EOF
    /// frame or closing a writer's descriptor before local EOF was seen.
    pub fn deliver_eof(&mut self) {
        debug_assert_eq!(*self, ZioState::EofSeen, "eof delivered before it was seen");
        *self = ZioState::EofDelivered;
    }

    /// Moves to `Closed`. Valid from any pre-`Closed` state; the normal
    /// path reaches it via `EofDelivered`.
    pub fn close(&mut self) {
        *self = ZioState::Closed;
    }
}
