//! Bidirectional, buffered bridge between byte-oriented file descriptors
//! (pipes, ttys, stream sockets) and a framed message bus.
//!
//! A [`ZioObject`] is either a *reader*, which drains a descriptor and
//! hands the bytes to a [`DeliverySink`] as named, base64-framed
//! [envelopes](zio_codec), or a *writer*, which accepts such envelopes and
//! drains their payload onto a descriptor. Both directions attach to an
//! [`EventLoop`](zio_driver::EventLoop) and run single-threaded and
//! cooperatively; see [`object`] for the full state machine.

mod error;
mod object;
mod pipe;
mod sink;
mod state;

pub use error::ZioError;
pub use object::ZioObject;
pub use sink::{CloseCallback, DeliverySink, SendCallback};
pub use state::ZioState;

pub use zio_codec::{decode, encode, CodecError, Decoded};
pub use zio_driver::{EventLoop, NullLoop, PollLoop};
