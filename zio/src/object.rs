use std::{
    cell::RefCell,
    io,
    os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd},
    rc::{Rc, Weak},
};

use rustix::io::Errno;
use zio_buf::{CircularByteBuffer, DrainOutcome, FillOutcome};
use zio_driver::EventLoop;
use zio_log::instrument;

use crate::{
    error::ZioError,
    pipe::{anonymous_pipe, set_nonblocking},
    sink::{CloseCallback, DeliverySink, SendCallback},
    state::ZioState,
};

/// Which end of the bridge a zio implements. Immutable after construction.
enum Direction {
    Reader {
        /// `None` once the descriptor has been closed.
        src_fd: Option<OwnedFd>,
        /// Write end of a helper-allocated pipe; owned but never polled.
        owned_write_end: Option<OwnedFd>,
    },
    Writer {
        /// `None` once the descriptor has been closed.
        dst_fd: Option<OwnedFd>,
        /// Read end of a helper-allocated pipe; owned but never polled.
        owned_read_end: Option<OwnedFd>,
    },
}

#[derive(Clone, Copy)]
struct BufferingConfig {
    buffered: bool,
    line_buffered: bool,
    cap: usize,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            buffered: true,
            line_buffered: true,
            cap: 4096,
        }
    }
}

struct Inner {
    name: String,
    direction: Direction,
    state: ZioState,
    config: BufferingConfig,
    verbose: bool,
    log_prefix: Option<String>,
    buf: CircularByteBuffer,
    send_cb: Option<SendCallback>,
    close_cb: Option<CloseCallback>,
    event_loop: Option<Weak<RefCell<dyn EventLoop>>>,
}

/// A named, directional I/O adapter between a byte-oriented file descriptor
/// and a framed message bus.
///
/// A `ZioObject` is a cheap handle (`Rc<RefCell<_>>`): clones refer to the
/// same underlying object, which is what lets an attached event loop hold
/// one clone per armed callback while the caller keeps its own. There are
/// no internal locks; see the crate-level docs for the concurrency model
/// this assumes.
#[derive(Clone)]
pub struct ZioObject(Rc<RefCell<Inner>>);

fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    // SAFETY: every caller holds `self.0` borrowed for the duration, which
    // keeps the owning `OwnedFd` alive and this raw fd valid.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

fn to_io_error(e: ZioError) -> io::Error {
    match e {
        ZioError::IoError(io_err) => io_err,
        other => io::Error::other(other),
    }
}

impl ZioObject {
    /// Wraps an existing descriptor as a reader. `src_fd` is switched to
    /// nonblocking; `sink` backs the default send callback.
    pub fn reader(
        name: impl Into<String>,
        src_fd: OwnedFd,
        sink: Rc<dyn DeliverySink>,
    ) -> Result<Self, ZioError> {
        set_nonblocking(&src_fd)?;
        Ok(Self::new_reader(name, src_fd, None, sink))
    }

    /// Allocates an anonymous pipe, wraps the read end as a reader, and
    /// retains the write end as `dst_fd` for the caller (e.g. to hand to a
    /// child process's stdout). The write end is left blocking.
    pub fn pipe_reader(name: impl Into<String>, sink: Rc<dyn DeliverySink>) -> Result<Self, ZioError> {
        let (read_end, write_end) = anonymous_pipe()?;
        set_nonblocking(&read_end)?;
        Ok(Self::new_reader(name, read_end, Some(write_end), sink))
    }

    fn new_reader(
        name: impl Into<String>,
        src_fd: OwnedFd,
        owned_write_end: Option<OwnedFd>,
        sink: Rc<dyn DeliverySink>,
    ) -> Self {
        let send_cb: SendCallback = Box::new(move |_zio, frame| {
            sink.publish(frame).map_err(ZioError::IoError)
        });
        Self::new(
            name,
            Direction::Reader {
                src_fd: Some(src_fd),
                owned_write_end,
            },
            Some(send_cb),
        )
    }

    /// Wraps an existing descriptor as a writer. `dst_fd` is switched to
    /// nonblocking.
    pub fn writer(name: impl Into<String>, dst_fd: OwnedFd) -> Result<Self, ZioError> {
        set_nonblocking(&dst_fd)?;
        Ok(Self::new(
            name,
            Direction::Writer {
                dst_fd: Some(dst_fd),
                owned_read_end: None,
            },
            None,
        ))
    }

    /// Allocates an anonymous pipe, wraps the write end as a writer, and
    /// retains the read end as `src_fd` for the caller. The read end is
    /// left blocking.
    pub fn pipe_writer(name: impl Into<String>) -> Result<Self, ZioError> {
        let (read_end, write_end) = anonymous_pipe()?;
        set_nonblocking(&write_end)?;
        Ok(Self::new(
            name,
            Direction::Writer {
                dst_fd: Some(write_end),
                owned_read_end: Some(read_end),
            },
            None,
        ))
    }

    fn new(name: impl Into<String>, direction: Direction, send_cb: Option<SendCallback>) -> Self {
        let inner = Inner {
            name: name.into(),
            direction,
            state: ZioState::Open,
            config: BufferingConfig::default(),
            verbose: false,
            log_prefix: None,
            buf: CircularByteBuffer::with_defaults(),
            send_cb,
            close_cb: None,
            event_loop: None,
        };
        Self(Rc::new(RefCell::new(inner)))
    }

    // -- accessors -----------------------------------------------------

    pub fn name(&self) -> String {
        self.0.borrow().name.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().state.is_closed()
    }

    pub fn state(&self) -> ZioState {
        self.0.borrow().state
    }

    pub fn src_fd(&self) -> Option<RawFd> {
        match &self.0.borrow().direction {
            Direction::Reader { src_fd, .. } => src_fd.as_ref().map(OwnedFd::as_raw_fd),
            Direction::Writer { owned_read_end, .. } => owned_read_end.as_ref().map(OwnedFd::as_raw_fd),
        }
    }

    pub fn dst_fd(&self) -> Option<RawFd> {
        match &self.0.borrow().direction {
            Direction::Reader { owned_write_end, .. } => owned_write_end.as_ref().map(OwnedFd::as_raw_fd),
            Direction::Writer { dst_fd, .. } => dst_fd.as_ref().map(OwnedFd::as_raw_fd),
        }
    }

    /// The descriptor this zio actually polls: `src_fd` for a reader,
    /// `dst_fd` for a writer.
    fn poll_fd(&self) -> Option<RawFd> {
        match &self.0.borrow().direction {
            Direction::Reader { src_fd, .. } => src_fd.as_ref().map(OwnedFd::as_raw_fd),
            Direction::Writer { dst_fd, .. } => dst_fd.as_ref().map(OwnedFd::as_raw_fd),
        }
    }

    fn is_reader(&self) -> bool {
        matches!(self.0.borrow().direction, Direction::Reader { .. })
    }

    // -- mutators --------------------------------------------------------

    fn ensure_open(&self) -> Result<(), ZioError> {
        if self.0.borrow().state.is_closed() {
            return Err(ZioError::InvalidState("operation on a closed zio".into()));
        }
        Ok(())
    }

    pub fn set_buffered(&self, cap: usize) -> Result<(), ZioError> {
        self.ensure_open()?;
        let mut inner = self.0.borrow_mut();
        inner.config.buffered = true;
        inner.config.line_buffered = false;
        inner.config.cap = cap;
        Ok(())
    }

    pub fn set_line_buffered(&self) -> Result<(), ZioError> {
        self.ensure_open()?;
        let mut inner = self.0.borrow_mut();
        inner.config.buffered = true;
        inner.config.line_buffered = true;
        Ok(())
    }

    /// Switches off buffering policy without discarding undelivered bytes;
    /// the ring stays alive until it drains on its own.
    pub fn set_unbuffered(&self) -> Result<(), ZioError> {
        self.ensure_open()?;
        let mut inner = self.0.borrow_mut();
        inner.config.buffered = false;
        inner.config.line_buffered = false;
        Ok(())
    }

    pub fn set_verbose(&self) {
        self.0.borrow_mut().verbose = true;
    }

    pub fn set_quiet(&self) {
        self.0.borrow_mut().verbose = false;
    }

    /// Enables verbose logging with a caller-supplied prefix, used to tag
    /// `tracing` spans when several zios share one subscriber.
    pub fn set_debug(&self, prefix: impl Into<String>) {
        let mut inner = self.0.borrow_mut();
        inner.verbose = true;
        inner.log_prefix = Some(prefix.into());
    }

    pub fn set_send_cb(&self, cb: SendCallback) -> Result<(), ZioError> {
        self.ensure_open()?;
        self.0.borrow_mut().send_cb = Some(cb);
        Ok(())
    }

    pub fn set_close_cb(&self, cb: CloseCallback) -> Result<(), ZioError> {
        self.ensure_open()?;
        self.0.borrow_mut().close_cb = Some(cb);
        Ok(())
    }

    /// The supplemented verbose/debug dump mode: mirrors every flush/write
    /// decision as a `TRACE` span when `set_verbose`/`set_debug` is on.
    /// A no-op build (the default) compiles this down to nothing, so its
    /// arguments go unused without the `enable_log` feature.
    #[allow(unused_variables)]
    fn log_verbose(&self, msg: &str) {
        let inner = self.0.borrow();
        if !inner.verbose {
            return;
        }
        let prefix = inner.log_prefix.as_deref().unwrap_or(&inner.name);
        instrument!(zio_log::Level::TRACE, "zio::verbose", prefix, msg);
    }

    // -- attach ----------------------------------------------------------

    /// Attaches this zio to `event_loop`. A reader arms its read interest
    /// immediately; a writer only arms a write interest if there is
    /// already pending output (lazy writer registration); `write_envelope`
    /// arms it later if needed.
    pub fn attach(&self, event_loop: &Rc<RefCell<dyn EventLoop>>) -> Result<(), ZioError> {
        self.ensure_open()?;
        self.0.borrow_mut().event_loop = Some(Rc::downgrade(event_loop));

        if self.is_reader() {
            let fd = self.poll_fd().expect("open reader always has src_fd");
            self.arm_read_on(event_loop, fd)?;
        } else if self.write_pending() {
            let fd = self.poll_fd().expect("open writer always has dst_fd");
            self.arm_write_on(event_loop, fd)?;
        }
        Ok(())
    }

    fn arm_read_on(&self, event_loop: &Rc<RefCell<dyn EventLoop>>, fd: RawFd) -> Result<(), ZioError> {
        let this = self.clone();
        event_loop
            .borrow_mut()
            .arm_read(fd, Box::new(move || this.flush().map_err(to_io_error)))
            .map_err(ZioError::IoError)
    }

    fn arm_write_on(&self, event_loop: &Rc<RefCell<dyn EventLoop>>, fd: RawFd) -> Result<(), ZioError> {
        let this = self.clone();
        event_loop
            .borrow_mut()
            .arm_write(fd, Box::new(move || this.writer_on_writable().map_err(to_io_error)))
            .map_err(ZioError::IoError)
    }

    fn attached_loop(&self) -> Option<Rc<RefCell<dyn EventLoop>>> {
        self.0.borrow().event_loop.as_ref().and_then(Weak::upgrade)
    }

    // -- reader side (spec.md 4.4) ----------------------------------------

    /// Runs one reader flush cycle: a single nonblocking fill from `src_fd`,
    /// then emits as many envelopes as the buffering policy allows.
    pub fn flush(&self) -> Result<(), ZioError> {
        instrument!(zio_log::Level::TRACE, "zio::flush");
        if !self.is_reader() {
            return Err(ZioError::InvalidArgument("flush called on a writer".into()));
        }
        if self.0.borrow().state.is_closed() {
            return Ok(());
        }
        self.fill_once()?;
        self.emit_pending_frames()
    }

    /// Drains `src_fd` into the ring until it would block or hits EOF.
    ///
    /// A single readability trigger can carry both data and EOF already
    /// sitting in the kernel's pipe buffer (a writer that wrote and closed
    /// before this side ever polled); looping here rather than stopping
    /// after one syscall is what lets [`emit_pending_frames`](Self::emit_pending_frames)
    /// fold both into one envelope instead of an empty trailing one.
    fn fill_once(&self) -> Result<(), ZioError> {
        loop {
            let mut inner = self.0.borrow_mut();
            if inner.state.eof_seen() {
                return Ok(());
            }
            let fd = match &inner.direction {
                Direction::Reader { src_fd, .. } => {
                    src_fd.as_ref().expect("open reader has src_fd").as_raw_fd()
                }
                Direction::Writer { .. } => unreachable!("checked by flush()"),
            };
            match inner.buf.write_from_fd(borrow_fd(fd), None)? {
                FillOutcome::Eof => {
                    inner.state.observe_eof();
                    return Ok(());
                }
                FillOutcome::WouldBlock => return Ok(()),
                FillOutcome::Read(_) => continue,
            }
        }
    }

    fn emit_pending_frames(&self) -> Result<(), ZioError> {
        loop {
            if self.0.borrow().state.is_closed() {
                return Ok(());
            }
            let chunk = {
                let inner = &mut *self.0.borrow_mut();
                Self::next_reader_chunk(inner)
            };
            let Some(chunk) = chunk else { break };

            let (name, is_final) = {
                let inner = self.0.borrow();
                (inner.name.clone(), inner.state.eof_seen() && inner.buf.empty())
            };
            let frame = zio_codec::encode(&name, &chunk, is_final)?;
            self.log_verbose(&format!("emit {} bytes, eof={is_final}", chunk.len()));

            if is_final {
                // The frame has been handed off; EOF_SENT is latched
                // regardless of what the callback below returns.
                self.0.borrow_mut().state.deliver_eof();
            }
            let send_result = self
                .invoke_send_cb(&frame)
                .map_err(|e| ZioError::DeliveryError(Box::new(e)));
            if is_final {
                self.close_now()?;
                send_result?;
                break;
            }
            send_result?;
        }
        Ok(())
    }

    /// Picks the next chunk a reader flush should emit, or `None` if
    /// nothing is eligible yet (the reader should park).
    fn next_reader_chunk(inner: &mut Inner) -> Option<Vec<u8>> {
        let eof_pending = inner.state.eof_seen() && !inner.state.eof_delivered();
        if inner.buf.empty() {
            return if eof_pending { Some(Vec::new()) } else { None };
        }

        if inner.config.line_buffered {
            let mut out = vec![0u8; inner.buf.used()];
            let n = inner.buf.read_line(&mut out);
            if n > 0 {
                out.truncate(n);
                return Some(out);
            }
            if !eof_pending {
                return None;
            }
            // No newline yet, but EOF means no more is coming: flush the
            // trailing partial line as the final frame.
        } else {
            let over_threshold = inner.config.buffered && inner.buf.used() > inner.config.cap;
            let flush_all = !inner.config.buffered || over_threshold || eof_pending;
            if !flush_all {
                return None;
            }
        }

        let used = inner.buf.used();
        let mut out = vec![0u8; used];
        let got = inner.buf.read(&mut out);
        debug_assert_eq!(got, used);
        Some(out)
    }

    fn invoke_send_cb(&self, frame: &[u8]) -> Result<(), ZioError> {
        let mut cb = self.0.borrow_mut().send_cb.take();
        let result = match cb.as_mut() {
            Some(f) => f(self, frame),
            None => Ok(()),
        };
        self.0.borrow_mut().send_cb = cb;
        result
    }

    // -- writer side (spec.md 4.5) ----------------------------------------

    /// Delivers one wire envelope. Envelopes not addressed to this writer's
    /// name are accepted and silently dropped.
    pub fn write_envelope(&self, envelope: &[u8]) -> Result<(), ZioError> {
        instrument!(zio_log::Level::TRACE, "zio::write_envelope");
        self.ensure_open()?;
        if self.is_reader() {
            return Err(ZioError::InvalidArgument("write_envelope called on a reader".into()));
        }

        let decoded = zio_codec::decode(envelope)?;
        if decoded.name != self.0.borrow().name {
            return Ok(());
        }

        let eof_already_seen = self.0.borrow().state.eof_seen();
        if eof_already_seen && !decoded.data.is_empty() {
            return Err(ZioError::InvalidState("data received after eof".into()));
        }

        if !decoded.data.is_empty() {
            self.write_path(&decoded.data)?;
        }
        if decoded.eof {
            self.0.borrow_mut().state.observe_eof();
        }
        self.log_verbose(&format!(
            "accepted {} bytes, eof={}",
            decoded.data.len(),
            decoded.eof
        ));

        self.maybe_close_writer()?;
        self.maybe_arm_write()
    }

    /// A single direct nonblocking write is attempted first to avoid a
    /// needless copy; only the remainder (if any) is enqueued in the ring.
    fn write_path(&self, payload: &[u8]) -> Result<(), ZioError> {
        let ring_was_empty = self.0.borrow().buf.empty();
        let mut offset = 0;
        if ring_was_empty {
            let fd = self.poll_fd().expect("open writer always has dst_fd");
            offset = self.direct_write(fd, payload)?;
        }
        let remaining = &payload[offset..];
        if !remaining.is_empty() {
            self.0.borrow_mut().buf.write(remaining)?;
        }
        Ok(())
    }

    fn direct_write(&self, fd: RawFd, payload: &[u8]) -> Result<usize, ZioError> {
        loop {
            return match rustix::io::write(borrow_fd(fd), payload) {
                Ok(n) => Ok(n),
                Err(Errno::AGAIN) => Ok(0),
                Err(Errno::INTR) => continue,
                Err(e) => Err(ZioError::IoError(e.into())),
            };
        }
    }

    fn write_pending(&self) -> bool {
        let inner = self.0.borrow();
        !inner.buf.empty() || (inner.state.eof_seen() && !inner.state.eof_delivered())
    }

    fn maybe_arm_write(&self) -> Result<(), ZioError> {
        if self.0.borrow().state.is_closed() || !self.write_pending() {
            return Ok(());
        }
        let Some(loop_rc) = self.attached_loop() else {
            return Ok(());
        };
        let fd = self.poll_fd().expect("open writer always has dst_fd");
        self.arm_write_on(&loop_rc, fd)
    }

    /// Drains the ring to `dst_fd` on a writable callback, closing once the
    /// ring is empty and EOF has been observed.
    fn writer_on_writable(&self) -> Result<(), ZioError> {
        instrument!(zio_log::Level::TRACE, "zio::writer_on_writable");
        if self.0.borrow().state.is_closed() {
            return Ok(());
        }
        let fd = self.poll_fd().expect("open writer always has dst_fd");
        loop {
            let outcome = self.0.borrow_mut().buf.read_to_fd(borrow_fd(fd), None)?;
            match outcome {
                DrainOutcome::Wrote(0) => break,
                DrainOutcome::Wrote(_) => continue,
                DrainOutcome::WouldBlock => break,
            }
        }
        self.maybe_close_writer()?;
        self.sync_write_interest()
    }

    fn maybe_close_writer(&self) -> Result<(), ZioError> {
        let should_close = {
            let inner = self.0.borrow();
            inner.buf.empty() && inner.state.eof_seen() && !inner.state.eof_delivered()
        };
        if should_close {
            self.0.borrow_mut().state.deliver_eof();
            self.close_now()?;
        }
        Ok(())
    }

    /// Deregisters the writable interest once there's nothing left to
    /// drain and EOF hasn't arrived yet; a later `write_envelope` re-arms
    /// it.
    fn sync_write_interest(&self) -> Result<(), ZioError> {
        let idle = {
            let inner = self.0.borrow();
            !inner.state.is_closed() && inner.buf.empty() && !inner.state.eof_seen()
        };
        if idle {
            if let Some(loop_rc) = self.attached_loop() {
                let fd = self.poll_fd().expect("open writer always has dst_fd");
                loop_rc.borrow_mut().disarm(fd).map_err(ZioError::IoError)?;
            }
        }
        Ok(())
    }

    // -- shared close path (spec.md 4.6) ----------------------------------

    /// Deregisters from the event loop, closes the owning-side descriptor,
    /// fires `close_cb` exactly once, and transitions to `Closed`.
    fn close_now(&self) -> Result<(), ZioError> {
        if self.0.borrow().state.is_closed() {
            return Ok(());
        }
        if let Some(fd) = self.poll_fd() {
            if let Some(loop_rc) = self.attached_loop() {
                loop_rc.borrow_mut().disarm(fd).map_err(ZioError::IoError)?;
            }
        }

        let mut close_cb = {
            let mut inner = self.0.borrow_mut();
            match &mut inner.direction {
                Direction::Reader { src_fd, .. } => {
                    src_fd.take();
                }
                Direction::Writer { dst_fd, .. } => {
                    dst_fd.take();
                }
            }
            inner.state.close();
            inner.close_cb.take()
        };
        let result = match close_cb.as_mut() {
            Some(cb) => cb(self),
            None => Ok(()),
        };
        self.0.borrow_mut().close_cb = close_cb;
        result
    }
}
