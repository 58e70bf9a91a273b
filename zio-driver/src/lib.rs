//! The event-loop contract a [`zio`](../zio/index.html) object attaches to.
//!
//! The core only ever needs three operations from its loop: arm a
//! descriptor for readability, arm it for writability, and disarm it. These
//! are kept behind the [`EventLoop`] trait so the reader/writer/flusher
//! logic is testable without a real OS reactor (see [`NullLoop`]).
//! [`PollLoop`] is the default, backed by the same `polling` crate a
//! completion-based driver's non-io_uring readiness backend would use.

use std::{
    cell::RefCell,
    collections::HashMap,
    io,
    os::fd::RawFd,
    rc::Rc,
    time::Duration,
};

use polling::{Event, Events, PollMode, Poller};
use zio_log::instrument;

/// A callback invoked once per turn a descriptor is found ready.
///
/// Returns `Err` if the work it did while the descriptor was ready failed;
/// the loop surfaces that back to whoever drove this turn rather than
/// swallowing it.
pub type Callback = Box<dyn FnMut() -> io::Result<()> + 'static>;

/// The minimal set of operations a zio object needs from an event loop.
///
/// Implementations must be level-triggered: as long as a descriptor stays
/// ready and armed, its callback fires on every turn, not just the first.
pub trait EventLoop {
    /// Arms `fd` for readability, invoking `callback` on every turn it is
    /// ready until [`disarm`](Self::disarm) is called.
    fn arm_read(&mut self, fd: RawFd, callback: Callback) -> io::Result<()>;

    /// Arms `fd` for writability, invoking `callback` on every turn it is
    /// ready until [`disarm`](Self::disarm) is called.
    fn arm_write(&mut self, fd: RawFd, callback: Callback) -> io::Result<()>;

    /// Deregisters whatever interest is currently armed on `fd`.
    ///
    /// A no-op if `fd` has no armed interest.
    fn disarm(&mut self, fd: RawFd) -> io::Result<()>;
}

#[derive(Default)]
struct Registration {
    read: Option<Callback>,
    write: Option<Callback>,
}

impl Registration {
    fn event(&self, key: usize) -> Event {
        Event::new(key, self.read.is_some(), self.write.is_some())
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

/// The default [`EventLoop`], backed by the `polling` crate.
///
/// Every registered interest uses [`PollMode::Level`] where the platform
/// supports it; on platforms whose backend is inherently edge-triggered,
/// [`run_once`](Self::run_once) re-arms every interest it just fired on,
/// which is observationally level-triggered.
pub struct PollLoop {
    poller: Poller,
    registry: HashMap<RawFd, Registration>,
    events: Events,
}

impl PollLoop {
    /// Creates a new, empty loop.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            registry: HashMap::new(),
            events: Events::new(),
        })
    }

    fn sync_registration(&mut self, fd: RawFd) -> io::Result<()> {
        let existing = self.registry.get(&fd);
        match existing {
            Some(reg) if reg.is_empty() => {
                self.poller.delete(borrow(fd))?;
                self.registry.remove(&fd);
            }
            Some(reg) => {
                let event = reg.event(fd as usize);
                self.poller.modify(borrow(fd), event)?;
            }
            None => {}
        }
        Ok(())
    }

    fn arm(&mut self, fd: RawFd, read: Option<Callback>, write: Option<Callback>) -> io::Result<()> {
        let is_new = !self.registry.contains_key(&fd);
        let reg = self.registry.entry(fd).or_default();
        if let Some(cb) = read {
            reg.read = Some(cb);
        }
        if let Some(cb) = write {
            reg.write = Some(cb);
        }
        let event = reg.event(fd as usize);
        if is_new {
            // SAFETY: fd is a valid, open descriptor owned by the caller for
            // at least as long as it stays registered.
            unsafe { self.poller.add(fd, event) }?;
        } else {
            self.poller.modify(borrow(fd), event)?;
        }
        Ok(())
    }

    /// Blocks (up to `timeout`) for at least one readiness event, then
    /// invokes every armed callback whose interest fired. Returns the
    /// number of callbacks invoked.
    ///
    /// Every armed callback that fired this turn runs even if an earlier one
    /// in the same turn errored; the first error observed is what's
    /// returned once the turn is done.
    ///
    /// Takes `this` rather than `&mut self` so the loop's own `RefCell`
    /// is not held borrowed while a callback runs; a callback (e.g. one
    /// that closes its descriptor) is allowed to call back into this same
    /// loop to disarm itself.
    pub fn run_once(this: &Rc<RefCell<Self>>, timeout: Option<Duration>) -> io::Result<usize> {
        instrument!(zio_log::Level::TRACE, "run_once");
        let ready: Vec<(RawFd, bool, bool)> = {
            let mut loop_ = this.borrow_mut();
            loop_.events.clear();
            let Self { poller, events, .. } = &mut *loop_;
            poller.wait(events, timeout)?;
            loop_.events.iter().map(|ev| (ev.key as RawFd, ev.readable, ev.writable)).collect()
        };

        let mut fired = 0;
        let mut first_err = None;
        for (fd, readable, writable) in ready {
            if readable {
                let armed = this.borrow_mut().registry.get_mut(&fd).and_then(|r| r.read.take());
                if let Some(mut cb) = armed {
                    let result = cb();
                    if let Some(reg) = this.borrow_mut().registry.get_mut(&fd) {
                        if reg.read.is_none() {
                            reg.read = Some(cb);
                        }
                    }
                    if let Err(e) = result {
                        first_err.get_or_insert(e);
                    }
                    fired += 1;
                }
            }
            if writable {
                let armed = this.borrow_mut().registry.get_mut(&fd).and_then(|r| r.write.take());
                if let Some(mut cb) = armed {
                    let result = cb();
                    if let Some(reg) = this.borrow_mut().registry.get_mut(&fd) {
                        if reg.write.is_none() {
                            reg.write = Some(cb);
                        }
                    }
                    if let Err(e) = result {
                        first_err.get_or_insert(e);
                    }
                    fired += 1;
                }
            }
            this.borrow_mut().sync_registration(fd)?;
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(fired),
        }
    }
}

fn borrow(fd: RawFd) -> std::os::fd::BorrowedFd<'static> {
    // SAFETY: callers only ever pass fds they already own and have
    // registered; the poller never outlives them.
    unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }
}

impl EventLoop for PollLoop {
    fn arm_read(&mut self, fd: RawFd, callback: Callback) -> io::Result<()> {
        self.arm(fd, Some(callback), None)
    }

    fn arm_write(&mut self, fd: RawFd, callback: Callback) -> io::Result<()> {
        self.arm(fd, None, Some(callback))
    }

    fn disarm(&mut self, fd: RawFd) -> io::Result<()> {
        if let Some(reg) = self.registry.get_mut(&fd) {
            reg.read = None;
            reg.write = None;
        }
        self.sync_registration(fd)
    }
}

#[allow(unused)]
fn _assert_level_mode_supported() -> PollMode {
    PollMode::Level
}

/// A manually-driven [`EventLoop`] for tests: nothing is registered with
/// the OS. [`fire_read`](Self::fire_read)/[`fire_write`](Self::fire_write)
/// invoke whatever callback is currently armed on a descriptor, letting
/// reader/writer/flusher logic be exercised without a real reactor.
#[derive(Default)]
pub struct NullLoop {
    registry: HashMap<RawFd, Registration>,
}

impl NullLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if `fd` currently has an armed read interest.
    pub fn is_read_armed(&self, fd: RawFd) -> bool {
        self.registry.get(&fd).is_some_and(|r| r.read.is_some())
    }

    /// `true` if `fd` currently has an armed write interest.
    pub fn is_write_armed(&self, fd: RawFd) -> bool {
        self.registry.get(&fd).is_some_and(|r| r.write.is_some())
    }

    /// Invokes the read callback armed on `fd`, if any.
    ///
    /// Takes `this` rather than `&mut self` for the same reason as
    /// [`PollLoop::run_once`]: a callback must be free to call back into
    /// this loop (e.g. to disarm itself on close) without the loop's own
    /// `RefCell` still being borrowed.
    pub fn fire_read(this: &Rc<RefCell<Self>>, fd: RawFd) -> io::Result<()> {
        Self::fire(this, fd, |r| &mut r.read)
    }

    /// Invokes the write callback armed on `fd`, if any.
    pub fn fire_write(this: &Rc<RefCell<Self>>, fd: RawFd) -> io::Result<()> {
        Self::fire(this, fd, |r| &mut r.write)
    }

    fn fire(
        this: &Rc<RefCell<Self>>,
        fd: RawFd,
        slot: impl Fn(&mut Registration) -> &mut Option<Callback>,
    ) -> io::Result<()> {
        let cb = this.borrow_mut().registry.get_mut(&fd).and_then(|r| slot(r).take());
        let Some(mut cb) = cb else {
            return Ok(());
        };
        let result = cb();
        if let Some(reg) = this.borrow_mut().registry.get_mut(&fd) {
            let current = slot(reg);
            if current.is_none() {
                *current = Some(cb);
            }
        }
        result
    }
}

impl EventLoop for NullLoop {
    fn arm_read(&mut self, fd: RawFd, callback: Callback) -> io::Result<()> {
        self.registry.entry(fd).or_default().read = Some(callback);
        Ok(())
    }

    fn arm_write(&mut self, fd: RawFd, callback: Callback) -> io::Result<()> {
        self.registry.entry(fd).or_default().write = Some(callback);
        Ok(())
    }

    fn disarm(&mut self, fd: RawFd) -> io::Result<()> {
        self.registry.remove(&fd);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        cell::Cell,
        rc::Rc,
    };

    #[test]
    fn null_loop_fires_armed_callback() {
        let loop_ = Rc::new(RefCell::new(NullLoop::new()));
        let calls = Rc::new(Cell::new(0));
        let calls2 = calls.clone();
        loop_
            .borrow_mut()
            .arm_read(3, Box::new(move || { calls2.set(calls2.get() + 1); Ok(()) }))
            .unwrap();
        assert!(loop_.borrow().is_read_armed(3));
        NullLoop::fire_read(&loop_, 3).unwrap();
        NullLoop::fire_read(&loop_, 3).unwrap();
        assert_eq!(calls.get(), 2);

        loop_.borrow_mut().disarm(3).unwrap();
        assert!(!loop_.borrow().is_read_armed(3));
        NullLoop::fire_read(&loop_, 3).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn null_loop_callback_may_disarm_itself_reentrantly() {
        let loop_ = Rc::new(RefCell::new(NullLoop::new()));
        let loop2 = loop_.clone();
        loop_
            .borrow_mut()
            .arm_read(3, Box::new(move || {
                loop2.borrow_mut().disarm(3).unwrap();
                Ok(())
            }))
            .unwrap();
        NullLoop::fire_read(&loop_, 3).unwrap();
        assert!(!loop_.borrow().is_read_armed(3));
    }

    #[test]
    fn poll_loop_observes_pipe_readability() {
        let (read_end, write_end) = rustix::pipe::pipe().unwrap();
        let loop_ = Rc::new(RefCell::new(PollLoop::new().unwrap()));
        let fired = Rc::new(Cell::new(false));
        let fired2 = fired.clone();
        loop_
            .borrow_mut()
            .arm_read(
                std::os::fd::AsRawFd::as_raw_fd(&read_end),
                Box::new(move || { fired2.set(true); Ok(()) }),
            )
            .unwrap();

        rustix::io::write(&write_end, b"x").unwrap();
        PollLoop::run_once(&loop_, Some(Duration::from_secs(5))).unwrap();
        assert!(fired.get());
    }
}
