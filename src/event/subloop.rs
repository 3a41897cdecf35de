//! Nested event loops.
//!
//! A [`SubLoop`] is a small epoll-based reactor that can be driven in a
//! bounded fashion (`run` with a millisecond budget) independently of the
//! main loop, and that is *also* an fd source of the main loop: whenever
//! one of its sources becomes ready, the parent wakes up and drives it.
//! The VT master uses one so that a bounded wait for release
//! acknowledgements cannot starve or deadlock the rest of the process.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use rustix::event::epoll;
use rustix::io::Errno;

bitflags::bitflags! {
    /// Readiness (and interest) mask of a sub-loop fd source.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdEvents: u32 {
        /// The fd is readable.
        const READ = 1 << 0;
        /// The fd is writable.
        const WRITE = 1 << 1;
        /// The peer hung up.
        const HUP = 1 << 2;
        /// The fd is in an error state.
        const ERR = 1 << 3;
        /// Register edge-triggered (interest only, never reported).
        const EDGE = 1 << 4;
    }
}

fn epoll_flags(events: FdEvents) -> epoll::EventFlags {
    let mut flags = epoll::EventFlags::empty();
    if events.contains(FdEvents::READ) {
        flags |= epoll::EventFlags::IN;
    }
    if events.contains(FdEvents::WRITE) {
        flags |= epoll::EventFlags::OUT;
    }
    if events.contains(FdEvents::EDGE) {
        flags |= epoll::EventFlags::ET;
    }
    flags
}

fn fd_events(flags: epoll::EventFlags) -> FdEvents {
    let mut events = FdEvents::empty();
    if flags.contains(epoll::EventFlags::IN) {
        events |= FdEvents::READ;
    }
    if flags.contains(epoll::EventFlags::OUT) {
        events |= FdEvents::WRITE;
    }
    if flags.contains(epoll::EventFlags::HUP) {
        events |= FdEvents::HUP;
    }
    if flags.contains(epoll::EventFlags::ERR) {
        events |= FdEvents::ERR;
    }
    events
}

/// Identifier of a source registered on a [`SubLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubSourceId(u64);

struct SubSource {
    fd: RawFd,
    cb: Option<Box<dyn FnMut(FdEvents)>>,
}

struct Inner {
    epoll: OwnedFd,
    sources: RefCell<HashMap<u64, SubSource>>,
    next_id: Cell<u64>,
    stop: Cell<bool>,
    token: Cell<Option<Token>>,
}

/// A nested event loop. Cheaply cloneable; all clones drive the same loop.
#[derive(Clone)]
pub struct SubLoop {
    inner: Rc<Inner>,
}

impl std::fmt::Debug for SubLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubLoop")
            .field("sources", &self.inner.sources.borrow().len())
            .finish_non_exhaustive()
    }
}

impl SubLoop {
    /// Creates an empty sub-loop.
    pub fn new() -> io::Result<Self> {
        let fd = epoll::create(epoll::CreateFlags::CLOEXEC)?;
        Ok(SubLoop {
            inner: Rc::new(Inner {
                epoll: fd,
                sources: RefCell::new(HashMap::new()),
                next_id: Cell::new(0),
                stop: Cell::new(false),
                token: Cell::new(None),
            }),
        })
    }

    /// Registers an fd with an interest mask and a handler.
    ///
    /// The caller keeps ownership of the fd and must keep it open until
    /// [`SubLoop::unregister`].
    pub fn register<F>(&self, fd: BorrowedFd<'_>, interest: FdEvents, cb: F) -> io::Result<SubSourceId>
    where
        F: FnMut(FdEvents) + 'static,
    {
        let id = self.inner.next_id.get() + 1;
        self.inner.next_id.set(id);
        epoll::add(
            &self.inner.epoll,
            fd,
            epoll::EventData::new_u64(id),
            epoll_flags(interest),
        )?;
        self.inner.sources.borrow_mut().insert(
            id,
            SubSource {
                fd: fd.as_raw_fd(),
                cb: Some(Box::new(cb)),
            },
        );
        Ok(SubSourceId(id))
    }

    /// Removes a source. Safe to call from within its own handler.
    pub fn unregister(&self, id: SubSourceId) -> io::Result<()> {
        let source = self.inner.sources.borrow_mut().remove(&id.0);
        if let Some(source) = source {
            let fd = unsafe { BorrowedFd::borrow_raw(source.fd) };
            epoll::delete(&self.inner.epoll, fd)?;
        }
        Ok(())
    }

    /// Waits for readiness at most `timeout` and delivers ready events.
    /// Returns the number of sources dispatched.
    pub fn dispatch(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms: i32 = match timeout {
            None => -1,
            Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
        };
        let mut events = epoll::EventVec::with_capacity(16);
        match epoll::wait(&self.inner.epoll, &mut events, timeout_ms) {
            Ok(()) => {}
            Err(Errno::INTR) => return Ok(0),
            Err(err) => return Err(err.into()),
        }

        let ready: Vec<(u64, FdEvents)> = events
            .iter()
            .map(|event| (event.data.u64(), fd_events(event.flags)))
            .collect();

        let mut dispatched = 0;
        for (id, revents) in ready {
            // The callback is taken out of the entry while running so a
            // handler can unregister any source, including itself.
            let cb = self
                .inner
                .sources
                .borrow_mut()
                .get_mut(&id)
                .and_then(|source| source.cb.take());
            if let Some(mut cb) = cb {
                cb(revents);
                dispatched += 1;
                if let Some(source) = self.inner.sources.borrow_mut().get_mut(&id) {
                    source.cb = Some(cb);
                }
            }
        }
        Ok(dispatched)
    }

    /// Runs the sub-loop until [`SubLoop::exit`] is called or `timeout`
    /// elapses. `None` runs until exit.
    pub fn run(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.stop.set(false);
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let budget = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            self.dispatch(budget)?;
            if self.inner.stop.get() {
                return Ok(());
            }
        }
    }

    /// Makes the innermost [`SubLoop::run`] return.
    pub fn exit(&self) {
        self.inner.stop.set(true);
    }
}

impl AsFd for SubLoop {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.epoll.as_fd()
    }
}

impl EventSource for SubLoop {
    type Event = ();
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(
        &mut self,
        _readiness: Readiness,
        token: Token,
        mut callback: F,
    ) -> io::Result<PostAction>
    where
        F: FnMut((), &mut ()),
    {
        if Some(token) != self.inner.token.get() {
            return Ok(PostAction::Continue);
        }
        if self.dispatch(Some(Duration::ZERO))? > 0 {
            callback((), &mut ());
        }
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        self.inner.token.set(Some(token));
        unsafe { poll.register(&self.inner.epoll, Interest::READ, Mode::Level, token) }
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        self.inner.token.set(Some(token));
        poll.reregister(&self.inner.epoll, Interest::READ, Mode::Level, token)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.inner.token.set(None);
        poll.unregister(self.inner.epoll.as_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    #[test]
    fn bounded_run_returns_without_events() {
        let subloop = SubLoop::new().unwrap();
        let start = Instant::now();
        subloop.run(Some(Duration::from_millis(30))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn handler_runs_and_can_exit_the_loop() {
        let subloop = SubLoop::new().unwrap();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        let hits = Rc::new(Cell::new(0));
        let id = subloop
            .register(rx.as_fd(), FdEvents::READ, {
                let subloop = subloop.clone();
                let hits = hits.clone();
                let rx = rx.try_clone().unwrap();
                move |revents| {
                    assert!(revents.contains(FdEvents::READ));
                    let mut buf = [0u8; 16];
                    use std::io::Read;
                    let _ = (&rx).read(&mut buf);
                    hits.set(hits.get() + 1);
                    subloop.exit();
                }
            })
            .unwrap();

        tx.write_all(b"x").unwrap();
        subloop.run(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(hits.get(), 1);
        subloop.unregister(id).unwrap();
    }

    #[test]
    fn parent_loop_drives_ready_subloop() {
        let mut parent: calloop::EventLoop<'_, u32> = calloop::EventLoop::try_new().unwrap();
        let subloop = SubLoop::new().unwrap();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        subloop
            .register(rx.as_fd(), FdEvents::READ, {
                let rx = rx.try_clone().unwrap();
                move |_| {
                    let mut buf = [0u8; 16];
                    use std::io::Read;
                    let _ = (&rx).read(&mut buf);
                }
            })
            .unwrap();

        parent
            .handle()
            .insert_source(subloop.clone(), |_, _, driven: &mut u32| *driven += 1)
            .unwrap();

        tx.write_all(b"x").unwrap();
        let mut driven = 0;
        parent
            .dispatch(Some(Duration::from_millis(500)), &mut driven)
            .unwrap();
        assert_eq!(driven, 1);
    }
}
