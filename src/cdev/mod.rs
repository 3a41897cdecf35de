//! Character-device bridge.
//!
//! Exposes VT sessions to unmodified legacy clients (X-style display
//! servers, getty-style login managers) as character devices served via
//! CUSE. Two kinds of nodes exist per seat: one *control* node, where
//! every open creates a fresh VT session, and *legacy* per-VT nodes,
//! whose minors are allocated from a bitset offset by 16384 so they can
//! never collide with in-kernel TTY minors under the shared TTY major.
//!
//! The ioctl surface mirrors the kernel VT closely; errors map onto the
//! errnos a kernel VT would produce so legacy clients behave unchanged.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::mem;
use std::rc::{Rc, Weak};

use calloop::{EventSource, Interest, LoopHandle, Mode, Poll, PostAction, Readiness, RegistrationToken, Token, TokenFactory};
use rustix::io::Errno;
use tracing::{debug, info, info_span, trace, warn};

mod cuse;

use crate::error::{ErrorKind, Kind};
use crate::seat::Seat;
use crate::utils::Bitset;
use crate::vt::ffi as vt_ffi;
use crate::vt::session::{VtSession, VtsNotify};
use cuse::{CuseChannel, IoctlIn, IoctlIovec, OpenIn, PollIn, ReleaseIn, Request, WriteIn};

/// The kernel TTY major; our nodes live in its minor space.
pub const TTY_MAJOR: u32 = 4;

/// Offset of the minor bitset, keeping clear of kernel TTY minors.
pub const MINOR_OFFSET: u32 = 16384;

// Ioctl numbers of the legacy VT surface.
const TCFLSH: u32 = 0x540B;
const KDSETMODE: u32 = 0x4B3A;
const KDGETMODE: u32 = 0x4B3B;
const KDGKBMODE: u32 = 0x4B44;
const KDSKBMODE: u32 = 0x4B45;
const VT_OPENQRY: u32 = 0x5600;
const VT_GETMODE: u32 = 0x5601;
const VT_SETMODE: u32 = 0x5602;
const VT_GETSTATE: u32 = 0x5603;
const VT_RELDISP: u32 = 0x5605;
const VT_ACTIVATE: u32 = 0x5606;
const VT_WAITACTIVE: u32 = 0x5607;

/// Errors of the character-device bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `/dev/cuse` could not be opened or spoken to.
    #[error("cuse channel failed")]
    Cuse(#[source] io::Error),
    /// Inserting the channel into the event loop failed.
    #[error("cannot register cuse channel")]
    EventLoop,
    /// Creating the backing VT session failed.
    #[error("cannot create VT session")]
    Session(ErrorKind),
}

impl Kind for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Cuse(_) | Error::EventLoop => ErrorKind::DeviceFault,
            Error::Session(kind) => *kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    /// Every open creates its own VT session.
    Control,
    /// All opens share the node's VT session.
    Legacy,
}

struct Client {
    vts: VtSession,
    poll_kh: Cell<Option<u64>>,
    // (reply id, session id the client waits on)
    wait_active: RefCell<Vec<(u64, u32)>>,
}

struct DevInner {
    registry: Weak<RegistryInner>,
    seat: Seat,
    minor: u32,
    kind: NodeKind,
    channel: RefCell<CuseChannel>,
    token: Cell<Option<RegistrationToken>>,
    clients: RefCell<HashMap<u64, Rc<Client>>>,
    next_fh: Cell<u64>,
    shared_vts: RefCell<Option<VtSession>>,
    loop_handle: LoopHandle<'static, ()>,
    span: tracing::Span,
}

/// A published character device.
#[derive(Clone)]
pub struct CharDev {
    inner: Rc<DevInner>,
}

impl std::fmt::Debug for CharDev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CharDev")
            .field("minor", &self.inner.minor)
            .field("kind", &self.inner.kind)
            .field("clients", &self.inner.clients.borrow().len())
            .finish_non_exhaustive()
    }
}

struct RegistryInner {
    loop_handle: LoopHandle<'static, ()>,
    minors: RefCell<Bitset>,
    devices: RefCell<HashMap<u32, CharDev>>,
}

/// The per-process device registry, keyed by (major, minor).
#[derive(Clone)]
pub struct CdevRegistry {
    inner: Rc<RegistryInner>,
}

impl std::fmt::Debug for CdevRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdevRegistry")
            .field("devices", &self.inner.devices.borrow().len())
            .finish_non_exhaustive()
    }
}

impl CdevRegistry {
    /// Creates an empty registry.
    pub fn new(loop_handle: &LoopHandle<'static, ()>) -> Self {
        CdevRegistry {
            inner: Rc::new(RegistryInner {
                loop_handle: loop_handle.clone(),
                minors: RefCell::new(Bitset::new()),
                devices: RefCell::new(HashMap::new()),
            }),
        }
    }

    fn alloc_minor(&self) -> u32 {
        self.inner.minors.borrow_mut().alloc() as u32 + MINOR_OFFSET
    }

    fn publish(
        &self,
        seat: &Seat,
        name: &str,
        kind: NodeKind,
        session_id: u32,
    ) -> Result<CharDev, Error> {
        let minor = self.alloc_minor();
        let channel = CuseChannel::open(name, TTY_MAJOR, minor).map_err(Error::Cuse)?;
        let dev = CharDev {
            inner: Rc::new(DevInner {
                registry: Rc::downgrade(&self.inner),
                seat: seat.clone(),
                minor,
                kind,
                channel: RefCell::new(channel),
                token: Cell::new(None),
                clients: RefCell::new(HashMap::new()),
                next_fh: Cell::new(1),
                shared_vts: RefCell::new(None),
                loop_handle: self.inner.loop_handle.clone(),
                span: info_span!("cdev", name, minor),
            }),
        };

        if let NodeKind::Legacy = kind {
            let vts = dev.make_session(session_id)?;
            *dev.inner.shared_vts.borrow_mut() = Some(vts);
        }

        let token = self
            .inner
            .loop_handle
            .insert_source(dev.clone(), |_, _, _| {})
            .map_err(|_| Error::EventLoop)?;
        dev.inner.token.set(Some(token));

        info!(name, major = TTY_MAJOR, minor, "character device published");
        self.inner.devices.borrow_mut().insert(minor, dev.clone());
        Ok(dev)
    }

    /// Publishes the per-seat control node (`vtmux-<seat>`); every open
    /// creates a fresh session at the list tail.
    pub fn publish_control(&self, seat: &Seat) -> Result<CharDev, Error> {
        self.publish(seat, &format!("vtmux-{}", seat.name()), NodeKind::Control, 0)
    }

    /// Publishes a legacy per-VT node backed by one shared, numbered
    /// session, so `VT_ACTIVATE`/`VT_WAITACTIVE` can address it like a
    /// kernel VT number. `index` counts from zero per seat.
    pub fn publish_legacy(&self, seat: &Seat, index: u32) -> Result<CharDev, Error> {
        self.publish(
            seat,
            &format!("ttyV{}-{}", seat.name(), index),
            NodeKind::Legacy,
            index + 1,
        )
    }

    /// Looks up a device by its numbers.
    pub fn lookup(&self, major: u32, minor: u32) -> Option<CharDev> {
        if major != TTY_MAJOR {
            return None;
        }
        self.inner.devices.borrow().get(&minor).cloned()
    }

    /// Unpublishes every node of `seat`.
    pub fn remove_seat(&self, seat: &Seat) {
        let minors: Vec<u32> = self
            .inner
            .devices
            .borrow()
            .iter()
            .filter(|(_, dev)| dev.inner.seat.name() == seat.name())
            .map(|(&minor, _)| minor)
            .collect();
        for minor in minors {
            self.remove(minor);
        }
    }

    /// Unpublishes one device, severing all of its clients.
    pub fn remove(&self, minor: u32) {
        let dev = self.inner.devices.borrow_mut().remove(&minor);
        if let Some(dev) = dev {
            dev.close();
            self.inner
                .minors
                .borrow_mut()
                .clear((minor - MINOR_OFFSET) as usize);
        }
    }
}

impl CharDev {
    /// Device minor.
    pub fn minor(&self) -> u32 {
        self.inner.minor
    }

    /// Severs one client immediately, as if it had closed the node.
    pub fn kill_client(&self, fh: u64) {
        let client = self.inner.clients.borrow_mut().remove(&fh);
        if let Some(client) = client {
            debug!(parent: &self.inner.span, fh, "client killed");
            if self.inner.kind == NodeKind::Control {
                client.vts.hangup();
            }
            if let Some(kh) = client.poll_kh.get() {
                let _ = self.inner.channel.borrow().notify_poll(kh);
            }
        }
    }

    /// Number of open clients.
    pub fn client_count(&self) -> usize {
        self.inner.clients.borrow().len()
    }

    fn close(&self) {
        let fhs: Vec<u64> = self.inner.clients.borrow().keys().copied().collect();
        for fh in fhs {
            self.kill_client(fh);
        }
        if let Some(vts) = self.inner.shared_vts.borrow_mut().take() {
            vts.hangup();
        }
        if let Some(token) = self.inner.token.take() {
            self.inner.loop_handle.remove(token);
        }
        debug!(parent: &self.inner.span, "device closed");
    }

    fn make_session(&self, id: u32) -> Result<VtSession, Error> {
        let vts =
            VtSession::new(&self.inner.seat, &self.inner.loop_handle, id).map_err(Error::Session)?;
        let weak = Rc::downgrade(&self.inner);
        vts.set_notify(move |notify| {
            if let Some(inner) = weak.upgrade() {
                CharDev { inner }.on_notify(notify);
            }
        });
        Ok(vts)
    }

    fn on_notify(&self, notify: VtsNotify) {
        trace!(parent: &self.inner.span, ?notify, "session notify");
        let channel = self.inner.channel.borrow();
        for client in self.inner.clients.borrow().values() {
            if let Some(kh) = client.poll_kh.get() {
                let _ = channel.notify_poll(kh);
            }
            if notify == VtsNotify::Activated {
                let mut waiters = client.wait_active.borrow_mut();
                waiters.retain(|&(unique, target)| {
                    let done = self
                        .inner
                        .seat
                        .foreground()
                        .map_or(false, |fg| fg.id() == target);
                    if done {
                        let _ = channel.reply_ok(unique);
                    }
                    !done
                });
            }
        }
    }

    fn client(&self, fh: u64) -> Option<Rc<Client>> {
        self.inner.clients.borrow().get(&fh).cloned()
    }

    fn handle_request(&self, request: Request) {
        let unique = request.header.unique;
        let channel = &self.inner.channel;
        let reply_err = |errno: Errno| {
            let _ = channel.borrow().reply_err(unique, errno);
        };

        match request.header.opcode {
            cuse::FUSE_OPEN => {
                let Some(_open) = cuse::read_struct::<OpenIn>(&request.body) else {
                    return reply_err(Errno::INVAL);
                };
                let vts = match self.inner.kind {
                    NodeKind::Control => match self.make_session(0) {
                        Ok(vts) => vts,
                        Err(err) => {
                            warn!(parent: &self.inner.span, "open failed: {err}");
                            return reply_err(err.kind().errno());
                        }
                    },
                    NodeKind::Legacy => match &*self.inner.shared_vts.borrow() {
                        Some(vts) => vts.clone(),
                        None => return reply_err(Errno::NODEV),
                    },
                };
                let fh = self.inner.next_fh.get();
                self.inner.next_fh.set(fh + 1);
                self.inner.clients.borrow_mut().insert(
                    fh,
                    Rc::new(Client {
                        vts,
                        poll_kh: Cell::new(None),
                        wait_active: RefCell::new(Vec::new()),
                    }),
                );
                debug!(parent: &self.inner.span, fh, "client opened");
                let _ = channel.borrow().reply_open(unique, fh);
            }
            cuse::FUSE_RELEASE => {
                let Some(release) = cuse::read_struct::<ReleaseIn>(&request.body) else {
                    return reply_err(Errno::INVAL);
                };
                self.kill_client(release.fh);
                let _ = channel.borrow().reply_ok(unique);
            }
            cuse::FUSE_READ => {
                // A VT has no input stream here; input reaches sessions
                // through the input pipeline.
                reply_err(Errno::AGAIN);
            }
            cuse::FUSE_WRITE => {
                let Some(write) = cuse::read_struct::<WriteIn>(&request.body) else {
                    return reply_err(Errno::INVAL);
                };
                if self.client(write.fh).is_none() {
                    return reply_err(Errno::BADF);
                }
                // Terminal output is rendered by the session itself; the
                // VT node accepts and discards writes like a sink.
                let _ = channel.borrow().reply_write(unique, write.size);
            }
            cuse::FUSE_FLUSH => {
                let _ = channel.borrow().reply_ok(unique);
            }
            cuse::FUSE_INTERRUPT => {
                // The interrupted request id is the first u64 of the body.
                if let Some(interrupted) = cuse::read_struct::<u64>(&request.body) {
                    for client in self.inner.clients.borrow().values() {
                        let mut waiters = client.wait_active.borrow_mut();
                        waiters.retain(|&(waiting, _)| {
                            if waiting == interrupted {
                                let _ = channel.borrow().reply_err(waiting, Errno::INTR);
                                false
                            } else {
                                true
                            }
                        });
                    }
                }
            }
            cuse::FUSE_DESTROY => {
                let _ = channel.borrow().reply_ok(unique);
            }
            cuse::FUSE_POLL => {
                let Some(poll) = cuse::read_struct::<PollIn>(&request.body) else {
                    return reply_err(Errno::INVAL);
                };
                let Some(client) = self.client(poll.fh) else {
                    return reply_err(Errno::BADF);
                };
                if poll.flags & cuse::FUSE_POLL_SCHEDULE_NOTIFY != 0 {
                    client.poll_kh.set(Some(poll.kh));
                }
                let mask = client.vts.poll_mask();
                let mut revents = 0;
                if mask.contains(crate::vt::session::PollFlags::READ) {
                    revents |= cuse::POLLIN;
                }
                if mask.contains(crate::vt::session::PollFlags::WRITE) {
                    revents |= cuse::POLLOUT;
                }
                if mask.contains(crate::vt::session::PollFlags::HUP) {
                    revents |= cuse::POLLHUP;
                }
                let _ = channel.borrow().reply_poll(unique, revents);
            }
            cuse::FUSE_IOCTL => {
                let Some(ioctl) = cuse::read_struct::<IoctlIn>(&request.body) else {
                    return reply_err(Errno::INVAL);
                };
                let Some(client) = self.client(ioctl.fh) else {
                    return reply_err(Errno::BADF);
                };
                self.handle_ioctl(&request, &ioctl, &client);
            }
            opcode => {
                trace!(parent: &self.inner.span, opcode, "unsupported fuse op");
                reply_err(Errno::NOSYS);
            }
        }
    }

    // Unrestricted-ioctl data transfer: pointer-argument commands are
    // answered with a retry listing the client-memory iovecs, and the
    // kernel re-issues the request with the data in line.
    fn handle_ioctl(&self, request: &Request, ioctl: &IoctlIn, client: &Client) {
        let unique = request.header.unique;
        let channel = &self.inner.channel;
        let vts = &client.vts;
        let data = request.payload::<IoctlIn>();

        let reply = |result: Result<(), ErrorKind>| {
            let _ = match result {
                Ok(()) => channel.borrow().reply_ioctl(unique, 0, &[]),
                Err(kind) => channel.borrow().reply_err(unique, kind.errno()),
            };
        };
        let need_out = |len: u64| -> bool {
            if (ioctl.out_size as u64) < len {
                let _ = channel.borrow().reply_ioctl_retry(
                    unique,
                    &[],
                    &[IoctlIovec {
                        base: ioctl.arg,
                        len,
                    }],
                );
                true
            } else {
                false
            }
        };
        let reply_out = |bytes: &[u8]| {
            let _ = channel.borrow().reply_ioctl(unique, 0, bytes);
        };

        match ioctl.cmd {
            TCFLSH => reply(vts.flush(ioctl.arg as i32)),
            KDSETMODE => reply(vts.set_kd_mode(ioctl.arg as i32)),
            KDSKBMODE => reply(vts.set_kb_mode(ioctl.arg as i32)),
            KDGETMODE => {
                if !need_out(4) {
                    reply_out(&vts.kd_mode().to_ne_bytes());
                }
            }
            KDGKBMODE => {
                if !need_out(4) {
                    reply_out(&vts.kb_mode().to_ne_bytes());
                }
            }
            VT_GETMODE => {
                if !need_out(mem::size_of::<vt_ffi::VtMode>() as u64) {
                    let mode = vts.vt_mode();
                    let bytes = unsafe {
                        std::slice::from_raw_parts(
                            (&mode as *const vt_ffi::VtMode).cast::<u8>(),
                            mem::size_of::<vt_ffi::VtMode>(),
                        )
                    };
                    reply_out(bytes);
                }
            }
            VT_SETMODE => {
                let want = mem::size_of::<vt_ffi::VtMode>() as u64;
                if (ioctl.in_size as u64) < want {
                    let _ = channel.borrow().reply_ioctl_retry(
                        unique,
                        &[IoctlIovec {
                            base: ioctl.arg,
                            len: want,
                        }],
                        &[],
                    );
                    return;
                }
                match cuse::read_struct::<vt_ffi::VtMode>(data) {
                    Some(mode) => reply(vts.set_vt_mode(&mode, request.header.pid as i32)),
                    None => reply(Err(ErrorKind::InvalidArgument)),
                }
            }
            VT_GETSTATE => {
                if !need_out(mem::size_of::<vt_ffi::VtStat>() as u64) {
                    let ids = self.inner.seat.session_ids();
                    let mut state: u16 = 1;
                    for id in &ids {
                        if (1..16).contains(id) {
                            state |= 1 << id;
                        }
                    }
                    let stat = vt_ffi::VtStat {
                        v_active: self
                            .inner
                            .seat
                            .foreground()
                            .map(|fg| fg.id() as u16)
                            .unwrap_or(0),
                        v_signal: 0,
                        v_state: state,
                    };
                    let bytes = unsafe {
                        std::slice::from_raw_parts(
                            (&stat as *const vt_ffi::VtStat).cast::<u8>(),
                            mem::size_of::<vt_ffi::VtStat>(),
                        )
                    };
                    reply_out(bytes);
                }
            }
            VT_OPENQRY => {
                if !need_out(4) {
                    let ids = self.inner.seat.session_ids();
                    let free = (1..).find(|id| !ids.contains(id)).unwrap_or(0) as i32;
                    reply_out(&free.to_ne_bytes());
                }
            }
            VT_ACTIVATE => {
                let target = ioctl.arg as u32;
                match self.inner.seat.session_by_id(target) {
                    Some(session) => match self.inner.seat.schedule(&session) {
                        Ok(()) | Err(ErrorKind::InProgress) => reply(Ok(())),
                        Err(kind) => reply(Err(kind)),
                    },
                    None => reply(Err(ErrorKind::NotFound)),
                }
            }
            VT_WAITACTIVE => {
                let target = ioctl.arg as u32;
                if self.inner.seat.session_by_id(target).is_none() {
                    return reply(Err(ErrorKind::NotFound));
                }
                let active = self
                    .inner
                    .seat
                    .foreground()
                    .map_or(false, |fg| fg.id() == target);
                if active {
                    reply(Ok(()))
                } else {
                    // Parked until the target becomes foreground (or the
                    // kernel interrupts the request).
                    client.wait_active.borrow_mut().push((unique, target));
                }
            }
            VT_RELDISP => reply(vts.reldisp(ioctl.arg as i32)),
            cmd => {
                trace!(parent: &self.inner.span, cmd, "unsupported ioctl");
                reply(Err(ErrorKind::NotSupported));
            }
        }
    }
}

impl EventSource for CharDev {
    type Event = ();
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(
        &mut self,
        _readiness: Readiness,
        _token: Token,
        _callback: F,
    ) -> io::Result<PostAction>
    where
        F: FnMut((), &mut ()),
    {
        let _guard = self.inner.span.clone().entered();
        loop {
            let request = self.inner.channel.borrow_mut().next_request();
            match request {
                Ok(Some(request)) => self.handle_request(request),
                Ok(None) => return Ok(PostAction::Continue),
                Err(err) => {
                    warn!("cuse channel failed: {err}");
                    if let Some(registry) = self.inner.registry.upgrade() {
                        let registry = CdevRegistry { inner: registry };
                        registry.remove(self.inner.minor);
                    }
                    return Ok(PostAction::Remove);
                }
            }
        }
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        let channel = self.inner.channel.borrow();
        unsafe { poll.register(channel.fd(), Interest::READ, Mode::Level, token) }
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        let channel = self.inner.channel.borrow();
        poll.reregister(channel.fd(), Interest::READ, Mode::Level, token)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        use std::os::unix::io::AsFd;
        let channel = self.inner.channel.borrow();
        poll.unregister(channel.fd().as_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_allocation_is_offset_and_reusable() {
        let mut minors = Bitset::new();
        let first = minors.alloc() as u32 + MINOR_OFFSET;
        let second = minors.alloc() as u32 + MINOR_OFFSET;
        assert_eq!(first, 16384);
        assert_eq!(second, 16385);
        minors.clear((first - MINOR_OFFSET) as usize);
        assert_eq!(minors.alloc() as u32 + MINOR_OFFSET, 16384);
    }

    #[test]
    fn ioctl_numbers_match_the_kernel() {
        assert_eq!(TCFLSH, 0x540B);
        assert_eq!(KDSETMODE, 0x4B3A);
        assert_eq!(VT_OPENQRY, 0x5600);
        assert_eq!(VT_SETMODE, 0x5602);
        assert_eq!(VT_RELDISP, 0x5605);
        assert_eq!(VT_WAITACTIVE, 0x5607);
    }
}
