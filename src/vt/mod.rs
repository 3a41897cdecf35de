//! VT master and VT handles.
//!
//! The [`VtMaster`] is a per-process singleton deciding who may hold the
//! real kernel VT: in *listen mode* nobody does (every seat gets a fake
//! VT), otherwise the first seat asking for a real VT claims it and any
//! further claim is refused. Fake VTs expose the same surface with no
//! kernel backing; the seat scheduler drives them directly.
//!
//! The kernel handshake of the real VT (SIGUSR1 on release request,
//! SIGUSR2 on acquisition) runs on a dedicated [`SubLoop`] so process
//! teardown can pump just these acknowledgements for a bounded time
//! without running the whole world.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use rustix::fs::{Mode as FsMode, OFlags};
use tracing::{debug, info, info_span, warn};

use crate::error::{ErrorKind, Kind};
use crate::event::{FdEvents, Signals, SubLoop};
use crate::seat::SessionReply;

pub mod session;

pub use session::{KbMode, KdMode, VtModeRecord, VtSession};

/// How long teardown waits for outstanding release acknowledgements.
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_millis(50);

/// Raw kernel ABI of the VT and KD ioctl surface.
pub mod ffi {
    #![allow(missing_docs)]

    use std::io;
    use std::os::unix::io::AsRawFd;

    pub const KDSETMODE: libc::c_ulong = 0x4B3A;
    pub const KDGETMODE: libc::c_ulong = 0x4B3B;
    pub const KDGKBMODE: libc::c_ulong = 0x4B44;
    pub const KDSKBMODE: libc::c_ulong = 0x4B45;

    pub const KD_TEXT: libc::c_int = 0x00;
    pub const KD_GRAPHICS: libc::c_int = 0x01;

    pub const K_RAW: libc::c_int = 0x00;
    pub const K_XLATE: libc::c_int = 0x01;
    pub const K_MEDIUMRAW: libc::c_int = 0x02;
    pub const K_UNICODE: libc::c_int = 0x03;
    pub const K_OFF: libc::c_int = 0x04;

    pub const VT_OPENQRY: libc::c_ulong = 0x5600;
    pub const VT_GETMODE: libc::c_ulong = 0x5601;
    pub const VT_SETMODE: libc::c_ulong = 0x5602;
    pub const VT_GETSTATE: libc::c_ulong = 0x5603;
    pub const VT_RELDISP: libc::c_ulong = 0x5605;
    pub const VT_ACTIVATE: libc::c_ulong = 0x5606;
    pub const VT_WAITACTIVE: libc::c_ulong = 0x5607;

    pub const VT_AUTO: i8 = 0x00;
    pub const VT_PROCESS: i8 = 0x01;
    pub const VT_ACKACQ: libc::c_int = 0x02;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct VtMode {
        /// `VT_AUTO` or `VT_PROCESS`.
        pub mode: i8,
        /// If set, writes hang while the VT is inactive.
        pub waitv: i8,
        /// Signal raised on release requests.
        pub relsig: i16,
        /// Signal raised on acquisition.
        pub acqsig: i16,
        /// Unused, must be zero.
        pub frsig: i16,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct VtStat {
        pub v_active: u16,
        pub v_signal: u16,
        pub v_state: u16,
    }

    pub fn ioctl_int(fd: &impl AsRawFd, request: libc::c_ulong, arg: libc::c_int) -> io::Result<()> {
        if unsafe { libc::ioctl(fd.as_raw_fd(), request, arg as libc::c_ulong) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn ioctl_ptr<T>(fd: &impl AsRawFd, request: libc::c_ulong, arg: *mut T) -> io::Result<()> {
        if unsafe { libc::ioctl(fd.as_raw_fd(), request, arg) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn get_kb_mode(fd: &impl AsRawFd) -> io::Result<libc::c_int> {
        let mut mode: libc::c_int = 0;
        ioctl_ptr(fd, KDGKBMODE, &mut mode)?;
        Ok(mode)
    }

    pub fn get_state(fd: &impl AsRawFd) -> io::Result<VtStat> {
        let mut stat = VtStat::default();
        ioctl_ptr(fd, VT_GETSTATE, &mut stat)?;
        Ok(stat)
    }

    pub fn open_query(fd: &impl AsRawFd) -> io::Result<i32> {
        let mut vt: libc::c_int = 0;
        ioctl_ptr(fd, VT_OPENQRY, &mut vt)?;
        if vt <= 0 {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        Ok(vt)
    }

    pub fn set_mode(fd: &impl AsRawFd, mode: &VtMode) -> io::Result<()> {
        let mut copy = *mode;
        ioctl_ptr(fd, VT_SETMODE, &mut copy)
    }
}

/// Errors of the VT master.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Listen mode forbids real VT allocation.
    #[error("listen mode holds no controlling VT")]
    ListenMode,
    /// The real VT is already held by another seat.
    #[error("the real VT is already in use")]
    RealVtInUse,
    /// Opening or configuring the tty failed.
    #[error("cannot set up tty: {msg}")]
    Tty {
        /// What was attempted.
        msg: &'static str,
        /// Root cause.
        #[source]
        source: io::Error,
    },
}

impl Kind for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::ListenMode => ErrorKind::NotSupported,
            // Deliberately a range-style refusal so callers can fall
            // back to a fake VT.
            Error::RealVtInUse => ErrorKind::Busy,
            Error::Tty { .. } => ErrorKind::DeviceFault,
        }
    }
}

/// Events a VT handle delivers to its owner (the seat controller).
///
/// The `Leave` handler may reply [`SessionReply::InProgress`]; the owner
/// must then call [`VtHandle::leave_done`] once the seat finished going
/// to sleep so the kernel handshake (or teardown) can complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VtEvent {
    /// The VT became active; wake the seat.
    Enter,
    /// The VT shall be released; put the seat to sleep.
    Leave,
}

type VtCallback = Box<dyn FnMut(VtEvent) -> SessionReply>;

struct RealVt {
    tty: OwnedFd,
    vt_num: i32,
    prev_vt: i32,
    old_kb_mode: libc::c_int,
    active: Cell<bool>,
    // SIGUSR1 arrived, seat is still going down.
    release_pending: Cell<bool>,
    // deactivate() is waiting for the release to finish (teardown).
    exit_pending: Cell<bool>,
    cb: RefCell<Option<VtCallback>>,
    master: Weak<MasterInner>,
    span: tracing::Span,
}

struct FakeVt {
    active: Cell<bool>,
    leave_pending: Cell<bool>,
    exit_pending: Cell<bool>,
    cb: RefCell<Option<VtCallback>>,
    master: Weak<MasterInner>,
}

enum VtKind {
    Real(Rc<RealVt>),
    Fake(Rc<FakeVt>),
}

/// A seat's VT, real or fake.
pub struct VtHandle {
    kind: VtKind,
}

impl std::fmt::Debug for VtHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            VtKind::Real(vt) => f
                .debug_struct("VtHandle")
                .field("kind", &"real")
                .field("vt", &vt.vt_num)
                .field("active", &vt.active.get())
                .finish(),
            VtKind::Fake(vt) => f
                .debug_struct("VtHandle")
                .field("kind", &"fake")
                .field("active", &vt.active.get())
                .finish(),
        }
    }
}

struct MasterInner {
    listen: bool,
    subloop: SubLoop,
    real_taken: Cell<bool>,
    pending_exits: Cell<usize>,
}

/// The per-process VT arbiter.
#[derive(Clone)]
pub struct VtMaster {
    inner: Rc<MasterInner>,
}

impl std::fmt::Debug for VtMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VtMaster")
            .field("listen", &self.inner.listen)
            .field("real_taken", &self.inner.real_taken.get())
            .finish_non_exhaustive()
    }
}

impl VtMaster {
    /// Creates the master. `listen` disables real-VT ownership entirely.
    pub fn new(listen: bool) -> io::Result<Self> {
        Ok(VtMaster {
            inner: Rc::new(MasterInner {
                listen,
                subloop: SubLoop::new()?,
                real_taken: Cell::new(false),
                pending_exits: Cell::new(0),
            }),
        })
    }

    /// The VT sub-loop; the runtime inserts it into the main loop.
    pub fn subloop(&self) -> SubLoop {
        self.inner.subloop.clone()
    }

    /// Whether the master runs in listen mode.
    pub fn is_listen(&self) -> bool {
        self.inner.listen
    }

    /// Allocates a VT for a seat.
    ///
    /// `want_real` asks for the kernel VT; listen mode and a second
    /// claim both degrade to a fake VT via the returned error, which the
    /// caller typically handles by calling [`VtMaster::allocate_fake`].
    pub fn allocate_real<F>(&self, cb: F) -> Result<VtHandle, Error>
    where
        F: FnMut(VtEvent) -> SessionReply + 'static,
    {
        if self.inner.listen {
            return Err(Error::ListenMode);
        }
        if self.inner.real_taken.get() {
            return Err(Error::RealVtInUse);
        }
        let real = RealVt::open(Rc::downgrade(&self.inner))?;
        *real.cb.borrow_mut() = Some(Box::new(cb));
        real.clone().bind_signals()?;
        self.inner.real_taken.set(true);
        Ok(VtHandle {
            kind: VtKind::Real(real),
        })
    }

    /// Allocates a purely user-space VT.
    pub fn allocate_fake<F>(&self, cb: F) -> VtHandle
    where
        F: FnMut(VtEvent) -> SessionReply + 'static,
    {
        let fake = Rc::new(FakeVt {
            active: Cell::new(false),
            leave_pending: Cell::new(false),
            exit_pending: Cell::new(false),
            cb: RefCell::new(Some(Box::new(cb))),
            master: Rc::downgrade(&self.inner),
        });
        VtHandle {
            kind: VtKind::Fake(fake),
        }
    }

    /// Number of deactivations still waiting for acknowledgement.
    pub fn pending_exits(&self) -> usize {
        self.inner.pending_exits.get()
    }

    /// Runs the VT sub-loop until every pending exit acknowledged or
    /// `timeout` elapsed. Shutdown proceeds regardless afterwards.
    pub fn settle_exits(&self, timeout: Duration) -> io::Result<()> {
        if self.inner.pending_exits.get() == 0 {
            return Ok(());
        }
        debug!(pending = self.inner.pending_exits.get(), "waiting for VT release acks");
        self.inner.subloop.run(Some(timeout))?;
        if self.inner.pending_exits.get() > 0 {
            warn!(
                pending = self.inner.pending_exits.get(),
                "VT clients did not acknowledge in time"
            );
        }
        Ok(())
    }
}

impl MasterInner {
    fn exit_started(&self) {
        self.pending_exits.set(self.pending_exits.get() + 1);
    }

    fn exit_finished(&self) {
        let left = self.pending_exits.get().saturating_sub(1);
        self.pending_exits.set(left);
        if left == 0 {
            self.subloop.exit();
        }
    }
}

impl RealVt {
    fn open(master: Weak<MasterInner>) -> Result<Rc<Self>, Error> {
        let tty = |msg, source| Error::Tty { msg, source };

        let console = rustix::fs::open(
            "/dev/tty0",
            OFlags::RDWR | OFlags::CLOEXEC,
            FsMode::empty(),
        )
        .map_err(|err| tty("open /dev/tty0", err.into()))?;
        let vt_num = ffi::open_query(&console).map_err(|err| tty("VT_OPENQRY", err))?;
        let prev_vt = ffi::get_state(&console)
            .map(|stat| stat.v_active as i32)
            .unwrap_or(0);
        drop(console);

        let path = format!("/dev/tty{vt_num}");
        let fd = rustix::fs::open(
            path.as_str(),
            OFlags::RDWR | OFlags::CLOEXEC | OFlags::NOCTTY | OFlags::NONBLOCK,
            FsMode::empty(),
        )
        .map_err(|err| tty("open vt", err.into()))?;

        let old_kb_mode = ffi::get_kb_mode(&fd).map_err(|err| tty("KDGKBMODE", err))?;
        ffi::set_mode(
            &fd,
            &ffi::VtMode {
                mode: ffi::VT_PROCESS,
                relsig: libc::SIGUSR1 as i16,
                acqsig: libc::SIGUSR2 as i16,
                ..Default::default()
            },
        )
        .map_err(|err| tty("VT_SETMODE", err))?;

        info!(vt = vt_num, prev = prev_vt, "claimed real VT");
        Ok(Rc::new(RealVt {
            tty: fd,
            vt_num,
            prev_vt,
            old_kb_mode,
            active: Cell::new(false),
            release_pending: Cell::new(false),
            exit_pending: Cell::new(false),
            cb: RefCell::new(None),
            master,
            span: info_span!("vt", num = vt_num),
        }))
    }

    fn bind_signals(self: Rc<Self>) -> Result<(), Error> {
        let Some(master) = self.master.upgrade() else {
            return Ok(());
        };
        let signals = Signals::new(&[libc::SIGUSR1, libc::SIGUSR2]).map_err(|err| Error::Tty {
            msg: "signalfd",
            source: err,
        })?;
        let vt = self.clone();
        let fd = signals.as_fd().as_raw_fd();
        // The Signals source lives inside the closure for as long as the
        // registration exists.
        master
            .subloop
            .register(
                unsafe { std::os::unix::io::BorrowedFd::borrow_raw(fd) },
                FdEvents::READ,
                move |_| {
                    while let Ok(Some(event)) = signals.try_read() {
                        vt.signal(event.signal);
                    }
                },
            )
            .map_err(|err| Error::Tty {
                msg: "register signalfd",
                source: err,
            })?;
        Ok(())
    }

    fn invoke(&self, event: VtEvent) -> SessionReply {
        let mut slot = self.cb.borrow_mut();
        match slot.as_mut() {
            Some(cb) => cb(event),
            None => SessionReply::Ok,
        }
    }

    fn signal(&self, signal: i32) {
        let _guard = self.span.enter();
        match signal {
            libc::SIGUSR1 => {
                debug!("kernel requests VT release");
                match self.invoke(VtEvent::Leave) {
                    SessionReply::Ok => self.finish_release(),
                    SessionReply::InProgress => self.release_pending.set(true),
                    SessionReply::Failed(kind) => {
                        // Refuse the switch; the kernel keeps us active.
                        warn!(?kind, "seat refused VT release");
                        let _ = ffi::ioctl_int(&self.tty, ffi::VT_RELDISP, 0);
                    }
                }
            }
            libc::SIGUSR2 => {
                debug!("kernel granted VT");
                let _ = ffi::ioctl_int(&self.tty, ffi::VT_RELDISP, ffi::VT_ACKACQ);
                let _ = ffi::ioctl_int(&self.tty, ffi::KDSETMODE, ffi::KD_GRAPHICS);
                let _ = ffi::ioctl_int(&self.tty, ffi::KDSKBMODE, ffi::K_OFF);
                self.active.set(true);
                let _ = self.invoke(VtEvent::Enter);
            }
            _ => {}
        }
    }

    fn finish_release(&self) {
        self.release_pending.set(false);
        self.active.set(false);
        let _ = ffi::ioctl_int(&self.tty, ffi::KDSETMODE, ffi::KD_TEXT);
        let _ = ffi::ioctl_int(&self.tty, ffi::KDSKBMODE, self.old_kb_mode);
        let _ = ffi::ioctl_int(&self.tty, ffi::VT_RELDISP, 1);
        debug!("VT released");
        if self.exit_pending.replace(false) {
            if let Some(master) = self.master.upgrade() {
                master.exit_finished();
            }
        }
    }
}

impl Drop for RealVt {
    fn drop(&mut self) {
        let _ = ffi::ioctl_int(&self.tty, ffi::KDSKBMODE, self.old_kb_mode);
        let _ = ffi::ioctl_int(&self.tty, ffi::KDSETMODE, ffi::KD_TEXT);
        let _ = ffi::set_mode(
            &self.tty,
            &ffi::VtMode {
                mode: ffi::VT_AUTO,
                ..Default::default()
            },
        );
        if let Some(master) = self.master.upgrade() {
            master.real_taken.set(false);
        }
    }
}

impl VtHandle {
    /// Whether this handle is backed by the kernel VT.
    pub fn is_real(&self) -> bool {
        matches!(self.kind, VtKind::Real(_))
    }

    /// Whether the VT currently is the active one.
    pub fn is_active(&self) -> bool {
        match &self.kind {
            VtKind::Real(vt) => vt.active.get(),
            VtKind::Fake(vt) => vt.active.get(),
        }
    }

    /// Asks for this VT to become active.
    ///
    /// Real VTs go through the kernel (`Enter` arrives with SIGUSR2);
    /// fake VTs enter synchronously.
    pub fn activate(&self) -> Result<(), ErrorKind> {
        match &self.kind {
            VtKind::Real(vt) => {
                if vt.active.get() {
                    return Ok(());
                }
                ffi::ioctl_int(&vt.tty, ffi::VT_ACTIVATE, vt.vt_num)
                    .map_err(|_| ErrorKind::DeviceFault)
            }
            VtKind::Fake(vt) => {
                if vt.active.replace(true) {
                    return Ok(());
                }
                let reply = {
                    let mut slot = vt.cb.borrow_mut();
                    match slot.as_mut() {
                        Some(cb) => cb(VtEvent::Enter),
                        None => SessionReply::Ok,
                    }
                };
                match reply {
                    SessionReply::Failed(kind) => Err(kind),
                    _ => Ok(()),
                }
            }
        }
    }

    /// Asks for this VT to be released.
    ///
    /// Returns `Err(InProgress)` while the seat (or, for real VTs, the
    /// kernel round-trip) is still completing; the eventual completion
    /// is signalled through [`VtHandle::leave_done`] or the signal
    /// handler.
    pub fn deactivate(&self) -> Result<(), ErrorKind> {
        match &self.kind {
            VtKind::Real(vt) => {
                if !vt.active.get() {
                    return Ok(());
                }
                vt.exit_pending.set(true);
                if let Some(master) = vt.master.upgrade() {
                    master.exit_started();
                }
                if vt.prev_vt > 0 {
                    let _ = ffi::ioctl_int(&vt.tty, ffi::VT_ACTIVATE, vt.prev_vt);
                }
                Err(ErrorKind::InProgress)
            }
            VtKind::Fake(vt) => {
                if !vt.active.get() {
                    return Ok(());
                }
                let reply = {
                    let mut slot = vt.cb.borrow_mut();
                    match slot.as_mut() {
                        Some(cb) => cb(VtEvent::Leave),
                        None => SessionReply::Ok,
                    }
                };
                match reply {
                    SessionReply::Ok => {
                        vt.active.set(false);
                        Ok(())
                    }
                    SessionReply::InProgress => {
                        vt.leave_pending.set(true);
                        vt.exit_pending.set(true);
                        if let Some(master) = vt.master.upgrade() {
                            master.exit_started();
                        }
                        Err(ErrorKind::InProgress)
                    }
                    SessionReply::Failed(kind) => Err(kind),
                }
            }
        }
    }

    /// Completion hook: the seat finished going to sleep after a `Leave`
    /// that returned *in-progress*.
    pub fn leave_done(&self) {
        match &self.kind {
            VtKind::Real(vt) => {
                if vt.release_pending.get() {
                    vt.finish_release();
                }
            }
            VtKind::Fake(vt) => {
                if vt.leave_pending.replace(false) {
                    vt.active.set(false);
                    if vt.exit_pending.replace(false) {
                        if let Some(master) = vt.master.upgrade() {
                            master.exit_finished();
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_mode_refuses_real_vt() {
        let master = VtMaster::new(true).unwrap();
        let err = master.allocate_real(|_| SessionReply::Ok).unwrap_err();
        assert!(matches!(err, Error::ListenMode));
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn fake_vt_round_trip() {
        let master = VtMaster::new(true).unwrap();
        let log: Rc<RefCell<Vec<VtEvent>>> = Rc::default();
        let vt = master.allocate_fake({
            let log = log.clone();
            move |event| {
                log.borrow_mut().push(event);
                SessionReply::Ok
            }
        });
        assert!(!vt.is_real());
        assert!(!vt.is_active());

        vt.activate().unwrap();
        assert!(vt.is_active());
        vt.activate().unwrap();
        assert_eq!(&*log.borrow(), &[VtEvent::Enter]);

        vt.deactivate().unwrap();
        assert!(!vt.is_active());
        assert_eq!(&*log.borrow(), &[VtEvent::Enter, VtEvent::Leave]);
    }

    #[test]
    fn fake_vt_async_leave_counts_pending_exit() {
        let master = VtMaster::new(true).unwrap();
        let vt = master.allocate_fake(|event| match event {
            VtEvent::Leave => SessionReply::InProgress,
            _ => SessionReply::Ok,
        });
        vt.activate().unwrap();

        assert_eq!(vt.deactivate(), Err(ErrorKind::InProgress));
        assert_eq!(master.pending_exits(), 1);
        assert!(vt.is_active());

        vt.leave_done();
        assert!(!vt.is_active());
        assert_eq!(master.pending_exits(), 0);
    }

    #[test]
    fn settle_exits_returns_quickly_when_idle() {
        let master = VtMaster::new(true).unwrap();
        let start = std::time::Instant::now();
        master.settle_exits(TEARDOWN_TIMEOUT).unwrap();
        assert!(start.elapsed() < Duration::from_millis(40));
    }

    #[test]
    fn vt_mode_struct_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<ffi::VtMode>(), 8);
        assert_eq!(std::mem::size_of::<ffi::VtStat>(), 6);
    }
}
