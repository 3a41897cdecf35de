//! Kernel-VT-compatible session façade.
//!
//! A [`VtSession`] gives one legacy client the surface it expects from
//! `/dev/ttyN`: KD mode, keyboard mode, `VT_SETMODE` and the
//! release/acquire handshake, while the seat scheduler actually decides
//! who is foreground. The character-device bridge dispatches client
//! ioctls into the typed operations here.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use calloop::{LoopHandle, RegistrationToken};
use tracing::{debug, info_span, trace, warn};

use crate::error::ErrorKind;
use crate::event::Timer;
use crate::seat::{Seat, SeatSession, SessionConfig, SessionEvent, SessionReply};

use super::ffi;

/// How long a process-mode client may sit on a release request before
/// the scheduler forces the hand-off.
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Console mode of a VT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KdMode {
    /// Text mode (`KD_TEXT`; the `KD_TEXT0`/`KD_TEXT1` aliases collapse
    /// into this).
    #[default]
    Text,
    /// Graphics mode (`KD_GRAPHICS`).
    Graphics,
}

impl KdMode {
    /// Parses a `KDSETMODE` argument.
    pub fn from_raw(raw: i32) -> Result<Self, ErrorKind> {
        match raw {
            0 | 2 | 3 => Ok(KdMode::Text),
            1 => Ok(KdMode::Graphics),
            _ => Err(ErrorKind::InvalidArgument),
        }
    }

    /// The `KDGETMODE` representation.
    pub fn to_raw(self) -> i32 {
        match self {
            KdMode::Text => ffi::KD_TEXT,
            KdMode::Graphics => ffi::KD_GRAPHICS,
        }
    }
}

/// Keyboard mode of a VT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KbMode {
    /// Decoded input (`K_UNICODE`).
    #[default]
    Unicode,
    /// No input delivery (`K_OFF`).
    Off,
    /// `K_RAW` is accepted for compatibility but behaves like
    /// [`KbMode::Off`]: a user-space VT has no scancode stream to
    /// mirror. The mode is reported back verbatim so clients that set
    /// it round-trip cleanly.
    Raw,
}

impl KbMode {
    /// Parses a `KDSKBMODE` argument. `K_XLATE` and `K_MEDIUMRAW` are
    /// refused as not supported.
    pub fn from_raw(raw: i32) -> Result<Self, ErrorKind> {
        match raw {
            ffi::K_UNICODE => Ok(KbMode::Unicode),
            ffi::K_OFF => Ok(KbMode::Off),
            ffi::K_RAW => Ok(KbMode::Raw),
            ffi::K_XLATE | ffi::K_MEDIUMRAW => Err(ErrorKind::NotSupported),
            _ => Err(ErrorKind::InvalidArgument),
        }
    }

    /// The `KDGKBMODE` representation.
    pub fn to_raw(self) -> i32 {
        match self {
            KbMode::Unicode => ffi::K_UNICODE,
            KbMode::Off => ffi::K_OFF,
            KbMode::Raw => ffi::K_RAW,
        }
    }

    /// Whether decoded input events reach the client in this mode.
    pub fn delivers_input(self) -> bool {
        matches!(self, KbMode::Unicode)
    }
}

/// Switch policy of a VT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwitchMode {
    /// The scheduler switches freely (`VT_AUTO`).
    #[default]
    Auto,
    /// The client takes part in switching via signals (`VT_PROCESS`).
    Process,
}

/// The `VT_SETMODE` record of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VtModeRecord {
    /// Switch policy.
    pub mode: SwitchMode,
    /// Signal sent on release requests (process mode).
    pub relsig: i32,
    /// Signal sent on acquisition (process mode).
    pub acqsig: i32,
    /// Controlling pid, filled in from the requesting client.
    pub pid: i32,
}

impl VtModeRecord {
    /// Validates a raw `VT_SETMODE` request from `pid`.
    ///
    /// Non-zero `waitv` is refused: hanging writes on an inactive VT is
    /// a contract no current client relies on, and silently accepting
    /// it would be worse than refusing.
    pub fn from_raw(raw: &ffi::VtMode, pid: i32) -> Result<Self, ErrorKind> {
        if raw.waitv != 0 {
            return Err(ErrorKind::NotSupported);
        }
        let mode = match raw.mode {
            ffi::VT_AUTO => SwitchMode::Auto,
            ffi::VT_PROCESS => SwitchMode::Process,
            _ => return Err(ErrorKind::InvalidArgument),
        };
        let valid_sig = |sig: i16| (1..=64).contains(&(sig as i32));
        if mode == SwitchMode::Process && (!valid_sig(raw.relsig) || !valid_sig(raw.acqsig)) {
            return Err(ErrorKind::InvalidArgument);
        }
        Ok(VtModeRecord {
            mode,
            relsig: raw.relsig as i32,
            acqsig: raw.acqsig as i32,
            pid,
        })
    }

    /// The `VT_GETMODE` representation.
    pub fn to_raw(&self) -> ffi::VtMode {
        ffi::VtMode {
            mode: match self.mode {
                SwitchMode::Auto => ffi::VT_AUTO,
                SwitchMode::Process => ffi::VT_PROCESS,
            },
            waitv: 0,
            relsig: self.relsig as i16,
            acqsig: self.acqsig as i16,
            frsig: 0,
        }
    }
}

bitflags::bitflags! {
    /// Poll readiness of a VT session fd.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollFlags: u32 {
        /// Data (or a hang-up) can be read.
        const READ = 1 << 0;
        /// Writes will not block.
        const WRITE = 1 << 1;
        /// The session lost its seat.
        const HUP = 1 << 2;
    }
}

/// Notifications to the owning character-device client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VtsNotify {
    /// The session became foreground.
    Activated,
    /// The session left the foreground.
    Deactivated,
    /// The session lost its seat; poll now reports `HUP`.
    HangUp,
}

struct VtsInner {
    seat: RefCell<Option<Seat>>,
    session: RefCell<Option<SeatSession>>,
    kd: Cell<KdMode>,
    kb: Cell<KbMode>,
    mode: RefCell<VtModeRecord>,
    timer: Timer,
    timer_token: Cell<Option<RegistrationToken>>,
    loop_handle: LoopHandle<'static, ()>,
    notify: RefCell<Option<Box<dyn FnMut(VtsNotify)>>>,
    span: tracing::Span,
}

/// One legacy client's VT.
#[derive(Clone)]
pub struct VtSession {
    inner: Rc<VtsInner>,
}

impl std::fmt::Debug for VtSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VtSession")
            .field("kd", &self.inner.kd.get())
            .field("kb", &self.inner.kb.get())
            .field("hung_up", &self.inner.seat.borrow().is_none())
            .finish_non_exhaustive()
    }
}

impl VtSession {
    /// Creates a VT session and registers it on `seat`.
    pub fn new(
        seat: &Seat,
        loop_handle: &LoopHandle<'static, ()>,
        id: u32,
    ) -> Result<Self, ErrorKind> {
        let timer = Timer::new().map_err(|_| ErrorKind::DeviceFault)?;
        let inner = Rc::new(VtsInner {
            seat: RefCell::new(Some(seat.clone())),
            session: RefCell::new(None),
            kd: Cell::new(KdMode::Text),
            kb: Cell::new(KbMode::Unicode),
            mode: RefCell::new(VtModeRecord::default()),
            timer: timer.try_clone().map_err(|_| ErrorKind::DeviceFault)?,
            timer_token: Cell::new(None),
            loop_handle: loop_handle.clone(),
            notify: RefCell::new(None),
            span: info_span!("vt-session", seat = seat.name(), id),
        });

        let weak = Rc::downgrade(&inner);
        let session = seat.register_session(
            SessionConfig {
                id,
                enabled: true,
                dummy: false,
            },
            move |event| Self::session_event(&weak, event),
        )?;
        *inner.session.borrow_mut() = Some(session);

        let weak = Rc::downgrade(&inner);
        let token = loop_handle
            .insert_source(timer, move |_expirations, _, _| {
                if let Some(inner) = weak.upgrade() {
                    VtSession { inner }.release_timed_out();
                }
            })
            .map_err(|_| ErrorKind::DeviceFault)?;
        inner.timer_token.set(Some(token));

        Ok(VtSession { inner })
    }

    fn session_event(weak: &Weak<VtsInner>, event: SessionEvent) -> SessionReply {
        let Some(inner) = weak.upgrade() else {
            return SessionReply::Ok;
        };
        let vts = VtSession { inner };
        match event {
            SessionEvent::Activate => vts.on_activate(),
            SessionEvent::Deactivate => vts.on_deactivate(),
            SessionEvent::Unregister => {
                vts.on_hangup();
                SessionReply::Ok
            }
        }
    }

    fn emit(&self, notify: VtsNotify) {
        if let Some(cb) = self.inner.notify.borrow_mut().as_mut() {
            cb(notify);
        }
    }

    fn signal_client(&self, sig: i32) -> bool {
        let pid = self.inner.mode.borrow().pid;
        if pid <= 0 || sig <= 0 {
            return false;
        }
        let sent = unsafe { libc::kill(pid, sig) } == 0;
        if !sent {
            warn!(parent: &self.inner.span, pid, sig, "cannot signal VT client");
        }
        sent
    }

    fn on_activate(&self) -> SessionReply {
        let _guard = self.inner.span.enter();
        trace!("vt session activates");
        if self.inner.mode.borrow().mode == SwitchMode::Process {
            let acqsig = self.inner.mode.borrow().acqsig;
            self.signal_client(acqsig);
        }
        self.emit(VtsNotify::Activated);
        SessionReply::Ok
    }

    fn on_deactivate(&self) -> SessionReply {
        let _guard = self.inner.span.enter();
        let mode = *self.inner.mode.borrow();
        match mode.mode {
            SwitchMode::Auto => {
                trace!("auto-mode release");
                self.emit(VtsNotify::Deactivated);
                SessionReply::Ok
            }
            SwitchMode::Process => {
                if !self.signal_client(mode.relsig) {
                    // A dead client cannot acknowledge; do not wedge the
                    // seat on it.
                    self.emit(VtsNotify::Deactivated);
                    return SessionReply::Ok;
                }
                debug!(pid = mode.pid, "release signalled, waiting for VT_RELDISP");
                let _ = self.inner.timer.set_oneshot(RELEASE_TIMEOUT);
                SessionReply::InProgress
            }
        }
    }

    fn release_timed_out(&self) {
        let _guard = self.inner.span.enter();
        let session = self.inner.session.borrow().clone();
        let seat = self.inner.seat.borrow().clone();
        let (Some(session), Some(seat)) = (session, seat) else {
            return;
        };
        if !session.is_deactivating() {
            return;
        }
        warn!("VT client did not release in time, forcing");
        self.emit(VtsNotify::Deactivated);
        let _ = seat.notify_deactivated(&session);
    }

    fn on_hangup(&self) {
        let _guard = self.inner.span.enter();
        let _ = self.inner.timer.disarm();
        self.inner.seat.borrow_mut().take();
        self.inner.session.borrow_mut().take();
        self.emit(VtsNotify::HangUp);
        debug!("vt session hung up");
    }

    /// Installs the notification callback of the owning client.
    pub fn set_notify<F>(&self, cb: F)
    where
        F: FnMut(VtsNotify) + 'static,
    {
        *self.inner.notify.borrow_mut() = Some(Box::new(cb));
    }

    /// Whether this session is its seat's foreground.
    pub fn is_active(&self) -> bool {
        let seat = self.inner.seat.borrow();
        let session = self.inner.session.borrow();
        match (&*seat, &*session) {
            (Some(seat), Some(session)) => seat.is_foreground(session),
            _ => false,
        }
    }

    /// `KDSETMODE`.
    pub fn set_kd_mode(&self, raw: i32) -> Result<(), ErrorKind> {
        self.inner.kd.set(KdMode::from_raw(raw)?);
        Ok(())
    }

    /// `KDGETMODE`.
    pub fn kd_mode(&self) -> i32 {
        self.inner.kd.get().to_raw()
    }

    /// `KDSKBMODE`.
    pub fn set_kb_mode(&self, raw: i32) -> Result<(), ErrorKind> {
        self.inner.kb.set(KbMode::from_raw(raw)?);
        Ok(())
    }

    /// `KDGKBMODE`.
    pub fn kb_mode(&self) -> i32 {
        self.inner.kb.get().to_raw()
    }

    /// Whether decoded keyboard input currently flows to the client.
    pub fn input_enabled(&self) -> bool {
        self.inner.kb.get().delivers_input()
    }

    /// `VT_SETMODE` from client `pid`.
    pub fn set_vt_mode(&self, raw: &ffi::VtMode, pid: i32) -> Result<(), ErrorKind> {
        let record = VtModeRecord::from_raw(raw, pid)?;
        debug!(parent: &self.inner.span, mode = ?record.mode, pid, "VT_SETMODE");
        *self.inner.mode.borrow_mut() = record;
        Ok(())
    }

    /// `VT_GETMODE`.
    pub fn vt_mode(&self) -> ffi::VtMode {
        self.inner.mode.borrow().to_raw()
    }

    /// `VT_RELDISP`.
    pub fn reldisp(&self, arg: i32) -> Result<(), ErrorKind> {
        let session = self.inner.session.borrow().clone();
        let seat = self.inner.seat.borrow().clone();
        let (Some(session), Some(seat)) = (session, seat) else {
            return Err(ErrorKind::HangUp);
        };
        match arg {
            0 => {
                if !session.is_deactivating() {
                    return Err(ErrorKind::InvalidArgument);
                }
                let _ = self.inner.timer.disarm();
                seat.notify_refused(&session)
            }
            1 => {
                if !session.is_deactivating() {
                    return Err(ErrorKind::InvalidArgument);
                }
                let _ = self.inner.timer.disarm();
                self.emit(VtsNotify::Deactivated);
                seat.notify_deactivated(&session)
            }
            arg if arg == ffi::VT_ACKACQ => Ok(()),
            _ => Err(ErrorKind::InvalidArgument),
        }
    }

    /// `VT_ACTIVATE` targeting this session.
    pub fn activate_self(&self) -> Result<(), ErrorKind> {
        let session = self.inner.session.borrow().clone();
        let seat = self.inner.seat.borrow().clone();
        let (Some(session), Some(seat)) = (session, seat) else {
            return Err(ErrorKind::HangUp);
        };
        match seat.schedule(&session) {
            Ok(()) | Err(ErrorKind::InProgress) => Ok(()),
            Err(kind) => Err(kind),
        }
    }

    /// `TCFLSH`. The flush queues of a user-space VT are empty by
    /// construction, so this only validates the argument.
    pub fn flush(&self, arg: i32) -> Result<(), ErrorKind> {
        match arg {
            0..=2 => Ok(()),
            _ => Err(ErrorKind::InvalidArgument),
        }
    }

    /// Poll readiness.
    pub fn poll_mask(&self) -> PollFlags {
        if self.inner.seat.borrow().is_none() {
            PollFlags::HUP | PollFlags::READ | PollFlags::WRITE
        } else {
            PollFlags::WRITE
        }
    }

    /// Severs the session from its seat (client close or kill).
    pub fn hangup(&self) {
        let seat = self.inner.seat.borrow().clone();
        let session = self.inner.session.borrow().clone();
        if let (Some(seat), Some(session)) = (seat, session) {
            let _ = seat.unregister_session(&session);
        }
        // unregister_session drives on_hangup via the Unregister event;
        // a second call is a no-op.
        if self.inner.seat.borrow().is_some() {
            self.on_hangup();
        }
    }
}

impl Drop for VtsInner {
    fn drop(&mut self) {
        if let Some(token) = self.timer_token.take() {
            self.loop_handle.remove(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kd_text_aliases_collapse() {
        assert_eq!(KdMode::from_raw(0), Ok(KdMode::Text));
        assert_eq!(KdMode::from_raw(2), Ok(KdMode::Text));
        assert_eq!(KdMode::from_raw(3), Ok(KdMode::Text));
        assert_eq!(KdMode::from_raw(1), Ok(KdMode::Graphics));
        assert_eq!(KdMode::from_raw(7), Err(ErrorKind::InvalidArgument));
        assert_eq!(KdMode::Text.to_raw(), 0);
    }

    #[test]
    fn kb_mode_support_matrix() {
        assert_eq!(KbMode::from_raw(ffi::K_UNICODE), Ok(KbMode::Unicode));
        assert_eq!(KbMode::from_raw(ffi::K_OFF), Ok(KbMode::Off));
        assert_eq!(KbMode::from_raw(ffi::K_RAW), Ok(KbMode::Raw));
        assert_eq!(KbMode::from_raw(ffi::K_XLATE), Err(ErrorKind::NotSupported));
        assert_eq!(
            KbMode::from_raw(ffi::K_MEDIUMRAW),
            Err(ErrorKind::NotSupported)
        );
        assert_eq!(KbMode::from_raw(99), Err(ErrorKind::InvalidArgument));

        assert!(KbMode::Unicode.delivers_input());
        assert!(!KbMode::Off.delivers_input());
        assert!(!KbMode::Raw.delivers_input());
    }

    #[test]
    fn vt_setmode_validation() {
        let process = ffi::VtMode {
            mode: ffi::VT_PROCESS,
            relsig: libc::SIGUSR1 as i16,
            acqsig: libc::SIGUSR2 as i16,
            ..Default::default()
        };
        let record = VtModeRecord::from_raw(&process, 1234).unwrap();
        assert_eq!(record.mode, SwitchMode::Process);
        assert_eq!(record.pid, 1234);
        assert_eq!(record.to_raw(), process);

        let waitv = ffi::VtMode {
            waitv: 1,
            ..process
        };
        assert_eq!(
            VtModeRecord::from_raw(&waitv, 1),
            Err(ErrorKind::NotSupported)
        );

        let bad_sig = ffi::VtMode {
            relsig: 0,
            ..process
        };
        assert_eq!(
            VtModeRecord::from_raw(&bad_sig, 1),
            Err(ErrorKind::InvalidArgument)
        );

        let bad_mode = ffi::VtMode {
            mode: 9,
            ..process
        };
        assert_eq!(
            VtModeRecord::from_raw(&bad_mode, 1),
            Err(ErrorKind::InvalidArgument)
        );

        // Auto mode does not require signals.
        let auto = ffi::VtMode::default();
        assert_eq!(
            VtModeRecord::from_raw(&auto, 1).unwrap().mode,
            SwitchMode::Auto
        );
    }
}
