//! The per-seat controller.
//!
//! One controller per seat wires everything together: it owns the seat
//! and its scheduler, the input aggregate, one video backend per
//! accepted graphics device and the seat's VT handle. Monitor events are
//! routed in from the runtime; scheduler events are reflected out into
//! the backends (wake on foreground, sleep on background) and into the
//! VT handshake.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use calloop::{Dispatcher, LoopHandle, RegistrationToken};
use tracing::{debug, info, info_span, trace, warn};
use xkbcommon::xkb::keysyms;

use crate::error::{ErrorKind, Kind};
use crate::input::{self, KeyEvent, SeatInput, XkbConfig};
use crate::monitor::{DeviceDesc, DeviceFlags, DeviceKind};
use crate::seat::{Seat, SeatEvent, SessionReply};
use crate::video::{VideoBackend, VideoEvent};
use crate::vt::{VtEvent, VtHandle, VtMaster};

/// Errors of the seat controller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The input pipeline could not be created.
    #[error(transparent)]
    Input(#[from] input::Error),
    /// Inserting a source into the event loop failed.
    #[error("cannot register with the event loop")]
    EventLoop,
}

impl Kind for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Input(err) => err.kind(),
            Error::EventLoop => ErrorKind::DeviceFault,
        }
    }
}

struct BackendEntry {
    node: std::path::PathBuf,
    dispatcher: Dispatcher<'static, VideoBackend, ()>,
    token: RegistrationToken,
}

struct ControllerInner {
    seat: Seat,
    loop_handle: LoopHandle<'static, ()>,
    input: Dispatcher<'static, SeatInput, ()>,
    input_token: Cell<Option<RegistrationToken>>,
    backends: RefCell<Vec<BackendEntry>>,
    vt: RefCell<Option<VtHandle>>,
    closing: Cell<bool>,
    span: tracing::Span,
}

/// Controller of one seat. Cheaply cloneable handle.
#[derive(Clone)]
pub struct SeatController {
    inner: Rc<ControllerInner>,
}

impl std::fmt::Debug for SeatController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeatController")
            .field("seat", &self.inner.seat.name())
            .field("backends", &self.inner.backends.borrow().len())
            .finish_non_exhaustive()
    }
}

impl SeatController {
    /// Creates the controller for `name` and claims a VT for it.
    pub fn new(
        name: &str,
        loop_handle: &LoopHandle<'static, ()>,
        master: &VtMaster,
        xkb: &XkbConfig<'_>,
    ) -> Result<Self, Error> {
        let input = SeatInput::new(name, xkb)?;
        let span = info_span!("seat-controller", seat = name);

        let inner = Rc::new_cyclic(|weak: &Weak<ControllerInner>| {
            let seat = Seat::new(name, {
                let weak = weak.clone();
                move |event| {
                    if let Some(inner) = weak.upgrade() {
                        SeatController { inner }.on_seat_event(event);
                    }
                }
            });
            let input = Dispatcher::new(input, {
                let weak = weak.clone();
                move |key, _, _: &mut ()| {
                    if let Some(inner) = weak.upgrade() {
                        SeatController { inner }.on_key(key);
                    }
                }
            });
            ControllerInner {
                seat,
                loop_handle: loop_handle.clone(),
                input,
                input_token: Cell::new(None),
                backends: RefCell::new(Vec::new()),
                vt: RefCell::new(None),
                closing: Cell::new(false),
                span,
            }
        });

        let token = loop_handle
            .register_dispatcher(inner.input.clone())
            .map_err(|_| Error::EventLoop)?;
        inner.input_token.set(Some(token));

        let controller = SeatController { inner };
        controller.claim_vt(master);
        Ok(controller)
    }

    fn claim_vt(&self, master: &VtMaster) {
        let weak = Rc::downgrade(&self.inner);
        let handler = move |event| match weak.upgrade() {
            Some(inner) => SeatController { inner }.on_vt_event(event),
            None => SessionReply::Ok,
        };
        let vt = match master.allocate_real(handler) {
            Ok(vt) => vt,
            Err(err) => {
                debug!(parent: &self.inner.span, "no real VT ({err}), using a fake one");
                let weak = Rc::downgrade(&self.inner);
                master.allocate_fake(move |event| match weak.upgrade() {
                    Some(inner) => SeatController { inner }.on_vt_event(event),
                    None => SessionReply::Ok,
                })
            }
        };
        *self.inner.vt.borrow_mut() = Some(vt);
    }

    /// The seat this controller drives.
    pub fn seat(&self) -> &Seat {
        &self.inner.seat
    }

    /// The seat's VT handle.
    pub fn with_vt<R>(&self, f: impl FnOnce(&VtHandle) -> R) -> Option<R> {
        self.inner.vt.borrow().as_ref().map(f)
    }

    /// Routes a new device of this seat into the right backend.
    pub fn add_device(&self, desc: &DeviceDesc) {
        let _guard = self.inner.span.enter();
        match desc.kind {
            DeviceKind::Input => {
                let mut input = self.inner.input.as_source_mut();
                if let Err(err) = input.add_node(&desc.node) {
                    warn!("cannot add input node: {err}");
                    return;
                }
                drop(input);
                self.refresh_input_registration();
            }
            DeviceKind::Drm => {
                // Accelerated first, dumb buffers on the same node as
                // the fallback. fbdev is never promoted to DRM.
                let backend = VideoBackend::new_drm(&desc.node, true).or_else(|err| {
                    debug!("drm-accel failed ({err}), trying dumb buffers");
                    VideoBackend::new_drm(&desc.node, false)
                });
                match backend {
                    Ok(backend) => self.adopt_backend(desc, backend),
                    Err(err) => warn!(node = %desc.node.display(), "unusable drm device: {err}"),
                }
            }
            DeviceKind::Fbdev => {
                if desc.flags.contains(DeviceFlags::DRM_BACKED) {
                    // The companion DRM node owns the hardware; writing
                    // the shadow fbdev would fight it.
                    trace!(node = %desc.node.display(), "ignoring drm-backed fbdev");
                    return;
                }
                match VideoBackend::new_fbdev(&desc.node) {
                    Ok(backend) => self.adopt_backend(desc, backend),
                    Err(err) => warn!(node = %desc.node.display(), "unusable fbdev: {err}"),
                }
            }
        }
    }

    fn adopt_backend(&self, desc: &DeviceDesc, backend: VideoBackend) {
        let weak = Rc::downgrade(&self.inner);
        let dispatcher = Dispatcher::new(backend, move |event, _, _: &mut ()| {
            if let Some(inner) = weak.upgrade() {
                SeatController { inner }.on_video_event(event);
            }
        });
        let token = match self.inner.loop_handle.register_dispatcher(dispatcher.clone()) {
            Ok(token) => token,
            Err(err) => {
                warn!("cannot register video backend: {err}");
                return;
            }
        };
        info!(node = %desc.node.display(), "video backend added");
        self.inner.backends.borrow_mut().push(BackendEntry {
            node: desc.node.clone(),
            dispatcher,
            token,
        });

        if self.inner.seat.is_awake() {
            let dispatcher = self
                .inner
                .backends
                .borrow()
                .last()
                .map(|entry| entry.dispatcher.clone());
            if let Some(dispatcher) = dispatcher {
                let events = dispatcher.as_source_mut().wake();
                self.apply_video_events(events);
            }
        }
    }

    /// Removes a device previously added.
    pub fn remove_device(&self, desc: &DeviceDesc) {
        let _guard = self.inner.span.enter();
        match desc.kind {
            DeviceKind::Input => {
                self.inner.input.as_source_mut().remove_node(&desc.node);
                self.refresh_input_registration();
            }
            DeviceKind::Drm | DeviceKind::Fbdev => {
                let mut backends = self.inner.backends.borrow_mut();
                if let Some(index) = backends.iter().position(|entry| entry.node == desc.node) {
                    let entry = backends.remove(index);
                    drop(backends);
                    self.inner.loop_handle.remove(entry.token);
                    info!(node = %desc.node.display(), "video backend removed");
                    // Dropping the dispatcher deactivates the displays
                    // and restores the saved CRTC if still master.
                }
            }
        }
    }

    /// Re-scans a backend after a hotplug uevent.
    pub fn hotplug(&self, desc: &DeviceDesc) {
        let _guard = self.inner.span.enter();
        let dispatcher = {
            let backends = self.inner.backends.borrow();
            let Some(entry) = backends.iter().find(|entry| entry.node == desc.node) else {
                return;
            };
            entry.dispatcher.clone()
        };
        let events = dispatcher.as_source_mut().poll();
        self.apply_video_events(events);
    }

    fn apply_video_events(&self, events: Result<Vec<VideoEvent>, crate::video::Error>) {
        let events = match events {
            Ok(events) => events,
            Err(err) => {
                warn!("video backend poll failed: {err}");
                return;
            }
        };
        for event in events {
            self.on_video_event(event);
        }
    }

    fn on_video_event(&self, event: VideoEvent) {
        trace!(parent: &self.inner.span, ?event, "video event");
        if let VideoEvent::New(id) = event {
            // Fresh connectors light up right away while the seat is in
            // the foreground.
            if self.inner.seat.is_awake() && self.inner.seat.foreground().is_some() {
                for entry in self.inner.backends.borrow().iter() {
                    let mut backend = entry.dispatcher.as_source_mut();
                    if backend.displays().contains(&id) {
                        if let Err(err) = backend.activate(id, None) {
                            warn!("cannot activate display: {err}");
                        }
                    }
                }
            }
        }
    }

    fn refresh_input_registration(&self) {
        if let Some(token) = self.inner.input_token.get() {
            if self.inner.loop_handle.update(&token).is_err() {
                warn!(parent: &self.inner.span, "cannot refresh input registration");
            }
        }
    }

    fn wake_backends(&self) {
        self.inner.input.as_source_mut().wake();
        self.refresh_input_registration();
        let entries: Vec<_> = {
            let backends = self.inner.backends.borrow();
            backends.iter().map(|entry| entry.dispatcher.clone()).collect()
        };
        for dispatcher in entries {
            let events = dispatcher.as_source_mut().wake();
            self.apply_video_events(events);
            let mut backend = dispatcher.as_source_mut();
            for id in backend.displays() {
                let active = backend
                    .display_info(id)
                    .map_or(false, |info| info.current_mode.is_some());
                if !active {
                    if let Err(err) = backend.activate(id, None) {
                        warn!("cannot activate display: {err}");
                    }
                }
            }
        }
    }

    fn sleep_backends(&self) {
        for entry in self.inner.backends.borrow().iter() {
            entry.dispatcher.as_source_mut().sleep();
        }
        self.inner.input.as_source_mut().sleep();
        self.refresh_input_registration();
    }

    fn on_seat_event(&self, event: SeatEvent) {
        let _guard = self.inner.span.enter();
        trace!(?event, "seat event");
        match event {
            SeatEvent::Foreground => self.wake_backends(),
            SeatEvent::Background => self.sleep_backends(),
            SeatEvent::Sleep => {
                self.sleep_backends();
                if let Some(vt) = self.inner.vt.borrow().as_ref() {
                    vt.leave_done();
                }
            }
            SeatEvent::Wake => {}
        }
    }

    fn on_vt_event(&self, event: VtEvent) -> SessionReply {
        let _guard = self.inner.span.enter();
        match event {
            VtEvent::Enter => match self.inner.seat.wake() {
                Ok(()) => SessionReply::Ok,
                Err(kind) => SessionReply::Failed(kind),
            },
            VtEvent::Leave => match self.inner.seat.sleep(false) {
                Ok(()) => SessionReply::Ok,
                Err(ErrorKind::InProgress) => SessionReply::InProgress,
                Err(kind) => SessionReply::Failed(kind),
            },
        }
    }

    fn on_key(&self, key: KeyEvent) {
        if !key.mods.is_ctrl_alt() {
            return;
        }
        let sym = key.keysym.raw();
        if (keysyms::KEY_F1..=keysyms::KEY_F12).contains(&sym) {
            let target = sym - keysyms::KEY_F1 + 1;
            if let Some(session) = self.inner.seat.session_by_id(target) {
                debug!(parent: &self.inner.span, target, "switch binding");
                match self.inner.seat.schedule(&session) {
                    Ok(()) | Err(ErrorKind::InProgress) => {}
                    Err(kind) => warn!(?kind, "switch failed"),
                }
            }
        } else if sym == keysyms::KEY_Right {
            let _ = self.inner.seat.switch_cycle(false);
        } else if sym == keysyms::KEY_Left {
            let _ = self.inner.seat.switch_cycle(true);
        }
    }

    /// Starts an orderly shutdown: release the VT (counting towards the
    /// master's pending exits) and put the seat to sleep.
    pub fn shutdown(&self) {
        let _guard = self.inner.span.enter();
        if self.inner.closing.replace(true) {
            return;
        }
        if let Some(vt) = self.inner.vt.borrow().as_ref() {
            match vt.deactivate() {
                Ok(()) | Err(ErrorKind::InProgress) => {}
                Err(kind) => warn!(?kind, "vt deactivation failed"),
            }
        }
        match self.inner.seat.sleep(false) {
            Ok(()) | Err(ErrorKind::InProgress) => {}
            Err(_) => {
                let _ = self.inner.seat.sleep(true);
            }
        }
    }

    /// Tears the seat down completely (seat hang-up).
    ///
    /// Backends are destroyed, which deactivates every display, and any
    /// foreground session is force-dropped.
    pub fn destroy(&self) {
        let _guard = self.inner.span.enter();
        self.inner.closing.set(true);
        let _ = self.inner.seat.sleep(true);
        let backends = std::mem::take(&mut *self.inner.backends.borrow_mut());
        for entry in backends {
            self.inner.loop_handle.remove(entry.token);
        }
        if let Some(token) = self.inner.input_token.take() {
            self.inner.loop_handle.remove(token);
        }
        self.inner.vt.borrow_mut().take();
        info!(parent: &self.inner.span, "seat destroyed");
    }
}
