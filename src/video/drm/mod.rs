//! DRM/KMS backend.
//!
//! One [`DrmBackend`] drives one card node. Scanout buffers are either
//! GBM buffer objects (the accelerated allocation path) or dumb buffers;
//! both run the same legacy modeset/page-flip machinery. The card fd is
//! shared between the control device and the GBM allocator through a
//! cheaply cloneable wrapper, mirroring how handle spaces work on the
//! kernel side (GEM handles are per open file).

use std::collections::HashSet;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use calloop::{EventSource, Interest, Mode as TriggerMode, Poll, PostAction, Readiness, Token, TokenFactory};
use drm::buffer::{Buffer, DrmFourcc};
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::{connector, crtc, framebuffer, property, Device as ControlDevice, Event, Mode, PageFlipFlags};
use drm::Device as BasicDevice;
use gbm::{BufferObject, BufferObjectFlags, Format as GbmFormat};
use rustix::fs::{Mode as FsMode, OFlags};
use tracing::{debug, trace, warn};

use super::pixel::{self, BlendRequest, Color, Rect};
use super::{DisplayId, DisplayInfo, DisplayMode, Dpms, Error, VideoEvent};

/// Shared open card fd.
///
/// Control calls and GBM allocation must go through the same open file so
/// they share one GEM handle space.
#[derive(Debug, Clone)]
pub(crate) struct DrmFd(Rc<OwnedFd>);

impl AsFd for DrmFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl BasicDevice for DrmFd {}
impl ControlDevice for DrmFd {}

fn access(msg: &'static str) -> impl FnOnce(std::io::Error) -> Error {
    move |source| Error::Drm { msg, source }
}

fn boxed_access<E>(msg: &'static str) -> impl FnOnce(E) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |err| Error::Drm {
        msg,
        source: std::io::Error::new(std::io::ErrorKind::Other, err),
    }
}

struct GbmFrame {
    bo: BufferObject<()>,
    fb: framebuffer::Handle,
    shadow: Vec<u8>,
    stride: u32,
}

struct DumbFrame {
    db: DumbBuffer,
    fb: framebuffer::Handle,
}

enum Frames {
    Gbm([GbmFrame; 2]),
    Dumb([DumbFrame; 2]),
}

struct DrmDisplay {
    conn: connector::Handle,
    crtc: crtc::Handle,
    modes: Vec<Mode>,
    current: Option<usize>,
    dpms_prop: Option<property::Handle>,
    dpms: Dpms,
    online: bool,
    available: bool,
    frames: Option<Frames>,
    front: usize,
    pending: Option<usize>,
    saved_crtc: Option<crtc::Info>,
}

impl DrmDisplay {
    fn id(&self) -> DisplayId {
        DisplayId(u32::from(self.conn))
    }

    fn mode(&self) -> Option<&Mode> {
        self.current.and_then(|index| self.modes.get(index))
    }
}

pub(super) struct DrmBackend {
    fd: DrmFd,
    gbm: Option<gbm::Device<DrmFd>>,
    node: PathBuf,
    awake: bool,
    master: bool,
    displays: Vec<DrmDisplay>,
    token: Option<Token>,
}

impl std::fmt::Debug for DrmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmBackend")
            .field("node", &self.node)
            .field("accel", &self.gbm.is_some())
            .field("awake", &self.awake)
            .field("displays", &self.displays.len())
            .finish_non_exhaustive()
    }
}

impl DrmBackend {
    pub(super) fn new(node: &Path, accel: bool) -> Result<Self, Error> {
        let fd = rustix::fs::open(
            node,
            OFlags::RDWR | OFlags::CLOEXEC | OFlags::NONBLOCK,
            FsMode::empty(),
        )
        .map_err(|source| Error::Open {
            node: node.to_path_buf(),
            source,
        })?;
        let fd = DrmFd(Rc::new(fd));

        let gbm = if accel {
            Some(gbm::Device::new(fd.clone()).map_err(boxed_access("gbm device"))?)
        } else {
            None
        };

        Ok(DrmBackend {
            fd,
            gbm,
            node: node.to_path_buf(),
            awake: false,
            master: false,
            displays: Vec::new(),
            token: None,
        })
    }

    pub(super) fn is_awake(&self) -> bool {
        self.awake
    }

    pub(super) fn wake(&mut self) -> Result<Vec<VideoEvent>, Error> {
        if self.awake {
            return Ok(Vec::new());
        }
        if !self.master {
            // Newer kernels hand out master implicitly if nobody else
            // holds it, so a failure here is only fatal once a modeset
            // actually gets refused.
            match self.fd.acquire_master_lock() {
                Ok(()) => self.master = true,
                Err(err) => warn!("cannot become drm master: {err}"),
            }
        }
        self.awake = true;
        debug!("drm backend awake");
        self.poll()
    }

    pub(super) fn sleep(&mut self) {
        if !self.awake {
            return;
        }
        self.awake = false;
        if self.master {
            if let Err(err) = self.fd.release_master_lock() {
                warn!("cannot drop drm master: {err}");
            }
            self.master = false;
        }
        debug!("drm backend asleep");
    }

    fn dpms_property(&self, conn: connector::Handle) -> (Option<property::Handle>, Dpms) {
        let Ok(props) = self.fd.get_properties(conn) else {
            return (None, Dpms::Unknown);
        };
        let (handles, values) = props.as_props_and_values();
        for (prop, value) in handles.iter().zip(values) {
            let Ok(info) = self.fd.get_property(*prop) else {
                continue;
            };
            if info.name().to_str().map_or(false, |name| name == "DPMS") {
                let state = match *value {
                    0 => Dpms::On,
                    1 => Dpms::Standby,
                    2 => Dpms::Suspend,
                    3 => Dpms::Off,
                    _ => Dpms::Unknown,
                };
                return (Some(*prop), state);
            }
        }
        (None, Dpms::Unknown)
    }

    fn pick_crtc(&self, info: &connector::Info) -> Result<crtc::Handle, Error> {
        if let Some(enc) = info.current_encoder() {
            if let Ok(enc_info) = self.fd.get_encoder(enc) {
                if let Some(crtc) = enc_info.crtc() {
                    return Ok(crtc);
                }
            }
        }
        let used: HashSet<crtc::Handle> = self.displays.iter().map(|d| d.crtc).collect();
        let res = self.fd.resource_handles().map_err(access("resources"))?;
        res.crtcs()
            .iter()
            .copied()
            .find(|crtc| !used.contains(crtc))
            .ok_or(Error::Drm {
                msg: "no free crtc",
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
    }

    pub(super) fn poll(&mut self) -> Result<Vec<VideoEvent>, Error> {
        let res = self.fd.resource_handles().map_err(access("resources"))?;
        let mut events = vec![VideoEvent::WakeUp];

        for display in &mut self.displays {
            display.available = false;
        }

        for &conn in res.connectors() {
            let Ok(info) = self.fd.get_connector(conn, false) else {
                continue;
            };
            let connected = info.state() == connector::State::Connected && !info.modes().is_empty();
            if let Some(display) = self.displays.iter_mut().find(|d| d.conn == conn) {
                display.available = connected;
                if connected {
                    display.online = true;
                    if display.current.is_none() {
                        display.modes = info.modes().to_vec();
                    }
                }
                continue;
            }
            if !connected {
                continue;
            }
            let crtc = match self.pick_crtc(&info) {
                Ok(crtc) => crtc,
                Err(err) => {
                    warn!(?conn, "connector has no usable crtc: {err}");
                    continue;
                }
            };
            let (dpms_prop, dpms) = self.dpms_property(conn);
            let disp = DrmDisplay {
                conn,
                crtc,
                modes: info.modes().to_vec(),
                current: None,
                dpms_prop,
                dpms,
                online: true,
                available: true,
                frames: None,
                front: 0,
                pending: None,
                saved_crtc: None,
            };
            trace!(display = ?disp.id(), "connector appeared");
            events.push(VideoEvent::New(disp.id()));
            self.displays.push(disp);
        }

        let mut gone = Vec::new();
        self.displays.retain_mut(|disp| {
            if disp.available {
                return true;
            }
            trace!(display = ?disp.id(), "connector vanished");
            gone.push(disp.id());
            // Buffers die with the entry; the CRTC is reused for the
            // next connector that shows up.
            disp.frames = None;
            false
        });
        for id in gone {
            events.push(VideoEvent::Gone(id));
        }
        Ok(events)
    }

    pub(super) fn displays(&self) -> Vec<DisplayId> {
        self.displays.iter().map(DrmDisplay::id).collect()
    }

    pub(super) fn display_info(&self, id: DisplayId) -> Option<DisplayInfo> {
        let display = self.displays.iter().find(|d| d.id() == id)?;
        let convert = |mode: &Mode| DisplayMode {
            width: mode.size().0 as u32,
            height: mode.size().1 as u32,
            vrefresh: mode.vrefresh(),
        };
        Some(DisplayInfo {
            id,
            modes: display.modes.iter().map(convert).collect(),
            current_mode: display.mode().map(convert),
            dpms: display.dpms,
            online: display.online,
            pending_vsync: display.pending.is_some(),
            double_buffered: true,
        })
    }

    fn alloc_frames(&self, mode: &Mode) -> Result<Frames, Error> {
        let (width, height) = (mode.size().0 as u32, mode.size().1 as u32);
        match &self.gbm {
            Some(gbm) => {
                let mut alloc = || -> Result<GbmFrame, Error> {
                    let bo = gbm
                        .create_buffer_object::<()>(
                            width,
                            height,
                            GbmFormat::Xrgb8888,
                            BufferObjectFlags::SCANOUT | BufferObjectFlags::WRITE,
                        )
                        .map_err(boxed_access("gbm buffer"))?;
                    let stride = bo.stride().map_err(boxed_access("gbm stride"))?;
                    let fb = self
                        .fd
                        .add_framebuffer(&bo, 24, 32)
                        .map_err(access("add framebuffer"))?;
                    Ok(GbmFrame {
                        bo,
                        fb,
                        shadow: vec![0u8; stride as usize * height as usize],
                        stride,
                    })
                };
                Ok(Frames::Gbm([alloc()?, alloc()?]))
            }
            None => {
                let mut alloc = || -> Result<DumbFrame, Error> {
                    let db = self
                        .fd
                        .create_dumb_buffer((width, height), DrmFourcc::Xrgb8888, 32)
                        .map_err(access("create dumb buffer"))?;
                    let fb = self
                        .fd
                        .add_framebuffer(&db, 24, 32)
                        .map_err(access("add framebuffer"))?;
                    Ok(DumbFrame { db, fb })
                };
                Ok(Frames::Dumb([alloc()?, alloc()?]))
            }
        }
    }

    fn release_frames(&self, frames: Frames) {
        match frames {
            Frames::Gbm(pair) => {
                for frame in pair {
                    let _ = self.fd.destroy_framebuffer(frame.fb);
                    drop(frame.bo);
                }
            }
            Frames::Dumb(pair) => {
                for frame in pair {
                    let _ = self.fd.destroy_framebuffer(frame.fb);
                    let _ = self.fd.destroy_dumb_buffer(frame.db);
                }
            }
        }
    }

    fn display_mut(&mut self, id: DisplayId) -> Result<&mut DrmDisplay, Error> {
        self.displays
            .iter_mut()
            .find(|d| d.id() == id)
            .ok_or(Error::NoDisplay)
    }

    pub(super) fn activate(&mut self, id: DisplayId, mode_index: Option<usize>) -> Result<(), Error> {
        if !self.awake {
            return Err(Error::Asleep);
        }
        let display = self
            .displays
            .iter()
            .position(|d| d.id() == id)
            .ok_or(Error::NoDisplay)?;

        let index = mode_index.unwrap_or(0);
        let mode = *self.displays[display]
            .modes
            .get(index)
            .ok_or(Error::InvalidMode)?;
        let frames = self.alloc_frames(&mode)?;

        {
            let crtc = self.displays[display].crtc;
            if self.displays[display].saved_crtc.is_none() {
                self.displays[display].saved_crtc = self.fd.get_crtc(crtc).ok();
            }
        }

        let front_fb = match &frames {
            Frames::Gbm(pair) => pair[0].fb,
            Frames::Dumb(pair) => pair[0].fb,
        };
        let (crtc, conn) = (self.displays[display].crtc, self.displays[display].conn);
        if let Err(err) = self
            .fd
            .set_crtc(crtc, Some(front_fb), (0, 0), &[conn], Some(mode))
        {
            self.release_frames(frames);
            return Err(Error::Drm {
                msg: "set crtc",
                source: err,
            });
        }

        let old = self.displays[display].frames.take();
        if let Some(old) = old {
            self.release_frames(old);
        }
        let entry = &mut self.displays[display];
        entry.frames = Some(frames);
        entry.current = Some(index);
        entry.front = 0;
        entry.pending = None;
        debug!(display = ?id, width = mode.size().0, height = mode.size().1, "display activated");

        let _ = self.set_dpms(id, Dpms::On);
        Ok(())
    }

    pub(super) fn deactivate(&mut self, id: DisplayId) {
        let Some(index) = self.displays.iter().position(|d| d.id() == id) else {
            return;
        };
        let frames = self.displays[index].frames.take();
        if let Some(frames) = frames {
            self.release_frames(frames);
        }
        let entry = &mut self.displays[index];
        entry.current = None;
        entry.pending = None;
        debug!(display = ?id, "display deactivated");
    }

    pub(super) fn set_dpms(&mut self, id: DisplayId, state: Dpms) -> Result<(), Error> {
        if !self.awake {
            return Err(Error::Asleep);
        }
        let display = self.display_mut(id)?;
        let conn = display.conn;
        let Some(prop) = display.dpms_prop else {
            display.dpms = Dpms::Unknown;
            return Ok(());
        };
        self.fd
            .set_property(conn, prop, state.drm_value())
            .map_err(access("set dpms"))?;
        self.display_mut(id)?.dpms = state;
        Ok(())
    }

    pub(super) fn swap(&mut self, id: DisplayId) -> Result<(), Error> {
        if !self.awake {
            return Err(Error::Asleep);
        }
        let display = self.display_mut(id)?;
        if display.current.is_none() {
            return Err(Error::NotActive);
        }
        if display.pending.is_some() {
            return Err(Error::SwapPending);
        }
        let back = 1 - display.front;
        let crtc = display.crtc;
        let back_fb = match display.frames.as_mut().ok_or(Error::NotActive)? {
            Frames::Gbm(pair) => {
                let frame = &mut pair[back];
                let _ = frame
                    .bo
                    .write(&frame.shadow)
                    .map_err(boxed_access("gbm bo write"))?;
                frame.fb
            }
            Frames::Dumb(pair) => pair[back].fb,
        };
        self.fd
            .page_flip(crtc, back_fb, PageFlipFlags::EVENT, None)
            .map_err(access("page flip"))?;
        self.display_mut(id)?.pending = Some(back);
        trace!(display = ?id, "flip submitted");
        Ok(())
    }

    fn with_back_buffer<R>(
        fd: &DrmFd,
        display: &mut DrmDisplay,
        op: impl FnOnce(&mut [u8], u32, u32, u32) -> R,
    ) -> Result<R, Error> {
        let (width, height) = {
            let mode = display.mode().ok_or(Error::NotActive)?;
            (mode.size().0 as u32, mode.size().1 as u32)
        };
        // While a flip is queued the queued buffer belongs to scanout;
        // drawing goes to the one being displaced.
        let back = match display.pending {
            Some(pending) => 1 - pending,
            None => 1 - display.front,
        };
        match display.frames.as_mut().ok_or(Error::NotActive)? {
            Frames::Gbm(pair) => {
                let frame = &mut pair[back];
                Ok(op(&mut frame.shadow, frame.stride, width, height))
            }
            Frames::Dumb(pair) => {
                let frame = &mut pair[back];
                let pitch = frame.db.pitch();
                let mut mapping = fd
                    .map_dumb_buffer(&mut frame.db)
                    .map_err(access("map dumb buffer"))?;
                Ok(op(mapping.as_mut(), pitch, width, height))
            }
        }
    }

    pub(super) fn blit(
        &mut self,
        id: DisplayId,
        data: &[u8],
        width: u32,
        height: u32,
        stride: u32,
        x: u32,
        y: u32,
    ) -> Result<(), Error> {
        let fd = self.fd.clone();
        let display = self.display_mut(id)?;
        Self::with_back_buffer(&fd, display, |buf, pitch, w, h| {
            pixel::blit_xrgb(buf, pitch, w, h, data, width, height, stride, x, y);
        })
    }

    pub(super) fn fill(&mut self, id: DisplayId, color: Color, rect: Rect) -> Result<(), Error> {
        let fd = self.fd.clone();
        let display = self.display_mut(id)?;
        Self::with_back_buffer(&fd, display, |buf, pitch, w, h| {
            pixel::fill_xrgb(buf, pitch, w, h, color, rect);
        })
    }

    pub(super) fn blendv(&mut self, id: DisplayId, requests: &[BlendRequest<'_>]) -> Result<(), Error> {
        let fd = self.fd.clone();
        let display = self.display_mut(id)?;
        Self::with_back_buffer(&fd, display, |buf, pitch, w, h| {
            for req in requests {
                pixel::blend_xrgb(buf, pitch, w, h, req);
            }
        })
    }
}

impl Drop for DrmBackend {
    fn drop(&mut self) {
        // Restore scanout only while still master; after sleep() a peer
        // may already be driving the card.
        if self.master {
            for disp in &self.displays {
                let Some(saved) = &disp.saved_crtc else {
                    continue;
                };
                if let Err(err) = self.fd.set_crtc(
                    disp.crtc,
                    saved.framebuffer(),
                    saved.position(),
                    &[disp.conn],
                    saved.mode(),
                ) {
                    warn!(display = ?disp.id(), "cannot restore crtc: {err}");
                }
            }
            let _ = self.fd.release_master_lock();
        }
        for display in &mut self.displays {
            if let Some(frames) = display.frames.take() {
                match frames {
                    Frames::Gbm(pair) => {
                        for frame in pair {
                            let _ = self.fd.destroy_framebuffer(frame.fb);
                        }
                    }
                    Frames::Dumb(pair) => {
                        for frame in pair {
                            let _ = self.fd.destroy_framebuffer(frame.fb);
                            let _ = self.fd.destroy_dumb_buffer(frame.db);
                        }
                    }
                }
            }
        }
    }
}

impl EventSource for DrmBackend {
    type Event = VideoEvent;
    type Metadata = ();
    type Ret = ();
    type Error = std::io::Error;

    fn process_events<F>(
        &mut self,
        _readiness: Readiness,
        token: Token,
        mut callback: F,
    ) -> std::io::Result<PostAction>
    where
        F: FnMut(VideoEvent, &mut ()),
    {
        if Some(token) != self.token {
            return Ok(PostAction::Continue);
        }
        let events = match self.fd.receive_events() {
            Ok(events) => events,
            Err(err) => {
                warn!("cannot read drm events: {err}");
                return Ok(PostAction::Continue);
            }
        };
        for event in events {
            if let Event::PageFlip(flip) = event {
                if let Some(display) = self.displays.iter_mut().find(|d| d.crtc == flip.crtc) {
                    if let Some(back) = display.pending.take() {
                        display.front = back;
                    }
                    callback(VideoEvent::VBlank(display.id()), &mut ());
                }
            }
        }
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.token = Some(factory.token());
        unsafe {
            poll.register(
                self.fd.as_fd(),
                Interest::READ,
                TriggerMode::Level,
                self.token.unwrap(),
            )
        }
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.token = Some(factory.token());
        poll.reregister(
            self.fd.as_fd(),
            Interest::READ,
            TriggerMode::Level,
            self.token.unwrap(),
        )
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.token = None;
        poll.unregister(self.fd.as_fd())
    }
}
