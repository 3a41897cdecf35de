//! Display backends.
//!
//! One [`VideoBackend`] wraps one graphics device node and owns the
//! displays (connectors) behind it. Three variants exist: DRM with GBM
//! scanout buffers, DRM with dumb buffers, and legacy fbdev. They all
//! speak the same small vocabulary the seat scheduler relies on:
//!
//! - `wake` / `sleep`: acquire and drop exclusive low-level access
//!   (DRM master; fbdev merely marks itself awake);
//! - `poll`: re-scan connectors and diff against the known displays;
//! - per display: `activate` / `deactivate`, `set_dpms`, `swap` and the
//!   CPU drawing primitives `fill`, `blit`, `blend` and `blendv`.
//!
//! Drawing targets the current back buffer in `XRGB8888`; `swap`
//! page-flips to it and the `VSYNC` flag clears once the flip completion
//! arrives on the card fd. Displays are addressed by [`DisplayId`] and
//! owned by their backend, so device teardown deactivates everything
//! without reference cycles.

use std::path::Path;

use calloop::{EventSource, Poll, PostAction, Readiness, Token, TokenFactory};
use tracing::debug_span;

use crate::error::{ErrorKind, Kind};

pub mod drm;
pub mod fbdev;
mod pixel;

pub use pixel::{BlendRequest, Color, Rect};

/// Display power management state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dpms {
    /// Powered on.
    On,
    /// Standby.
    Standby,
    /// Suspended.
    Suspend,
    /// Powered off.
    Off,
    /// The backend cannot read the state.
    Unknown,
}

impl Dpms {
    pub(crate) fn drm_value(self) -> u64 {
        match self {
            Dpms::On | Dpms::Unknown => 0,
            Dpms::Standby => 1,
            Dpms::Suspend => 2,
            Dpms::Off => 3,
        }
    }
}

/// Identifier of a display within its backend.
///
/// For DRM backends this is the connector id; fbdev exposes exactly one
/// display with id `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayId(pub u32);

/// A display mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    /// Horizontal resolution in pixels.
    pub width: u32,
    /// Vertical resolution in pixels.
    pub height: u32,
    /// Vertical refresh rate in Hz, `0` if unknown.
    pub vrefresh: u32,
}

/// Observable state of a display.
#[derive(Debug, Clone)]
pub struct DisplayInfo {
    /// Display id.
    pub id: DisplayId,
    /// Supported modes, preferred first.
    pub modes: Vec<DisplayMode>,
    /// Active mode, if the display is active.
    pub current_mode: Option<DisplayMode>,
    /// Power state.
    pub dpms: Dpms,
    /// Whether the connector is currently connected.
    pub online: bool,
    /// A swap was submitted and its completion is still pending.
    pub pending_vsync: bool,
    /// Whether the display runs double-buffered.
    pub double_buffered: bool,
}

/// Events produced by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoEvent {
    /// A connector appeared during a re-scan.
    New(DisplayId),
    /// A connector disappeared; the display was deactivated first.
    Gone(DisplayId),
    /// The backend as a whole woke up or re-scanned.
    WakeUp,
    /// A page flip completed; the display's `VSYNC` flag is now clear.
    VBlank(DisplayId),
}

/// Errors of the video backends.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening the device node failed.
    #[error("cannot open video device {node}")]
    Open {
        /// Node path.
        node: std::path::PathBuf,
        /// Root cause.
        #[source]
        source: rustix::io::Errno,
    },
    /// A DRM/KMS call failed.
    #[error("drm: {msg}")]
    Drm {
        /// What was attempted.
        msg: &'static str,
        /// Root cause.
        #[source]
        source: std::io::Error,
    },
    /// An fbdev ioctl failed.
    #[error("fbdev: {msg}")]
    Fbdev {
        /// What was attempted.
        msg: &'static str,
        /// Root cause.
        #[source]
        source: std::io::Error,
    },
    /// The fbdev pixel format cannot be driven.
    #[error("unsupported fbdev format ({0})")]
    UnsupportedFormat(&'static str),
    /// The display is unknown to this backend.
    #[error("no such display")]
    NoDisplay,
    /// The display is not active.
    #[error("display not active")]
    NotActive,
    /// The backend is asleep and holds no device access.
    #[error("backend is asleep")]
    Asleep,
    /// The requested mode is not in the display's mode list.
    #[error("invalid mode")]
    InvalidMode,
    /// A swap is already pending on this display.
    #[error("swap still pending")]
    SwapPending,
}

impl Kind for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Open { .. } | Error::Drm { .. } | Error::Fbdev { .. } => ErrorKind::DeviceFault,
            Error::UnsupportedFormat(_) => ErrorKind::NotSupported,
            Error::NoDisplay => ErrorKind::NotFound,
            Error::NotActive | Error::Asleep => ErrorKind::InvalidArgument,
            Error::InvalidMode => ErrorKind::InvalidArgument,
            Error::SwapPending => ErrorKind::Busy,
        }
    }
}

#[derive(Debug)]
enum BackendKind {
    Drm(drm::DrmBackend),
    Fbdev(fbdev::FbdevBackend),
}

/// A graphics device and its displays.
#[derive(Debug)]
pub struct VideoBackend {
    inner: BackendKind,
    span: tracing::Span,
}

impl VideoBackend {
    /// Opens a DRM node. `accel` selects GBM scanout buffers over dumb
    /// buffers; everything else behaves identically.
    pub fn new_drm(node: &Path, accel: bool) -> Result<Self, Error> {
        let span = debug_span!("video", node = %node.display(), kind = if accel { "drm" } else { "drm-dumb" });
        Ok(VideoBackend {
            inner: BackendKind::Drm(drm::DrmBackend::new(node, accel)?),
            span,
        })
    }

    /// Opens an fbdev node.
    pub fn new_fbdev(node: &Path) -> Result<Self, Error> {
        let span = debug_span!("video", node = %node.display(), kind = "fbdev");
        Ok(VideoBackend {
            inner: BackendKind::Fbdev(fbdev::FbdevBackend::new(node)?),
            span,
        })
    }

    /// Whether the backend currently holds device access.
    pub fn is_awake(&self) -> bool {
        match &self.inner {
            BackendKind::Drm(backend) => backend.is_awake(),
            BackendKind::Fbdev(backend) => backend.is_awake(),
        }
    }

    /// Acquires exclusive access and re-scans; returns the resulting
    /// display diff (preceded by [`VideoEvent::WakeUp`]).
    pub fn wake(&mut self) -> Result<Vec<VideoEvent>, Error> {
        let _guard = self.span.enter();
        match &mut self.inner {
            BackendKind::Drm(backend) => backend.wake(),
            BackendKind::Fbdev(backend) => backend.wake(),
        }
    }

    /// Drops exclusive access so a peer can drive the hardware.
    pub fn sleep(&mut self) {
        let _guard = self.span.enter();
        match &mut self.inner {
            BackendKind::Drm(backend) => backend.sleep(),
            BackendKind::Fbdev(backend) => backend.sleep(),
        }
    }

    /// Re-scans connectors and diffs against the known display set.
    pub fn poll(&mut self) -> Result<Vec<VideoEvent>, Error> {
        let _guard = self.span.enter();
        match &mut self.inner {
            BackendKind::Drm(backend) => backend.poll(),
            BackendKind::Fbdev(backend) => backend.poll(),
        }
    }

    /// Ids of all known displays.
    pub fn displays(&self) -> Vec<DisplayId> {
        match &self.inner {
            BackendKind::Drm(backend) => backend.displays(),
            BackendKind::Fbdev(backend) => backend.displays(),
        }
    }

    /// Observable state of one display.
    pub fn display_info(&self, id: DisplayId) -> Option<DisplayInfo> {
        match &self.inner {
            BackendKind::Drm(backend) => backend.display_info(id),
            BackendKind::Fbdev(backend) => backend.display_info(id),
        }
    }

    /// Activates a display on the mode at `mode_index` into its mode
    /// list, or the preferred mode if `None`. Forces DPMS on.
    pub fn activate(&mut self, id: DisplayId, mode_index: Option<usize>) -> Result<(), Error> {
        let _guard = self.span.enter();
        match &mut self.inner {
            BackendKind::Drm(backend) => backend.activate(id, mode_index),
            BackendKind::Fbdev(backend) => backend.activate(id, mode_index),
        }
    }

    /// Deactivates a display, releasing its scanout buffers.
    pub fn deactivate(&mut self, id: DisplayId) {
        let _guard = self.span.enter();
        match &mut self.inner {
            BackendKind::Drm(backend) => backend.deactivate(id),
            BackendKind::Fbdev(backend) => backend.deactivate(id),
        }
    }

    /// Sets the power state of a display.
    pub fn set_dpms(&mut self, id: DisplayId, state: Dpms) -> Result<(), Error> {
        let _guard = self.span.enter();
        match &mut self.inner {
            BackendKind::Drm(backend) => backend.set_dpms(id, state),
            BackendKind::Fbdev(backend) => backend.set_dpms(id, state),
        }
    }

    /// Swaps front and back buffer.
    ///
    /// Returns immediately; on DRM the display's `VSYNC` flag stays set
    /// until the flip completion arrives, fbdev pans synchronously.
    pub fn swap(&mut self, id: DisplayId) -> Result<(), Error> {
        let _guard = self.span.enter();
        match &mut self.inner {
            BackendKind::Drm(backend) => backend.swap(id),
            BackendKind::Fbdev(backend) => backend.swap(id),
        }
    }

    /// Copies an `XRGB8888` buffer into the back buffer at (`x`, `y`).
    pub fn blit(
        &mut self,
        id: DisplayId,
        data: &[u8],
        width: u32,
        height: u32,
        stride: u32,
        x: u32,
        y: u32,
    ) -> Result<(), Error> {
        match &mut self.inner {
            BackendKind::Drm(backend) => backend.blit(id, data, width, height, stride, x, y),
            BackendKind::Fbdev(backend) => backend.blit(id, data, width, height, stride, x, y),
        }
    }

    /// Fills `rect` of the back buffer with a solid color.
    pub fn fill(&mut self, id: DisplayId, color: Color, rect: Rect) -> Result<(), Error> {
        match &mut self.inner {
            BackendKind::Drm(backend) => backend.fill(id, color, rect),
            BackendKind::Fbdev(backend) => backend.fill(id, color, rect),
        }
    }

    /// Alpha-blends an 8-bit greyscale buffer between `fg` and `bg` into
    /// the back buffer at (`x`, `y`).
    #[allow(clippy::too_many_arguments)]
    pub fn blend(
        &mut self,
        id: DisplayId,
        data: &[u8],
        width: u32,
        height: u32,
        stride: u32,
        x: u32,
        y: u32,
        fg: Color,
        bg: Color,
    ) -> Result<(), Error> {
        self.blendv(
            id,
            &[BlendRequest {
                data,
                width,
                height,
                stride,
                x,
                y,
                fg,
                bg,
            }],
        )
    }

    /// Applies a batch of blend requests in order.
    pub fn blendv(&mut self, id: DisplayId, requests: &[BlendRequest<'_>]) -> Result<(), Error> {
        match &mut self.inner {
            BackendKind::Drm(backend) => backend.blendv(id, requests),
            BackendKind::Fbdev(backend) => backend.blendv(id, requests),
        }
    }
}

impl EventSource for VideoBackend {
    type Event = VideoEvent;
    type Metadata = ();
    type Ret = ();
    type Error = std::io::Error;

    fn process_events<F>(
        &mut self,
        readiness: Readiness,
        token: Token,
        callback: F,
    ) -> std::io::Result<PostAction>
    where
        F: FnMut(VideoEvent, &mut ()),
    {
        let _guard = self.span.clone().entered();
        match &mut self.inner {
            BackendKind::Drm(backend) => backend.process_events(readiness, token, callback),
            // fbdev produces no fd events.
            BackendKind::Fbdev(_) => Ok(PostAction::Continue),
        }
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        match &mut self.inner {
            BackendKind::Drm(backend) => backend.register(poll, factory),
            BackendKind::Fbdev(_) => Ok(()),
        }
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        match &mut self.inner {
            BackendKind::Drm(backend) => backend.reregister(poll, factory),
            BackendKind::Fbdev(_) => Ok(()),
        }
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        match &mut self.inner {
            BackendKind::Drm(backend) => backend.unregister(poll),
            BackendKind::Fbdev(_) => Ok(()),
        }
    }
}
