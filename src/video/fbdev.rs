//! Legacy fbdev backend.
//!
//! fbdev has no master concept and exactly one display per node. Double
//! buffering is requested by doubling the virtual vertical resolution and
//! panning between the halves; drivers that refuse fall back to a single
//! buffer. Only packed-pixel TRUECOLOR layouts at 16, 24 or 32 bpp are
//! driven, with 32 preferred.
//!
//! Targets below 8 bits per channel are dithered. The error residual
//! lives on the display and carries across fills and blits — it is not
//! reset per frame, so the quantization error diffuses over time instead
//! of banding in the same place every frame.

use std::io;
use std::os::unix::io::OwnedFd;
use std::path::{Path, PathBuf};

use rustix::fs::{Mode as FsMode, OFlags};
use tracing::{debug, trace, warn};

use super::pixel::{self, BlendRequest, Color, Rect};
use super::{DisplayId, DisplayInfo, DisplayMode, Dpms, Error, VideoEvent};

pub(crate) mod ffi {
    use std::io;
    use std::os::unix::io::AsRawFd;

    pub const FBIOGET_VSCREENINFO: libc::c_ulong = 0x4600;
    pub const FBIOPUT_VSCREENINFO: libc::c_ulong = 0x4601;
    pub const FBIOGET_FSCREENINFO: libc::c_ulong = 0x4602;
    pub const FBIOPAN_DISPLAY: libc::c_ulong = 0x4606;
    pub const FBIOBLANK: libc::c_ulong = 0x4611;

    pub const FB_TYPE_PACKED_PIXELS: u32 = 0;
    pub const FB_VISUAL_TRUECOLOR: u32 = 2;
    pub const FB_ACTIVATE_NOW: u32 = 0;
    pub const FB_ACTIVATE_VBL: u32 = 16;
    pub const FB_BLANK_UNBLANK: libc::c_int = 0;
    pub const FB_BLANK_VSYNC_SUSPEND: libc::c_int = 2;
    pub const FB_BLANK_HSYNC_SUSPEND: libc::c_int = 3;
    pub const FB_BLANK_POWERDOWN: libc::c_int = 4;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct FbBitfield {
        pub offset: u32,
        pub length: u32,
        pub msb_right: u32,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct FbFixScreeninfo {
        pub id: [u8; 16],
        pub smem_start: libc::c_ulong,
        pub smem_len: u32,
        pub type_: u32,
        pub type_aux: u32,
        pub visual: u32,
        pub xpanstep: u16,
        pub ypanstep: u16,
        pub ywrapstep: u16,
        pub line_length: u32,
        pub mmio_start: libc::c_ulong,
        pub mmio_len: u32,
        pub accel: u32,
        pub capabilities: u16,
        pub reserved: [u16; 2],
    }

    impl Default for FbFixScreeninfo {
        fn default() -> Self {
            unsafe { std::mem::zeroed() }
        }
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct FbVarScreeninfo {
        pub xres: u32,
        pub yres: u32,
        pub xres_virtual: u32,
        pub yres_virtual: u32,
        pub xoffset: u32,
        pub yoffset: u32,
        pub bits_per_pixel: u32,
        pub grayscale: u32,
        pub red: FbBitfield,
        pub green: FbBitfield,
        pub blue: FbBitfield,
        pub transp: FbBitfield,
        pub nonstd: u32,
        pub activate: u32,
        pub height: u32,
        pub width: u32,
        pub accel_flags: u32,
        pub pixclock: u32,
        pub left_margin: u32,
        pub right_margin: u32,
        pub upper_margin: u32,
        pub lower_margin: u32,
        pub hsync_len: u32,
        pub vsync_len: u32,
        pub sync: u32,
        pub vmode: u32,
        pub rotate: u32,
        pub colorspace: u32,
        pub reserved: [u32; 4],
    }

    fn ioctl<T>(fd: &impl AsRawFd, request: libc::c_ulong, arg: *mut T) -> io::Result<()> {
        if unsafe { libc::ioctl(fd.as_raw_fd(), request, arg) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn get_fix(fd: &impl AsRawFd) -> io::Result<FbFixScreeninfo> {
        let mut fix = FbFixScreeninfo::default();
        ioctl(fd, FBIOGET_FSCREENINFO, &mut fix)?;
        Ok(fix)
    }

    pub fn get_var(fd: &impl AsRawFd) -> io::Result<FbVarScreeninfo> {
        let mut var = FbVarScreeninfo::default();
        ioctl(fd, FBIOGET_VSCREENINFO, &mut var)?;
        Ok(var)
    }

    pub fn put_var(fd: &impl AsRawFd, var: &mut FbVarScreeninfo) -> io::Result<()> {
        ioctl(fd, FBIOPUT_VSCREENINFO, var)
    }

    pub fn pan_display(fd: &impl AsRawFd, var: &mut FbVarScreeninfo) -> io::Result<()> {
        ioctl(fd, FBIOPAN_DISPLAY, var)
    }

    pub fn blank(fd: &impl AsRawFd, mode: libc::c_int) -> io::Result<()> {
        if unsafe { libc::ioctl(fd.as_raw_fd(), FBIOBLANK, mode as libc::c_ulong) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Reads the fixed-screeninfo id string of an fbdev node.
///
/// Used by the device monitor to tag DRM-backed framebuffers before any
/// backend exists for the node.
pub(crate) fn probe_fix_id(node: &Path) -> io::Result<String> {
    let fd = rustix::fs::open(node, OFlags::RDONLY | OFlags::CLOEXEC, FsMode::empty())?;
    let fix = ffi::get_fix(&fd)?;
    let len = fix.id.iter().position(|&b| b == 0).unwrap_or(fix.id.len());
    Ok(String::from_utf8_lossy(&fix.id[..len]).into_owned())
}

struct Mapping {
    ptr: *mut u8,
    len: usize,
}

impl Mapping {
    fn new(fd: &OwnedFd, len: usize) -> Result<Self, Error> {
        use rustix::mm::{mmap, MapFlags, ProtFlags};
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )
        }
        .map_err(|err| Error::Fbdev {
            msg: "mmap",
            source: err.into(),
        })?;
        Ok(Mapping {
            ptr: ptr.cast(),
            len,
        })
    }

    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.cast(), self.len);
        }
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping").field("len", &self.len).finish()
    }
}

/// Per-channel error-diffusion state.
///
/// The residual is carried from pixel to pixel and from frame to frame.
/// For channels emitted at full depth the expansion is exact and the
/// residual is invariant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Dither {
    r: i32,
    g: i32,
    b: i32,
}

/// Replicates the top bits so the expanded value spans the full 0..=255
/// range (31 at 5 bits expands back to 255).
fn expand(value: u32, length: u32) -> i32 {
    if length >= 8 {
        return value as i32;
    }
    ((value << (8 - length)) | (value >> (2 * length).saturating_sub(8))) as i32
}

fn quantize(residual: &mut i32, value: u8, length: u32) -> u32 {
    if length >= 8 {
        return value as u32;
    }
    let want = value as i32 + *residual;
    let max = (1i32 << length) - 1;
    let emitted = (want >> (8 - length)).clamp(0, max) as u32;
    *residual = want - expand(emitted, length);
    emitted
}

impl Dither {
    fn pack(&mut self, color: (u8, u8, u8), layout: &PixelLayout) -> u32 {
        let r = quantize(&mut self.r, color.0, layout.len_r) << layout.off_r;
        let g = quantize(&mut self.g, color.1, layout.len_g) << layout.off_g;
        let b = quantize(&mut self.b, color.2, layout.len_b) << layout.off_b;
        r | g | b
    }

    #[cfg(test)]
    fn residual_magnitude(&self) -> i32 {
        self.r.abs() + self.g.abs() + self.b.abs()
    }
}

#[derive(Debug, Clone, Copy)]
struct PixelLayout {
    off_r: u32,
    len_r: u32,
    off_g: u32,
    len_g: u32,
    off_b: u32,
    len_b: u32,
    bytes: u32,
}

struct Active {
    fd: OwnedFd,
    map: Mapping,
    stride: u32,
    layout: PixelLayout,
    width: u32,
    height: u32,
    double_buffered: bool,
    front: u32,
    var: ffi::FbVarScreeninfo,
}

impl std::fmt::Debug for Active {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Active")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("double_buffered", &self.double_buffered)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(super) struct FbdevBackend {
    node: PathBuf,
    awake: bool,
    announced: bool,
    active: Option<Active>,
    dpms: Dpms,
    dither: Dither,
    mode: Option<DisplayMode>,
}

const FB_DISPLAY: DisplayId = DisplayId(0);

impl FbdevBackend {
    pub(super) fn new(node: &Path) -> Result<Self, Error> {
        // Probe once so a broken node fails construction, then close; the
        // fd is only held while the display is active so a peer process
        // can drive the device in between.
        probe_fix_id(node).map_err(|source| Error::Fbdev {
            msg: "probe",
            source,
        })?;
        Ok(FbdevBackend {
            node: node.to_path_buf(),
            awake: false,
            announced: false,
            active: None,
            dpms: Dpms::Unknown,
            dither: Dither::default(),
            mode: None,
        })
    }

    pub(super) fn is_awake(&self) -> bool {
        self.awake
    }

    pub(super) fn wake(&mut self) -> Result<Vec<VideoEvent>, Error> {
        if self.awake {
            return Ok(Vec::new());
        }
        self.awake = true;
        debug!("fbdev backend awake");
        self.poll()
    }

    pub(super) fn sleep(&mut self) {
        if !self.awake {
            return;
        }
        // Unmap and close so a peer can draw.
        self.deactivate(FB_DISPLAY);
        self.awake = false;
        debug!("fbdev backend asleep");
    }

    pub(super) fn poll(&mut self) -> Result<Vec<VideoEvent>, Error> {
        let mut events = vec![VideoEvent::WakeUp];
        if !self.announced {
            self.announced = true;
            events.push(VideoEvent::New(FB_DISPLAY));
        }
        Ok(events)
    }

    pub(super) fn displays(&self) -> Vec<DisplayId> {
        if self.announced {
            vec![FB_DISPLAY]
        } else {
            Vec::new()
        }
    }

    pub(super) fn display_info(&self, id: DisplayId) -> Option<DisplayInfo> {
        if id != FB_DISPLAY || !self.announced {
            return None;
        }
        Some(DisplayInfo {
            id,
            modes: self.mode.into_iter().collect(),
            current_mode: self.active.as_ref().and(self.mode),
            dpms: self.dpms,
            online: true,
            pending_vsync: false,
            double_buffered: self.active.as_ref().map_or(false, |a| a.double_buffered),
        })
    }

    pub(super) fn activate(&mut self, id: DisplayId, _mode_index: Option<usize>) -> Result<(), Error> {
        if !self.awake {
            return Err(Error::Asleep);
        }
        if id != FB_DISPLAY {
            return Err(Error::NoDisplay);
        }
        if self.active.is_some() {
            return Ok(());
        }

        let fd = rustix::fs::open(
            &self.node,
            OFlags::RDWR | OFlags::CLOEXEC,
            FsMode::empty(),
        )
        .map_err(|source| Error::Open {
            node: self.node.clone(),
            source,
        })?;

        let mut var = ffi::get_var(&fd).map_err(|source| Error::Fbdev {
            msg: "get vscreeninfo",
            source,
        })?;

        // Ask for 32bpp and a doubled virtual height; drivers that cannot
        // do either get a second, reduced request.
        var.bits_per_pixel = 32;
        var.xres_virtual = var.xres;
        var.yres_virtual = var.yres * 2;
        var.xoffset = 0;
        var.yoffset = 0;
        var.grayscale = 0;
        var.activate = ffi::FB_ACTIVATE_NOW;
        let mut double_buffered = true;
        if ffi::put_var(&fd, &mut var).is_err() {
            var.yres_virtual = var.yres;
            double_buffered = false;
            var.activate = ffi::FB_ACTIVATE_NOW;
            if let Err(source) = ffi::put_var(&fd, &mut var) {
                // Keep whatever format the driver is in and try plain.
                warn!("cannot configure fbdev mode: {source}");
            }
        }

        let var = ffi::get_var(&fd).map_err(|source| Error::Fbdev {
            msg: "get vscreeninfo",
            source,
        })?;
        let fix = ffi::get_fix(&fd).map_err(|source| Error::Fbdev {
            msg: "get fscreeninfo",
            source,
        })?;

        if fix.type_ != ffi::FB_TYPE_PACKED_PIXELS {
            return Err(Error::UnsupportedFormat("not packed pixels"));
        }
        if fix.visual != ffi::FB_VISUAL_TRUECOLOR {
            return Err(Error::UnsupportedFormat("not truecolor"));
        }
        if !matches!(var.bits_per_pixel, 16 | 24 | 32) {
            return Err(Error::UnsupportedFormat("unsupported depth"));
        }
        double_buffered = double_buffered && var.yres_virtual >= var.yres * 2;

        let layout = PixelLayout {
            off_r: var.red.offset,
            len_r: var.red.length,
            off_g: var.green.offset,
            len_g: var.green.length,
            off_b: var.blue.offset,
            len_b: var.blue.length,
            bytes: var.bits_per_pixel / 8,
        };
        let len = (fix.line_length * var.yres_virtual) as usize;
        let map = Mapping::new(&fd, len.min(fix.smem_len as usize))?;

        self.mode = Some(DisplayMode {
            width: var.xres,
            height: var.yres,
            vrefresh: 0,
        });
        debug!(
            width = var.xres,
            height = var.yres,
            bpp = var.bits_per_pixel,
            double_buffered,
            "fbdev display activated"
        );
        self.active = Some(Active {
            fd,
            map,
            stride: fix.line_length,
            layout,
            width: var.xres,
            height: var.yres,
            double_buffered,
            front: 0,
            var,
        });
        let _ = self.set_dpms(id, Dpms::On);
        Ok(())
    }

    pub(super) fn deactivate(&mut self, id: DisplayId) {
        if id != FB_DISPLAY {
            return;
        }
        if self.active.take().is_some() {
            debug!("fbdev display deactivated");
        }
    }

    pub(super) fn set_dpms(&mut self, id: DisplayId, state: Dpms) -> Result<(), Error> {
        if id != FB_DISPLAY {
            return Err(Error::NoDisplay);
        }
        let Some(active) = &self.active else {
            return Err(Error::NotActive);
        };
        let blank = match state {
            Dpms::On | Dpms::Unknown => ffi::FB_BLANK_UNBLANK,
            Dpms::Standby => ffi::FB_BLANK_VSYNC_SUSPEND,
            Dpms::Suspend => ffi::FB_BLANK_HSYNC_SUSPEND,
            Dpms::Off => ffi::FB_BLANK_POWERDOWN,
        };
        match ffi::blank(&active.fd, blank) {
            Ok(()) => {
                self.dpms = state;
                Ok(())
            }
            // Plenty of fbdev drivers do not implement blanking.
            Err(err) => {
                trace!("fbdev blank not supported: {err}");
                self.dpms = Dpms::Unknown;
                Ok(())
            }
        }
    }

    pub(super) fn swap(&mut self, id: DisplayId) -> Result<(), Error> {
        if id != FB_DISPLAY {
            return Err(Error::NoDisplay);
        }
        let Some(active) = &mut self.active else {
            return Err(Error::NotActive);
        };
        if !active.double_buffered {
            return Ok(());
        }
        let back = 1 - active.front;
        active.var.yoffset = back * active.height;
        active.var.activate = ffi::FB_ACTIVATE_VBL;
        ffi::pan_display(&active.fd, &mut active.var).map_err(|source| Error::Fbdev {
            msg: "pan display",
            source,
        })?;
        active.front = back;
        Ok(())
    }

    // Renders one XRGB row into the back buffer with dithering.
    fn pack_row(
        dither: &mut Dither,
        layout: &PixelLayout,
        target: &mut [u8],
        row: impl Iterator<Item = (u8, u8, u8)>,
    ) {
        let bytes = layout.bytes as usize;
        for (index, color) in row.enumerate() {
            let value = dither.pack(color, layout);
            let Some(out) = target.get_mut(index * bytes..index * bytes + bytes) else {
                break;
            };
            match bytes {
                4 => out.copy_from_slice(&value.to_le_bytes()),
                3 => out.copy_from_slice(&value.to_le_bytes()[..3]),
                2 => out.copy_from_slice(&(value as u16).to_le_bytes()),
                _ => {}
            }
        }
    }

    fn with_back<R>(
        &mut self,
        op: impl FnOnce(&mut Active, &mut Dither, usize) -> R,
    ) -> Result<R, Error> {
        let Some(active) = &mut self.active else {
            return Err(Error::NotActive);
        };
        let back_row = if active.double_buffered {
            (1 - active.front) * active.height
        } else {
            0
        };
        let offset = (back_row * active.stride) as usize;
        let mut dither = self.dither;
        let result = op(active, &mut dither, offset);
        self.dither = dither;
        Ok(result)
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
        if id != FB_DISPLAY {
            return Err(Error::NoDisplay);
        }
        self.with_back(|active, dither, base| {
            let layout = active.layout;
            let (fb_w, fb_h, fb_stride) = (active.width, active.height, active.stride);
            let copy_w = width.min(fb_w.saturating_sub(x));
            let copy_h = height.min(fb_h.saturating_sub(y));
            let buf = active.map.as_mut();
            for row in 0..copy_h {
                let src_off = (row * stride) as usize;
                let Some(src) = data.get(src_off..src_off + copy_w as usize * 4) else {
                    break;
                };
                let dst_off =
                    base + ((y + row) * fb_stride) as usize + (x * layout.bytes) as usize;
                let Some(dst) = buf.get_mut(dst_off..) else {
                    break;
                };
                Self::pack_row(
                    dither,
                    &layout,
                    dst,
                    src.chunks_exact(4).map(|px| (px[2], px[1], px[0])),
                );
            }
        })
    }

    pub(super) fn fill(&mut self, id: DisplayId, color: Color, rect: Rect) -> Result<(), Error> {
        if id != FB_DISPLAY {
            return Err(Error::NoDisplay);
        }
        self.with_back(|active, dither, base| {
            let layout = active.layout;
            let (fb_w, fb_h, fb_stride) = (active.width, active.height, active.stride);
            let fill_w = rect.width.min(fb_w.saturating_sub(rect.x));
            let fill_h = rect.height.min(fb_h.saturating_sub(rect.y));
            let buf = active.map.as_mut();
            for row in 0..fill_h {
                let dst_off = base
                    + ((rect.y + row) * fb_stride) as usize
                    + (rect.x * layout.bytes) as usize;
                let Some(dst) = buf.get_mut(dst_off..) else {
                    break;
                };
                Self::pack_row(
                    dither,
                    &layout,
                    dst,
                    (0..fill_w).map(|_| (color.r, color.g, color.b)),
                );
            }
        })
    }

    pub(super) fn blendv(&mut self, id: DisplayId, requests: &[BlendRequest<'_>]) -> Result<(), Error> {
        if id != FB_DISPLAY {
            return Err(Error::NoDisplay);
        }
        // Blend in XRGB space first, then pack through the ditherer.
        for req in requests {
            let mut scratch = vec![0u8; (req.width * req.height * 4) as usize];
            pixel::blend_xrgb(
                &mut scratch,
                req.width * 4,
                req.width,
                req.height,
                &BlendRequest {
                    x: 0,
                    y: 0,
                    ..*req
                },
            );
            self.blit(id, &scratch, req.width, req.height, req.width * 4, req.x, req.y)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RGB565: PixelLayout = PixelLayout {
        off_r: 11,
        len_r: 5,
        off_g: 5,
        len_g: 6,
        off_b: 0,
        len_b: 5,
        bytes: 2,
    };

    #[test]
    fn expansion_round_trips_extremes() {
        assert_eq!(expand(31, 5), 255);
        assert_eq!(expand(63, 6), 255);
        assert_eq!(expand(0, 5), 0);
        assert_eq!(expand(200, 8), 200);
    }

    #[test]
    fn white_fill_conserves_residual() {
        let mut dither = Dither::default();
        for _ in 0..64 {
            dither.pack((255, 255, 255), &RGB565);
        }
        let settled = dither;
        for _ in 0..1024 {
            dither.pack((255, 255, 255), &RGB565);
        }
        assert_eq!(dither, settled);
        assert_eq!(dither.residual_magnitude(), settled.residual_magnitude());
    }

    #[test]
    fn black_fill_conserves_residual() {
        let mut dither = Dither::default();
        for _ in 0..64 {
            dither.pack((0, 0, 0), &RGB565);
        }
        let settled = dither;
        dither.pack((0, 0, 0), &RGB565);
        assert_eq!(dither, settled);
    }

    #[test]
    fn residual_diffuses_midtones() {
        // 128 at 5 bits cannot be represented exactly; consecutive
        // pixels must alternate between neighbouring levels instead of
        // repeating one.
        let mut dither = Dither::default();
        let mut emitted = std::collections::HashSet::new();
        for _ in 0..16 {
            let px = dither.pack((128, 128, 128), &RGB565);
            emitted.insert(px >> 11);
        }
        assert!(emitted.len() > 1, "no diffusion: {emitted:?}");
    }

    #[test]
    fn full_depth_channels_have_zero_residual() {
        let layout = PixelLayout {
            off_r: 16,
            len_r: 8,
            off_g: 8,
            len_g: 8,
            off_b: 0,
            len_b: 8,
            bytes: 4,
        };
        let mut dither = Dither::default();
        for value in [0u8, 1, 127, 200, 255] {
            let px = dither.pack((value, value, value), &layout);
            assert_eq!(px, u32::from_le_bytes([value, value, value, 0]));
        }
        assert_eq!(dither, Dither::default());
    }
}
