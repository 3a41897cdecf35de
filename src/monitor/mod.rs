//! Seat-scoped device monitoring.
//!
//! The monitor subscribes to the udev event stream for the `drm`,
//! `graphics` and `input` subsystems, classifies every device, tags it
//! with the seat it belongs to, and hands add/remove/hotplug events to
//! the seat controllers. When a login manager is present its seat
//! directory is watched as well, so seats themselves come and go at
//! runtime; without one, a single static `seat0` is synthesized.
//!
//! Classification and flag computation follow the conventions the rest of
//! the stack expects: `card<N>` DRM nodes (primary if a parent carries
//! `boot_vga`, aux for USB display-link devices), `fb<N>` framebuffer
//! nodes (flagged when their kernel driver is a DRM shadow) and
//! `event<N>` input nodes.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};

use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use tracing::{debug, info_span, trace, warn};
use udev::{Enumerator, EventType, MonitorBuilder, MonitorSocket};

mod logind;

use crate::error::{ErrorKind, Kind};
use logind::SeatWatcher;

/// Default seat name used when a device carries no `ID_SEAT` property.
pub const DEFAULT_SEAT: &str = "seat0";

/// Errors of the device monitor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Setting up or reading the udev monitor socket failed.
    #[error("udev monitor failed")]
    Udev(#[source] io::Error),
    /// The login-manager seat watcher failed.
    #[error("seat watcher failed")]
    SeatWatcher(#[source] io::Error),
}

impl Kind for Error {
    fn kind(&self) -> ErrorKind {
        ErrorKind::DeviceFault
    }
}

/// Class of a monitored device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// A DRM card node (`/dev/dri/card<N>`).
    Drm,
    /// A legacy framebuffer node (`/dev/fb<N>`).
    Fbdev,
    /// An evdev input node (`/dev/input/event<N>`).
    Input,
}

bitflags::bitflags! {
    /// Extra classification bits computed per device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFlags: u32 {
        /// The fbdev node is a shadow of a DRM driver.
        const DRM_BACKED = 1 << 0;
        /// The device drives the boot display.
        const PRIMARY = 1 << 1;
        /// Auxiliary hot-pluggable display hardware (USB display-link).
        const AUX = 1 << 2;
    }
}

/// A classified device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDesc {
    /// Device class.
    pub kind: DeviceKind,
    /// Classification flags.
    pub flags: DeviceFlags,
    /// Device node path.
    pub node: PathBuf,
    /// Sysfs path, the stable identity of the device.
    pub syspath: PathBuf,
}

/// Events emitted by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// A seat appeared.
    NewSeat {
        /// Seat name.
        seat: String,
    },
    /// A seat went away. Its devices are freed individually first.
    FreeSeat {
        /// Seat name.
        seat: String,
    },
    /// A device was added to a seat.
    NewDevice {
        /// Owning seat.
        seat: String,
        /// The device.
        device: DeviceDesc,
    },
    /// A device disappeared from a seat.
    FreeDevice {
        /// Owning seat.
        seat: String,
        /// The device.
        device: DeviceDesc,
    },
    /// A tracked DRM device reported a connector change.
    HotplugDevice {
        /// Owning seat.
        seat: String,
        /// The device.
        device: DeviceDesc,
    },
}

/// Classifies a device by subsystem and sysname.
///
/// This is the pure half of the classification; flags need sysfs access
/// and are computed separately.
pub fn classify(subsystem: &str, sysname: &str) -> Option<DeviceKind> {
    fn numbered(sysname: &str, prefix: &str) -> bool {
        sysname
            .strip_prefix(prefix)
            .map_or(false, |rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
    }

    match subsystem {
        "drm" if numbered(sysname, "card") => Some(DeviceKind::Drm),
        "graphics" if numbered(sysname, "fb") => Some(DeviceKind::Fbdev),
        "input" if numbered(sysname, "event") => Some(DeviceKind::Input),
        _ => None,
    }
}

/// Flags for an fbdev node, derived from the fixed-screeninfo id string.
///
/// The id-based DRM detection is a heuristic: most DRM drivers register
/// their shadow fbdev with an id ending in `drmfb`, and a short allow-list
/// covers the ones that predate the convention.
pub fn fbdev_id_flags(id: &str) -> DeviceFlags {
    const DRM_FB_IDS: &[&str] = &["nouveaufb", "psbfb"];

    let mut flags = DeviceFlags::empty();
    if id.ends_with("drmfb") || DRM_FB_IDS.contains(&id) {
        flags |= DeviceFlags::DRM_BACKED;
    }
    if id == "VESA VGA" {
        flags |= DeviceFlags::PRIMARY;
    }
    if id == "udlfb" {
        flags |= DeviceFlags::AUX;
    }
    flags
}

fn drm_flags(device: &udev::Device) -> DeviceFlags {
    let mut flags = DeviceFlags::empty();
    if let Ok(Some(pci)) = device.parent_with_subsystem(Path::new("pci")) {
        if pci.attribute_value("boot_vga").map_or(false, |v| v == "1") {
            flags |= DeviceFlags::PRIMARY;
        }
    }
    if device.parent_with_subsystem(Path::new("usb")).ok().flatten().is_some() {
        flags |= DeviceFlags::AUX;
    }
    flags
}

fn fbdev_flags(node: &Path) -> DeviceFlags {
    match crate::video::fbdev::probe_fix_id(node) {
        Ok(id) => fbdev_id_flags(&id),
        Err(err) => {
            warn!(node = %node.display(), "cannot probe fbdev id: {err}");
            DeviceFlags::empty()
        }
    }
}

fn seat_of(device: &udev::Device) -> String {
    let own = device.property_value("ID_SEAT");
    let seat = match own {
        Some(seat) => Some(seat.to_os_string()),
        None => device
            .parent()
            .and_then(|parent| parent.property_value("ID_SEAT").map(OsStr::to_os_string)),
    };
    seat.map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_SEAT.to_string())
}

fn has_seat_tag(device: &udev::Device) -> bool {
    fn tagged(device: &udev::Device) -> bool {
        ["TAGS", "CURRENT_TAGS"].iter().any(|prop| {
            device
                .property_value(prop)
                .map_or(false, |tags| tags.to_string_lossy().contains(":seat:"))
        })
    }

    tagged(device) || device.parent().as_ref().map_or(false, tagged)
}

#[derive(Debug)]
struct Tracked {
    seat: String,
    desc: DeviceDesc,
}

/// Monitors seat-scoped graphics and input devices.
///
/// Insert into the event loop to receive hotplug events; call
/// [`DeviceMonitor::scan`] once afterwards to learn the initial seats and
/// devices. When the seat stream and the udev stream are ready in the
/// same wake-up, the seat stream is drained first so a device belonging
/// to a freshly announced seat is not dropped.
pub struct DeviceMonitor {
    socket: MonitorSocket,
    seats: Option<SeatWatcher>,
    devices: HashMap<PathBuf, Tracked>,
    udev_token: Option<Token>,
    seat_token: Option<Token>,
    span: tracing::Span,
}

impl std::fmt::Debug for DeviceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMonitor")
            .field("devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}

impl DeviceMonitor {
    /// Creates a monitor subscribed to the graphics and input subsystems.
    pub fn new() -> Result<Self, Error> {
        let span = info_span!("monitor");
        let socket = MonitorBuilder::new()
            .and_then(|builder| builder.match_subsystem("drm"))
            .and_then(|builder| builder.match_subsystem("graphics"))
            .and_then(|builder| builder.match_subsystem("input"))
            .and_then(|builder| builder.listen())
            .map_err(Error::Udev)?;
        let seats = SeatWatcher::new(Path::new(logind::SEAT_DIR)).map_err(Error::SeatWatcher)?;
        if seats.is_none() {
            debug!(parent: &span, "no seat manager, synthesizing {DEFAULT_SEAT}");
        }
        Ok(DeviceMonitor {
            socket,
            seats,
            devices: HashMap::new(),
            udev_token: None,
            seat_token: None,
            span,
        })
    }

    /// Whether a login manager publishes seats on this host.
    pub fn managed(&self) -> bool {
        self.seats.is_some()
    }

    /// Performs the initial scan, emitting `NewSeat` and `NewDevice`
    /// events for everything currently present.
    pub fn scan(&mut self) -> Result<Vec<MonitorEvent>, Error> {
        let _guard = self.span.clone().entered();
        let mut events = Vec::new();

        match &mut self.seats {
            Some(watcher) => {
                let diff = watcher.rescan();
                for seat in diff.added {
                    events.push(MonitorEvent::NewSeat { seat });
                }
            }
            None => events.push(MonitorEvent::NewSeat {
                seat: DEFAULT_SEAT.to_string(),
            }),
        }

        let mut enumerator = Enumerator::new().map_err(Error::Udev)?;
        for subsystem in ["drm", "graphics", "input"] {
            enumerator.match_subsystem(subsystem).map_err(Error::Udev)?;
        }
        for device in enumerator.scan_devices().map_err(Error::Udev)? {
            if let Some(event) = self.track(&device) {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn accept(&self, device: &udev::Device) -> Option<DeviceDesc> {
        let subsystem = device.subsystem()?.to_str()?.to_string();
        let sysname = device.sysname().to_str()?.to_string();
        let kind = classify(&subsystem, &sysname)?;
        let node = device.devnode()?.to_path_buf();

        if kind == DeviceKind::Input && device.parent().is_none() {
            return None;
        }
        if self.managed() && !has_seat_tag(device) {
            trace!("ignoring untagged device {}", node.display());
            return None;
        }

        let flags = match kind {
            DeviceKind::Drm => drm_flags(device),
            DeviceKind::Fbdev => fbdev_flags(&node),
            DeviceKind::Input => DeviceFlags::empty(),
        };
        Some(DeviceDesc {
            kind,
            flags,
            node,
            syspath: device.syspath().to_path_buf(),
        })
    }

    fn track(&mut self, device: &udev::Device) -> Option<MonitorEvent> {
        let desc = self.accept(device)?;
        let seat = seat_of(device);
        if self.devices.contains_key(&desc.syspath) {
            return None;
        }
        debug!(seat, node = %desc.node.display(), kind = ?desc.kind, flags = ?desc.flags, "new device");
        self.devices.insert(
            desc.syspath.clone(),
            Tracked {
                seat: seat.clone(),
                desc: desc.clone(),
            },
        );
        Some(MonitorEvent::NewDevice { seat, device: desc })
    }

    fn untrack(&mut self, syspath: &Path) -> Option<MonitorEvent> {
        let tracked = self.devices.remove(syspath)?;
        debug!(seat = tracked.seat, node = %tracked.desc.node.display(), "device removed");
        Some(MonitorEvent::FreeDevice {
            seat: tracked.seat,
            device: tracked.desc,
        })
    }

    fn handle_change(&mut self, device: &udev::Device, events: &mut Vec<MonitorEvent>) {
        let syspath = device.syspath().to_path_buf();
        let hotplug = device
            .property_value("HOTPLUG")
            .map_or(false, |value| value == "1");

        if let Some(tracked) = self.devices.get(&syspath) {
            let seat_now = seat_of(device);
            if seat_now != tracked.seat {
                // Seat reassignment is a remove-then-add.
                events.extend(self.untrack(&syspath));
                events.extend(self.track(device));
                return;
            }
            if hotplug {
                events.push(MonitorEvent::HotplugDevice {
                    seat: tracked.seat.clone(),
                    device: tracked.desc.clone(),
                });
            }
        } else {
            events.extend(self.track(device));
        }
    }

    fn drain_seats(&mut self, events: &mut Vec<MonitorEvent>) -> Result<(), Error> {
        let Some(watcher) = &mut self.seats else {
            return Ok(());
        };
        let diff = watcher.drain().map_err(Error::SeatWatcher)?;
        for seat in diff.added {
            events.push(MonitorEvent::NewSeat { seat });
        }
        for seat in diff.removed {
            let gone: Vec<PathBuf> = self
                .devices
                .iter()
                .filter(|(_, tracked)| tracked.seat == seat)
                .map(|(syspath, _)| syspath.clone())
                .collect();
            for syspath in gone {
                events.extend(self.untrack(&syspath));
            }
            events.push(MonitorEvent::FreeSeat { seat });
        }
        Ok(())
    }

    fn drain_udev(&mut self, events: &mut Vec<MonitorEvent>) {
        let pending: Vec<udev::Event> = self.socket.iter().collect();
        for event in pending {
            let device = event.device();
            match event.event_type() {
                EventType::Add => events.extend(self.track(&device)),
                EventType::Remove => events.extend(self.untrack(device.syspath())),
                EventType::Change => self.handle_change(&device, events),
                _ => {}
            }
        }
    }

    fn udev_fd(&self) -> BorrowedFd<'_> {
        let raw: RawFd = self.socket.as_raw_fd();
        unsafe { BorrowedFd::borrow_raw(raw) }
    }
}

impl EventSource for DeviceMonitor {
    type Event = MonitorEvent;
    type Metadata = ();
    type Ret = ();
    type Error = Error;

    fn process_events<F>(
        &mut self,
        _readiness: Readiness,
        _token: Token,
        mut callback: F,
    ) -> Result<PostAction, Error>
    where
        F: FnMut(MonitorEvent, &mut ()),
    {
        let _guard = self.span.clone().entered();
        let mut events = Vec::new();
        // Seat stream first: a device announce may race its seat announce
        // within the same wake-up.
        self.drain_seats(&mut events)?;
        self.drain_udev(&mut events);
        for event in events {
            callback(event, &mut ());
        }
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.udev_token = Some(factory.token());
        unsafe {
            poll.register(
                self.udev_fd(),
                Interest::READ,
                Mode::Level,
                self.udev_token.unwrap(),
            )?;
        }
        if let Some(watcher) = &self.seats {
            self.seat_token = Some(factory.token());
            unsafe {
                poll.register(
                    watcher.fd(),
                    Interest::READ,
                    Mode::Level,
                    self.seat_token.unwrap(),
                )?;
            }
        }
        Ok(())
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.udev_token = Some(factory.token());
        poll.reregister(
            self.udev_fd(),
            Interest::READ,
            Mode::Level,
            self.udev_token.unwrap(),
        )?;
        if let Some(watcher) = &self.seats {
            self.seat_token = Some(factory.token());
            poll.reregister(
                watcher.fd(),
                Interest::READ,
                Mode::Level,
                self.seat_token.unwrap(),
            )?;
        }
        Ok(())
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.udev_token = None;
        poll.unregister(self.udev_fd())?;
        if let Some(watcher) = &self.seats {
            self.seat_token = None;
            poll.unregister(watcher.fd())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        assert_eq!(classify("drm", "card0"), Some(DeviceKind::Drm));
        assert_eq!(classify("drm", "card12"), Some(DeviceKind::Drm));
        assert_eq!(classify("drm", "renderD128"), None);
        assert_eq!(classify("drm", "card"), None);
        assert_eq!(classify("graphics", "fb0"), Some(DeviceKind::Fbdev));
        assert_eq!(classify("graphics", "fbcon"), None);
        assert_eq!(classify("input", "event3"), Some(DeviceKind::Input));
        assert_eq!(classify("input", "mouse0"), None);
        assert_eq!(classify("input", "js0"), None);
        assert_eq!(classify("sound", "card0"), None);
    }

    #[test]
    fn fbdev_heuristics() {
        assert_eq!(fbdev_id_flags("inteldrmfb"), DeviceFlags::DRM_BACKED);
        assert_eq!(fbdev_id_flags("radeondrmfb"), DeviceFlags::DRM_BACKED);
        assert_eq!(fbdev_id_flags("nouveaufb"), DeviceFlags::DRM_BACKED);
        assert_eq!(fbdev_id_flags("psbfb"), DeviceFlags::DRM_BACKED);
        assert_eq!(fbdev_id_flags("VESA VGA"), DeviceFlags::PRIMARY);
        assert_eq!(fbdev_id_flags("udlfb"), DeviceFlags::AUX);
        assert_eq!(fbdev_id_flags("EFI VGA"), DeviceFlags::empty());
    }
}
