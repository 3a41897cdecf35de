//! Per-seat input pipeline.
//!
//! Aggregates the seat's evdev keyboards behind a single xkb keymap and
//! produces decoded key events: evdev keycode, keysym, effective modifier
//! mask and the unicode codepoint when the keysym has one. Release events
//! only update modifier state; repeats are forwarded only for keys the
//! keymap marks as repeating.
//!
//! The aggregate is sleep-aware: while asleep it holds no open fds at
//! all. Waking reopens every node, re-reads the LED state and rebuilds
//! the xkb state from scratch — events missed while asleep are lost, and
//! rebuilding is the only way to avoid stuck modifiers.

use std::io;
use std::mem;
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::ptr;

use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use rustix::fs::{Mode as FsMode, OFlags};
use rustix::io::Errno;
use smallvec::SmallVec;
use tracing::{debug, info_span, trace, warn};
use xkbcommon::xkb;

mod keyboard;

pub use keyboard::{Modifiers, XkbConfig};

use crate::error::{ErrorKind, Kind};

/// Errors of the input pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening an evdev node failed.
    #[error("cannot open evdev node {node}")]
    OpenNode {
        /// The node that failed to open.
        node: PathBuf,
        /// Root cause.
        #[source]
        source: Errno,
    },
    /// Neither the configured nor the fallback keymap compiled.
    #[error("cannot compile keymap (even the plain us fallback)")]
    KeymapCompile,
}

impl Kind for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::OpenNode { .. } => ErrorKind::DeviceFault,
            Error::KeymapCompile => ErrorKind::InvalidArgument,
        }
    }
}

const FALLBACK_LAYOUT: &str = "us";

/// State of a key in a decoded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// Initial press.
    Pressed,
    /// Kernel autorepeat of a held key.
    Repeated,
}

/// A decoded keyboard event.
#[derive(Debug, Clone)]
pub struct KeyEvent {
    /// Raw evdev keycode (without the +8 X offset).
    pub keycode: u32,
    /// First keysym produced by the keymap for this key.
    pub keysym: xkb::Keysym,
    /// Effective modifier mask.
    pub mods: Modifiers,
    /// Unicode codepoint of the keysym, if it has one.
    pub unicode: Option<char>,
    /// Press or repeat.
    pub state: KeyState,
}

// Raw evdev constants; the `input_event` struct itself comes from libc.
const EV_KEY: u16 = 0x01;
const KEY_RELEASED: i32 = 0;
const KEY_PRESSED: i32 = 1;
const KEY_REPEATED: i32 = 2;

const KEY_NUMLOCK: u32 = 69;
const KEY_CAPSLOCK: u32 = 58;
const KEY_SCROLLLOCK: u32 = 70;
const LED_NUML: usize = 0;
const LED_CAPSL: usize = 1;
const LED_SCROLLL: usize = 2;

// Keycode offset between evdev and xkb keymaps.
const XKB_OFFSET: u32 = 8;

fn xkb_keycode(code: u32) -> xkb::Keycode {
    xkb::Keycode::new(code + XKB_OFFSET)
}

mod ffi {
    const fn ioc_read(ty: u8, nr: u8, size: usize) -> libc::c_ulong {
        ((2u64 << 30) | ((size as u64) << 16) | ((ty as u64) << 8) | nr as u64) as libc::c_ulong
    }

    pub(super) fn eviocgled(fd: libc::c_int, buf: &mut [u8]) -> std::io::Result<()> {
        let request = ioc_read(b'E', 0x19, buf.len());
        if unsafe { libc::ioctl(fd, request, buf.as_mut_ptr()) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

struct OpenKeyboard {
    fd: OwnedFd,
    state: xkb::State,
    token: Option<Token>,
}

struct Node {
    path: PathBuf,
    open: Option<OpenKeyboard>,
}

/// The evdev aggregate of one seat.
///
/// Wrap in a [`calloop::Dispatcher`] so the controller can add and remove
/// devices at runtime and refresh the fd registration via
/// `LoopHandle::update`.
pub struct SeatInput {
    context: xkb::Context,
    keymap: xkb::Keymap,
    nodes: Vec<Node>,
    awake: bool,
    span: tracing::Span,
}

impl std::fmt::Debug for SeatInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeatInput")
            .field("nodes", &self.nodes.len())
            .field("awake", &self.awake)
            .finish_non_exhaustive()
    }
}

impl SeatInput {
    /// Creates the aggregate for `seat`, compiling the configured keymap.
    ///
    /// A keymap that fails to compile falls back to a plain `us` layout;
    /// only a second failure is an error.
    pub fn new(seat: &str, config: &XkbConfig<'_>) -> Result<Self, Error> {
        let span = info_span!("input", seat);
        let _guard = span.enter();

        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = match config.compile_keymap(&context) {
            Some(keymap) => keymap,
            None => {
                warn!(
                    layout = config.layout,
                    variant = config.variant,
                    "keymap failed to compile, falling back to `{FALLBACK_LAYOUT}`"
                );
                XkbConfig {
                    layout: FALLBACK_LAYOUT,
                    ..XkbConfig::default()
                }
                .compile_keymap(&context)
                .ok_or(Error::KeymapCompile)?
            }
        };

        drop(_guard);
        Ok(SeatInput {
            context,
            keymap,
            nodes: Vec::new(),
            awake: false,
            span,
        })
    }

    /// Whether the aggregate currently holds open devices.
    pub fn is_awake(&self) -> bool {
        self.awake
    }

    /// Replaces the keymap and rebuilds every device state.
    pub fn set_keymap(&mut self, config: &XkbConfig<'_>) -> Result<(), Error> {
        self.keymap = match config.compile_keymap(&self.context) {
            Some(keymap) => keymap,
            None => XkbConfig {
                layout: FALLBACK_LAYOUT,
                ..XkbConfig::default()
            }
            .compile_keymap(&self.context)
            .ok_or(Error::KeymapCompile)?,
        };
        for node in &mut self.nodes {
            if let Some(open) = &mut node.open {
                open.state = Self::fresh_state(&self.keymap, &open.fd);
            }
        }
        Ok(())
    }

    /// Adds an evdev node to the aggregate.
    ///
    /// While asleep only the path is remembered; the node is opened on
    /// the next wake.
    pub fn add_node(&mut self, path: &Path) -> Result<(), Error> {
        let _guard = self.span.enter();
        if self.nodes.iter().any(|node| node.path == path) {
            return Ok(());
        }
        let open = if self.awake {
            Some(self.open_node(path)?)
        } else {
            None
        };
        debug!(node = %path.display(), opened = open.is_some(), "input node added");
        self.nodes.push(Node {
            path: path.to_path_buf(),
            open,
        });
        Ok(())
    }

    /// Removes an evdev node, closing it if open.
    pub fn remove_node(&mut self, path: &Path) {
        let _guard = self.span.enter();
        let before = self.nodes.len();
        self.nodes.retain(|node| node.path != path);
        if self.nodes.len() != before {
            debug!(node = %path.display(), "input node removed");
        }
    }

    /// Closes every fd. Events arriving while asleep are lost by design.
    pub fn sleep(&mut self) {
        let _guard = self.span.enter();
        if !self.awake {
            return;
        }
        debug!("input pipeline sleeping");
        self.awake = false;
        for node in &mut self.nodes {
            node.open = None;
        }
    }

    /// Reopens every node and resynchronizes the lock state from LEDs.
    pub fn wake(&mut self) {
        let _guard = self.span.enter();
        if self.awake {
            return;
        }
        debug!("input pipeline waking");
        self.awake = true;
        let mut failed = Vec::new();
        for i in 0..self.nodes.len() {
            let path = self.nodes[i].path.clone();
            match self.open_node(&path) {
                Ok(open) => self.nodes[i].open = Some(open),
                Err(err) => {
                    warn!(node = %path.display(), "reopen failed: {err}");
                    failed.push(path);
                }
            }
        }
        self.nodes.retain(|node| !failed.contains(&node.path));
    }

    fn open_node(&self, path: &Path) -> Result<OpenKeyboard, Error> {
        let fd = rustix::fs::open(
            path,
            OFlags::RDONLY | OFlags::CLOEXEC | OFlags::NONBLOCK,
            FsMode::empty(),
        )
        .map_err(|source| Error::OpenNode {
            node: path.to_path_buf(),
            source,
        })?;
        let state = Self::fresh_state(&self.keymap, &fd);
        Ok(OpenKeyboard {
            fd,
            state,
            token: None,
        })
    }

    // A fresh state knows nothing about currently held keys; locked
    // modifiers are recovered from the LED readout by toggling the
    // corresponding lock keys.
    fn fresh_state(keymap: &xkb::Keymap, fd: &OwnedFd) -> xkb::State {
        let mut state = xkb::State::new(keymap);

        let mut leds = [0u8; 8];
        if ffi::eviocgled(fd.as_raw_fd(), &mut leds).is_err() {
            return state;
        }
        let led_set = |bit: usize| leds[bit / 8] & (1 << (bit % 8)) != 0;
        for (led, key) in [
            (LED_NUML, KEY_NUMLOCK),
            (LED_CAPSL, KEY_CAPSLOCK),
            (LED_SCROLLL, KEY_SCROLLLOCK),
        ] {
            if led_set(led) {
                state.update_key(xkb_keycode(key), xkb::KeyDirection::Down);
                state.update_key(xkb_keycode(key), xkb::KeyDirection::Up);
            }
        }
        state
    }

    fn decode(keymap: &xkb::Keymap, state: &mut xkb::State, code: u32, value: i32) -> Option<KeyEvent> {
        let keycode = xkb_keycode(code);
        match value {
            KEY_RELEASED => {
                state.update_key(keycode, xkb::KeyDirection::Up);
                None
            }
            KEY_PRESSED | KEY_REPEATED => {
                let key_state = if value == KEY_PRESSED {
                    state.update_key(keycode, xkb::KeyDirection::Down);
                    KeyState::Pressed
                } else {
                    if !keymap.key_repeats(keycode) {
                        return None;
                    }
                    KeyState::Repeated
                };

                let syms: SmallVec<[xkb::Keysym; 4]> =
                    state.key_get_syms(keycode).iter().copied().collect();
                let keysym = *syms.first()?;
                let unicode = char::from_u32(state.key_get_utf32(keycode)).filter(|c| *c != '\0');
                Some(KeyEvent {
                    keycode: code,
                    keysym,
                    mods: keyboard::modifiers_of_state(state),
                    unicode,
                    state: key_state,
                })
            }
            _ => None,
        }
    }

    fn drain_node(
        keymap: &xkb::Keymap,
        open: &mut OpenKeyboard,
        mut emit: impl FnMut(KeyEvent),
    ) -> Result<bool, Errno> {
        const EVENT_SIZE: usize = mem::size_of::<libc::input_event>();
        let mut buf = [0u8; EVENT_SIZE * 64];
        loop {
            match rustix::io::read(&open.fd, &mut buf) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    for chunk in buf[..n].chunks_exact(EVENT_SIZE) {
                        let event: libc::input_event =
                            unsafe { ptr::read_unaligned(chunk.as_ptr().cast()) };
                        if event.type_ != EV_KEY {
                            continue;
                        }
                        if let Some(key) =
                            Self::decode(keymap, &mut open.state, event.code as u32, event.value)
                        {
                            emit(key);
                        }
                    }
                }
                Err(Errno::WOULDBLOCK) => return Ok(true),
                Err(Errno::INTR) => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

impl EventSource for SeatInput {
    type Event = KeyEvent;
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
        F: FnMut(KeyEvent, &mut ()),
    {
        let _guard = self.span.clone().entered();
        let mut dead = Vec::new();
        for node in &mut self.nodes {
            let Some(open) = &mut node.open else {
                continue;
            };
            if open.token != Some(token) {
                continue;
            }
            match Self::drain_node(&self.keymap, open, |key| {
                trace!(keycode = key.keycode, state = ?key.state, "key event");
                callback(key, &mut ());
            }) {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    // Terminal failure; drop the device until the monitor
                    // confirms removal or a wake reopens it.
                    warn!(node = %node.path.display(), "evdev node hung up");
                    dead.push(node.path.clone());
                }
            }
        }
        for path in dead {
            self.remove_node(&path);
        }
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        for node in &mut self.nodes {
            if let Some(open) = &mut node.open {
                let token = factory.token();
                open.token = Some(token);
                unsafe { poll.register(&open.fd, Interest::READ, Mode::Level, token)? };
            }
        }
        Ok(())
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        // Registration state after a device set change is rebuilt from
        // scratch: fds that were registered before keep their slot via
        // reregister, new ones are added.
        for node in &mut self.nodes {
            if let Some(open) = &mut node.open {
                let token = factory.token();
                let fresh = open.token.is_none();
                open.token = Some(token);
                if fresh {
                    unsafe { poll.register(&open.fd, Interest::READ, Mode::Level, token)? };
                } else {
                    poll.reregister(&open.fd, Interest::READ, Mode::Level, token)?;
                }
            }
        }
        Ok(())
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        for node in &mut self.nodes {
            if let Some(open) = &mut node.open {
                if open.token.take().is_some() {
                    poll.unregister(open.fd.as_fd())?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_constants_match_evdev() {
        assert_eq!(mem::size_of::<libc::input_event>() % 8, 0);
        assert_eq!(KEY_RELEASED, 0);
        assert_eq!(KEY_PRESSED, 1);
        assert_eq!(KEY_REPEATED, 2);
    }

    #[test]
    fn keycode_offset_is_evdev_to_x() {
        assert_eq!(xkb_keycode(0).raw(), 8);
        assert_eq!(xkb_keycode(30).raw(), 38);
    }
}
