#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![allow(clippy::upper_case_acronyms)]

//! # vtmux: a user-space virtual terminal runtime
//!
//! This crate replaces the kernel virtual terminal with a user-space seat
//! runtime: it takes ownership of a seat's graphics outputs (DRM/KMS or
//! fbdev), its input devices (evdev via udev) and the VT-switching rights,
//! and multiplexes them across logical *sessions* (terminal emulators,
//! compositors, splash screens), of which at most one is foreground per
//! seat at any time.
//!
//! ## Structure of the crate
//!
//! Everything runs on a single-threaded [`calloop`]-based reactor, wrapped
//! by [`event`] which adds dispatch hooks, timers, counters, signal
//! delivery, child reaping and nested sub-loops. [`monitor`] tracks
//! seat-tagged devices through udev and the login manager. Per seat,
//! [`input`] aggregates evdev keyboards behind an xkb keymap, [`video`]
//! drives the DRM/fbdev display backends, and [`seat`] holds the session
//! scheduler and the controller wiring it all together. [`vt`] provides
//! kernel-VT-compatible session semantics (mode, keyboard mode,
//! `VT_SETMODE`, the release/acquire handshake), and [`cdev`] exposes each
//! VT session to unmodified legacy clients as a character device.
//!
//! Terminal emulation, font handling and rendering front-ends are out of
//! scope; sessions bring their own.
//!
//! ## The event loop and state handling
//!
//! vtmux follows the same callback-oriented structure as a calloop-based
//! compositor: waiting for events and reacting to them. Components that
//! produce events implement [`calloop::EventSource`] and are inserted into
//! the loop by the [`runtime`], which also owns the top-level signal
//! policy (SIGTERM/SIGINT exit, SIGPIPE ignored, SIGUSR1/2 for kernel VT
//! switching).

pub mod cdev;
pub mod error;
pub mod event;
pub mod input;
pub mod monitor;
pub mod runtime;
pub mod seat;
pub mod utils;
pub mod video;
pub mod vt;

/// Re-exports of the crates forming this crate's public API surface.
pub mod reexports {
    pub use calloop;
    pub use drm;
    pub use gbm;
    pub use rustix;
    pub use udev;
    pub use xkbcommon;
}
