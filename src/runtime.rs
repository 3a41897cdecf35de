//! Process composition.
//!
//! The [`Runtime`] ties the pieces together: one device monitor and one
//! VT master per process, one [`SeatController`] per seat the login
//! manager announces, and the character-device registry publishing each
//! seat to legacy clients. It also owns the top-level signal policy:
//! SIGTERM and SIGINT exit the loop gracefully, SIGPIPE is ignored, and
//! SIGUSR1/SIGUSR2 are consumed by the VT sub-loop while a real VT is
//! held.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use calloop::{Dispatcher, LoopHandle};
use tracing::{debug, info, warn};

use crate::cdev::CdevRegistry;
use crate::event::{EventLoop, LoopStopper, Signals};
use crate::input::XkbConfig;
use crate::monitor::{DeviceMonitor, MonitorEvent};
use crate::seat::controller::SeatController;
use crate::vt::{VtMaster, TEARDOWN_TIMEOUT};

/// Runtime configuration, usually filled in from the command line.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Listen mode: never claim the real VT, drop vanished seats
    /// silently, keep running with zero seats.
    pub listen: bool,
    /// Switch to our VT immediately on startup.
    pub switch_vt: bool,
    /// Keyboard layout.
    pub xkb_layout: String,
    /// Keyboard variant.
    pub xkb_variant: String,
    /// Keyboard options.
    pub xkb_options: String,
    /// Number of legacy per-VT character nodes to publish per seat.
    pub legacy_vts: u32,
    /// Whether to publish character devices at all.
    pub cdev: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            listen: false,
            switch_vt: true,
            xkb_layout: String::new(),
            xkb_variant: String::new(),
            xkb_options: String::new(),
            legacy_vts: 0,
            cdev: true,
        }
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    handle: LoopHandle<'static, ()>,
    stopper: LoopStopper,
    master: VtMaster,
    registry: CdevRegistry,
    seats: RefCell<HashMap<String, SeatController>>,
    live_seats: Cell<usize>,
}

/// A running vtmux process.
pub struct Runtime {
    eloop: EventLoop<()>,
    monitor: Dispatcher<'static, DeviceMonitor, ()>,
    inner: Rc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("seats", &self.inner.seats.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Builds the runtime: event loop, VT master, device monitor, signal
    /// policy.
    pub fn new(config: RuntimeConfig) -> io::Result<Self> {
        let eloop = EventLoop::try_new()?;
        let handle = eloop.handle();

        // A dying session client must not take the process down with a
        // write to a closed pipe.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let master = VtMaster::new(config.listen)?;
        handle
            .insert_source(master.subloop(), |_, _, _| {})
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;

        let registry = CdevRegistry::new(&handle);

        let inner = Rc::new(RuntimeInner {
            config,
            handle: handle.clone(),
            stopper: eloop.stopper(),
            master,
            registry,
            seats: RefCell::new(HashMap::new()),
            live_seats: Cell::new(0),
        });

        let stopper = eloop.stopper();
        let exit_signals = Signals::new(&[libc::SIGTERM, libc::SIGINT])
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        handle
            .insert_source(exit_signals, move |event, _, _| {
                info!(signal = event.signal, "exit requested");
                stopper.exit();
            })
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;

        let monitor = DeviceMonitor::new()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
        let monitor = Dispatcher::new(monitor, {
            let inner = inner.clone();
            move |event, _, _: &mut ()| inner.handle_monitor_event(event)
        });
        handle
            .register_dispatcher(monitor.clone())
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;

        Ok(Runtime {
            eloop,
            monitor,
            inner,
        })
    }

    /// Runs until SIGTERM/SIGINT or, outside listen mode, until the last
    /// seat hangs up; then tears down with the bounded VT handshake.
    pub fn run(&mut self) -> io::Result<()> {
        let initial = self
            .monitor
            .as_source_mut()
            .scan()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
        for event in initial {
            self.inner.handle_monitor_event(event);
        }

        self.eloop.run(None, &mut ())?;
        self.shutdown()
    }

    fn shutdown(&mut self) -> io::Result<()> {
        info!("shutting down");
        for controller in self.inner.seats.borrow().values() {
            controller.shutdown();
        }
        // Give process-mode VT clients and the kernel handshake a
        // bounded window to acknowledge, then proceed regardless.
        self.inner.master.settle_exits(TEARDOWN_TIMEOUT)?;

        let seats: Vec<SeatController> = self.inner.seats.borrow_mut().drain().map(|(_, c)| c).collect();
        for controller in seats {
            self.inner.registry.remove_seat(controller.seat());
            controller.destroy();
        }
        Ok(())
    }
}

impl RuntimeInner {
    fn handle_monitor_event(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::NewSeat { seat } => self.add_seat(&seat),
            MonitorEvent::FreeSeat { seat } => self.free_seat(&seat),
            MonitorEvent::NewDevice { seat, device } => {
                if let Some(controller) = self.seats.borrow().get(&seat) {
                    controller.add_device(&device);
                }
            }
            MonitorEvent::FreeDevice { seat, device } => {
                if let Some(controller) = self.seats.borrow().get(&seat) {
                    controller.remove_device(&device);
                }
            }
            MonitorEvent::HotplugDevice { seat, device } => {
                if let Some(controller) = self.seats.borrow().get(&seat) {
                    controller.hotplug(&device);
                }
            }
        }
    }

    fn add_seat(&self, name: &str) {
        if self.seats.borrow().contains_key(name) {
            return;
        }
        let xkb = XkbConfig {
            layout: &self.config.xkb_layout,
            variant: &self.config.xkb_variant,
            options: if self.config.xkb_options.is_empty() {
                None
            } else {
                Some(self.config.xkb_options.clone())
            },
            ..XkbConfig::default()
        };
        let controller = match SeatController::new(name, &self.handle, &self.master, &xkb) {
            Ok(controller) => controller,
            Err(err) => {
                warn!(seat = name, "cannot create seat controller: {err}");
                return;
            }
        };

        if self.config.cdev {
            if let Err(err) = self.registry.publish_control(controller.seat()) {
                warn!(seat = name, "no control node: {err}");
            }
            for index in 0..self.config.legacy_vts {
                if let Err(err) = self.registry.publish_legacy(controller.seat(), index) {
                    warn!(seat = name, index, "no legacy node: {err}");
                }
            }
        }

        // Fake VTs have no kernel switch to wait for; real VTs enter via
        // SIGUSR2 once the console switches.
        let _ = controller.with_vt(|vt| {
            if !vt.is_real() || self.config.switch_vt {
                if let Err(kind) = vt.activate() {
                    warn!(seat = name, ?kind, "cannot activate VT");
                }
            }
        });

        info!(seat = name, "seat added");
        self.live_seats.set(self.live_seats.get() + 1);
        self.seats
            .borrow_mut()
            .insert(name.to_string(), controller);
    }

    fn free_seat(&self, name: &str) {
        let Some(controller) = self.seats.borrow_mut().remove(name) else {
            return;
        };
        self.registry.remove_seat(controller.seat());
        controller.destroy();
        info!(seat = name, "seat removed");

        if self.config.listen {
            // Listen mode outlives its seats.
            return;
        }
        let left = self.live_seats.get().saturating_sub(1);
        self.live_seats.set(left);
        debug!(live = left, "live seat count");
        if left == 0 {
            self.stopper.exit();
        }
    }
}
