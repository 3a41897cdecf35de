//! The cooperative event loop every other module runs on.
//!
//! [`calloop`] provides the epoll reactor and source registration; this
//! module wraps it with the pieces the runtime additionally relies on:
//!
//! - dispatch hooks: *pre-dispatch* fires once before each poll wait,
//!   *idle* hooks fire after event delivery of the same iteration, and
//!   *post-dispatch* hooks fire last;
//! - [`Timer`]: a timerfd source that delivers the coalesced expiration
//!   count instead of one wake-up per expiry;
//! - [`Counter`]: an eventfd source delivering the accumulated count;
//! - [`Signals`]: a signalfd source;
//! - [`ChildReaper`]: SIGCHLD plus a `waitpid` drain;
//! - [`SubLoop`]: a nested reactor that is itself an fd source of its
//!   parent, so a bounded `run` on it cannot starve the parent loop.
//!
//! Everything is strictly single-threaded and cooperative. Handlers run
//! to completion; a handler that needs later work schedules an idle hook.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use calloop::LoopHandle;
use tracing::trace;

mod child;
mod counter;
mod hooks;
mod signals;
mod subloop;
mod timer;

pub use child::{ChildExit, ChildReaper};
pub use counter::Counter;
pub use hooks::{HookId, Idle};
pub use signals::{SignalEvent, Signals};
pub use subloop::{FdEvents, SubLoop, SubSourceId};
pub use timer::Timer;

use hooks::HookList;

/// The event loop driving a vtmux process.
///
/// A thin wrapper around [`calloop::EventLoop`]: fd-based sources are
/// inserted through the calloop [`LoopHandle`] as usual, while the
/// dispatch hooks live here because calloop has no notion of them.
pub struct EventLoop<Data> {
    inner: calloop::EventLoop<'static, Data>,
    hooks: Rc<RefCell<HookList<Data>>>,
    exit: Rc<RefCell<bool>>,
}

impl<Data> std::fmt::Debug for EventLoop<Data> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop").finish_non_exhaustive()
    }
}

impl<Data> EventLoop<Data> {
    /// Creates a new event loop.
    pub fn try_new() -> io::Result<Self> {
        let inner = calloop::EventLoop::try_new().map_err(io::Error::from)?;
        Ok(EventLoop {
            inner,
            hooks: Rc::new(RefCell::new(HookList::new())),
            exit: Rc::new(RefCell::new(false)),
        })
    }

    /// Handle used to insert and remove fd-based sources.
    pub fn handle(&self) -> LoopHandle<'static, Data> {
        self.inner.handle()
    }

    /// Registers a hook invoked once before every poll wait.
    pub fn add_pre_dispatch<F>(&self, cb: F) -> HookId
    where
        F: FnMut(&mut Data) + 'static,
    {
        self.hooks.borrow_mut().add_pre(Box::new(cb))
    }

    /// Registers a hook invoked after event delivery on every iteration.
    pub fn add_idle<F>(&self, cb: F) -> Idle
    where
        F: FnMut(&mut Data) + 'static,
    {
        self.hooks.borrow_mut().add_idle(Box::new(cb), false)
    }

    /// Registers an idle hook that fires on the next iteration only.
    ///
    /// The returned [`Idle`] handle can re-arm it; re-arming while it is
    /// still armed is a no-op, giving single-instance semantics.
    pub fn add_idle_oneshot<F>(&self, cb: F) -> Idle
    where
        F: FnMut(&mut Data) + 'static,
    {
        self.hooks.borrow_mut().add_idle(Box::new(cb), true)
    }

    /// Registers a hook invoked last on every iteration.
    pub fn add_post_dispatch<F>(&self, cb: F) -> HookId
    where
        F: FnMut(&mut Data) + 'static,
    {
        self.hooks.borrow_mut().add_post(Box::new(cb))
    }

    /// Removes a pre- or post-dispatch hook.
    ///
    /// Safe to call from within any hook, including the one being removed.
    pub fn remove_hook(&self, id: HookId) {
        self.hooks.borrow_mut().remove(id);
    }

    /// Performs exactly one loop iteration.
    ///
    /// Ordering within the iteration: pre-dispatch hooks, poll wait plus
    /// event delivery, idle hooks, post-dispatch hooks.
    pub fn dispatch(&mut self, timeout: Option<Duration>, data: &mut Data) -> io::Result<()> {
        HookList::fire_pre(&self.hooks, data);
        self.inner.dispatch(timeout, data).map_err(io::Error::from)?;
        HookList::fire_idle(&self.hooks, data);
        HookList::fire_post(&self.hooks, data);
        Ok(())
    }

    /// Runs the loop until [`EventLoop::exit`] is called or `timeout`
    /// elapses. `None` means run forever.
    pub fn run(&mut self, timeout: Option<Duration>, data: &mut Data) -> io::Result<()> {
        *self.exit.borrow_mut() = false;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let budget = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        trace!("event loop budget elapsed");
                        return Ok(());
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            self.dispatch(budget, data)?;
            if *self.exit.borrow() {
                return Ok(());
            }
        }
    }

    /// Makes the innermost [`EventLoop::run`] return after the current
    /// iteration completes.
    pub fn exit(&self) {
        *self.exit.borrow_mut() = true;
    }

    /// A cloneable handle that can stop the loop from inside handlers.
    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            exit: self.exit.clone(),
        }
    }
}

/// Stops an [`EventLoop`] from within a handler.
#[derive(Debug, Clone)]
pub struct LoopStopper {
    exit: Rc<RefCell<bool>>,
}

impl LoopStopper {
    /// Requests loop exit after the current iteration.
    pub fn exit(&self) {
        *self.exit.borrow_mut() = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn hook_phases_run_in_order() {
        let mut eloop: EventLoop<Vec<&'static str>> = EventLoop::try_new().unwrap();
        eloop.add_pre_dispatch(|log: &mut Vec<&str>| log.push("pre"));
        eloop.add_idle(|log| log.push("idle"));
        eloop.add_post_dispatch(|log| log.push("post"));

        let mut log = Vec::new();
        eloop.dispatch(Some(Duration::ZERO), &mut log).unwrap();
        assert_eq!(log, vec!["pre", "idle", "post"]);

        eloop.dispatch(Some(Duration::ZERO), &mut log).unwrap();
        assert_eq!(log, vec!["pre", "idle", "post", "pre", "idle", "post"]);
    }

    #[test]
    fn oneshot_idle_fires_once_until_rearmed() {
        let mut eloop: EventLoop<u32> = EventLoop::try_new().unwrap();
        let idle = eloop.add_idle_oneshot(|hits: &mut u32| *hits += 1);

        let mut hits = 0;
        eloop.dispatch(Some(Duration::ZERO), &mut hits).unwrap();
        eloop.dispatch(Some(Duration::ZERO), &mut hits).unwrap();
        assert_eq!(hits, 1);

        idle.reschedule();
        idle.reschedule();
        eloop.dispatch(Some(Duration::ZERO), &mut hits).unwrap();
        assert_eq!(hits, 2);
    }

    #[test]
    fn hook_may_remove_itself() {
        let mut eloop: EventLoop<u32> = EventLoop::try_new().unwrap();
        let slot: Rc<RefCell<Option<HookId>>> = Rc::new(RefCell::new(None));
        let id = eloop.add_pre_dispatch({
            let eloop_hooks = eloop.hooks.clone();
            let slot = slot.clone();
            move |hits: &mut u32| {
                *hits += 1;
                if let Some(id) = *slot.borrow() {
                    eloop_hooks.borrow_mut().remove(id);
                }
            }
        });
        *slot.borrow_mut() = Some(id);

        let mut hits = 0;
        eloop.dispatch(Some(Duration::ZERO), &mut hits).unwrap();
        eloop.dispatch(Some(Duration::ZERO), &mut hits).unwrap();
        assert_eq!(hits, 1);
    }

    #[test]
    fn run_honors_exit_from_handler() {
        let mut eloop: EventLoop<()> = EventLoop::try_new().unwrap();
        let exit = eloop.exit.clone();
        eloop.add_idle(move |_| *exit.borrow_mut() = true);
        eloop.run(Some(Duration::from_secs(5)), &mut ()).unwrap();
    }
}
