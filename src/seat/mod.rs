//! Seats and the session scheduler.
//!
//! A [`Seat`] owns an ordered list of sessions of which at most one is
//! foreground. Transitions are asynchronous: deactivating a session may
//! return *in-progress* (a VT client gets to acknowledge the hand-off
//! first), in which case the scheduler parks exactly one pending task —
//! switch, sleep or unregister — and completes it when
//! [`Seat::notify_deactivated`] arrives.
//!
//! The scheduler never calls back into itself: session callbacks are
//! invoked with no internal borrows held, and a callback that re-enters
//! `schedule`/`pause`/`run` while they are on the stack is refused with
//! *busy* instead of corrupting state.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::{debug, info_span, trace, warn};

use crate::error::ErrorKind;

pub mod controller;

/// Events delivered to a session by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session becomes foreground.
    Activate,
    /// The session shall leave the foreground.
    Deactivate,
    /// The session was removed from its seat.
    Unregister,
}

/// Reply of a session callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionReply {
    /// The event was handled synchronously.
    Ok,
    /// Deactivation started; [`Seat::notify_deactivated`] will follow.
    InProgress,
    /// The event failed.
    Failed(ErrorKind),
}

/// Seat-level events delivered to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatEvent {
    /// A session became foreground.
    Foreground,
    /// The foreground session was dropped.
    Background,
    /// The seat went to sleep.
    Sleep,
    /// The seat woke up.
    Wake,
}

/// The one-slot memo of what to do once an in-progress deactivation
/// completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum AsyncTask {
    #[default]
    None,
    Switch,
    Sleep,
    Unregister,
}

type SessionCallback = Box<dyn FnMut(SessionEvent) -> SessionReply>;

struct SessionInner {
    seat: Weak<SeatInner>,
    id: u32,
    enabled: Cell<bool>,
    deactivating: Cell<bool>,
    shadowed: Cell<bool>,
    dummy: bool,
    registered: Cell<bool>,
    cb: RefCell<SessionCallback>,
}

/// Handle to a registered session.
#[derive(Clone)]
pub struct SeatSession {
    inner: Rc<SessionInner>,
}

impl std::fmt::Debug for SeatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeatSession")
            .field("id", &self.inner.id)
            .field("enabled", &self.inner.enabled.get())
            .field("dummy", &self.inner.dummy)
            .finish_non_exhaustive()
    }
}

impl SeatSession {
    /// Numeric id; `0` means the session was appended unnumbered.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Whether the scheduler may pick this session.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.get()
    }

    /// Whether another session with the same id registered earlier.
    pub fn is_shadowed(&self) -> bool {
        self.inner.shadowed.get()
    }

    /// Whether a deactivation of this session is in flight.
    pub fn is_deactivating(&self) -> bool {
        self.inner.deactivating.get()
    }

    /// Enables the session and reschedules the seat.
    pub fn enable(&self) -> Result<(), ErrorKind> {
        self.inner.enabled.set(true);
        if let Some(seat) = self.inner.seat.upgrade() {
            let seat = Seat { inner: seat };
            seat.reschedule_and_run()?;
        }
        Ok(())
    }

    /// Disables the session. A disabled foreground stays foreground
    /// until it is paused; it just will not be re-chosen.
    pub fn disable(&self) {
        self.inner.enabled.set(false);
    }

    fn same(&self, other: &Rc<SessionInner>) -> bool {
        Rc::ptr_eq(&self.inner, other)
    }
}

/// Configuration for [`Seat::register_session`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    /// Requested id; `0` appends behind all numbered sessions.
    pub id: u32,
    /// Whether the session starts enabled.
    pub enabled: bool,
    /// Whether this is the seat's background fallback.
    pub dummy: bool,
}

struct SeatState {
    awake: bool,
    sessions: Vec<Rc<SessionInner>>,
    current: Option<Rc<SessionInner>>,
    scheduled: Option<Rc<SessionInner>>,
    dummy: Option<Rc<SessionInner>>,
    async_task: AsyncTask,
}

type SeatCallback = Box<dyn FnMut(SeatEvent)>;

struct SeatInner {
    name: String,
    state: RefCell<SeatState>,
    cb: RefCell<SeatCallback>,
    in_dispatch: Cell<bool>,
    span: tracing::Span,
}

/// A seat: one set of input and output devices, at most one foreground
/// session. Cheaply cloneable handle.
#[derive(Clone)]
pub struct Seat {
    inner: Rc<SeatInner>,
}

impl std::fmt::Debug for Seat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Seat")
            .field("name", &self.inner.name)
            .field("awake", &state.awake)
            .field("sessions", &state.sessions.len())
            .field("foreground", &state.current.is_some())
            .finish_non_exhaustive()
    }
}

// Guard restoring the dispatch flag on every exit path.
struct DispatchGuard<'a>(&'a Cell<bool>);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Seat {
    /// Creates a seat. `cb` receives the seat-level events the
    /// controller reflects into input and video backends.
    pub fn new<F>(name: &str, cb: F) -> Self
    where
        F: FnMut(SeatEvent) + 'static,
    {
        Seat {
            inner: Rc::new(SeatInner {
                name: name.to_string(),
                state: RefCell::new(SeatState {
                    awake: false,
                    sessions: Vec::new(),
                    current: None,
                    scheduled: None,
                    dummy: None,
                    async_task: AsyncTask::None,
                }),
                cb: RefCell::new(Box::new(cb)),
                in_dispatch: Cell::new(false),
                span: info_span!("seat", name),
            }),
        }
    }

    /// The seat name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the seat is awake.
    pub fn is_awake(&self) -> bool {
        self.inner.state.borrow().awake
    }

    /// The current foreground session.
    pub fn foreground(&self) -> Option<SeatSession> {
        self.inner
            .state
            .borrow()
            .current
            .clone()
            .map(|inner| SeatSession { inner })
    }

    /// Whether `session` is this seat's foreground.
    pub fn is_foreground(&self, session: &SeatSession) -> bool {
        self.inner
            .state
            .borrow()
            .current
            .as_ref()
            .map_or(false, |current| session.same(current))
    }

    fn emit(&self, event: SeatEvent) {
        trace!(parent: &self.inner.span, ?event, "seat event");
        (self.inner.cb.borrow_mut())(event);
    }

    fn guard(&self) -> Result<DispatchGuard<'_>, ErrorKind> {
        if self.inner.in_dispatch.get() {
            return Err(ErrorKind::Busy);
        }
        self.inner.in_dispatch.set(true);
        Ok(DispatchGuard(&self.inner.in_dispatch))
    }

    fn invoke(session: &Rc<SessionInner>, event: SessionEvent) -> SessionReply {
        (session.cb.borrow_mut())(event)
    }

    /// Registers a session. Sessions with non-zero ids are kept sorted
    /// ascending; id `0` appends behind every numbered session. A second
    /// session with an already-used id is permitted but shadowed.
    pub fn register_session<F>(&self, config: SessionConfig, cb: F) -> Result<SeatSession, ErrorKind>
    where
        F: FnMut(SessionEvent) -> SessionReply + 'static,
    {
        let _guard = self.guard()?;
        let inner = Rc::new(SessionInner {
            seat: Rc::downgrade(&self.inner),
            id: config.id,
            enabled: Cell::new(config.enabled),
            deactivating: Cell::new(false),
            shadowed: Cell::new(false),
            dummy: config.dummy,
            registered: Cell::new(true),
            cb: RefCell::new(Box::new(cb)),
        });

        {
            let mut state = self.inner.state.borrow_mut();
            if config.id != 0 {
                if state.sessions.iter().any(|s| s.id == config.id) {
                    inner.shadowed.set(true);
                }
                let pos = state
                    .sessions
                    .iter()
                    .position(|s| s.id == 0 || s.id > config.id)
                    .unwrap_or(state.sessions.len());
                state.sessions.insert(pos, inner.clone());
            } else {
                state.sessions.push(inner.clone());
            }
            if config.dummy && state.dummy.is_none() {
                state.dummy = Some(inner.clone());
            }
        }

        let session = SeatSession { inner };
        debug!(parent: &self.inner.span, id = config.id, dummy = config.dummy, shadowed = session.is_shadowed(), "session registered");

        // A freshly enabled session takes over an idle seat or one only
        // showing the fallback.
        let takeover = {
            let state = self.inner.state.borrow();
            config.enabled
                && !config.dummy
                && state
                    .current
                    .as_ref()
                    .map_or(true, |current| current.dummy)
        };
        drop(_guard);
        // Activation problems do not undo the registration; the seat is
        // simply left idle (or mid-handshake) until external input.
        let started = if takeover {
            self.schedule(&session)
        } else if config.enabled {
            self.reschedule_and_run()
        } else {
            Ok(())
        };
        match started {
            Ok(()) | Err(ErrorKind::InProgress) => {}
            Err(kind) => {
                warn!(parent: &self.inner.span, ?kind, "session did not start")
            }
        }
        Ok(session)
    }

    /// Removes a session from the seat.
    ///
    /// A foreground session is force-paused first; in that case the
    /// scheduler deliberately does not advance to another session until
    /// external input arrives.
    pub fn unregister_session(&self, session: &SeatSession) -> Result<(), ErrorKind> {
        let guard = self.guard()?;
        if !session.inner.registered.replace(false) {
            return Err(ErrorKind::NotFound);
        }

        let was_current = {
            let mut state = self.inner.state.borrow_mut();
            let was_current = state
                .current
                .as_ref()
                .map_or(false, |current| session.same(current));
            state.sessions.retain(|s| !session.same(s));
            if state
                .scheduled
                .as_ref()
                .map_or(false, |scheduled| session.same(scheduled))
            {
                state.scheduled = None;
            }
            if state
                .dummy
                .as_ref()
                .map_or(false, |dummy| session.same(dummy))
            {
                state.dummy = None;
            }
            was_current
        };

        if was_current {
            self.pause_locked(true, AsyncTask::None);
            self.reschedule();
        } else {
            self.reschedule();
            let _ = self.run_locked();
        }
        drop(guard);

        Self::invoke(&session.inner, SessionEvent::Unregister);
        debug!(parent: &self.inner.span, id = session.id(), "session unregistered");
        Ok(())
    }

    /// Activates the scheduled session if the seat is awake and idle.
    pub fn run(&self) -> Result<(), ErrorKind> {
        let _guard = self.guard()?;
        self.run_locked()
    }

    fn run_locked(&self) -> Result<(), ErrorKind> {
        let next = {
            let state = self.inner.state.borrow();
            if !state.awake || state.current.is_some() {
                return Ok(());
            }
            match &state.scheduled {
                Some(next) => next.clone(),
                None => return Ok(()),
            }
        };

        // The session is foreground for the duration of its own ACTIVATE
        // callback; a failure rolls this back.
        self.inner.state.borrow_mut().current = Some(next.clone());
        match Self::invoke(&next, SessionEvent::Activate) {
            SessionReply::Ok => {
                self.emit(SeatEvent::Foreground);
                Ok(())
            }
            reply => {
                self.inner.state.borrow_mut().current = None;
                // No automatic advance: the failed session may still
                // hold resources the next candidate needs.
                let kind = match reply {
                    SessionReply::Failed(kind) => kind,
                    _ => ErrorKind::DeviceFault,
                };
                warn!(parent: &self.inner.span, ?kind, "session activation failed");
                Err(kind)
            }
        }
    }

    fn pause_locked(&self, force: bool, task: AsyncTask) -> Result<(), ErrorKind> {
        let current = {
            let state = self.inner.state.borrow();
            match &state.current {
                Some(current) => current.clone(),
                None => return Ok(()),
            }
        };

        if current.deactivating.get() && !force {
            // A handshake is already in flight; just repark the task.
            self.inner.state.borrow_mut().async_task = task;
            return Err(ErrorKind::InProgress);
        }
        current.deactivating.set(true);
        let reply = Self::invoke(&current, SessionEvent::Deactivate);

        match reply {
            SessionReply::Ok => {
                current.deactivating.set(false);
                let mut state = self.inner.state.borrow_mut();
                state.current = None;
                state.async_task = AsyncTask::None;
                drop(state);
                self.emit(SeatEvent::Background);
                Ok(())
            }
            _ if force => {
                current.deactivating.set(false);
                let mut state = self.inner.state.borrow_mut();
                state.current = None;
                state.async_task = AsyncTask::None;
                drop(state);
                self.emit(SeatEvent::Background);
                Ok(())
            }
            SessionReply::InProgress => {
                self.inner.state.borrow_mut().async_task = task;
                Err(ErrorKind::InProgress)
            }
            SessionReply::Failed(kind) => {
                current.deactivating.set(false);
                self.inner.state.borrow_mut().async_task = task;
                Err(kind)
            }
        }
    }

    /// Re-picks the scheduled session per the ordering rules.
    fn reschedule(&self) {
        let mut state = self.inner.state.borrow_mut();

        if let Some(scheduled) = &state.scheduled {
            if scheduled.enabled.get() {
                return;
            }
        }
        if let Some(current) = &state.current {
            if current.enabled.get() {
                state.scheduled = Some(current.clone());
                return;
            }
        }

        let start = state
            .current
            .as_ref()
            .and_then(|current| state.sessions.iter().position(|s| Rc::ptr_eq(s, current)))
            .map(|pos| pos + 1)
            .unwrap_or(0);
        let len = state.sessions.len();
        let pick = (0..len)
            .map(|offset| &state.sessions[(start + offset) % len])
            .find(|s| s.enabled.get() && !s.dummy)
            .cloned();

        state.scheduled = pick.or_else(|| {
            state
                .dummy
                .clone()
                .filter(|dummy| dummy.enabled.get())
        });
    }

    fn reschedule_and_run(&self) -> Result<(), ErrorKind> {
        let _guard = self.guard()?;
        self.reschedule();
        self.run_locked()
    }

    /// Makes `next` the scheduled session and starts the transition.
    pub fn schedule(&self, next: &SeatSession) -> Result<(), ErrorKind> {
        let guard = self.guard()?;
        {
            let mut state = self.inner.state.borrow_mut();
            state.scheduled = Some(next.inner.clone());
        }
        self.reschedule();

        let switch_needed = {
            let state = self.inner.state.borrow();
            match (&state.scheduled, &state.current) {
                (Some(scheduled), Some(current)) => !Rc::ptr_eq(scheduled, current),
                (Some(_), None) => true,
                (None, _) => false,
            }
        };
        if !switch_needed {
            return Ok(());
        }

        match self.pause_locked(false, AsyncTask::Switch) {
            Ok(()) => self.run_locked(),
            Err(ErrorKind::InProgress) => Err(ErrorKind::InProgress),
            Err(kind) => Err(kind),
        }
        .map(|_| {
            drop(guard);
        })
    }

    /// Schedules the next (or previous) enabled session in list order,
    /// skipping the dummy unless nothing else is enabled.
    pub fn switch_cycle(&self, reverse: bool) -> Result<(), ErrorKind> {
        let pick = {
            let state = self.inner.state.borrow();
            let len = state.sessions.len();
            if len == 0 {
                return Ok(());
            }
            let start = state
                .current
                .as_ref()
                .and_then(|current| state.sessions.iter().position(|s| Rc::ptr_eq(s, current)))
                .unwrap_or(0);
            let mut pick = None;
            for offset in 1..=len {
                let index = if reverse {
                    (start + len - offset % len) % len
                } else {
                    (start + offset) % len
                };
                let candidate = &state.sessions[index];
                if candidate.enabled.get() && !candidate.dummy {
                    pick = Some(candidate.clone());
                    break;
                }
            }
            pick.or_else(|| state.dummy.clone().filter(|dummy| dummy.enabled.get()))
        };
        match pick {
            Some(inner) => self.schedule(&SeatSession { inner }),
            None => Ok(()),
        }
    }

    /// Completion callback for an in-progress deactivation.
    ///
    /// Consumes the pending task exactly once: a pending sleep puts the
    /// seat to sleep, a pending unregister removes the session, anything
    /// else re-runs the scheduler.
    pub fn notify_deactivated(&self, session: &SeatSession) -> Result<(), ErrorKind> {
        let guard = self.guard()?;
        let task = {
            let mut state = self.inner.state.borrow_mut();
            let is_current = state
                .current
                .as_ref()
                .map_or(false, |current| session.same(current));
            if !is_current {
                return Err(ErrorKind::NotFound);
            }
            state.current = None;
            std::mem::take(&mut state.async_task)
        };
        session.inner.deactivating.set(false);
        self.emit(SeatEvent::Background);
        self.reschedule();

        match task {
            AsyncTask::Sleep => {
                self.go_asleep_locked(false)?;
                Ok(())
            }
            AsyncTask::Unregister => {
                drop(guard);
                self.unregister_session(session)
            }
            AsyncTask::None | AsyncTask::Switch => self.run_locked(),
        }
    }

    /// Cancellation callback: the client refused to release the VT. The
    /// session stays foreground and the pending task is dropped.
    pub fn notify_refused(&self, session: &SeatSession) -> Result<(), ErrorKind> {
        let _guard = self.guard()?;
        let mut state = self.inner.state.borrow_mut();
        let is_current = state
            .current
            .as_ref()
            .map_or(false, |current| session.same(current));
        if !is_current {
            return Err(ErrorKind::NotFound);
        }
        session.inner.deactivating.set(false);
        state.async_task = AsyncTask::None;
        debug!(parent: &self.inner.span, "session refused to release");
        Ok(())
    }

    /// Pauses the foreground and puts the seat to sleep.
    pub fn sleep(&self, force: bool) -> Result<(), ErrorKind> {
        let guard = self.guard()?;
        let paused = self.pause_locked(force, AsyncTask::Sleep);
        match paused {
            Err(ErrorKind::InProgress) if !force => {
                // Completion runs go_asleep.
                Err(ErrorKind::InProgress)
            }
            _ => {
                self.go_asleep_locked(force)?;
                drop(guard);
                Ok(())
            }
        }
    }

    fn go_asleep_locked(&self, force: bool) -> Result<(), ErrorKind> {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.current.is_some() {
                if !force {
                    return Err(ErrorKind::Busy);
                }
                state.current = None;
            }
            if !state.awake {
                return Ok(());
            }
            state.awake = false;
        }
        self.emit(SeatEvent::Sleep);
        Ok(())
    }

    /// Wakes the seat and activates the scheduled session.
    pub fn wake(&self) -> Result<(), ErrorKind> {
        let _guard = self.guard()?;
        {
            let mut state = self.inner.state.borrow_mut();
            if state.awake {
                return Ok(());
            }
            state.awake = true;
        }
        self.emit(SeatEvent::Wake);
        self.reschedule();
        self.run_locked()
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.inner.state.borrow().sessions.len()
    }

    /// The dominant (earliest-registered) session with `id`, if any.
    pub fn session_by_id(&self, id: u32) -> Option<SeatSession> {
        self.inner
            .state
            .borrow()
            .sessions
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .map(|inner| SeatSession { inner })
    }

    /// Ids of all registered sessions, in list order.
    pub fn session_ids(&self) -> Vec<u32> {
        self.inner
            .state
            .borrow()
            .sessions
            .iter()
            .map(|s| s.id)
            .collect()
    }

    #[cfg(test)]
    fn async_task_pending(&self) -> bool {
        self.inner.state.borrow().async_task != AsyncTask::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Activate(u32),
        Deactivate(u32),
        Unregister(u32),
    }

    #[derive(Default)]
    struct Log {
        calls: RefCell<Vec<Call>>,
        seat_events: RefCell<Vec<SeatEvent>>,
    }

    fn seat_with_log() -> (Seat, Rc<Log>) {
        let log: Rc<Log> = Rc::default();
        let seat = Seat::new("seat0", {
            let log = log.clone();
            move |event| log.seat_events.borrow_mut().push(event)
        });
        (seat, log)
    }

    fn accepting(log: &Rc<Log>, id: u32) -> impl FnMut(SessionEvent) -> SessionReply + 'static {
        let log = log.clone();
        move |event| {
            log.calls.borrow_mut().push(match event {
                SessionEvent::Activate => Call::Activate(id),
                SessionEvent::Deactivate => Call::Deactivate(id),
                SessionEvent::Unregister => Call::Unregister(id),
            });
            SessionReply::Ok
        }
    }

    fn async_deactivate(log: &Rc<Log>, id: u32) -> impl FnMut(SessionEvent) -> SessionReply + 'static {
        let log = log.clone();
        move |event| {
            log.calls.borrow_mut().push(match event {
                SessionEvent::Activate => Call::Activate(id),
                SessionEvent::Deactivate => Call::Deactivate(id),
                SessionEvent::Unregister => Call::Unregister(id),
            });
            if event == SessionEvent::Deactivate {
                SessionReply::InProgress
            } else {
                SessionReply::Ok
            }
        }
    }

    fn register(seat: &Seat, log: &Rc<Log>, id: u32) -> SeatSession {
        seat.register_session(
            SessionConfig {
                id,
                enabled: true,
                dummy: false,
            },
            accepting(log, id),
        )
        .unwrap()
    }

    // S1: cold start, one seat, one session.
    #[test]
    fn cold_start_activates_single_session() {
        let (seat, log) = seat_with_log();
        seat.wake().unwrap();
        let a = register(&seat, &log, 1);

        assert_eq!(&*log.calls.borrow(), &[Call::Activate(1)]);
        assert!(seat.is_foreground(&a));
        assert_eq!(
            &*log.seat_events.borrow(),
            &[SeatEvent::Wake, SeatEvent::Foreground]
        );
    }

    // S2: synchronous switch.
    #[test]
    fn synchronous_switch_orders_calls() {
        let (seat, log) = seat_with_log();
        seat.wake().unwrap();
        let _a = register(&seat, &log, 1);
        let b = seat
            .register_session(
                SessionConfig {
                    id: 2,
                    enabled: true,
                    dummy: false,
                },
                accepting(&log, 2),
            )
            .unwrap();
        log.calls.borrow_mut().clear();

        seat.schedule(&b).unwrap();
        assert_eq!(
            &*log.calls.borrow(),
            &[Call::Deactivate(1), Call::Activate(2)]
        );
        assert!(seat.is_foreground(&b));
    }

    // S3: asynchronous switch.
    #[test]
    fn async_switch_completes_on_notify() {
        let (seat, log) = seat_with_log();
        seat.wake().unwrap();
        let a = seat
            .register_session(
                SessionConfig {
                    id: 1,
                    enabled: true,
                    dummy: false,
                },
                async_deactivate(&log, 1),
            )
            .unwrap();
        let b = seat
            .register_session(
                SessionConfig {
                    id: 2,
                    enabled: true,
                    dummy: false,
                },
                accepting(&log, 2),
            )
            .unwrap();
        log.calls.borrow_mut().clear();

        assert_eq!(seat.schedule(&b), Err(ErrorKind::InProgress));
        assert!(seat.is_foreground(&a));
        assert!(seat.async_task_pending());
        assert_eq!(&*log.calls.borrow(), &[Call::Deactivate(1)]);

        seat.notify_deactivated(&a).unwrap();
        assert!(seat.is_foreground(&b));
        assert!(!seat.async_task_pending());
        assert_eq!(
            &*log.calls.borrow(),
            &[Call::Deactivate(1), Call::Activate(2)]
        );
    }

    // S4: refusal leaves the foreground in place.
    #[test]
    fn refused_release_keeps_foreground() {
        let (seat, log) = seat_with_log();
        seat.wake().unwrap();
        let a = seat
            .register_session(
                SessionConfig {
                    id: 1,
                    enabled: true,
                    dummy: false,
                },
                async_deactivate(&log, 1),
            )
            .unwrap();
        let b = seat
            .register_session(
                SessionConfig {
                    id: 2,
                    enabled: true,
                    dummy: false,
                },
                accepting(&log, 2),
            )
            .unwrap();
        log.calls.borrow_mut().clear();

        assert_eq!(seat.schedule(&b), Err(ErrorKind::InProgress));
        seat.notify_refused(&a).unwrap();
        assert!(seat.is_foreground(&a));
        assert!(!seat.async_task_pending());
        assert!(!a.is_deactivating());
        assert_eq!(&*log.calls.borrow(), &[Call::Deactivate(1)]);
    }

    // S5: forced teardown.
    #[test]
    fn forced_sleep_drops_current_and_emits_sleep_once() {
        let (seat, log) = seat_with_log();
        seat.wake().unwrap();
        let a = seat
            .register_session(
                SessionConfig {
                    id: 1,
                    enabled: true,
                    dummy: false,
                },
                async_deactivate(&log, 1),
            )
            .unwrap();
        log.calls.borrow_mut().clear();
        log.seat_events.borrow_mut().clear();

        seat.sleep(true).unwrap();
        assert_eq!(&*log.calls.borrow(), &[Call::Deactivate(1)]);
        assert!(seat.foreground().is_none());
        assert!(!seat.is_awake());
        let sleeps = log
            .seat_events
            .borrow()
            .iter()
            .filter(|&&event| event == SeatEvent::Sleep)
            .count();
        assert_eq!(sleeps, 1);
        drop(a);
    }

    #[test]
    fn async_sleep_completes_on_notify() {
        let (seat, log) = seat_with_log();
        seat.wake().unwrap();
        let a = seat
            .register_session(
                SessionConfig {
                    id: 1,
                    enabled: true,
                    dummy: false,
                },
                async_deactivate(&log, 1),
            )
            .unwrap();

        assert_eq!(seat.sleep(false), Err(ErrorKind::InProgress));
        assert!(seat.is_awake());
        assert!(seat.is_foreground(&a));

        seat.notify_deactivated(&a).unwrap();
        assert!(!seat.is_awake());
        assert!(seat.foreground().is_none());
    }

    // Invariant 2: asleep implies no foreground.
    #[test]
    fn asleep_never_has_foreground() {
        let (seat, log) = seat_with_log();
        let _a = register(&seat, &log, 1);
        assert!(!seat.is_awake());
        assert!(seat.foreground().is_none());

        seat.wake().unwrap();
        assert!(seat.foreground().is_some());
        seat.sleep(true).unwrap();
        assert!(seat.foreground().is_none());
    }

    // Invariant 3: the later of two schedules wins.
    #[test]
    fn later_schedule_wins() {
        let (seat, log) = seat_with_log();
        seat.wake().unwrap();
        let _a = register(&seat, &log, 1);
        let x = register(&seat, &log, 2);
        let y = register(&seat, &log, 3);

        seat.schedule(&x).unwrap();
        seat.schedule(&y).unwrap();
        assert!(seat.is_foreground(&y));
    }

    // Invariant 5: ordering of ids, with 0 at the tail.
    #[test]
    fn id_zero_goes_to_tail_and_ids_stay_sorted() {
        let (seat, log) = seat_with_log();
        let mk = |id| {
            seat.register_session(
                SessionConfig {
                    id,
                    enabled: false,
                    dummy: false,
                },
                accepting(&log, id),
            )
            .unwrap()
        };
        mk(5);
        mk(0);
        mk(3);
        mk(0);
        mk(4);
        mk(1);
        assert_eq!(seat.session_ids(), vec![1, 3, 4, 5, 0, 0]);
    }

    #[test]
    fn duplicate_id_is_shadowed_and_ordered_after() {
        let (seat, log) = seat_with_log();
        let first = seat
            .register_session(
                SessionConfig {
                    id: 7,
                    enabled: false,
                    dummy: false,
                },
                accepting(&log, 7),
            )
            .unwrap();
        let second = seat
            .register_session(
                SessionConfig {
                    id: 7,
                    enabled: false,
                    dummy: false,
                },
                accepting(&log, 7),
            )
            .unwrap();
        assert!(!first.is_shadowed());
        assert!(second.is_shadowed());
        assert_eq!(seat.session_ids(), vec![7, 7]);
    }

    // Invariant 6: unregistering the current session force-pauses and
    // does not auto-run.
    #[test]
    fn unregister_current_does_not_auto_run() {
        let (seat, log) = seat_with_log();
        seat.wake().unwrap();
        let a = seat
            .register_session(
                SessionConfig {
                    id: 1,
                    enabled: true,
                    dummy: false,
                },
                async_deactivate(&log, 1),
            )
            .unwrap();
        let b = register(&seat, &log, 2);
        log.calls.borrow_mut().clear();

        seat.unregister_session(&a).unwrap();
        assert!(seat.foreground().is_none());
        assert_eq!(
            &*log.calls.borrow(),
            &[Call::Deactivate(1), Call::Unregister(1)]
        );

        // External input advances the seat again.
        seat.run().unwrap();
        assert!(seat.is_foreground(&b));
    }

    #[test]
    fn unregister_background_session_runs_scheduler() {
        let (seat, log) = seat_with_log();
        seat.wake().unwrap();
        let a = register(&seat, &log, 1);
        let b = register(&seat, &log, 2);
        assert!(seat.is_foreground(&a));

        seat.unregister_session(&b).unwrap();
        assert!(seat.is_foreground(&a));
        assert_eq!(seat.session_count(), 1);
    }

    #[test]
    fn pending_task_is_consumed_exactly_once() {
        let (seat, log) = seat_with_log();
        seat.wake().unwrap();
        let a = seat
            .register_session(
                SessionConfig {
                    id: 1,
                    enabled: true,
                    dummy: false,
                },
                async_deactivate(&log, 1),
            )
            .unwrap();
        let b = register(&seat, &log, 2);

        assert_eq!(seat.schedule(&b), Err(ErrorKind::InProgress));
        seat.notify_deactivated(&a).unwrap();
        assert!(!seat.async_task_pending());
        // A second notification is stale.
        assert_eq!(seat.notify_deactivated(&a), Err(ErrorKind::NotFound));
        assert!(seat.is_foreground(&b));
    }

    #[test]
    fn dummy_is_fallback_only() {
        let (seat, log) = seat_with_log();
        seat.wake().unwrap();
        let dummy = seat
            .register_session(
                SessionConfig {
                    id: 0,
                    enabled: true,
                    dummy: true,
                },
                accepting(&log, 99),
            )
            .unwrap();
        seat.run().unwrap();
        assert!(seat.is_foreground(&dummy));

        // A real session takes over from the dummy immediately.
        let a = register(&seat, &log, 1);
        assert!(seat.is_foreground(&a));

        // Cycling skips the dummy while a real session exists.
        let b = register(&seat, &log, 2);
        seat.switch_cycle(false).unwrap();
        assert!(seat.is_foreground(&b));
        seat.switch_cycle(false).unwrap();
        assert!(seat.is_foreground(&a));

        // With the real sessions gone the dummy comes back.
        seat.unregister_session(&a).unwrap();
        seat.unregister_session(&b).unwrap();
        seat.run().unwrap();
        assert!(seat.is_foreground(&dummy));
    }

    #[test]
    fn failed_activation_leaves_seat_idle() {
        let (seat, _log) = seat_with_log();
        seat.wake().unwrap();
        let fail = seat
            .register_session(
                SessionConfig {
                    id: 1,
                    enabled: true,
                    dummy: false,
                },
                |event| match event {
                    SessionEvent::Activate => SessionReply::Failed(ErrorKind::DeviceFault),
                    _ => SessionReply::Ok,
                },
            )
            .unwrap();
        assert!(seat.foreground().is_none());
        assert!(!seat.is_foreground(&fail));

        // The scheduler does not retry by itself.
        assert_eq!(seat.run(), Err(ErrorKind::DeviceFault));
        assert!(seat.foreground().is_none());
    }

    #[test]
    fn reentrant_call_from_callback_is_refused() {
        let (seat, _log) = seat_with_log();
        seat.wake().unwrap();
        let reentered: Rc<RefCell<Option<Result<(), ErrorKind>>>> = Rc::default();
        let seat_clone = seat.clone();
        let observed = reentered.clone();
        seat.register_session(
            SessionConfig {
                id: 1,
                enabled: true,
                dummy: false,
            },
            move |event| {
                if event == SessionEvent::Activate {
                    *observed.borrow_mut() = Some(seat_clone.run());
                }
                SessionReply::Ok
            },
        )
        .unwrap();
        assert_eq!(*reentered.borrow(), Some(Err(ErrorKind::Busy)));
    }
}
