//! Monotonic timer source backed by a timerfd.

use std::io;
use std::os::unix::io::{AsFd, OwnedFd};
use std::time::Duration;

use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use rustix::io::Errno;
use rustix::time::{
    timerfd_create, timerfd_settime, Itimerspec, TimerfdClockId, TimerfdFlags, TimerfdTimerFlags,
    Timespec,
};

fn timespec(duration: Duration) -> Timespec {
    Timespec {
        tv_sec: duration.as_secs() as i64,
        tv_nsec: duration.subsec_nanos() as i64,
    }
}

/// A relative monotonic timer.
///
/// Expirations are coalesced: if the timer fired `N` times while the loop
/// was busy, the handler is invoked once with `N`.
#[derive(Debug)]
pub struct Timer {
    fd: OwnedFd,
    token: Option<Token>,
}

impl Timer {
    /// Creates a disarmed timer.
    pub fn new() -> io::Result<Self> {
        let fd = timerfd_create(
            TimerfdClockId::Monotonic,
            TimerfdFlags::CLOEXEC | TimerfdFlags::NONBLOCK,
        )?;
        Ok(Timer { fd, token: None })
    }

    /// Creates a timer firing once after `delay`.
    pub fn oneshot(delay: Duration) -> io::Result<Self> {
        let timer = Timer::new()?;
        timer.set_oneshot(delay)?;
        Ok(timer)
    }

    /// Creates a timer firing after `initial` and every `interval` after.
    pub fn repeating(initial: Duration, interval: Duration) -> io::Result<Self> {
        let timer = Timer::new()?;
        timer.set(initial, interval)?;
        Ok(timer)
    }

    /// Arms the timer to fire once after `delay`.
    ///
    /// A zero delay still fires (on the next loop iteration) rather than
    /// disarming, which is what a zero `it_value` would mean to the fd.
    pub fn set_oneshot(&self, delay: Duration) -> io::Result<()> {
        let delay = if delay.is_zero() {
            Duration::from_nanos(1)
        } else {
            delay
        };
        self.set(delay, Duration::ZERO)
    }

    /// Arms the timer with an initial delay and a repeat interval.
    pub fn set(&self, initial: Duration, interval: Duration) -> io::Result<()> {
        timerfd_settime(
            &self.fd,
            TimerfdTimerFlags::empty(),
            &Itimerspec {
                it_interval: timespec(interval),
                it_value: timespec(initial),
            },
        )?;
        Ok(())
    }

    /// Disarms the timer. A disarmed timer stays registered.
    pub fn disarm(&self) -> io::Result<()> {
        self.set(Duration::ZERO, Duration::ZERO)
    }

    /// Duplicates the handle. Both handles arm the same kernel timer, so
    /// one can live in the event loop while the other re-arms it.
    pub fn try_clone(&self) -> io::Result<Timer> {
        Ok(Timer {
            fd: self.fd.try_clone()?,
            token: None,
        })
    }

    fn drain(&self) -> io::Result<u64> {
        let mut total = 0u64;
        loop {
            let mut buf = [0u8; 8];
            match rustix::io::read(&self.fd, &mut buf) {
                Ok(8) => total += u64::from_ne_bytes(buf),
                Ok(_) => break,
                Err(Errno::WOULDBLOCK) => break,
                Err(Errno::INTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(total)
    }
}

impl EventSource for Timer {
    type Event = u64;
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
        F: FnMut(u64, &mut ()),
    {
        if Some(token) != self.token {
            return Ok(PostAction::Continue);
        }
        let expirations = self.drain()?;
        if expirations > 0 {
            callback(expirations, &mut ());
        }
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.token = Some(factory.token());
        unsafe { poll.register(&self.fd, Interest::READ, Mode::Level, self.token.unwrap()) }
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.token = Some(factory.token());
        poll.reregister(&self.fd, Interest::READ, Mode::Level, self.token.unwrap())
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.token = None;
        poll.unregister(self.fd.as_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expirations_are_coalesced() {
        let mut eloop: calloop::EventLoop<'_, u64> = calloop::EventLoop::try_new().unwrap();
        let timer = Timer::repeating(Duration::from_millis(1), Duration::from_millis(1)).unwrap();
        eloop
            .handle()
            .insert_source(timer, |count, _, seen: &mut u64| *seen += count)
            .unwrap();

        std::thread::sleep(Duration::from_millis(20));

        let mut seen = 0;
        eloop.dispatch(Some(Duration::ZERO), &mut seen).unwrap();
        assert!(seen > 1, "expected coalesced count, got {seen}");
    }

    #[test]
    fn zero_oneshot_still_fires() {
        let mut eloop: calloop::EventLoop<'_, u64> = calloop::EventLoop::try_new().unwrap();
        let timer = Timer::oneshot(Duration::ZERO).unwrap();
        eloop
            .handle()
            .insert_source(timer, |count, _, seen: &mut u64| *seen += count)
            .unwrap();

        let mut seen = 0;
        eloop
            .dispatch(Some(Duration::from_millis(100)), &mut seen)
            .unwrap();
        assert_eq!(seen, 1);
    }
}
