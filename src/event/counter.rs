//! Semantic counter source backed by an eventfd.

use std::io;
use std::os::unix::io::{AsFd, OwnedFd};

use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use rustix::event::{eventfd, EventfdFlags};
use rustix::io::Errno;

/// An accumulating counter.
///
/// [`Counter::add`] increments it; once the loop dispatches, the handler
/// receives the accumulated value and the counter resets to zero.
#[derive(Debug)]
pub struct Counter {
    fd: OwnedFd,
    token: Option<Token>,
}

impl Counter {
    /// Creates a counter starting at zero.
    pub fn new() -> io::Result<Self> {
        let fd = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)?;
        Ok(Counter { fd, token: None })
    }

    /// Adds `value` to the counter. A value of zero is a no-op.
    pub fn add(&self, value: u64) -> io::Result<()> {
        if value == 0 {
            return Ok(());
        }
        rustix::io::write(&self.fd, &value.to_ne_bytes())?;
        Ok(())
    }
}

impl EventSource for Counter {
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
        let mut buf = [0u8; 8];
        match rustix::io::read(&self.fd, &mut buf) {
            Ok(8) => {
                let value = u64::from_ne_bytes(buf);
                if value > 0 {
                    callback(value, &mut ());
                }
            }
            Ok(_) | Err(Errno::WOULDBLOCK) | Err(Errno::INTR) => {}
            Err(err) => return Err(err.into()),
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
    fn increments_accumulate_until_dispatch() {
        let mut eloop: calloop::EventLoop<'_, Vec<u64>> = calloop::EventLoop::try_new().unwrap();
        let counter = Counter::new().unwrap();
        let adder = Counter {
            fd: counter.fd.try_clone().unwrap(),
            token: None,
        };
        eloop
            .handle()
            .insert_source(counter, |value, _, seen: &mut Vec<u64>| seen.push(value))
            .unwrap();

        adder.add(3).unwrap();
        adder.add(4).unwrap();

        let mut seen = Vec::new();
        eloop.dispatch(Some(Duration::ZERO), &mut seen).unwrap();
        assert_eq!(seen, vec![7]);

        eloop.dispatch(Some(Duration::ZERO), &mut seen).unwrap();
        assert_eq!(seen, vec![7]);
    }
}
