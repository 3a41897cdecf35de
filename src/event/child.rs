//! Child reaping driven by SIGCHLD.

use std::io;

use calloop::{EventSource, Poll, PostAction, Readiness, Token, TokenFactory};

use super::signals::Signals;

/// A reaped child.
#[derive(Debug, Clone, Copy)]
pub struct ChildExit {
    /// Pid of the exited child.
    pub pid: i32,
    /// Raw wait status, as produced by `waitpid`.
    pub status: i32,
}

/// Event source reaping exited children.
///
/// SIGCHLD only signals *that* children exited, not how many; every
/// wake-up drains all reapable children, so a single dispatch may deliver
/// several [`ChildExit`] events.
#[derive(Debug)]
pub struct ChildReaper {
    signals: Signals,
}

impl ChildReaper {
    /// Creates the reaper, blocking SIGCHLD for this thread.
    pub fn new() -> io::Result<Self> {
        Ok(ChildReaper {
            signals: Signals::new(&[libc::SIGCHLD])?,
        })
    }

    fn drain<F>(mut callback: F)
    where
        F: FnMut(ChildExit),
    {
        loop {
            let mut status = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            callback(ChildExit { pid, status });
        }
    }
}

impl EventSource for ChildReaper {
    type Event = ChildExit;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: F,
    ) -> io::Result<PostAction>
    where
        F: FnMut(ChildExit, &mut ()),
    {
        self.signals.process_events(readiness, token, |_, _| {})?;
        Self::drain(|exit| callback(exit, &mut ()));
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.signals.register(poll, factory)
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.signals.reregister(poll, factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.signals.unregister(poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::Duration;

    #[test]
    fn drain_reaps_exited_children() {
        let _guard = Signals::new(&[libc::SIGCHLD]).unwrap();
        let child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;

        let mut reaped = Vec::new();
        for _ in 0..100 {
            ChildReaper::drain(|exit| reaped.push(exit.pid));
            if reaped.contains(&pid) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("child {pid} was never reaped");
    }
}
