//! Signal delivery through a signalfd.

use std::io;
use std::mem;
use std::os::unix::io::{AsFd, FromRawFd, OwnedFd};
use std::ptr;

use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use rustix::io::Errno;

/// A signal read from the fd, with the sender recorded for protocols that
/// care (the VT acquire/release handshake does not, the child reaper does).
#[derive(Debug, Clone, Copy)]
pub struct SignalEvent {
    /// Signal number.
    pub signal: i32,
    /// Pid of the sender, `0` for kernel-originated signals.
    pub sender_pid: u32,
}

/// Event source delivering a fixed set of signals.
///
/// The signals are blocked for the calling thread on construction so that
/// they reach the fd instead of their default handlers, and unblocked
/// again on drop.
#[derive(Debug)]
pub struct Signals {
    fd: OwnedFd,
    mask: Vec<i32>,
    token: Option<Token>,
}

impl Signals {
    /// Creates a source for `signals`.
    pub fn new(signals: &[i32]) -> io::Result<Self> {
        unsafe {
            let mut set: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut set);
            for &signal in signals {
                if libc::sigaddset(&mut set, signal) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            if libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
            let fd = libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Signals {
                fd: OwnedFd::from_raw_fd(fd),
                mask: signals.to_vec(),
                token: None,
            })
        }
    }
}

impl AsFd for Signals {
    fn as_fd(&self) -> std::os::unix::io::BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Signals {
    /// Reads one pending signal without blocking, for callers that poll
    /// the fd themselves (the VT sub-loop does).
    pub fn try_read(&self) -> io::Result<Option<SignalEvent>> {
        const INFO_SIZE: usize = mem::size_of::<libc::signalfd_siginfo>();
        let mut buf = [0u8; INFO_SIZE];
        loop {
            return match rustix::io::read(&self.fd, &mut buf) {
                Ok(n) if n == INFO_SIZE => {
                    let info: libc::signalfd_siginfo =
                        unsafe { ptr::read_unaligned(buf.as_ptr().cast()) };
                    Ok(Some(SignalEvent {
                        signal: info.ssi_signo as i32,
                        sender_pid: info.ssi_pid,
                    }))
                }
                Ok(_) | Err(Errno::WOULDBLOCK) => Ok(None),
                Err(Errno::INTR) => continue,
                Err(err) => Err(err.into()),
            };
        }
    }
}

impl Drop for Signals {
    fn drop(&mut self) {
        unsafe {
            let mut set: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut set);
            for &signal in &self.mask {
                libc::sigaddset(&mut set, signal);
            }
            libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, ptr::null_mut());
        }
    }
}

impl EventSource for Signals {
    type Event = SignalEvent;
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
        F: FnMut(SignalEvent, &mut ()),
    {
        if Some(token) != self.token {
            return Ok(PostAction::Continue);
        }
        const INFO_SIZE: usize = mem::size_of::<libc::signalfd_siginfo>();
        loop {
            let mut buf = [0u8; INFO_SIZE];
            match rustix::io::read(&self.fd, &mut buf) {
                Ok(n) if n == INFO_SIZE => {
                    let info: libc::signalfd_siginfo =
                        unsafe { ptr::read_unaligned(buf.as_ptr().cast()) };
                    callback(
                        SignalEvent {
                            signal: info.ssi_signo as i32,
                            sender_pid: info.ssi_pid,
                        },
                        &mut (),
                    );
                }
                Ok(_) => break,
                Err(Errno::WOULDBLOCK) => break,
                Err(Errno::INTR) => continue,
                Err(err) => return Err(err.into()),
            }
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
    fn delivers_thread_directed_signal() {
        let mut eloop: calloop::EventLoop<'_, Vec<i32>> = calloop::EventLoop::try_new().unwrap();
        let signals = Signals::new(&[libc::SIGUSR2]).unwrap();
        eloop
            .handle()
            .insert_source(signals, |event, _, seen: &mut Vec<i32>| {
                seen.push(event.signal)
            })
            .unwrap();

        unsafe {
            libc::pthread_kill(libc::pthread_self(), libc::SIGUSR2);
        }

        let mut seen = Vec::new();
        eloop
            .dispatch(Some(Duration::from_millis(500)), &mut seen)
            .unwrap();
        assert_eq!(seen, vec![libc::SIGUSR2]);
    }
}
