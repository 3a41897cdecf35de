//! Login-manager seat stream.
//!
//! systemd-logind publishes one entry per seat under `/run/systemd/seats`.
//! The watcher holds an inotify fd on that directory and diffs its
//! contents on every wake-up; hosts without a seat manager get no watcher
//! and the monitor synthesizes a single static `seat0` instead.

use std::collections::HashSet;
use std::io;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use rustix::fs::inotify;
use rustix::io::Errno;
use tracing::trace;

pub(super) const SEAT_DIR: &str = "/run/systemd/seats";

/// Diff of the seat directory since the previous drain.
#[derive(Debug, Default)]
pub(super) struct SeatDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug)]
pub(super) struct SeatWatcher {
    fd: OwnedFd,
    dir: PathBuf,
    seats: HashSet<String>,
}

impl SeatWatcher {
    /// Opens a watcher on `dir`; `None` if no seat manager is present.
    pub(super) fn new(dir: &Path) -> io::Result<Option<Self>> {
        if !dir.is_dir() {
            return Ok(None);
        }
        let fd = inotify::inotify_init(inotify::CreateFlags::CLOEXEC | inotify::CreateFlags::NONBLOCK)?;
        inotify::inotify_add_watch(
            &fd,
            dir,
            inotify::WatchFlags::CREATE
                | inotify::WatchFlags::DELETE
                | inotify::WatchFlags::MOVED_FROM
                | inotify::WatchFlags::MOVED_TO,
        )?;
        Ok(Some(SeatWatcher {
            fd,
            dir: dir.to_path_buf(),
            seats: HashSet::new(),
        }))
    }

    pub(super) fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Known seats, in unspecified order.
    pub(super) fn seats(&self) -> impl Iterator<Item = &str> {
        self.seats.iter().map(String::as_str)
    }

    fn scan(dir: &Path) -> HashSet<String> {
        let mut seats = HashSet::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                if let Ok(name) = entry.file_name().into_string() {
                    seats.insert(name);
                }
            }
        }
        seats
    }

    /// Consumes pending inotify events and returns the seat diff.
    pub(super) fn drain(&mut self) -> io::Result<SeatDiff> {
        let mut buf = [0u8; 4096];
        loop {
            match rustix::io::read(&self.fd, &mut buf) {
                Ok(0) | Err(Errno::WOULDBLOCK) => break,
                Ok(_) => continue,
                Err(Errno::INTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(self.rescan())
    }

    /// Re-reads the directory and diffs against the cached seat set.
    pub(super) fn rescan(&mut self) -> SeatDiff {
        let now = Self::scan(&self.dir);
        let mut diff = SeatDiff::default();
        for seat in now.difference(&self.seats) {
            trace!(seat, "seat appeared");
            diff.added.push(seat.clone());
        }
        for seat in self.seats.difference(&now) {
            trace!(seat, "seat vanished");
            diff.removed.push(seat.clone());
        }
        self.seats = now;
        diff.added.sort();
        diff.removed.sort();
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescan_diffs_directory_contents() {
        let dir = std::env::temp_dir().join(format!("vtmux-seats-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut watcher = SeatWatcher::new(&dir).unwrap().unwrap();

        let diff = watcher.rescan();
        assert!(diff.added.is_empty() && diff.removed.is_empty());

        std::fs::write(dir.join("seat0"), b"").unwrap();
        std::fs::write(dir.join("seat1"), b"").unwrap();
        let diff = watcher.drain().unwrap();
        assert_eq!(diff.added, vec!["seat0".to_string(), "seat1".to_string()]);
        assert!(diff.removed.is_empty());

        std::fs::remove_file(dir.join("seat1")).unwrap();
        let diff = watcher.drain().unwrap();
        assert!(diff.added.is_empty());
        assert_eq!(diff.removed, vec!["seat1".to_string()]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
