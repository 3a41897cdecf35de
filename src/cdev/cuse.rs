//! CUSE wire protocol.
//!
//! A character device served from user space is one open of `/dev/cuse`
//! per device node; the kernel talks FUSE framing over that fd. This
//! module owns the framing only: request parsing, reply encoding and the
//! handful of structs from the kernel ABI. Device semantics live in the
//! registry on top.

use std::io;
use std::mem;
use std::os::unix::io::{AsFd, OwnedFd};
use std::ptr;

use rustix::fs::{Mode as FsMode, OFlags};
use rustix::io::Errno;
use tracing::{debug, trace, warn};

pub(super) const CUSE_DEV: &str = "/dev/cuse";

pub(super) const FUSE_KERNEL_VERSION: u32 = 7;
pub(super) const FUSE_KERNEL_MINOR_VERSION: u32 = 31;

pub(super) const CUSE_UNRESTRICTED_IOCTL: u32 = 1 << 0;

pub(super) const FUSE_OPEN: u32 = 14;
pub(super) const FUSE_READ: u32 = 15;
pub(super) const FUSE_WRITE: u32 = 16;
pub(super) const FUSE_RELEASE: u32 = 18;
pub(super) const FUSE_FLUSH: u32 = 25;
pub(super) const FUSE_INTERRUPT: u32 = 36;
pub(super) const FUSE_DESTROY: u32 = 38;
pub(super) const FUSE_IOCTL: u32 = 39;
pub(super) const FUSE_POLL: u32 = 40;
pub(super) const CUSE_INIT: u32 = 4096;

pub(super) const FUSE_IOCTL_RETRY: u32 = 1 << 2;

pub(super) const FUSE_POLL_SCHEDULE_NOTIFY: u32 = 1 << 0;
pub(super) const FUSE_NOTIFY_POLL: i32 = 1;

pub(super) const POLLIN: u32 = 0x001;
pub(super) const POLLOUT: u32 = 0x004;
pub(super) const POLLHUP: u32 = 0x010;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct InHeader {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct OutHeader {
    len: u32,
    error: i32,
    unique: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct CuseInitIn {
    pub major: u32,
    pub minor: u32,
    pub unused: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct CuseInitOut {
    major: u32,
    minor: u32,
    unused: u32,
    flags: u32,
    max_read: u32,
    max_write: u32,
    dev_major: u32,
    dev_minor: u32,
    spare: [u32; 10],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct OpenIn {
    pub flags: u32,
    pub unused: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct OpenOut {
    fh: u64,
    open_flags: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct ReadIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub read_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct WriteIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub write_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct WriteOut {
    size: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct ReleaseIn {
    pub fh: u64,
    pub flags: u32,
    pub release_flags: u32,
    pub lock_owner: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct IoctlIn {
    pub fh: u64,
    pub flags: u32,
    pub cmd: u32,
    pub arg: u64,
    pub in_size: u32,
    pub out_size: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IoctlOut {
    result: i32,
    flags: u32,
    in_iovs: u32,
    out_iovs: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct IoctlIovec {
    pub base: u64,
    pub len: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct PollIn {
    pub fh: u64,
    pub kh: u64,
    pub flags: u32,
    pub events: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct PollOut {
    revents: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct NotifyPollWakeupOut {
    kh: u64,
}

fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>()) }
}

pub(super) fn read_struct<T: Copy + Default>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < mem::size_of::<T>() {
        return None;
    }
    Some(unsafe { ptr::read_unaligned(bytes.as_ptr().cast()) })
}

/// A parsed request from the kernel.
#[derive(Debug)]
pub(super) struct Request {
    pub header: InHeader,
    pub body: Vec<u8>,
}

impl Request {
    /// The bytes following the fixed-size argument struct `T`.
    pub fn payload<T>(&self) -> &[u8] {
        self.body.get(mem::size_of::<T>()..).unwrap_or(&[])
    }
}

/// One open of `/dev/cuse`, i.e. one published character device.
#[derive(Debug)]
pub(super) struct CuseChannel {
    fd: OwnedFd,
    initialized: bool,
    dev_major: u32,
    dev_minor: u32,
    name: String,
}

impl CuseChannel {
    /// Opens `/dev/cuse` for a device `name` with the given numbers.
    pub fn open(name: &str, dev_major: u32, dev_minor: u32) -> io::Result<Self> {
        let fd = rustix::fs::open(
            CUSE_DEV,
            OFlags::RDWR | OFlags::CLOEXEC | OFlags::NONBLOCK,
            FsMode::empty(),
        )?;
        debug!(name, dev_major, dev_minor, "cuse channel open");
        Ok(CuseChannel {
            fd,
            initialized: false,
            dev_major,
            dev_minor,
            name: name.to_string(),
        })
    }

    pub fn fd(&self) -> &OwnedFd {
        &self.fd
    }

    /// Reads the next request, handling CUSE_INIT internally.
    ///
    /// `Ok(None)` means no request is pending right now.
    pub fn next_request(&mut self) -> io::Result<Option<Request>> {
        // The kernel writes each request in one chunk; the buffer must
        // cover max_write plus headers.
        let mut buf = vec![0u8; 64 * 1024 + 4096];
        let n = loop {
            match rustix::io::read(&self.fd, &mut buf) {
                Ok(n) => break n,
                Err(Errno::WOULDBLOCK) => return Ok(None),
                Err(Errno::INTR) => continue,
                Err(Errno::NODEV) => {
                    // Unmounted; treat as closed.
                    return Err(io::Error::from(io::ErrorKind::BrokenPipe));
                }
                Err(err) => return Err(err.into()),
            }
        };
        let Some(header) = read_struct::<InHeader>(&buf[..n]) else {
            return Ok(None);
        };
        let body = buf[mem::size_of::<InHeader>()..n.min(header.len as usize)].to_vec();
        let request = Request { header, body };
        trace!(opcode = request.header.opcode, unique = request.header.unique, "cuse request");

        if request.header.opcode == CUSE_INIT {
            self.handle_init(&request)?;
            return Ok(None);
        }
        Ok(Some(request))
    }

    fn handle_init(&mut self, request: &Request) -> io::Result<()> {
        let init: CuseInitIn = read_struct(&request.body).unwrap_or_default();
        if init.major < FUSE_KERNEL_VERSION {
            warn!(major = init.major, "kernel fuse ABI too old");
        }
        let out = CuseInitOut {
            major: FUSE_KERNEL_VERSION,
            minor: FUSE_KERNEL_MINOR_VERSION,
            flags: CUSE_UNRESTRICTED_IOCTL,
            max_read: 64 * 1024,
            max_write: 64 * 1024,
            dev_major: self.dev_major,
            dev_minor: self.dev_minor,
            ..Default::default()
        };
        let devname = format!("DEVNAME={}\0", self.name);
        self.send(request.header.unique, 0, &[as_bytes(&out), devname.as_bytes()])?;
        self.initialized = true;
        debug!(name = self.name, "cuse device published");
        Ok(())
    }

    fn send(&self, unique: u64, error: i32, chunks: &[&[u8]]) -> io::Result<()> {
        let payload: usize = chunks.iter().map(|chunk| chunk.len()).sum();
        let header = OutHeader {
            len: (mem::size_of::<OutHeader>() + payload) as u32,
            error,
            unique,
        };
        let mut message = Vec::with_capacity(header.len as usize);
        message.extend_from_slice(as_bytes(&header));
        for chunk in chunks {
            message.extend_from_slice(chunk);
        }
        rustix::io::write(&self.fd, &message)?;
        Ok(())
    }

    /// Replies with a bare errno (0 for success without payload).
    pub fn reply_err(&self, unique: u64, errno: Errno) -> io::Result<()> {
        self.send(unique, -errno.raw_os_error(), &[])
    }

    /// Replies success with no payload.
    pub fn reply_ok(&self, unique: u64) -> io::Result<()> {
        self.send(unique, 0, &[])
    }

    pub fn reply_open(&self, unique: u64, fh: u64) -> io::Result<()> {
        let out = OpenOut {
            fh,
            ..Default::default()
        };
        self.send(unique, 0, &[as_bytes(&out)])
    }

    pub fn reply_read(&self, unique: u64, data: &[u8]) -> io::Result<()> {
        self.send(unique, 0, &[data])
    }

    pub fn reply_write(&self, unique: u64, size: u32) -> io::Result<()> {
        let out = WriteOut {
            size,
            ..Default::default()
        };
        self.send(unique, 0, &[as_bytes(&out)])
    }

    pub fn reply_poll(&self, unique: u64, revents: u32) -> io::Result<()> {
        let out = PollOut {
            revents,
            ..Default::default()
        };
        self.send(unique, 0, &[as_bytes(&out)])
    }

    /// Replies to an unrestricted ioctl with a data-transfer retry: the
    /// kernel re-issues the request copying `in_iovs`/`out_iovs` between
    /// client memory and the fuse message.
    pub fn reply_ioctl_retry(
        &self,
        unique: u64,
        in_iovs: &[IoctlIovec],
        out_iovs: &[IoctlIovec],
    ) -> io::Result<()> {
        let out = IoctlOut {
            result: 0,
            flags: FUSE_IOCTL_RETRY,
            in_iovs: in_iovs.len() as u32,
            out_iovs: out_iovs.len() as u32,
        };
        let mut iovs = Vec::new();
        for iov in in_iovs.iter().chain(out_iovs) {
            iovs.extend_from_slice(as_bytes(iov));
        }
        self.send(unique, 0, &[as_bytes(&out), &iovs])
    }

    /// Replies to an ioctl with a result code and optional out data.
    pub fn reply_ioctl(&self, unique: u64, result: i32, data: &[u8]) -> io::Result<()> {
        let out = IoctlOut {
            result,
            ..Default::default()
        };
        self.send(unique, 0, &[as_bytes(&out), data])
    }

    /// Wakes a poll sleeper previously registered with `kh`.
    pub fn notify_poll(&self, kh: u64) -> io::Result<()> {
        let out = NotifyPollWakeupOut { kh };
        let header = OutHeader {
            len: (mem::size_of::<OutHeader>() + mem::size_of::<NotifyPollWakeupOut>()) as u32,
            error: FUSE_NOTIFY_POLL,
            unique: 0,
        };
        let mut message = Vec::with_capacity(header.len as usize);
        message.extend_from_slice(as_bytes(&header));
        message.extend_from_slice(as_bytes(&out));
        rustix::io::write(&self.fd, &message)?;
        Ok(())
    }
}

impl AsFd for CuseChannel {
    fn as_fd(&self) -> std::os::unix::io::BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layouts_match_kernel_abi() {
        assert_eq!(mem::size_of::<InHeader>(), 40);
        assert_eq!(mem::size_of::<OutHeader>(), 16);
        assert_eq!(mem::size_of::<CuseInitOut>(), 72);
        assert_eq!(mem::size_of::<IoctlIn>(), 32);
        assert_eq!(mem::size_of::<IoctlOut>(), 16);
        assert_eq!(mem::size_of::<PollIn>(), 24);
        assert_eq!(mem::size_of::<ReadIn>(), 40);
        assert_eq!(mem::size_of::<WriteIn>(), 40);
    }

    #[test]
    fn read_struct_rejects_short_buffers() {
        let bytes = [0u8; 8];
        assert!(read_struct::<InHeader>(&bytes).is_none());

        let mut long = vec![0u8; 64];
        long[0] = 40;
        long[4] = 14; // opcode
        let header: InHeader = read_struct(&long).unwrap();
        assert_eq!(header.len, 40);
        assert_eq!(header.opcode, 14);
    }

    #[test]
    fn request_payload_skips_argument_struct() {
        let mut body = vec![0u8; mem::size_of::<WriteIn>()];
        body.extend_from_slice(b"hello");
        let request = Request {
            header: InHeader::default(),
            body,
        };
        assert_eq!(request.payload::<WriteIn>(), b"hello");
    }
}
