use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::warn;

/// Interrupts a loop that is blocked in its poller.
///
/// The read side of an `eventfd(2)` rides the loop as an ordinary channel,
/// registered right next to the sockets and the timerfd; its read callback
/// is [`drain`]. Cross-thread callers (`LoopHandle::queue_in_loop`,
/// `quit`) bump the counter with [`wake`], the poller reports the fd
/// readable, and the loop services its pending-task list in the same
/// iteration.
///
/// [`wake`]: Waker::wake
/// [`drain`]: Waker::drain
pub(crate) struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` ensures the fd is valid.
        Ok(Waker {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Bump the counter; callable from any thread.
    ///
    /// The kernel refuses the add only when the counter is one step from
    /// overflow, meaning the loop has not drained in 2^64-2 wakes. Emptying
    /// the counter and retrying keeps the readiness edge from being lost.
    pub(crate) fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        loop {
            match syscall!(write(
                self.fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                size_of::<u64>(),
            )) {
                Ok(_) => return Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => self.drain(),
                Err(err) => return Err(err),
            }
        }
    }

    /// Zero the counter. Runs as the wakeup channel's read callback; one
    /// drain acknowledges any number of coalesced wakes.
    pub(crate) fn drain(&self) {
        let mut count: u64 = 0;
        match syscall!(read(
            self.fd.as_raw_fd(),
            &mut count as *mut u64 as *mut libc::c_void,
            size_of::<u64>(),
        )) {
            Ok(n) if n as usize == size_of::<u64>() => {}
            Ok(n) => warn!("wakeup fd read returned {} bytes", n),
            // Raced with another drain; the wake was already consumed.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => warn!("wakeup fd read: {}", err),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
