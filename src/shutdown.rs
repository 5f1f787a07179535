//! Cooperative shutdown signal shared by every worker.
//!
//! Each io_uring keeps a poll armed on the eventfd. Triggering writes once and never reads,
//! so the fd stays readable and every ring observes it.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Shutdown {
    triggered: AtomicBool,
    eventfd: OwnedFd,
}

impl Shutdown {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            triggered: AtomicBool::new(false),
            // SAFETY: fd was just returned by eventfd and is owned by nobody else.
            eventfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Ask every worker to stop. Idempotent.
    pub fn trigger(&self) -> io::Result<()> {
        if self.triggered.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let val: u64 = 1;
        let n = unsafe {
            libc::write(
                self.eventfd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    pub fn eventfd(&self) -> RawFd {
        self.eventfd.as_raw_fd()
    }
}
