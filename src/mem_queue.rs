//! In-process queue between dispatch and processing workers.
//!
//! A shared deque plus a semaphore eventfd: every push adds one to the counter, so each
//! completed 8-byte read of the eventfd entitles the reader to exactly one pop. That lets
//! several rings wait on the same queue through ordinary io_uring reads.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, PoisonError};

use crate::envelope::Envelope;

pub struct MemQueue {
    items: Mutex<VecDeque<Envelope>>,
    eventfd: OwnedFd,
}

impl MemQueue {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_SEMAPHORE | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            items: Mutex::new(VecDeque::new()),
            // SAFETY: fd was just returned by eventfd and is owned by nobody else.
            eventfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Enqueue, then wake one reader. Unbounded.
    pub fn push(&self, envelope: Envelope) -> io::Result<()> {
        self.lock().push_back(envelope);
        self.signal()
    }

    /// Take the oldest envelope. Call once per completed eventfd read.
    pub fn pop(&self) -> Option<Envelope> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The fd readers wait on.
    pub fn eventfd(&self) -> RawFd {
        self.eventfd.as_raw_fd()
    }

    fn signal(&self) -> io::Result<()> {
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

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Envelope>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
