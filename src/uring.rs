use std::io;
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, FromRawFd};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use io_uring::{IoUring, opcode, squeue::Entry, types::Fd};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::trace;

use dispatch_http::config::{READ_BUF_SIZE, RING_ENTRIES};
use dispatch_http::envelope::{Completion, Envelope, OpKind, OpOutput, QueueId, Token};
use dispatch_http::error::{SubstrateError, WaitError};
use dispatch_http::mem_queue::MemQueue;
use dispatch_http::shutdown::Shutdown;
use dispatch_http::substrate::Substrate;

/// user_data of the poll each ring keeps armed on the shutdown eventfd. Operation keys are
/// slab indices and never reach it.
const SHUTDOWN_USER_DATA: u64 = u64::MAX;

#[derive(Clone)]
enum QueueEntry {
    Socket(Arc<Socket>),
    Memory(Arc<MemQueue>),
}

/// Process-wide queue descriptors, shared by every worker's ring.
#[derive(Default)]
pub struct QueueTable {
    entries: Mutex<Slab<QueueEntry>>,
}

impl QueueTable {
    fn insert(&self, entry: QueueEntry) -> QueueId {
        QueueId(self.lock().insert(entry) as u32)
    }

    fn get(&self, qd: QueueId) -> Result<QueueEntry, SubstrateError> {
        self.lock()
            .get(qd.0 as usize)
            .cloned()
            .ok_or(SubstrateError::UnknownQueue(qd))
    }

    fn remove(&self, qd: QueueId) -> Result<QueueEntry, SubstrateError> {
        self.lock()
            .try_remove(qd.0 as usize)
            .ok_or(SubstrateError::UnknownQueue(qd))
    }

    fn lock(&self) -> MutexGuard<'_, Slab<QueueEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Reset,
    Aborted,
    Os(i32),
}

fn failure(res: i32) -> Failure {
    match -res {
        libc::ECONNRESET | libc::EPIPE => Failure::Reset,
        libc::ECONNABORTED => Failure::Aborted,
        errno => Failure::Os(errno),
    }
}

/// Results that leave the operation in flight: it is resubmitted as-is. A connection
/// aborted while still in the accept queue belongs to no one yet, so the listener keeps
/// accepting.
fn transient(kind: OpKind, res: i32) -> bool {
    match -res {
        libc::EAGAIN | libc::EINTR => true,
        libc::ECONNABORTED => kind == OpKind::Accept,
        _ => false,
    }
}

/// Buffers an in-flight operation hands to the kernel. They live in the op slab until the
/// token is waited on, so their heap addresses stay valid for the SQE.
enum Io {
    Accept {
        listener: Arc<Socket>,
    },
    Recv {
        socket: Arc<Socket>,
        buf: Box<[u8]>,
    },
    Send {
        socket: Arc<Socket>,
        payload: Vec<u8>,
        pos: usize,
    },
    /// Read of an in-process queue's eventfd; a completed read entitles us to one pop.
    Signal {
        queue: Arc<MemQueue>,
        counter: Box<u64>,
    },
    /// Completed synchronously (in-process writes, empty sends).
    Immediate,
}

impl Io {
    fn sqe(&mut self, key: usize) -> Option<Entry> {
        let entry = match self {
            Io::Accept { listener } => {
                opcode::Accept::new(Fd(listener.as_raw_fd()), ptr::null_mut(), ptr::null_mut())
                    .build()
            }
            Io::Recv { socket, buf } => {
                opcode::Recv::new(Fd(socket.as_raw_fd()), buf.as_mut_ptr(), buf.len() as u32)
                    .build()
            }
            Io::Send {
                socket,
                payload,
                pos,
            } => {
                let rest = &payload[*pos..];
                opcode::Send::new(Fd(socket.as_raw_fd()), rest.as_ptr(), rest.len() as u32)
                    .flags(libc::MSG_NOSIGNAL)
                    .build()
            }
            Io::Signal { queue, counter } => opcode::Read::new(
                Fd(queue.eventfd()),
                &mut **counter as *mut u64 as *mut u8,
                8,
            )
            .build(),
            Io::Immediate => return None,
        };
        Some(entry.user_data(key as u64))
    }
}

struct PendingOp {
    qd: QueueId,
    kind: OpKind,
    io: Io,
    result: Option<Result<OpOutput, Failure>>,
}

/// Push an SQE, flushing the submission queue if full.
fn push_sqe(ring: &mut IoUring, sqe: &Entry) -> Result<(), SubstrateError> {
    loop {
        let result = unsafe { ring.submission().push(sqe) };
        match result {
            Ok(()) => return Ok(()),
            Err(_) => {
                // SQ full, flush pending submissions to kernel and retry
                ring.submit()?;
            }
        }
    }
}

/// [`Substrate`] over one io_uring. One per worker thread; queues come from the shared
/// [`QueueTable`], so a connection accepted on one ring can be written from another.
pub struct UringSubstrate {
    ring: IoUring,
    ops: Slab<PendingOp>,
    table: Arc<QueueTable>,
    cancelled: bool,
}

impl UringSubstrate {
    pub fn new(table: Arc<QueueTable>, shutdown: &Shutdown) -> Result<Self, SubstrateError> {
        let mut ring = IoUring::new(RING_ENTRIES)?;
        let poll = opcode::PollAdd::new(Fd(shutdown.eventfd()), libc::POLLIN as u32)
            .build()
            .user_data(SHUTDOWN_USER_DATA);
        push_sqe(&mut ring, &poll)?;
        Ok(Self {
            ring,
            ops: Slab::new(),
            table,
            cancelled: shutdown.is_triggered(),
        })
    }

    fn submit(&mut self, qd: QueueId, kind: OpKind, mut io: Io) -> Result<Token, SubstrateError> {
        let entry = self.ops.vacant_entry();
        let key = entry.key();
        let sqe = io.sqe(key);
        let result = match io {
            Io::Immediate => Some(Ok(OpOutput::Written)),
            _ => None,
        };
        entry.insert(PendingOp {
            qd,
            kind,
            io,
            result,
        });
        if let Some(sqe) = sqe {
            push_sqe(&mut self.ring, &sqe)?;
        }
        Ok(Token(key as u64))
    }

    /// Block for at least one completion and record every completion available.
    fn reap(&mut self) -> Result<(), SubstrateError> {
        match self.ring.submit_and_wait(1) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let cqes: Vec<(u64, i32)> = self
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();

        for (user_data, result) in cqes {
            if user_data == SHUTDOWN_USER_DATA {
                self.cancelled = true;
                continue;
            }
            self.complete(user_data as usize, result)?;
        }
        Ok(())
    }

    fn complete(&mut self, key: usize, res: i32) -> Result<(), SubstrateError> {
        let Some(op) = self.ops.get_mut(key) else {
            return Ok(());
        };
        if op.result.is_some() {
            return Ok(());
        }
        trace!(qd = %op.qd, kind = ?op.kind, res, "completion");

        let retry = transient(op.kind, res);
        let outcome = match &mut op.io {
            _ if retry => None,
            Io::Accept { .. } if res >= 0 => {
                // SAFETY: a successful accept hands us a fresh fd nobody else owns.
                let socket = unsafe { Socket::from_raw_fd(res) };
                let _ = socket.set_nodelay(true);
                let conn = self.table.insert(QueueEntry::Socket(Arc::new(socket)));
                Some(Ok(OpOutput::Accepted(conn)))
            }
            Io::Recv { buf, .. } if res > 0 => Some(Ok(OpOutput::Read(Envelope::new(
                buf[..res as usize].to_vec(),
            )))),
            // Orderly close by the peer (or by another worker's close).
            Io::Recv { .. } if res == 0 => Some(Err(Failure::Aborted)),
            Io::Send { payload, pos, .. } if res >= 0 => {
                *pos += res as usize;
                (*pos >= payload.len()).then_some(Ok(OpOutput::Written))
            }
            Io::Signal { queue, .. } if res >= 0 => queue.pop().map(|env| Ok(OpOutput::Read(env))),
            _ => Some(Err(failure(res))),
        };

        match outcome {
            Some(result) => {
                op.io = Io::Immediate;
                op.result = Some(result);
            }
            // Partial send, transient errno or empty pop: go again from where we are.
            None => {
                if let Some(sqe) = op.io.sqe(key) {
                    push_sqe(&mut self.ring, &sqe)?;
                }
            }
        }
        Ok(())
    }

    /// Remove and return `token`'s result if it has one.
    fn take(&mut self, index: usize, token: Token) -> Result<Option<Completion>, WaitError> {
        let key = token.0 as usize;
        match self.ops.get(key) {
            None => return Err(SubstrateError::UnknownToken(token).into()),
            Some(op) if op.result.is_none() => return Ok(None),
            Some(_) => {}
        }
        let PendingOp { qd, result, .. } = self.ops.remove(key);
        match result {
            Some(Ok(output)) => Ok(Some(Completion { qd, output })),
            Some(Err(Failure::Reset)) => Err(WaitError::ConnReset { index, qd }),
            Some(Err(Failure::Aborted)) => Err(WaitError::ConnAborted { index, qd }),
            Some(Err(Failure::Os(errno))) => Err(SubstrateError::Os { qd, errno }.into()),
            None => Ok(None),
        }
    }

    fn socket_of(&self, qd: QueueId, op: OpKind) -> Result<Arc<Socket>, SubstrateError> {
        match self.table.get(qd)? {
            QueueEntry::Socket(socket) => Ok(socket),
            QueueEntry::Memory(_) => Err(SubstrateError::Unsupported { qd, op }),
        }
    }
}

impl Substrate for UringSubstrate {
    fn socket(&mut self) -> Result<QueueId, SubstrateError> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;

        // SO_REUSEPORT via raw setsockopt so every dispatch worker can bind the same port.
        let optval: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        socket.set_nodelay(true)?;

        Ok(self.table.insert(QueueEntry::Socket(Arc::new(socket))))
    }

    fn queue(&mut self) -> Result<QueueId, SubstrateError> {
        let queue = MemQueue::new()?;
        Ok(self.table.insert(QueueEntry::Memory(Arc::new(queue))))
    }

    fn bind(&mut self, qd: QueueId, addr: SocketAddrV4) -> Result<(), SubstrateError> {
        // bind/listen are accepted ops on a socket queue; reported as Accept when misused.
        let socket = self.socket_of(qd, OpKind::Accept)?;
        socket.bind(&addr.into())?;
        Ok(())
    }

    fn listen(&mut self, qd: QueueId, backlog: i32) -> Result<(), SubstrateError> {
        let socket = self.socket_of(qd, OpKind::Accept)?;
        socket.listen(backlog)?;
        Ok(())
    }

    fn accept(&mut self, qd: QueueId) -> Result<Token, SubstrateError> {
        let listener = self.socket_of(qd, OpKind::Accept)?;
        self.submit(qd, OpKind::Accept, Io::Accept { listener })
    }

    fn read(&mut self, qd: QueueId) -> Result<Token, SubstrateError> {
        let io = match self.table.get(qd)? {
            QueueEntry::Socket(socket) => Io::Recv {
                socket,
                buf: vec![0u8; READ_BUF_SIZE].into_boxed_slice(),
            },
            QueueEntry::Memory(queue) => Io::Signal {
                queue,
                counter: Box::new(0),
            },
        };
        self.submit(qd, OpKind::Read, io)
    }

    fn write(&mut self, qd: QueueId, envelope: Envelope) -> Result<Token, SubstrateError> {
        let io = match self.table.get(qd)? {
            QueueEntry::Socket(_) if envelope.is_empty() => Io::Immediate,
            QueueEntry::Socket(socket) => Io::Send {
                socket,
                payload: envelope.into_payload(),
                pos: 0,
            },
            QueueEntry::Memory(queue) => {
                queue.push(envelope)?;
                Io::Immediate
            }
        };
        self.submit(qd, OpKind::Write, io)
    }

    fn wait(&mut self, token: Token) -> Result<Completion, WaitError> {
        loop {
            if let Some(completion) = self.take(0, token)? {
                return Ok(completion);
            }
            // Pushes already handed to the kernel are allowed to land.
            let kind = self.ops.get(token.0 as usize).map(|op| op.kind);
            if self.cancelled && kind != Some(OpKind::Write) {
                return Err(WaitError::Cancelled);
            }
            self.reap()?;
        }
    }

    fn wait_any(&mut self, tokens: &[Token]) -> Result<(usize, Completion), WaitError> {
        loop {
            for (index, &token) in tokens.iter().enumerate() {
                if let Some(completion) = self.take(index, token)? {
                    return Ok((index, completion));
                }
            }
            if self.cancelled {
                return Err(WaitError::Cancelled);
            }
            self.reap()?;
        }
    }

    fn close(&mut self, qd: QueueId) -> Result<(), SubstrateError> {
        match self.table.remove(qd)? {
            // Wake any ring still reading this socket; the fd closes with the last Arc.
            QueueEntry::Socket(socket) => {
                let _ = socket.shutdown(std::net::Shutdown::Both);
            }
            QueueEntry::Memory(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_accept_is_retried_not_reported() {
        assert!(transient(OpKind::Accept, -libc::ECONNABORTED));
        assert!(!transient(OpKind::Read, -libc::ECONNABORTED));
        assert!(matches!(failure(-libc::ECONNABORTED), Failure::Aborted));
    }

    #[test]
    fn would_block_and_interrupt_are_retried_for_every_op() {
        for kind in [OpKind::Accept, OpKind::Read, OpKind::Write] {
            assert!(transient(kind, -libc::EAGAIN));
            assert!(transient(kind, -libc::EINTR));
            assert!(!transient(kind, -libc::ECONNRESET));
            assert!(!transient(kind, 0));
        }
    }

    #[test]
    fn connection_errors_map_to_failures() {
        assert!(matches!(failure(-libc::ECONNRESET), Failure::Reset));
        assert!(matches!(failure(-libc::EPIPE), Failure::Reset));
        assert!(matches!(failure(-libc::EBADF), Failure::Os(libc::EBADF)));
    }
}
