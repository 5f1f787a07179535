#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;
use std::path::Path;
use std::rc::Rc;

use dispatch_http::envelope::{Completion, Envelope, OpKind, OpOutput, QueueId, Token};
use dispatch_http::error::{SubstrateError, WaitError};
use dispatch_http::substrate::Substrate;

/// How a simulated connection goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Reset,
    Aborted,
}

enum SimQueue {
    Listener {
        addr: Option<SocketAddrV4>,
        listening: bool,
        pending: VecDeque<QueueId>,
    },
    Conn {
        inbox: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
        failure: Option<Failure>,
    },
    Memory {
        items: VecDeque<Envelope>,
    },
}

struct SimOp {
    qd: QueueId,
    kind: OpKind,
    done: Option<Result<OpOutput, Failure>>,
}

#[derive(Default)]
struct SimState {
    next_qd: u32,
    next_token: u64,
    queues: HashMap<QueueId, SimQueue>,
    ops: HashMap<u64, SimOp>,
    /// What was written to connections that have since been closed.
    closed_sent: HashMap<QueueId, Vec<Vec<u8>>>,
    stalled_writes: bool,
}

impl SimState {
    fn insert(&mut self, queue: SimQueue) -> QueueId {
        let qd = QueueId(self.next_qd);
        self.next_qd += 1;
        self.queues.insert(qd, queue);
        qd
    }

    fn submit(
        &mut self,
        qd: QueueId,
        kind: OpKind,
        done: Option<Result<OpOutput, Failure>>,
    ) -> Token {
        let token = self.next_token;
        self.next_token += 1;
        self.ops.insert(token, SimOp { qd, kind, done });
        Token(token)
    }

    /// Complete `token` if its queue has something for it. Resolution is lazy: an item goes to
    /// whichever op is waited on first.
    fn resolve(&mut self, token: Token) -> Result<bool, SubstrateError> {
        let op = self
            .ops
            .get(&token.0)
            .ok_or(SubstrateError::UnknownToken(token))?;
        if op.done.is_some() {
            return Ok(true);
        }
        let (qd, kind) = (op.qd, op.kind);
        let done = match (self.queues.get_mut(&qd), kind) {
            // Closed underneath a pending op.
            (None, _) => Some(Err(Failure::Aborted)),
            (Some(SimQueue::Listener { pending, .. }), OpKind::Accept) => {
                pending.pop_front().map(|conn| Ok(OpOutput::Accepted(conn)))
            }
            (Some(SimQueue::Conn { failure: Some(f), .. }), OpKind::Read) => Some(Err(*f)),
            (Some(SimQueue::Conn { inbox, .. }), OpKind::Read) => inbox
                .pop_front()
                .map(|bytes| Ok(OpOutput::Read(Envelope::new(bytes)))),
            (Some(SimQueue::Memory { items }), OpKind::Read) => {
                items.pop_front().map(|env| Ok(OpOutput::Read(env)))
            }
            // Stalled write: never lands.
            (_, OpKind::Write) => None,
            _ => return Err(SubstrateError::Unsupported { qd, op: kind }),
        };
        let resolved = done.is_some();
        if let Some(op) = self.ops.get_mut(&token.0) {
            op.done = done;
        }
        Ok(resolved)
    }

    fn take(&mut self, index: usize, token: Token) -> Result<Completion, WaitError> {
        let op = self
            .ops
            .remove(&token.0)
            .ok_or(SubstrateError::UnknownToken(token))?;
        let qd = op.qd;
        match op.done {
            Some(Ok(output)) => Ok(Completion { qd, output }),
            Some(Err(Failure::Reset)) => Err(WaitError::ConnReset { index, qd }),
            Some(Err(Failure::Aborted)) => Err(WaitError::ConnAborted { index, qd }),
            None => Err(WaitError::Cancelled),
        }
    }
}

/// Deterministic in-memory [`Substrate`]. Clones share one world, so a dispatch worker and the
/// processing workers it feeds can be driven from one test thread. Waiting on operations that
/// cannot complete yet reports `Cancelled`, which the workers treat as shutdown: a worker's
/// `run` returns once it has drained everything that is ready.
#[derive(Clone, Default)]
pub struct SimSubstrate(Rc<RefCell<SimState>>);

impl SimSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client connects to `listener`; returns the connection's queue.
    pub fn connect(&self, listener: QueueId) -> QueueId {
        let mut state = self.0.borrow_mut();
        let conn = state.insert(SimQueue::Conn {
            inbox: VecDeque::new(),
            sent: Vec::new(),
            failure: None,
        });
        match state.queues.get_mut(&listener) {
            Some(SimQueue::Listener {
                listening: true,
                pending,
                ..
            }) => pending.push_back(conn),
            _ => panic!("{listener} is not listening"),
        }
        conn
    }

    /// The client sends `bytes` as one read's worth of data.
    pub fn send(&self, conn: QueueId, bytes: impl Into<Vec<u8>>) {
        match self.0.borrow_mut().queues.get_mut(&conn) {
            Some(SimQueue::Conn { inbox, .. }) => inbox.push_back(bytes.into()),
            _ => panic!("{conn} is not an open connection"),
        }
    }

    pub fn fail(&self, conn: QueueId, failure: Failure) {
        match self.0.borrow_mut().queues.get_mut(&conn) {
            Some(SimQueue::Conn { failure: f, .. }) => *f = Some(failure),
            _ => panic!("{conn} is not an open connection"),
        }
    }

    /// Everything written to `conn` so far, one entry per write, whether or not it is still
    /// open.
    pub fn sent(&self, conn: QueueId) -> Vec<Vec<u8>> {
        let state = self.0.borrow();
        match state.queues.get(&conn) {
            Some(SimQueue::Conn { sent, .. }) => sent.clone(),
            _ => state.closed_sent.get(&conn).cloned().unwrap_or_default(),
        }
    }

    pub fn is_closed(&self, qd: QueueId) -> bool {
        !self.0.borrow().queues.contains_key(&qd)
    }

    pub fn bound_addr(&self, listener: QueueId) -> Option<SocketAddrV4> {
        match self.0.borrow().queues.get(&listener) {
            Some(SimQueue::Listener { addr, .. }) => *addr,
            _ => None,
        }
    }

    /// Envelopes sitting in an in-process queue.
    pub fn memory_len(&self, qd: QueueId) -> usize {
        match self.0.borrow().queues.get(&qd) {
            Some(SimQueue::Memory { items }) => items.len(),
            _ => 0,
        }
    }

    /// From now on writes never complete, so waiting on one reports `Cancelled`, as a
    /// substrate shutting down underneath a push would.
    pub fn stall_writes(&self) {
        self.0.borrow_mut().stalled_writes = true;
    }

    pub fn push_memory(&self, qd: QueueId, envelope: Envelope) {
        match self.0.borrow_mut().queues.get_mut(&qd) {
            Some(SimQueue::Memory { items }) => items.push_back(envelope),
            _ => panic!("{qd} is not an in-process queue"),
        }
    }

    pub fn pop_memory(&self, qd: QueueId) -> Option<Envelope> {
        match self.0.borrow_mut().queues.get_mut(&qd) {
            Some(SimQueue::Memory { items }) => items.pop_front(),
            _ => None,
        }
    }
}

impl Substrate for SimSubstrate {
    fn socket(&mut self) -> Result<QueueId, SubstrateError> {
        Ok(self.0.borrow_mut().insert(SimQueue::Listener {
            addr: None,
            listening: false,
            pending: VecDeque::new(),
        }))
    }

    fn queue(&mut self) -> Result<QueueId, SubstrateError> {
        Ok(self.0.borrow_mut().insert(SimQueue::Memory {
            items: VecDeque::new(),
        }))
    }

    fn bind(&mut self, qd: QueueId, to: SocketAddrV4) -> Result<(), SubstrateError> {
        match self.0.borrow_mut().queues.get_mut(&qd) {
            Some(SimQueue::Listener { addr, .. }) => {
                *addr = Some(to);
                Ok(())
            }
            Some(_) => Err(SubstrateError::Unsupported {
                qd,
                op: OpKind::Accept,
            }),
            None => Err(SubstrateError::UnknownQueue(qd)),
        }
    }

    fn listen(&mut self, qd: QueueId, _backlog: i32) -> Result<(), SubstrateError> {
        match self.0.borrow_mut().queues.get_mut(&qd) {
            Some(SimQueue::Listener { listening, .. }) => {
                *listening = true;
                Ok(())
            }
            Some(_) => Err(SubstrateError::Unsupported {
                qd,
                op: OpKind::Accept,
            }),
            None => Err(SubstrateError::UnknownQueue(qd)),
        }
    }

    fn accept(&mut self, qd: QueueId) -> Result<Token, SubstrateError> {
        let mut state = self.0.borrow_mut();
        match state.queues.get(&qd) {
            Some(SimQueue::Listener { .. }) => Ok(state.submit(qd, OpKind::Accept, None)),
            Some(_) => Err(SubstrateError::Unsupported {
                qd,
                op: OpKind::Accept,
            }),
            None => Err(SubstrateError::UnknownQueue(qd)),
        }
    }

    fn read(&mut self, qd: QueueId) -> Result<Token, SubstrateError> {
        let mut state = self.0.borrow_mut();
        match state.queues.get(&qd) {
            Some(SimQueue::Conn { .. } | SimQueue::Memory { .. }) => {
                Ok(state.submit(qd, OpKind::Read, None))
            }
            Some(SimQueue::Listener { .. }) => Err(SubstrateError::Unsupported {
                qd,
                op: OpKind::Read,
            }),
            None => Err(SubstrateError::UnknownQueue(qd)),
        }
    }

    fn write(&mut self, qd: QueueId, envelope: Envelope) -> Result<Token, SubstrateError> {
        let mut state = self.0.borrow_mut();
        if state.stalled_writes {
            return match state.queues.get(&qd) {
                Some(_) => Ok(state.submit(qd, OpKind::Write, None)),
                None => Err(SubstrateError::UnknownQueue(qd)),
            };
        }
        let done = match state.queues.get_mut(&qd) {
            Some(SimQueue::Conn {
                failure: Some(f), ..
            }) => Err(*f),
            Some(SimQueue::Conn { sent, .. }) => {
                sent.push(envelope.into_payload());
                Ok(OpOutput::Written)
            }
            Some(SimQueue::Memory { items }) => {
                items.push_back(envelope);
                Ok(OpOutput::Written)
            }
            Some(SimQueue::Listener { .. }) => {
                return Err(SubstrateError::Unsupported {
                    qd,
                    op: OpKind::Write,
                });
            }
            None => return Err(SubstrateError::UnknownQueue(qd)),
        };
        Ok(state.submit(qd, OpKind::Write, Some(done)))
    }

    fn wait(&mut self, token: Token) -> Result<Completion, WaitError> {
        let mut state = self.0.borrow_mut();
        state.resolve(token)?;
        state.take(0, token)
    }

    fn wait_any(&mut self, tokens: &[Token]) -> Result<(usize, Completion), WaitError> {
        let mut state = self.0.borrow_mut();
        for (index, &token) in tokens.iter().enumerate() {
            if state.resolve(token)? {
                return state.take(index, token).map(|completion| (index, completion));
            }
        }
        Err(WaitError::Cancelled)
    }

    fn close(&mut self, qd: QueueId) -> Result<(), SubstrateError> {
        let mut state = self.0.borrow_mut();
        match state.queues.remove(&qd) {
            Some(SimQueue::Conn { sent, .. }) => {
                state.closed_sent.insert(qd, sent);
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(SubstrateError::UnknownQueue(qd)),
        }
    }
}

pub fn get(path: &str) -> Vec<u8> {
    format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").into_bytes()
}

/// Numeric status of a serialized response.
pub fn status(response: &[u8]) -> u16 {
    let text = String::from_utf8_lossy(response);
    text.split(' ')
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or_else(|| panic!("no status line in {text:?}"))
}

pub fn header(response: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(response);
    let head = text.split("\r\n\r\n").next()?;
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}

pub fn body(response: &[u8]) -> &[u8] {
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has a header terminator");
    &response[split + 4..]
}

/// A document root with an index page, a stylesheet and a sub-directory.
pub fn doc_root() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    write_file(dir.path(), "index.html", b"<h1>hello</h1>");
    write_file(dir.path(), "style.css", b"body{}");
    std::fs::create_dir(dir.path().join("docs")).expect("mkdir");
    write_file(dir.path(), "docs/readme.txt", b"read me");
    dir
}

pub fn write_file(root: &Path, name: &str, contents: &[u8]) {
    std::fs::write(root.join(name), contents).expect("write fixture");
}
