//! The asynchronous queue substrate the workers are written against.
//!
//! The binary implements it over io_uring (`uring.rs`); integration tests implement it in
//! memory so the worker loops can be driven deterministically.

use std::net::SocketAddrV4;

use crate::envelope::{Completion, Envelope, QueueId, Token};
use crate::error::{SubstrateError, WaitError};

/// One instance per worker thread. Queue identifiers are shared across instances.
pub trait Substrate {
    /// Create an unbound TCP socket queue.
    fn socket(&mut self) -> Result<QueueId, SubstrateError>;

    /// Create an in-process queue.
    fn queue(&mut self) -> Result<QueueId, SubstrateError>;

    fn bind(&mut self, qd: QueueId, addr: SocketAddrV4) -> Result<(), SubstrateError>;

    fn listen(&mut self, qd: QueueId, backlog: i32) -> Result<(), SubstrateError>;

    fn accept(&mut self, qd: QueueId) -> Result<Token, SubstrateError>;

    fn read(&mut self, qd: QueueId) -> Result<Token, SubstrateError>;

    /// Push `envelope` to `qd`. Ownership of the payload moves to the substrate.
    fn write(&mut self, qd: QueueId, envelope: Envelope) -> Result<Token, SubstrateError>;

    /// Block until `token` completes.
    fn wait(&mut self, token: Token) -> Result<Completion, WaitError>;

    /// Block until any of `tokens` completes; returns its index and result.
    fn wait_any(&mut self, tokens: &[Token]) -> Result<(usize, Completion), WaitError>;

    fn close(&mut self, qd: QueueId) -> Result<(), SubstrateError>;
}
