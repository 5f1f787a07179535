//! Completion multiplexer: the single suspension point of a dispatch worker.

use tracing::debug;

use crate::envelope::{Completion, QueueId, Token};
use crate::error::{SubstrateError, WaitError};
use crate::substrate::Substrate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    ConnReset,
    ConnAborted,
}

#[derive(Debug)]
pub enum Event {
    Completed(Completion),
    /// A connection-level failure. The queue has already been closed and its token dropped.
    Failed { qd: QueueId, reason: FailReason },
    Shutdown,
}

/// The dynamic set of operations a worker is waiting on.
#[derive(Debug, Default)]
pub struct WaitSet {
    tokens: Vec<Token>,
}

impl WaitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, token: Token) {
        self.tokens.push(token);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Block until one operation completes.
    ///
    /// Errors are fatal: anything other than a reset/aborted connection or shutdown means the
    /// substrate broke an invariant.
    pub fn next<S: Substrate>(&mut self, substrate: &mut S) -> Result<Event, SubstrateError> {
        match substrate.wait_any(&self.tokens) {
            Ok((index, completion)) => {
                self.tokens.remove(index);
                Ok(Event::Completed(completion))
            }
            Err(WaitError::ConnReset { index, qd }) => {
                self.drop_failed(substrate, index, qd);
                Ok(Event::Failed {
                    qd,
                    reason: FailReason::ConnReset,
                })
            }
            Err(WaitError::ConnAborted { index, qd }) => {
                self.drop_failed(substrate, index, qd);
                Ok(Event::Failed {
                    qd,
                    reason: FailReason::ConnAborted,
                })
            }
            Err(WaitError::Cancelled) => Ok(Event::Shutdown),
            Err(WaitError::Fatal(e)) => Err(e),
        }
    }

    fn drop_failed<S: Substrate>(&mut self, substrate: &mut S, index: usize, qd: QueueId) {
        self.tokens.remove(index);
        // Another worker may have closed it first after a failed push.
        if let Err(e) = substrate.close(qd) {
            debug!(%qd, error = %e, "queue already closed");
        }
    }
}
