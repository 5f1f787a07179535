use thiserror::Error;

use crate::envelope::{OpKind, QueueId, Token};

/// Substrate failure that no worker can recover from.
#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("unknown queue ({0})")]
    UnknownQueue(QueueId),
    #[error("unknown token {0:?}")]
    UnknownToken(Token),
    #[error("{op:?} is not supported on {qd}")]
    Unsupported { qd: QueueId, op: OpKind },
    #[error("unexpected {got:?} completion on {qd}")]
    UnexpectedCompletion { qd: QueueId, got: OpKind },
    #[error("operation on {qd} failed: errno {errno}")]
    Os { qd: QueueId, errno: i32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outcome of a failed wait.
///
/// Only the connection-level variants are recoverable: the caller closes `qd` and drops the
/// token at `index`.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("connection reset on {qd}")]
    ConnReset { index: usize, qd: QueueId },
    #[error("connection aborted on {qd}")]
    ConnAborted { index: usize, qd: QueueId },
    #[error("shutdown requested")]
    Cancelled,
    #[error(transparent)]
    Fatal(#[from] SubstrateError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{what} must be at least 1")]
    NoWorkers { what: &'static str },
    #[error(
        "cannot map {dispatch} dispatch workers one-to-one onto {processing} processing workers"
    )]
    AffinityShortfall { dispatch: usize, processing: usize },
}
