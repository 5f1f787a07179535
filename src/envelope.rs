use std::fmt;

/// Handle to a substrate endpoint: a listening socket, a connection, or an in-process queue.
///
/// Identifiers are process-wide, so any worker may write to a queue another worker opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u32);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qd={}", self.0)
    }
}

/// Handle to one pending operation. Waiting on it consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Accept,
    Read,
    Write,
}

/// A message moving through the substrate: an owned payload plus the queue its eventual
/// response must be delivered to.
///
/// Not `Clone`: writing an envelope moves it, so the sender cannot touch the payload after
/// handing it off.
#[derive(Debug, PartialEq, Eq)]
pub struct Envelope {
    payload: Vec<u8>,
    correlation: Option<QueueId>,
}

impl Envelope {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            correlation: None,
        }
    }

    pub fn with_correlation(mut self, destination: QueueId) -> Self {
        self.correlation = Some(destination);
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn correlation(&self) -> Option<QueueId> {
        self.correlation
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Kind-specific result of a completed operation.
#[derive(Debug)]
pub enum OpOutput {
    /// The newly accepted connection.
    Accepted(QueueId),
    Read(Envelope),
    Written,
}

impl OpOutput {
    pub fn kind(&self) -> OpKind {
        match self {
            OpOutput::Accepted(_) => OpKind::Accept,
            OpOutput::Read(_) => OpKind::Read,
            OpOutput::Written => OpKind::Write,
        }
    }
}

/// A finished operation and the queue it ran on.
#[derive(Debug)]
pub struct Completion {
    pub qd: QueueId,
    pub output: OpOutput,
}
