//! Response correlation convention.
//!
//! Whoever forwards a request tags it with the queue that must receive the reply; whoever
//! produces the reply copies that tag unchanged. Only dispatch workers act on the tag.

use crate::envelope::{Envelope, QueueId};

/// Tag `request` with the queue its response must reach.
pub fn tag(request: Envelope, origin: QueueId) -> Envelope {
    request.with_correlation(origin)
}

/// Build the response to `request`, carrying its tag forward.
pub fn reply(request: &Envelope, payload: Vec<u8>) -> Envelope {
    let response = Envelope::new(payload);
    match request.correlation() {
        Some(origin) => response.with_correlation(origin),
        None => response,
    }
}

/// Where a tagged response must be delivered.
pub fn destination(response: &Envelope) -> Option<QueueId> {
    response.correlation()
}
