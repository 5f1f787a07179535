use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::correlation;
use crate::envelope::{Completion, OpOutput};
use crate::error::{SubstrateError, WaitError};
use crate::handler::{Reply, RequestHandler};
use crate::protocol::ParserContext;
use crate::substrate::Substrate;
use crate::topology::ProcessingHandle;

/// What one pass of the processing loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    Responded,
    Dropped,
    Shutdown,
}

/// Processing worker: pops requests from its inbound queue, answers them, pushes each reply to
/// its outbound queue carrying the request's correlation tag.
///
/// Split mode only. Parsing, file reads and rendering run synchronously on this thread.
pub struct ProcessingWorker<S> {
    handle: ProcessingHandle,
    substrate: S,
    handler: Arc<RequestHandler>,
    ctx: ParserContext,
    responded: u64,
}

impl<S: Substrate> ProcessingWorker<S> {
    pub fn new(handle: ProcessingHandle, substrate: S, handler: Arc<RequestHandler>) -> Self {
        Self {
            handle,
            substrate,
            handler,
            ctx: ParserContext::new(),
            responded: 0,
        }
    }

    /// Serve until shutdown; returns the number of responses pushed.
    pub fn run(mut self) -> Result<u64, SubstrateError> {
        info!(worker = self.handle.index, "processing worker started");
        while self.serve_one()? != Served::Shutdown {}
        info!(
            worker = self.handle.index,
            responded = self.responded,
            "processing worker stopped"
        );
        Ok(self.responded)
    }

    /// Pop one request and answer it.
    pub fn serve_one(&mut self) -> Result<Served, SubstrateError> {
        let inbound = self.handle.inbound;
        let token = self.substrate.read(inbound)?;
        let request = match self.substrate.wait(token) {
            Ok(Completion {
                output: OpOutput::Read(envelope),
                ..
            }) => envelope,
            Ok(Completion { qd, output }) => {
                return Err(SubstrateError::UnexpectedCompletion {
                    qd,
                    got: output.kind(),
                });
            }
            Err(WaitError::Cancelled) => return Ok(Served::Shutdown),
            Err(WaitError::ConnReset { qd, .. } | WaitError::ConnAborted { qd, .. }) => {
                warn!(%qd, "inbound queue failed");
                return Ok(Served::Dropped);
            }
            Err(WaitError::Fatal(e)) => return Err(e),
        };

        if request.correlation().is_none() {
            warn!(worker = self.handle.index, "request carries no correlation tag");
        }
        let reply = self.handler.serve(&mut self.ctx, request.payload());
        let Reply::Send(bytes) = reply else {
            return Ok(Served::Dropped);
        };
        let response = correlation::reply(&request, bytes);
        drop(request);

        let token = self.substrate.write(self.handle.outbound, response)?;
        match self.substrate.wait(token) {
            Ok(_) | Err(WaitError::Cancelled) => {}
            Err(WaitError::ConnReset { qd, .. } | WaitError::ConnAborted { qd, .. }) => {
                warn!(%qd, "outbound queue failed");
                return Ok(Served::Dropped);
            }
            Err(WaitError::Fatal(e)) => return Err(e),
        }
        self.responded += 1;
        debug!(worker = self.handle.index, "response pushed");
        Ok(Served::Responded)
    }
}
