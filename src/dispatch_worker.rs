use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{ClientRearm, REQUEST_LOG_INTERVAL};
use crate::correlation;
use crate::envelope::{Completion, Envelope, OpKind, OpOutput, QueueId, Token};
use crate::error::{SubstrateError, WaitError};
use crate::handler::{Reply, RequestHandler};
use crate::metrics;
use crate::multiplexer::{Event, WaitSet};
use crate::protocol::ParserContext;
use crate::routing::RoutingPolicy;
use crate::substrate::Substrate;
use crate::topology::{ListenerRegistry, ProcessingHandle};

/// How a dispatch worker gets requests answered.
pub enum Pipeline {
    /// Forward to a processing worker and relay its tagged response.
    Split {
        pool: Arc<[ProcessingHandle]>,
        policy: RoutingPolicy,
        rearm: ClientRearm,
    },
    /// Parse and answer in-line.
    Joined { handler: Arc<RequestHandler> },
}

/// What one pass of the dispatch loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Accepted(QueueId),
    Forwarded { client: QueueId, worker: usize },
    /// A response went back to `client` (split relay or joined in-line reply).
    Responded { client: QueueId },
    /// The request or response produced nothing to send.
    Dropped { client: QueueId },
    Closed(QueueId),
    Ignored,
    Shutdown,
}

/// How a push ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pushed {
    Delivered,
    /// The peer went away; the queue has been closed.
    Gone,
    Cancelled,
}

/// Outstanding reads on processing workers' outbound queues.
#[derive(Debug, Default)]
pub struct PendingForwards {
    awaiting: HashMap<QueueId, usize>,
}

impl PendingForwards {
    pub fn add(&mut self, outbound: QueueId) {
        *self.awaiting.entry(outbound).or_default() += 1;
    }

    /// Consume one outstanding read on `qd`; false if `qd` is not awaited.
    pub fn take(&mut self, qd: QueueId) -> bool {
        match self.awaiting.get_mut(&qd) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.awaiting.remove(&qd);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, qd: QueueId) -> bool {
        self.awaiting.contains_key(&qd)
    }

    pub fn is_empty(&self) -> bool {
        self.awaiting.is_empty()
    }
}

/// Dispatch worker: owns one listening queue, accepts connections, reads requests and gets each
/// one answered, either by a processing worker or in-line.
///
/// Every connection has at most one request in flight.
pub struct DispatchWorker<S> {
    index: usize,
    substrate: S,
    listener: QueueId,
    pipeline: Pipeline,
    wait_set: WaitSet,
    pending: PendingForwards,
    ctx: ParserContext,
    received: u64,
}

impl<S: Substrate> DispatchWorker<S> {
    /// Open, register, bind and listen on this worker's queue, and post the first accept.
    pub fn setup(
        index: usize,
        mut substrate: S,
        addr: SocketAddrV4,
        backlog: i32,
        registry: &ListenerRegistry,
        pipeline: Pipeline,
    ) -> Result<Self, SubstrateError> {
        let listener = substrate.socket()?;
        registry.register(listener);
        substrate.bind(listener, addr)?;
        substrate.listen(listener, backlog)?;
        let mut wait_set = WaitSet::new();
        wait_set.push(substrate.accept(listener)?);
        info!(worker = index, %addr, %listener, "dispatch worker listening");

        Ok(Self {
            index,
            substrate,
            listener,
            pipeline,
            wait_set,
            pending: PendingForwards::default(),
            ctx: ParserContext::new(),
            received: 0,
        })
    }

    pub fn listener(&self) -> QueueId {
        self.listener
    }

    /// Requests received so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn pending(&self) -> &PendingForwards {
        &self.pending
    }

    /// Operations currently waited on.
    pub fn in_flight(&self) -> usize {
        self.wait_set.len()
    }

    /// Serve until shutdown; returns the number of requests received.
    pub fn run(mut self) -> Result<u64, SubstrateError> {
        while self.step()? != Step::Shutdown {}
        info!(
            worker = self.index,
            received = self.received,
            "dispatch worker stopped"
        );
        Ok(self.received)
    }

    /// Wait for the next completion and act on it.
    pub fn step(&mut self) -> Result<Step, SubstrateError> {
        match self.wait_set.next(&mut self.substrate)? {
            Event::Shutdown => Ok(Step::Shutdown),
            Event::Failed { qd, reason } => {
                warn!(worker = self.index, %qd, ?reason, "connection failed, queue closed");
                metrics::inc_connection_failures();
                Ok(Step::Closed(qd))
            }
            Event::Completed(Completion { qd, output }) => match output {
                OpOutput::Accepted(conn) => self.on_accept(qd, conn),
                OpOutput::Read(envelope) if self.pending.take(qd) => {
                    self.on_response(envelope)
                }
                OpOutput::Read(envelope) => self.on_request(qd, envelope),
                OpOutput::Written => Ok(Step::Ignored),
            },
        }
    }

    fn on_accept(&mut self, qd: QueueId, conn: QueueId) -> Result<Step, SubstrateError> {
        if qd != self.listener {
            return Err(SubstrateError::UnexpectedCompletion {
                qd,
                got: OpKind::Accept,
            });
        }
        self.arm_read(conn)?;
        let token = self.substrate.accept(self.listener)?;
        self.wait_set.push(token);
        metrics::inc_connections_accepted();
        debug!(worker = self.index, %conn, "accepted connection");
        Ok(Step::Accepted(conn))
    }

    fn on_request(&mut self, client: QueueId, request: Envelope) -> Result<Step, SubstrateError> {
        self.received += 1;
        metrics::inc_requests_received();
        if self.received % REQUEST_LOG_INTERVAL == 0 {
            info!(worker = self.index, received = self.received, "requests received");
        }
        debug!(worker = self.index, %client, len = request.len(), "new request");

        match &self.pipeline {
            Pipeline::Split { pool, policy, .. } => {
                let worker =
                    policy.select(self.received, self.index, request.payload(), pool.len());
                let handle = pool[worker];
                debug!(
                    worker = self.index,
                    processing = worker,
                    %client,
                    "forwarding request"
                );
                let tagged = correlation::tag(request, client);
                match self.push(handle.inbound, tagged)? {
                    Pushed::Delivered => {}
                    Pushed::Gone => return Ok(Step::Dropped { client }),
                    Pushed::Cancelled => return Ok(Step::Shutdown),
                }
                let token = self.substrate.read(handle.outbound)?;
                self.wait_set.push(token);
                self.pending.add(handle.outbound);
                metrics::inc_requests_forwarded();
                Ok(Step::Forwarded { client, worker })
            }
            Pipeline::Joined { handler } => {
                let reply = handler.serve(&mut self.ctx, request.payload());
                drop(request);
                let step = match reply {
                    Reply::Send(bytes) => match self.push(client, Envelope::new(bytes))? {
                        Pushed::Delivered => {
                            metrics::inc_responses_sent();
                            Step::Responded { client }
                        }
                        Pushed::Gone => return Ok(Step::Closed(client)),
                        Pushed::Cancelled => return Ok(Step::Shutdown),
                    },
                    Reply::Drop => Step::Dropped { client },
                };
                self.arm_read(client)?;
                Ok(step)
            }
        }
    }

    fn on_response(&mut self, response: Envelope) -> Result<Step, SubstrateError> {
        let Some(client) = correlation::destination(&response) else {
            warn!(worker = self.index, "response without correlation tag, dropping");
            return Ok(Step::Ignored);
        };
        debug!(worker = self.index, %client, len = response.len(), "relaying response");

        // The tag stays on this side of the wire.
        match self.push(client, Envelope::new(response.into_payload()))? {
            Pushed::Delivered => {}
            Pushed::Gone => return Ok(Step::Closed(client)),
            Pushed::Cancelled => return Ok(Step::Shutdown),
        }
        metrics::inc_responses_sent();

        let rearm = match &self.pipeline {
            Pipeline::Split { rearm, .. } => *rearm,
            Pipeline::Joined { .. } => ClientRearm::AfterResponse,
        };
        match rearm {
            ClientRearm::AfterResponse => self.arm_read(client)?,
            // One request per connection: it ends with its response.
            ClientRearm::Never => self.close(client),
        }
        Ok(Step::Responded { client })
    }

    fn arm_read(&mut self, qd: QueueId) -> Result<(), SubstrateError> {
        let token = self.substrate.read(qd)?;
        self.wait_set.push(token);
        Ok(())
    }

    /// Write `envelope` to `qd` and wait for it to land.
    fn push(&mut self, qd: QueueId, envelope: Envelope) -> Result<Pushed, SubstrateError> {
        let token: Token = self.substrate.write(qd, envelope)?;
        match self.substrate.wait(token) {
            Ok(_) => Ok(Pushed::Delivered),
            Err(WaitError::ConnReset { .. } | WaitError::ConnAborted { .. }) => {
                warn!(worker = self.index, %qd, "push failed, closing queue");
                metrics::inc_connection_failures();
                self.close(qd);
                Ok(Pushed::Gone)
            }
            Err(WaitError::Cancelled) => Ok(Pushed::Cancelled),
            Err(WaitError::Fatal(e)) => Err(e),
        }
    }

    fn close(&mut self, qd: QueueId) {
        if let Err(e) = self.substrate.close(qd) {
            debug!(%qd, error = %e, "queue already closed");
        }
    }
}
