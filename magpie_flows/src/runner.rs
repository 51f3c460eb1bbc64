//! The cooperative flow runtime.
//!
//! A flow is a persistent server-side task with named states. The runtime
//! delivers one [`ResponseBundle`] per scheduling round to the state the
//! originating call named; between rounds the flow is suspended, so all
//! state mutations inside a handler are atomic with respect to the flow.
//!
//! ## Delivery order
//!
//! Every `call_client` / `call_state` draws a sequence number when it is
//! enqueued. Agent calls complete in arbitrary order, but bundles are
//! delivered strictly in sequence order: a reorder buffer holds early
//! completions until their turn. As a consequence, local synthetic bundles
//! and remote responses interleave exactly as they were issued, which is
//! what lets a flow assemble per-file block streams without re-sorting.
//!
//! ## End of flow
//!
//! When nothing is deliverable and nothing is in flight, the runtime calls
//! [`Flow::end`]. A flow may schedule more work from `end` (flushing
//! trailing batches); the runtime then resumes normal delivery and calls
//! `end` again at the next quiescence. The flow terminates only once `end`
//! leaves no outstanding requests.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use magpie_core::VfsUrn;

use crate::envelope::{
    AgentRequest, AgentResponse, ClientAction, RequestContext, RequestPayload, ResponseBundle,
};

/// Errors that terminate a flow.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// A storage collaborator failed; the flow cannot continue safely.
    #[error("server store failure: {0}")]
    Store(#[from] anyhow::Error),
    /// The runtime or an agent broke an invariant the flow relies on.
    #[error("flow protocol violation: {0}")]
    Protocol(&'static str),
    /// The transport stopped delivering completions.
    #[error("agent transport closed")]
    TransportClosed,
}

pub type FlowResult<T> = Result<T, FlowError>;

/// Reply from an agent to a single call.
///
/// The substrate below this trait owns delivery (at-least-once, best
/// effort); implementations return exactly one reply per call and report
/// agent-side failure through `success`/`status` rather than panicking.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub success: bool,
    pub status: Option<String>,
    pub responses: Vec<AgentResponse>,
}

impl AgentReply {
    pub fn ok(responses: Vec<AgentResponse>) -> Self {
        Self {
            success: true,
            status: None,
            responses,
        }
    }

    pub fn error(status: impl Into<String>) -> Self {
        Self {
            success: false,
            status: Some(status.into()),
            responses: Vec::new(),
        }
    }
}

/// The seam to the RPC substrate that reaches remote agents.
#[async_trait]
pub trait AgentTransport: Send + Sync + 'static {
    async fn call(&self, request: AgentRequest) -> AgentReply;
}

/// A cooperative task with named states, driven by [`FlowDriver`].
#[async_trait]
pub trait Flow: Send {
    /// The flow's named states; each bundle is addressed to one.
    type State: Copy + Eq + fmt::Debug + Send + 'static;
    /// Values the flow replies to its caller with.
    type Reply: Send + 'static;

    /// Invoked once before any bundle is delivered.
    async fn start(
        &mut self,
        runner: &mut FlowRunner<Self::State, Self::Reply>,
    ) -> FlowResult<()>;

    /// Handle one response bundle addressed to `bundle.next_state`.
    async fn dispatch(
        &mut self,
        runner: &mut FlowRunner<Self::State, Self::Reply>,
        bundle: ResponseBundle<Self::State>,
    ) -> FlowResult<()>;

    /// Invoked whenever the runtime finds the flow quiescent. May schedule
    /// more work; the flow terminates once this leaves nothing outstanding.
    async fn end(&mut self, runner: &mut FlowRunner<Self::State, Self::Reply>) -> FlowResult<()> {
        let _ = runner;
        Ok(())
    }
}

/// Priority of a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPriority {
    Low,
    Medium,
    High,
}

/// An event published by a flow for an out-of-band consumer.
///
/// Delivery to the consumer is asynchronous and unordered with respect to
/// the flow; consumers must tolerate delay and duplicates.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub event: &'static str,
    pub urn: VfsUrn,
    pub priority: EventPriority,
}

struct OutboundCall<S> {
    seq: u64,
    request: AgentRequest,
    next_state: S,
    request_data: RequestContext,
}

/// The operations a flow may invoke from its handlers.
///
/// All of them only enqueue; nothing crosses the transport until the
/// current handler returns.
pub struct FlowRunner<S, R> {
    next_seq: u64,
    next_delivery: u64,
    in_flight: usize,
    outbound: Vec<OutboundCall<S>>,
    ready: BTreeMap<u64, ResponseBundle<S>>,
    inline: VecDeque<ResponseBundle<S>>,
    replies: Vec<R>,
    events: Vec<PublishedEvent>,
    heartbeats: u64,
}

impl<S: Copy, R> FlowRunner<S, R> {
    fn new() -> Self {
        Self {
            next_seq: 0,
            next_delivery: 0,
            in_flight: 0,
            outbound: Vec::new(),
            ready: BTreeMap::new(),
            inline: VecDeque::new(),
            replies: Vec::new(),
            events: Vec::new(),
            heartbeats: 0,
        }
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Enqueue a call to the remote agent; the response bundle will be
    /// delivered to `next_state` with `request_data` echoed back.
    pub fn call_client(
        &mut self,
        action: ClientAction,
        payload: RequestPayload,
        next_state: S,
        request_data: RequestContext,
    ) {
        let seq = self.bump_seq();
        self.outbound.push(OutboundCall {
            seq,
            request: AgentRequest { action, payload },
            next_state,
            request_data,
        });
    }

    /// Enqueue a locally synthesized bundle of `responses` for delivery to
    /// `next_state`, ordered against all other enqueued calls.
    pub fn call_state(
        &mut self,
        responses: Vec<AgentResponse>,
        next_state: S,
        request_data: RequestContext,
    ) {
        let seq = self.bump_seq();
        self.ready.insert(
            seq,
            ResponseBundle {
                success: true,
                status: None,
                request: None,
                request_data,
                responses,
                next_state,
            },
        );
    }

    /// Deliver an empty synthetic bundle to `next_state` ahead of all
    /// queued bundles, as soon as the current handler returns.
    pub fn call_state_inline(&mut self, next_state: S) {
        self.inline.push_back(ResponseBundle {
            success: true,
            status: None,
            request: None,
            request_data: RequestContext::default(),
            responses: Vec::new(),
            next_state,
        });
    }

    /// Record a reply for the flow's caller.
    pub fn send_reply(&mut self, reply: R) {
        self.replies.push(reply);
    }

    /// Publish an event for an out-of-band consumer.
    pub fn publish(&mut self, event: &'static str, urn: VfsUrn, priority: EventPriority) {
        self.events.push(PublishedEvent {
            event,
            urn,
            priority,
        });
    }

    /// Signal liveness from a long-running handler loop.
    pub fn heart_beat(&mut self) {
        self.heartbeats += 1;
        trace!("flow heartbeat {}", self.heartbeats);
    }

    /// Number of requests issued but not yet handled: queued, in flight,
    /// or awaiting delivery.
    pub fn outstanding_requests(&self) -> usize {
        self.outbound.len() + self.in_flight + self.ready.len() + self.inline.len()
    }

    fn take_outbound(&mut self) -> Vec<OutboundCall<S>> {
        let calls = std::mem::take(&mut self.outbound);
        self.in_flight += calls.len();
        calls
    }

    fn complete(&mut self, seq: u64, bundle: ResponseBundle<S>) {
        self.in_flight -= 1;
        self.ready.insert(seq, bundle);
    }

    fn take_deliverable(&mut self) -> Option<ResponseBundle<S>> {
        if let Some(bundle) = self.inline.pop_front() {
            return Some(bundle);
        }
        let bundle = self.ready.remove(&self.next_delivery)?;
        self.next_delivery += 1;
        Some(bundle)
    }
}

/// Everything a finished flow produced, alongside the flow itself.
pub struct FlowOutcome<F: Flow> {
    pub flow: F,
    pub replies: Vec<F::Reply>,
    pub events: Vec<PublishedEvent>,
}

/// Owns a flow and drives it to completion against a transport.
///
/// Outbound calls are spawned concurrently; completions funnel through an
/// inbox and are delivered one bundle per round, in issue order.
pub struct FlowDriver<F: Flow> {
    flow: F,
    runner: FlowRunner<F::State, F::Reply>,
    transport: Arc<dyn AgentTransport>,
    tx: mpsc::UnboundedSender<(u64, ResponseBundle<F::State>)>,
    rx: mpsc::UnboundedReceiver<(u64, ResponseBundle<F::State>)>,
}

impl<F: Flow> FlowDriver<F> {
    pub fn new(flow: F, transport: Arc<dyn AgentTransport>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            flow,
            runner: FlowRunner::new(),
            transport,
            tx,
            rx,
        }
    }

    /// Run the flow until it has no outstanding requests after an `end`
    /// round. Cancellation and timeouts act at this granularity: drop or
    /// race the returned future.
    pub async fn run(mut self) -> FlowResult<FlowOutcome<F>> {
        self.flow.start(&mut self.runner).await?;
        loop {
            self.spawn_outbound();
            while let Some(bundle) = self.runner.take_deliverable() {
                self.flow.dispatch(&mut self.runner, bundle).await?;
                self.spawn_outbound();
            }
            if self.runner.in_flight > 0 {
                let (seq, bundle) = self.rx.recv().await.ok_or(FlowError::TransportClosed)?;
                self.runner.complete(seq, bundle);
                continue;
            }
            self.flow.end(&mut self.runner).await?;
            self.spawn_outbound();
            if self.runner.outstanding_requests() == 0 {
                break;
            }
        }
        Ok(FlowOutcome {
            flow: self.flow,
            replies: std::mem::take(&mut self.runner.replies),
            events: std::mem::take(&mut self.runner.events),
        })
    }

    fn spawn_outbound(&mut self) {
        for call in self.runner.take_outbound() {
            let transport = Arc::clone(&self.transport);
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let reply = transport.call(call.request.clone()).await;
                let bundle = ResponseBundle {
                    success: reply.success,
                    status: reply.status,
                    request: Some(call.request),
                    request_data: call.request_data,
                    responses: reply.responses,
                    next_state: call.next_state,
                };
                // The driver may already be gone if the flow failed.
                let _ = tx.send((call.seq, bundle));
            });
        }
    }
}
