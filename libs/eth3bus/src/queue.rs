//! Serialized command queue
//!
//! Holds pending operations in arrival order and lets exactly one of them,
//! the head, be in flight. The queue does no I/O itself: the owner asks for
//! the next activation, writes the payload, reports the write with
//! [`CommandQueue::written`] and feeds inbound packets to
//! [`CommandQueue::check`]. Resolving the head (success, rejection, timeout,
//! cancellation) pops it so the next one can activate.
//!
//! Deadlines belong to the head's [`OperationId`]; a late `written`/`finish`
//! for an operation that is no longer at the head is ignored.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::error::{BusError, Result};
use crate::packet::Packet;

/// Successful outcome: the reply packet when the operation waited for one
pub type Reply = Option<Packet>;

/// Receiving side of an operation's single resolution
pub type ReplyReceiver = oneshot::Receiver<Result<Reply>>;

/// Sleep until `deadline`, or forever when there is none
pub(crate) async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// What a completion predicate decided about one inbound packet
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Not for this operation
    Ignore,
    /// Operation satisfied
    Complete(Reply),
    /// Operation definitively failed
    Fail(BusError),
}

/// Completion predicate attached to an operation
pub trait ReplyMatcher: Send {
    fn check(&mut self, packet: &Packet) -> Verdict;
}

impl<F> ReplyMatcher for F
where
    F: FnMut(&Packet) -> Verdict + Send,
{
    fn check(&mut self, packet: &Packet) -> Verdict {
        self(packet)
    }
}

/// Queue-assigned operation identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// A submitted unit of work
pub struct PendingOperation<P> {
    id: OperationId,
    payload: P,
    timeout: Duration,
    matcher: Option<Box<dyn ReplyMatcher>>,
    responder: oneshot::Sender<Result<Reply>>,
}

impl<P> PendingOperation<P> {
    /// Build an operation and the handle its caller awaits.
    ///
    /// Without a matcher the operation succeeds as soon as it is written.
    pub fn new(
        payload: P,
        timeout: Duration,
        matcher: Option<Box<dyn ReplyMatcher>>,
    ) -> (Self, ReplyReceiver) {
        let (responder, receiver) = oneshot::channel();
        let op = Self {
            id: OperationId(0),
            payload,
            timeout,
            matcher,
            responder,
        };
        (op, receiver)
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn resolve(self, result: Result<Reply>) {
        // Caller may have stopped waiting
        let _ = self.responder.send(result);
    }
}

impl<P: fmt::Debug> fmt::Debug for PendingOperation<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .field("timeout", &self.timeout)
            .field("awaits_reply", &self.matcher.is_some())
            .finish()
    }
}

/// Head handed to the owner for writing
#[derive(Debug, Clone)]
pub struct Activation<P> {
    pub id: OperationId,
    pub payload: P,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum HeadPhase {
    /// Head not started
    Idle,
    /// Payload being written
    Writing,
    /// Written, waiting for the matcher or the deadline
    AwaitingReply { deadline: Instant },
}

/// FIFO of pending operations with a single active head
pub struct CommandQueue<P> {
    pending: VecDeque<PendingOperation<P>>,
    phase: HeadPhase,
    next_id: u64,
}

impl<P> CommandQueue<P> {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            phase: HeadPhase::Idle,
            next_id: 1,
        }
    }

    /// Number of operations including the active one
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether the head has been started and not yet resolved
    pub fn is_active(&self) -> bool {
        self.phase != HeadPhase::Idle
    }

    /// Id of the active head
    pub fn active_id(&self) -> Option<OperationId> {
        if self.is_active() {
            self.pending.front().map(|op| op.id)
        } else {
            None
        }
    }

    /// Append an operation at the tail
    pub fn push(&mut self, mut op: PendingOperation<P>) -> OperationId {
        let id = OperationId(self.next_id);
        self.next_id += 1;
        op.id = id;
        trace!("Queued {} (depth {})", id, self.pending.len() + 1);
        self.pending.push_back(op);
        id
    }

    /// Create and append an operation, returning its result handle
    pub fn enqueue(
        &mut self,
        timeout: Duration,
        payload: P,
        matcher: Option<Box<dyn ReplyMatcher>>,
    ) -> ReplyReceiver {
        let (op, receiver) = PendingOperation::new(payload, timeout, matcher);
        self.push(op);
        receiver
    }

    /// Start the head if nothing is active
    pub fn activate(&mut self) -> Option<Activation<P>>
    where
        P: Clone,
    {
        if self.is_active() {
            return None;
        }
        let head = self.pending.front()?;
        self.phase = HeadPhase::Writing;
        debug!("Activating {}", head.id);
        Some(Activation {
            id: head.id,
            payload: head.payload.clone(),
            timeout: head.timeout,
        })
    }

    /// Head's payload reached the wire at `now`.
    ///
    /// Starts the reply deadline, or resolves right away when the head has
    /// no matcher.
    pub fn written(&mut self, id: OperationId, now: Instant) {
        if self.phase != HeadPhase::Writing || self.active_id() != Some(id) {
            trace!("Ignoring write completion for {}", id);
            return;
        }

        let Some(head) = self.pending.front() else {
            return;
        };
        if head.matcher.is_none() {
            self.resolve_head(Ok(None));
        } else {
            self.phase = HeadPhase::AwaitingReply {
                deadline: now + head.timeout,
            };
        }
    }

    /// Offer an inbound packet to the active head's matcher
    pub fn check(&mut self, packet: &Packet) {
        if !matches!(self.phase, HeadPhase::AwaitingReply { .. }) {
            return;
        }
        let Some(matcher) = self.pending.front_mut().and_then(|op| op.matcher.as_mut()) else {
            return;
        };

        match matcher.check(packet) {
            Verdict::Ignore => {},
            Verdict::Complete(reply) => self.resolve_head(Ok(reply)),
            Verdict::Fail(err) => self.resolve_head(Err(err)),
        }
    }

    /// Resolve the active head explicitly
    pub fn finish(&mut self, id: OperationId, result: Result<Reply>) {
        if self.active_id() != Some(id) {
            trace!("Ignoring finish for {}", id);
            return;
        }
        self.resolve_head(result);
    }

    /// Force-fail the active head. Returns whether anything was cancelled.
    pub fn cancel(&mut self, err: BusError) -> bool {
        if !self.is_active() {
            return false;
        }
        self.resolve_head(Err(err));
        true
    }

    /// Deadline of the active head
    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            HeadPhase::AwaitingReply { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Time out the head if its deadline has passed
    pub fn expire(&mut self, now: Instant) -> bool {
        let (deadline, timeout) = match (self.phase, self.pending.front()) {
            (HeadPhase::AwaitingReply { deadline }, Some(head)) => (deadline, head.timeout),
            _ => return false,
        };
        if now < deadline {
            return false;
        }
        self.resolve_head(Err(BusError::timeout(format!(
            "No reply within {}ms",
            timeout.as_millis()
        ))));
        true
    }

    /// Fail every operation, active or waiting
    pub fn close(&mut self, err: BusError) {
        self.phase = HeadPhase::Idle;
        for op in self.pending.drain(..) {
            op.resolve(Err(err.clone()));
        }
    }

    fn resolve_head(&mut self, result: Result<Reply>) {
        self.phase = HeadPhase::Idle;
        if let Some(head) = self.pending.pop_front() {
            match &result {
                Ok(_) => debug!("{} completed", head.id),
                Err(e) => debug!("{} failed: {}", head.id, e),
            }
            head.resolve(result);
        }
    }
}

impl<P> Default for CommandQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> fmt::Debug for CommandQueue<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("len", &self.pending.len())
            .field("phase", &self.phase)
            .finish()
    }
}
