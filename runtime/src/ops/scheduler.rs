//! Operation queue and scheduler.
//!
//! One FIFO queue per node. A node has at most one request in flight, and
//! the number of nodes executing at once is capped globally. Retries go back
//! to the tail of their node's queue with a `not_before` deadline. The
//! scheduler only decides what runs next; the engine drives execution.

use super::{OperationRequest, OperationResult, RequestId};
use crate::clock::Millis;
use crate::container::NodeId;
use std::collections::{BTreeMap, HashSet, VecDeque};
use tokio::sync::oneshot;

/// A request waiting in (or taken from) a node queue.
#[derive(Debug)]
pub struct QueuedRequest {
    pub request_id: RequestId,
    pub node_id: NodeId,
    pub request: OperationRequest,
    /// Executor invocations so far.
    pub attempts_used: u32,
    /// Earliest dispatch time (retry backoff).
    pub not_before: Millis,
    pub submitted_at: Millis,
    seq: u64,
    reply: Option<oneshot::Sender<OperationResult>>,
}

impl QueuedRequest {
    pub fn new(
        request_id: RequestId,
        node_id: NodeId,
        request: OperationRequest,
        submitted_at: Millis,
        reply: oneshot::Sender<OperationResult>,
    ) -> Self {
        Self {
            request_id,
            node_id,
            request,
            attempts_used: 0,
            not_before: submitted_at,
            submitted_at,
            seq: 0,
            reply: Some(reply),
        }
    }

    /// Whether the retry budget allows another attempt.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts_used < self.request.retry.max_attempts
    }

    /// Deliver the final result. Exactly one result per request: later
    /// calls are no-ops, and a caller that dropped its ticket is ignored.
    pub fn resolve(&mut self, result: OperationResult) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub queued: usize,
    pub in_flight: usize,
}

/// Per-node FIFO scheduling with a global in-flight cap.
#[derive(Debug)]
pub struct OperationScheduler {
    max_in_flight: usize,
    queues: BTreeMap<NodeId, VecDeque<QueuedRequest>>,
    in_flight: HashSet<NodeId>,
    next_seq: u64,
}

impl OperationScheduler {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            queues: BTreeMap::new(),
            in_flight: HashSet::new(),
            next_seq: 0,
        }
    }

    /// Append to the tail of the request's node queue.
    pub fn enqueue(&mut self, mut request: QueuedRequest) {
        request.seq = self.next_seq;
        self.next_seq += 1;
        self.queues.entry(request.node_id).or_default().push_back(request);
    }

    /// Re-enqueue after a retryable failure, eligible again at `not_before`.
    pub fn requeue(&mut self, mut request: QueuedRequest, not_before: Millis) {
        request.not_before = not_before;
        self.enqueue(request);
    }

    /// Take the next dispatchable request and mark its node busy.
    ///
    /// Candidates are queue heads whose node is idle and whose backoff has
    /// elapsed; the one submitted (or requeued) earliest wins.
    pub fn next_ready(&mut self, now: Millis) -> Option<QueuedRequest> {
        if self.in_flight.len() >= self.max_in_flight {
            return None;
        }
        let node = self
            .queues
            .iter()
            .filter(|(node, _)| !self.in_flight.contains(*node))
            .filter_map(|(node, queue)| queue.front().map(|head| (*node, head)))
            .filter(|(_, head)| head.not_before <= now)
            .min_by_key(|(_, head)| head.seq)
            .map(|(node, _)| node)?;

        let queue = self.queues.get_mut(&node)?;
        let request = queue.pop_front()?;
        if queue.is_empty() {
            self.queues.remove(&node);
        }
        self.in_flight.insert(node);
        Some(request)
    }

    /// The node's in-flight request settled.
    pub fn finish(&mut self, node: NodeId) {
        self.in_flight.remove(&node);
    }

    /// Remove a queued (not in-flight) request.
    pub fn cancel(&mut self, request_id: RequestId) -> Option<QueuedRequest> {
        let (node, index) = self.queues.iter().find_map(|(node, queue)| {
            queue
                .iter()
                .position(|r| r.request_id == request_id)
                .map(|i| (*node, i))
        })?;
        let queue = self.queues.get_mut(&node)?;
        let request = queue.remove(index);
        if queue.is_empty() {
            self.queues.remove(&node);
        }
        request
    }

    /// Remove every queued request.
    pub fn drain_all(&mut self) -> Vec<QueuedRequest> {
        let mut all: Vec<QueuedRequest> = std::mem::take(&mut self.queues)
            .into_values()
            .flatten()
            .collect();
        all.sort_by_key(|r| r.seq);
        all
    }

    /// Earliest time a currently blocked head becomes dispatchable.
    pub fn next_wakeup(&self) -> Option<Millis> {
        self.queues
            .iter()
            .filter(|(node, _)| !self.in_flight.contains(*node))
            .filter_map(|(_, queue)| queue.front().map(|head| head.not_before))
            .min()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queued: self.queues.values().map(VecDeque::len).sum(),
            in_flight: self.in_flight.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Operation;

    fn queued(node: u64, now: Millis) -> (QueuedRequest, oneshot::Receiver<OperationResult>) {
        let (tx, rx) = oneshot::channel();
        let request = OperationRequest::on_node(NodeId(node), Operation::Click);
        (QueuedRequest::new(RequestId::new(), NodeId(node), request, now, tx), rx)
    }

    #[test]
    fn test_fifo_per_node_one_in_flight() {
        let mut s = OperationScheduler::new(4);
        let (a, _) = queued(1, 0);
        let (b, _) = queued(1, 0);
        let (a_id, b_id) = (a.request_id, b.request_id);
        s.enqueue(a);
        s.enqueue(b);

        let first = s.next_ready(0).unwrap();
        assert_eq!(first.request_id, a_id);
        assert!(s.next_ready(0).is_none(), "node 1 is busy");

        s.finish(NodeId(1));
        assert_eq!(s.next_ready(0).unwrap().request_id, b_id);
    }

    #[test]
    fn test_different_nodes_run_concurrently_up_to_cap() {
        let mut s = OperationScheduler::new(2);
        for node in 1..=3 {
            s.enqueue(queued(node, 0).0);
        }
        assert_eq!(s.next_ready(0).unwrap().node_id, NodeId(1));
        assert_eq!(s.next_ready(0).unwrap().node_id, NodeId(2));
        assert!(s.next_ready(0).is_none(), "cap reached");
        assert_eq!(s.stats().in_flight, 2);

        s.finish(NodeId(1));
        assert_eq!(s.next_ready(0).unwrap().node_id, NodeId(3));
    }

    #[test]
    fn test_requeue_goes_to_tail_after_backoff() {
        let mut s = OperationScheduler::new(4);
        let (a, _) = queued(1, 0);
        let (b, _) = queued(1, 0);
        let (a_id, b_id) = (a.request_id, b.request_id);
        s.enqueue(a);
        s.enqueue(b);

        let mut first = s.next_ready(0).unwrap();
        first.attempts_used = 1;
        s.finish(NodeId(1));
        s.requeue(first, 500);

        assert_eq!(s.next_ready(0).unwrap().request_id, b_id);
        s.finish(NodeId(1));

        assert!(s.next_ready(100).is_none());
        assert_eq!(s.next_wakeup(), Some(500));
        let retried = s.next_ready(500).unwrap();
        assert_eq!(retried.request_id, a_id);
        assert_eq!(retried.attempts_used, 1);
    }

    #[test]
    fn test_blocked_head_blocks_its_node_only() {
        let mut s = OperationScheduler::new(4);
        let (mut a, _) = queued(1, 0);
        a.not_before = 1_000;
        s.enqueue(a);
        s.enqueue(queued(1, 0).0);
        s.enqueue(queued(2, 0).0);

        let ready = s.next_ready(0).unwrap();
        assert_eq!(ready.node_id, NodeId(2));
        assert!(s.next_ready(0).is_none());
    }

    #[test]
    fn test_cancel_removes_queued_request() {
        let mut s = OperationScheduler::new(4);
        let (a, _) = queued(1, 0);
        let (b, _) = queued(1, 0);
        let b_id = b.request_id;
        s.enqueue(a);
        s.enqueue(b);

        let cancelled = s.cancel(b_id).unwrap();
        assert_eq!(cancelled.request_id, b_id);
        assert!(s.cancel(b_id).is_none());
        assert_eq!(s.stats().queued, 1);
    }

    #[test]
    fn test_resolve_delivers_once() {
        let (mut req, mut rx) = queued(1, 0);
        let result = OperationResult::failed(
            req.request_id,
            req.node_id,
            crate::error::OperationError::Cancelled,
            0,
            0,
        );
        req.resolve(result.clone());
        req.resolve(result);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_drain_all_keeps_submission_order() {
        let mut s = OperationScheduler::new(1);
        let ids: Vec<RequestId> = [2, 1, 2]
            .into_iter()
            .map(|node| {
                let (r, _) = queued(node, 0);
                let id = r.request_id;
                s.enqueue(r);
                id
            })
            .collect();
        let drained: Vec<RequestId> = s.drain_all().into_iter().map(|r| r.request_id).collect();
        assert_eq!(drained, ids);
        assert_eq!((s.stats().queued, s.stats().in_flight), (0, 0));
    }
}
