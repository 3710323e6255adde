/*
Time-queue for the memory-system model.

Two pieces live here.  `EventQueue` is the global virtual clock: every state change in the
model is an event with a due cycle, and events that share a due cycle are dispatched in the
order they were scheduled (by sequence number), which keeps runs reproducible.

`TimedServer` wraps a shared resource (a cache port, a link) and enforces a service law:
    - a base latency plus a throughput component expressed in bytes-per-cycle
    - a bounded FIFO of outstanding work and a limit on new requests per cycle

When the server cannot accept more work it returns a Backpressure, which carries the request
back so the caller can retry it later.  Accepted requests yield a `Ticket` describing when the
service completes; the owner schedules an event at that cycle and drains the server.
*/

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

pub type Cycle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHandle(u64);

#[derive(Debug)]
pub struct EventQueue<E> {
    now: Cycle,
    next_seq: u64,
    heap: BinaryHeap<Reverse<(Cycle, u64)>>,
    // cancelled events are dropped from here; their heap entries are skipped lazily
    slots: HashMap<u64, E>,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self {
            now: 0,
            next_seq: 0,
            heap: BinaryHeap::new(),
            slots: HashMap::new(),
        }
    }

    pub fn now(&self) -> Cycle {
        self.now
    }

    /// Schedule `event` to fire `delay` cycles from now.
    pub fn schedule(&mut self, delay: Cycle, event: E) -> EventHandle {
        let at = self.now.saturating_add(delay);
        self.schedule_at(at, event)
    }

    /// Schedule `event` at an absolute cycle. Cycles in the past are clamped to now.
    pub fn schedule_at(&mut self, at: Cycle, event: E) -> EventHandle {
        let at = at.max(self.now);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse((at, seq)));
        self.slots.insert(seq, event);
        EventHandle(seq)
    }

    /// Remove a pending event. Returns false if it already fired or was already cancelled.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        self.slots.remove(&handle.0).is_some()
    }

    pub fn is_pending(&self, handle: EventHandle) -> bool {
        self.slots.contains_key(&handle.0)
    }

    /// Number of live (not cancelled, not dispatched) events.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Due cycle of the earliest live event.
    pub fn next_time(&mut self) -> Option<Cycle> {
        self.discard_stale();
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Pop the next live event due exactly at the current cycle.
    pub fn pop_due(&mut self) -> Option<(EventHandle, E)> {
        self.discard_stale();
        let Reverse((at, seq)) = *self.heap.peek()?;
        if at != self.now {
            return None;
        }
        self.heap.pop();
        let event = self.slots.remove(&seq)?;
        Some((EventHandle(seq), event))
    }

    /// Move the clock to the due cycle of the earliest live event, if that is not later than
    /// `horizon`. Returns the new current cycle.
    pub fn advance_to_next(&mut self, horizon: Cycle) -> Option<Cycle> {
        let next = self.next_time()?;
        if next > horizon {
            return None;
        }
        self.now = self.now.max(next);
        Some(self.now)
    }

    /// Move the clock forward to `at` without dispatching anything. The clock never moves past
    /// a pending event.
    pub fn advance_to(&mut self, at: Cycle) {
        let limit = self.next_time().unwrap_or(Cycle::MAX);
        self.now = self.now.max(at.min(limit));
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((_, seq))) = self.heap.peek() {
            if self.slots.contains_key(seq) {
                break;
            }
            self.heap.pop();
        }
    }
}

// Result of queueing a request with a timed server
#[derive(Debug, Clone, Copy)]
pub struct Ticket {
    issued_at: Cycle,
    ready_at: Cycle,
    size_bytes: u32,
}

impl Ticket {
    fn new(issued_at: Cycle, ready_at: Cycle, size_bytes: u32) -> Self {
        Self {
            issued_at,
            ready_at,
            size_bytes,
        }
    }

    // Cycle at which the request entered the server.
    pub fn issued_at(&self) -> Cycle {
        self.issued_at
    }

    // Cycle at which the server will make the payload available to downstream consumers.
    pub fn ready_at(&self) -> Cycle {
        self.ready_at
    }

    pub fn size_bytes(&self) -> u32 {
        self.size_bytes
    }

    pub fn is_ready(&self, now: Cycle) -> bool {
        now >= self.ready_at
    }
}

#[derive(Debug)]
pub struct ServiceRequest<T> {
    pub payload: T,
    pub size_bytes: u32,
}

impl<T> ServiceRequest<T> {
    pub fn new(payload: T, size_bytes: u32) -> Self {
        Self { payload, size_bytes }
    }
}

#[derive(Debug)]
pub struct ServiceResult<T> {
    pub payload: T,
    pub ticket: Ticket,
}

// Reasons why the server rejected a request
#[derive(Debug)]
pub enum Backpressure<T> {
    // The bounded FIFO is full
    QueueFull { request: ServiceRequest<T>, capacity: usize },
    // The server already accepted its per-cycle quota
    Busy { request: ServiceRequest<T>, available_at: Cycle },
}

impl<T> Backpressure<T> {
    // Recover the underlying request so it can be retried later.
    pub fn into_request(self) -> ServiceRequest<T> {
        match self {
            Backpressure::QueueFull { request, .. } => request,
            Backpressure::Busy { request, .. } => request,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    // Fixed latency added to every request
    pub base_latency: Cycle,
    // Throughput
    pub bytes_per_cycle: u32,
    // Maximum number of outstanding requests the server will accept
    pub queue_capacity: usize,
    // New requests accepted per cycle
    pub issues_per_cycle: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_latency: 0,
            bytes_per_cycle: 1,
            queue_capacity: 1,
            issues_per_cycle: 1,
        }
    }
}

#[derive(Debug)]
struct Inflight<T> {
    payload: T,
    ticket: Ticket,
}

// Pipelined single-lane server: the data path is occupied for ceil(bytes / bytes_per_cycle)
// cycles per request, while the base latency overlaps between requests.
#[derive(Debug)]
pub struct TimedServer<T> {
    config: ServerConfig,
    inflight: VecDeque<Inflight<T>>,
    next_free: Cycle,
    issue_cycle: Cycle,
    issued_this_cycle: u32,
}

impl<T> TimedServer<T> {
    pub fn new(config: ServerConfig) -> Self {
        assert!(config.bytes_per_cycle > 0, "bytes_per_cycle must be > 0");
        assert!(config.queue_capacity > 0, "queue_capacity must be > 0");
        assert!(config.issues_per_cycle > 0, "issues_per_cycle must be > 0");
        Self {
            config,
            inflight: VecDeque::new(),
            next_free: 0,
            issue_cycle: 0,
            issued_this_cycle: 0,
        }
    }

    // Attempt to enqueue a request at the provided cycle.
    pub fn try_enqueue(
        &mut self,
        now: Cycle,
        request: ServiceRequest<T>,
    ) -> Result<Ticket, Backpressure<T>> {
        if self.inflight.len() >= self.config.queue_capacity {
            return Err(Backpressure::QueueFull {
                request,
                capacity: self.config.queue_capacity,
            });
        }
        if self.issue_cycle != now {
            self.issue_cycle = now;
            self.issued_this_cycle = 0;
        }
        if self.issued_this_cycle >= self.config.issues_per_cycle {
            return Err(Backpressure::Busy {
                request,
                available_at: now.saturating_add(1),
            });
        }

        let start = self.next_free.max(now);
        let service = ceil_div_u64(request.size_bytes as u64, self.config.bytes_per_cycle as u64);
        self.next_free = start.saturating_add(service);
        let ready_at = self.next_free.saturating_add(self.config.base_latency);
        let ticket = Ticket::new(now, ready_at, request.size_bytes);

        self.issued_this_cycle += 1;
        self.inflight.push_back(Inflight {
            payload: request.payload,
            ticket,
        });
        Ok(ticket)
    }

    // Drain any requests that have completed by "now" and invoke the supplied callback with the
    // results.
    pub fn service_ready<F>(&mut self, now: Cycle, mut callback: F)
    where
        F: FnMut(ServiceResult<T>),
    {
        while self
            .inflight
            .front()
            .map_or(false, |front| front.ticket.is_ready(now))
        {
            if let Some(inflight) = self.inflight.pop_front() {
                callback(ServiceResult {
                    payload: inflight.payload,
                    ticket: inflight.ticket,
                });
            }
        }
    }

    // Earliest cycle at which the data path is free again.
    pub fn available_at(&self) -> Cycle {
        self.next_free
    }

    pub fn oldest_ticket(&self) -> Option<&Ticket> {
        self.inflight.front().map(|inflight| &inflight.ticket)
    }

    pub fn outstanding(&self) -> usize {
        self.inflight.len()
    }

    // Cycle at which a rejected request should be retried.
    pub fn retry_at(&self, now: Cycle) -> Cycle {
        self.oldest_ticket()
            .map(|ticket| ticket.ready_at())
            .unwrap_or(now)
            .max(now.saturating_add(1))
    }
}

fn ceil_div_u64(nom: u64, denom: u64) -> Cycle {
    debug_assert!(denom > 0);
    (nom + denom - 1) / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_cycle_events_fire_in_schedule_order() {
        let mut q = EventQueue::new();
        q.schedule(5, "b");
        q.schedule(5, "c");
        q.schedule(2, "a");
        assert_eq!(Some(2), q.advance_to_next(Cycle::MAX));
        assert_eq!("a", q.pop_due().unwrap().1);
        assert!(q.pop_due().is_none());
        assert_eq!(Some(5), q.advance_to_next(Cycle::MAX));
        assert_eq!("b", q.pop_due().unwrap().1);
        // zero-delay events scheduled mid-step run after the ones already queued
        q.schedule(0, "d");
        assert_eq!("c", q.pop_due().unwrap().1);
        assert_eq!("d", q.pop_due().unwrap().1);
        assert!(q.is_empty());
    }

    #[test]
    fn cancel_is_noop_after_dispatch() {
        let mut q = EventQueue::new();
        let h1 = q.schedule(1, 1u32);
        let h2 = q.schedule(1, 2u32);
        assert!(q.cancel(h2));
        assert!(!q.cancel(h2));
        q.advance_to_next(Cycle::MAX);
        let (h, v) = q.pop_due().unwrap();
        assert_eq!(h1, h);
        assert_eq!(1, v);
        assert!(q.pop_due().is_none());
        assert!(!q.cancel(h1));
    }

    #[test]
    fn advance_respects_horizon_and_pending_events() {
        let mut q = EventQueue::new();
        q.schedule(10, ());
        assert_eq!(None, q.advance_to_next(9));
        q.advance_to(50);
        assert_eq!(10, q.now());
        assert_eq!(Some(10), q.advance_to_next(10));
    }

    #[test]
    fn schedule_in_the_past_clamps_to_now() {
        let mut q = EventQueue::new();
        q.schedule(4, 0u8);
        q.advance_to_next(Cycle::MAX);
        q.pop_due();
        q.schedule_at(1, 7u8);
        assert_eq!(Some(4), q.next_time());
    }

    #[test]
    fn server_pipelines_bandwidth_and_latency() {
        let mut server = TimedServer::new(ServerConfig {
            base_latency: 3,
            bytes_per_cycle: 16,
            queue_capacity: 4,
            issues_per_cycle: 4,
        });
        let t0 = server.try_enqueue(0, ServiceRequest::new(0u32, 64)).unwrap();
        let t1 = server.try_enqueue(0, ServiceRequest::new(1u32, 64)).unwrap();
        assert_eq!(7, t0.ready_at());
        assert_eq!(11, t1.ready_at());
        let mut seen = Vec::new();
        server.service_ready(7, |r| seen.push(r.payload));
        assert_eq!(vec![0], seen);
        server.service_ready(11, |r| seen.push(r.payload));
        assert_eq!(vec![0, 1], seen);
    }

    #[test]
    fn server_reports_queue_full_and_busy() {
        let mut server = TimedServer::new(ServerConfig {
            base_latency: 1,
            bytes_per_cycle: 8,
            queue_capacity: 2,
            issues_per_cycle: 1,
        });
        server.try_enqueue(0, ServiceRequest::new((), 8)).unwrap();
        match server.try_enqueue(0, ServiceRequest::new((), 8)) {
            Err(Backpressure::Busy { available_at, .. }) => assert_eq!(1, available_at),
            other => panic!("expected busy, got {other:?}"),
        }
        server.try_enqueue(1, ServiceRequest::new((), 8)).unwrap();
        assert!(matches!(
            server.try_enqueue(2, ServiceRequest::new((), 8)),
            Err(Backpressure::QueueFull { capacity: 2, .. })
        ));
        assert_eq!(2, server.retry_at(0));
    }
}
