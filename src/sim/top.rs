use std::collections::{HashMap, VecDeque};

use log::{debug, info, trace, warn};
use serde::Serialize;
use smallvec::SmallVec;

use crate::cache::{CacheConfig, CacheHierarchy, Eviction, Ownership, WritePolicy};
use crate::coherence::protocol::{local_hit, requester_state};
use crate::coherence::{CoherenceEngine, CoherenceProtocol, DataSource, LineState, RoundId, SnoopKind};
use crate::dram::{DramController, DramKind, PagePolicy};
use crate::interconnect::{AxiTransaction, Interconnect, SubTransaction, TxnId, TxnKind, TxnOrigin};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::sim::config::SystemConfig;
use crate::sim::error::{SimError, SimResult};
use crate::sim::perf_log::{CommandLog, LogRecord, RequestRecord, TxnEvent, TxnRecord};
use crate::sim::request::{
    split_lines, AccessId, CompletionSink, MemOp, MemoryRequest, RequestHandle, RequestId,
    RequestStatus, Response,
};
use crate::timeq::{Backpressure, Cycle, EventHandle, EventQueue, ServiceRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Lookup(AccessId),
    RetryStalled(usize),
    AccessDone(AccessId),
    SnoopResponse { round: RoundId, target: usize },
    FinalizeRound(RoundId),
    L2Request(RoundId),
    L2Ready,
    L2Miss(RoundId),
    L1Fill(RoundId),
    RetrySubmit,
    Arbitrate,
    Dispatch,
    DramTick(usize),
    DramDone(SubTransaction),
    LinkReady,
    Watchdog(RequestId),
}

// one L1-line-sized piece of a request
#[derive(Debug, Clone, Copy)]
struct Access {
    request: RequestId,
    agent: usize,
    addr: u64,
    len: usize,
    // offset of this piece within the request's data
    offset: usize,
    op: MemOp,
    qos: u8,
    started: bool,
    counted: bool,
    lookup: Option<EventHandle>,
}

#[derive(Debug)]
struct Pending {
    agent: usize,
    addr: u64,
    size: u32,
    op: MemOp,
    // write payload, or the read buffer being assembled
    data: Vec<u8>,
    sink: CompletionSink,
    issued_at: Cycle,
    accesses: SmallVec<[AccessId; 4]>,
    remaining: usize,
    watchdog: EventHandle,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheGeometry {
    pub size_bytes: usize,
    pub associativity: usize,
    pub line_bytes: usize,
    pub sets: usize,
    pub hit_latency: Cycle,
    pub write_policy: WritePolicy,
    pub ownership: Ownership,
    pub mshr_entries: usize,
}

impl From<&CacheConfig> for CacheGeometry {
    fn from(c: &CacheConfig) -> Self {
        Self {
            size_bytes: c.size_bytes,
            associativity: c.associativity,
            line_bytes: c.line_bytes,
            sets: c.num_sets(),
            hit_latency: c.hit_latency,
            write_policy: c.write_policy,
            ownership: c.ownership,
            mshr_entries: c.mshr_entries,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DramGeometry {
    pub kind: DramKind,
    pub capacity_bytes: u64,
    pub channels: usize,
    pub ranks: usize,
    pub banks: usize,
    pub rows: u64,
    pub columns: u64,
    pub access_bytes: u64,
    pub page_policy: PagePolicy,
    pub peak_bandwidth_gbps: f64,
}

/// Read-only view of the configured system and the geometry derived from it.
#[derive(Debug, Clone, Serialize)]
pub struct TopologySnapshot {
    pub num_agents: usize,
    pub protocol: CoherenceProtocol,
    pub l1: CacheGeometry,
    pub l2: CacheGeometry,
    pub qos_weights: Vec<u32>,
    pub max_transaction_bytes: u64,
    pub dram: DramGeometry,
}

/// The simulation context: owns the clock and every component, and moves requests through
/// them one scheduled event at a time.
#[derive(Debug)]
pub struct MemorySystem {
    config: SystemConfig,
    events: EventQueue<Event>,
    caches: CacheHierarchy,
    engine: CoherenceEngine,
    interconnect: Interconnect,
    dram: DramController,
    metrics: MetricsCollector,
    log: CommandLog,

    pending: HashMap<RequestId, Pending>,
    accesses: HashMap<AccessId, Access>,
    // per agent, accesses waiting for a free MSHR entry in arrival order
    stalled: Vec<VecDeque<AccessId>>,
    responses: Vec<Response>,
    next_request: RequestId,
    next_access: AccessId,

    next_txn: TxnId,
    // L2 fill transactions -> L2 line
    txn_lines: HashMap<TxnId, u64>,
    // transactions refused by a full arbitration queue
    held: VecDeque<AxiTransaction>,
    arbitrate_pending: bool,
    dram_ticks: Vec<Option<(Cycle, EventHandle)>>,

    started: bool,
    fault: Option<SimError>,
}

impl MemorySystem {
    pub fn new(config: SystemConfig) -> SimResult<Self> {
        config.validate()?;
        let sim = &config.sim;
        let dram = DramController::new(&config.dram);
        let channels = dram.num_channels();
        let mut system = Self {
            events: EventQueue::new(),
            caches: CacheHierarchy::new(sim.num_agents, &config.l1, &config.l2),
            engine: CoherenceEngine::new(sim.protocol),
            interconnect: Interconnect::new(&config.interconnect, config.dram.access_bytes(), channels),
            dram,
            metrics: MetricsCollector::new(sim.num_agents),
            log: CommandLog::new(sim.record_log, sim.command_log.as_deref())?,
            pending: HashMap::new(),
            accesses: HashMap::new(),
            stalled: vec![VecDeque::new(); sim.num_agents],
            responses: Vec::new(),
            next_request: 0,
            next_access: 0,
            next_txn: 0,
            txn_lines: HashMap::new(),
            held: VecDeque::new(),
            arbitrate_pending: false,
            dram_ticks: vec![None; channels],
            started: false,
            fault: None,
            config,
        };
        for channel in 0..channels {
            let at = system.dram.refresh_wakeup(channel);
            system.schedule_dram_tick(channel, at);
        }
        info!(
            "memory system: {} agents, {:?}, {} DRAM channel(s)",
            system.config.sim.num_agents, system.config.sim.protocol, channels
        );
        Ok(system)
    }

    /// Replace the configuration. Only allowed before the first request is submitted.
    pub fn configure(&mut self, config: SystemConfig) -> SimResult<()> {
        if self.started {
            return Err(SimError::config("configure after the simulation started"));
        }
        *self = Self::new(config)?;
        info!("memory system reconfigured");
        Ok(())
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn now(&self) -> Cycle {
        self.events.now()
    }

    pub fn fault(&self) -> Option<&SimError> {
        self.fault.as_ref()
    }

    pub fn caches(&self) -> &CacheHierarchy {
        &self.caches
    }

    pub fn coherence(&self) -> &CoherenceEngine {
        &self.engine
    }

    pub fn interconnect(&self) -> &Interconnect {
        &self.interconnect
    }

    pub fn dram(&self) -> &DramController {
        &self.dram
    }

    pub fn command_log(&self) -> &CommandLog {
        &self.log
    }

    /// Coherency state of the L1 line holding `addr` in `agent`'s cache.
    pub fn l1_state(&self, agent: usize, addr: u64) -> LineState {
        self.caches
            .l1
            .get(agent)
            .map_or(LineState::Invalid, |l1| l1.state(l1.line_addr(addr)))
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// No request outstanding and no coherency or DRAM-bound work left in flight.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
            && self.engine.active_rounds() == 0
            && self.interconnect.is_idle()
            && self.held.is_empty()
    }

    pub fn submit(&mut self, request: MemoryRequest) -> SimResult<RequestHandle> {
        self.check_fault()?;
        self.validate_request(&request)?;
        self.started = true;

        let now = self.now();
        let id = self.next_request;
        self.next_request += 1;
        let line_bytes = self.caches.l1_line_bytes();
        let mut accesses = SmallVec::new();
        let mut offset = 0;
        for (addr, len) in split_lines(request.addr, request.size, line_bytes) {
            let aid = self.next_access;
            self.next_access += 1;
            let handle = self.events.schedule(0, Event::Lookup(aid));
            self.accesses.insert(
                aid,
                Access {
                    request: id,
                    agent: request.agent,
                    addr,
                    len,
                    offset,
                    op: request.op,
                    qos: request.qos,
                    started: false,
                    counted: false,
                    lookup: Some(handle),
                },
            );
            accesses.push(aid);
            offset += len;
        }
        let watchdog = self
            .events
            .schedule(self.config.sim.timeout, Event::Watchdog(id));
        let data = match request.op {
            MemOp::Read => vec![0; request.size as usize],
            MemOp::Write => request.data.unwrap_or_default(),
        };
        debug!(
            "request {id}: agent {} {:?} {:#x}+{} qos {} at {now} ({} accesses)",
            request.agent,
            request.op,
            request.addr,
            request.size,
            request.qos,
            accesses.len()
        );
        self.pending.insert(
            id,
            Pending {
                agent: request.agent,
                addr: request.addr,
                size: request.size,
                op: request.op,
                data,
                sink: request.sink,
                issued_at: now,
                remaining: accesses.len(),
                accesses,
                watchdog,
            },
        );
        Ok(RequestHandle(id))
    }

    fn validate_request(&self, request: &MemoryRequest) -> SimResult<()> {
        let invalid = |detail: String| -> SimResult<()> { Err(SimError::InvalidRequest(detail)) };
        if request.agent >= self.config.sim.num_agents {
            return invalid(format!(
                "agent {} out of range (have {})",
                request.agent, self.config.sim.num_agents
            ));
        }
        if request.size == 0 {
            return invalid("zero-sized request".to_string());
        }
        if request.op == MemOp::Write {
            let len = request.data.as_ref().map_or(0, Vec::len);
            if len != request.size as usize {
                return invalid(format!(
                    "write of {} bytes carries {len} bytes of data",
                    request.size
                ));
            }
        }
        let capacity = self.config.dram.capacity_bytes;
        if request.addr >= capacity || request.end() > capacity {
            return invalid(format!(
                "{:#x}+{} outside the {capacity:#x}-byte address space",
                request.addr, request.size
            ));
        }
        if request.qos as usize >= self.config.interconnect.num_classes() {
            return invalid(format!(
                "qos class {} out of range (have {})",
                request.qos,
                self.config.interconnect.num_classes()
            ));
        }
        Ok(())
    }

    /// Withdraw a request that has not started its first lookup. Delivers `Cancelled`.
    pub fn cancel(&mut self, handle: RequestHandle) -> bool {
        let Some(pending) = self.pending.get(&handle.0) else {
            return false;
        };
        let untouched = pending
            .accesses
            .iter()
            .all(|aid| self.accesses.get(aid).map_or(false, |a| !a.started));
        if !untouched {
            return false;
        }
        self.complete(handle.0, RequestStatus::Cancelled);
        true
    }

    /// Take the queued response of a finished request, if it has arrived.
    pub fn take_response(&mut self, handle: RequestHandle) -> Option<Response> {
        let idx = self.responses.iter().position(|r| r.id == handle.0)?;
        Some(self.responses.remove(idx))
    }

    pub fn drain_responses(&mut self) -> Vec<Response> {
        std::mem::take(&mut self.responses)
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(
            self.now(),
            self.engine.stats(),
            self.interconnect.stats(),
            &self.dram,
        )
    }

    pub fn topology(&self) -> TopologySnapshot {
        let d = &self.config.dram;
        TopologySnapshot {
            num_agents: self.config.sim.num_agents,
            protocol: self.config.sim.protocol,
            l1: CacheGeometry::from(&self.config.l1),
            l2: CacheGeometry::from(&self.config.l2),
            qos_weights: self.config.interconnect.qos_weights.clone(),
            max_transaction_bytes: self.config.interconnect.max_transaction_bytes(),
            dram: DramGeometry {
                kind: d.kind,
                capacity_bytes: d.capacity_bytes,
                channels: d.channels,
                ranks: d.ranks,
                banks: d.banks,
                rows: d.rows(),
                columns: d.columns(),
                access_bytes: d.access_bytes(),
                page_policy: d.page_policy,
                peak_bandwidth_gbps: d.peak_bandwidth_gbps(),
            },
        }
    }

    /// Directory/cache agreement and the single-writer rule.
    pub fn check_invariants(&self) -> SimResult<()> {
        self.engine.check(&self.caches.l1, self.now())
    }

    fn check_fault(&self) -> SimResult<()> {
        match &self.fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }

    /// Dispatch every event of the next busy cycle. Returns that cycle, or `None` when nothing
    /// is scheduled at all.
    pub fn step(&mut self) -> SimResult<Option<Cycle>> {
        self.check_fault()?;
        let Some(now) = self.events.advance_to_next(Cycle::MAX) else {
            return Ok(None);
        };
        while let Some((_, event)) = self.events.pop_due() {
            if let Err(err) = self.handle(event) {
                warn!("fatal fault at cycle {now}: {err}");
                self.fault = Some(err.clone());
                self.log.flush();
                return Err(err);
            }
        }
        Ok(Some(now))
    }

    /// Run until `until`, or until the last outstanding request finishes if there were any.
    pub fn run_until(&mut self, until: Cycle) -> SimResult<Cycle> {
        self.check_fault()?;
        let was_busy = !self.pending.is_empty();
        while self.events.next_time().map_or(false, |next| next <= until) {
            self.step()?;
            if was_busy && self.pending.is_empty() {
                return Ok(self.now());
            }
        }
        self.events.advance_to(until);
        Ok(self.now())
    }

    pub fn advance(&mut self, cycles: Cycle) -> SimResult<Cycle> {
        self.run_until(self.now().saturating_add(cycles))
    }

    /// Run until every request has finished and the fabric has drained.
    pub fn run_until_idle(&mut self) -> SimResult<Cycle> {
        self.check_fault()?;
        while !self.is_idle() {
            if self.step()?.is_none() {
                break;
            }
        }
        info!(
            "memory system idle at cycle {} ({} DRAM commands checked)",
            self.now(),
            self.dram.commands_checked()
        );
        self.log.flush();
        Ok(self.now())
    }

    fn handle(&mut self, event: Event) -> SimResult<()> {
        trace!("{}: {:?}", self.now(), event);
        match event {
            Event::Lookup(aid) => self.lookup(aid),
            Event::RetryStalled(agent) => {
                for aid in std::mem::take(&mut self.stalled[agent]) {
                    self.lookup(aid)?;
                }
                Ok(())
            }
            Event::AccessDone(aid) => {
                self.access_done(aid);
                Ok(())
            }
            Event::SnoopResponse { round, target } => self.snoop_response(round, target),
            Event::FinalizeRound(round) => self.finalize_round(round),
            Event::L2Request(round) => {
                self.l2_request(round);
                Ok(())
            }
            Event::L2Ready => self.l2_ready(),
            Event::L2Miss(round) => self.l2_miss(round),
            Event::L1Fill(round) => self.l1_fill(round),
            Event::RetrySubmit => self.retry_submit(),
            Event::Arbitrate => self.arbitrate(),
            Event::Dispatch => {
                self.dispatch();
                Ok(())
            }
            Event::DramTick(channel) => self.dram_tick(channel),
            Event::DramDone(piece) => {
                let now = self.now();
                if let Some(at) = self.interconnect.piece_done(now, piece)? {
                    self.events.schedule_at(at, Event::LinkReady);
                }
                Ok(())
            }
            Event::LinkReady => self.link_ready(),
            Event::Watchdog(id) => {
                if self.pending.contains_key(&id) {
                    warn!("request {id} timed out at cycle {}", self.now());
                    self.complete(id, RequestStatus::Timeout);
                }
                Ok(())
            }
        }
    }

    // ---------------------------------------------------------------------------------------
    // L1 and request bookkeeping

    fn lookup(&mut self, aid: AccessId) -> SimResult<()> {
        let now = self.now();
        // accesses of timed-out requests are dropped
        let Some(access) = self.accesses.get_mut(&aid) else {
            return Ok(());
        };
        access.started = true;
        access.lookup = None;
        let first = !access.counted;
        access.counted = true;
        let a = *access;

        let l1 = &self.caches.l1[a.agent];
        let line_addr = l1.line_addr(a.addr);
        let kind = snoop_kind(a.op);
        // keep program order behind earlier accesses to the line that are waiting for an MSHR
        let accesses = &self.accesses;
        let blocked = self.stalled[a.agent].iter().any(|other| {
            accesses
                .get(other)
                .map_or(false, |o| l1.line_addr(o.addr) == line_addr)
        });
        if blocked {
            if first {
                self.metrics.record_l1(a.agent, false);
            }
            self.stall(a.agent, aid);
            return Ok(());
        }
        let mshr = &mut self.caches.l1_mshr[a.agent];
        if mshr.has_entry(line_addr) {
            if first {
                self.metrics.record_l1(a.agent, false);
            }
            trace!("l1[{}]: access {aid} merges into miss on {line_addr:#x}", a.agent);
            return mshr.merge(line_addr, aid).map_err(|_| {
                SimError::protocol(now, format!("l1[{}] lost MSHR entry {line_addr:#x}", a.agent))
            });
        }

        let state = l1.state(line_addr);
        if local_hit(state, kind) {
            if first {
                self.metrics.record_l1(a.agent, true);
            }
            self.apply_hit(aid, line_addr)?;
            let latency = self.config.l1.hit_latency;
            self.events.schedule(latency, Event::AccessDone(aid));
            return Ok(());
        }

        if first {
            self.metrics.record_l1(a.agent, false);
        }
        if mshr.allocate(line_addr, aid).is_err() {
            trace!("l1[{}]: MSHR full, access {aid} retries", a.agent);
            self.stall(a.agent, aid);
            return Ok(());
        }
        if state.is_valid() {
            self.engine.note_upgrade();
        }
        debug!(
            "l1[{}]: {:?} miss on {line_addr:#x} ({}) at {now}",
            a.agent,
            a.op,
            state.short()
        );
        self.start_round(line_addr, a.agent, kind, a.qos)
    }

    fn stall(&mut self, agent: usize, aid: AccessId) {
        if self.stalled[agent].is_empty() {
            self.events.schedule(1, Event::RetryStalled(agent));
        }
        self.stalled[agent].push_back(aid);
    }

    // Serve an access from the requester's L1 copy.
    fn apply_hit(&mut self, aid: AccessId, line_addr: u64) -> SimResult<()> {
        let now = self.now();
        let Some(a) = self.accesses.get(&aid).copied() else {
            return Ok(());
        };
        let Some(pending) = self.pending.get_mut(&a.request) else {
            return Ok(());
        };
        let write_through = self.config.l1.write_policy == WritePolicy::WriteThrough;
        let line = self.caches.l1[a.agent].lookup(line_addr).ok_or_else(|| {
            SimError::protocol(now, format!("l1[{}] hit on absent line {line_addr:#x}", a.agent))
        })?;
        let offset = (a.addr - line_addr) as usize;
        let piece = a.offset..a.offset + a.len;
        match a.op {
            MemOp::Read => {
                pending.data[piece].copy_from_slice(line.read(offset, a.len));
            }
            MemOp::Write => {
                line.write(offset, &pending.data[piece.clone()]);
                if line.state != LineState::Modified {
                    line.state = LineState::Modified;
                    self.engine.record(line_addr, a.agent, LineState::Modified);
                }
                if write_through {
                    let bytes = pending.data[piece].to_vec();
                    self.write_back(a.addr, &bytes)?;
                } else {
                    line.dirty = true;
                }
            }
        }
        Ok(())
    }

    fn access_done(&mut self, aid: AccessId) {
        let Some(access) = self.accesses.remove(&aid) else {
            return;
        };
        let Some(pending) = self.pending.get_mut(&access.request) else {
            return;
        };
        pending.remaining -= 1;
        if pending.remaining == 0 {
            self.complete(access.request, RequestStatus::Ok);
        }
    }

    fn complete(&mut self, id: RequestId, status: RequestStatus) {
        let Some(mut pending) = self.pending.remove(&id) else {
            return;
        };
        let now = self.now();
        if status != RequestStatus::Timeout {
            self.events.cancel(pending.watchdog);
        }
        for aid in &pending.accesses {
            if let Some(access) = self.accesses.remove(aid) {
                if let Some(handle) = access.lookup {
                    self.events.cancel(handle);
                }
            }
        }
        let data = match (status, pending.op) {
            (RequestStatus::Ok, MemOp::Read) => Some(std::mem::take(&mut pending.data)),
            _ => None,
        };
        let response = Response {
            id,
            agent: pending.agent,
            addr: pending.addr,
            size: pending.size,
            op: pending.op,
            status,
            data,
            issued_at: pending.issued_at,
            completed_at: now,
            latency: now - pending.issued_at,
        };
        debug!(
            "request {id}: {:?} after {} cycles",
            status, response.latency
        );
        self.metrics.record_response(&response);
        if self.log.is_enabled() {
            self.log.push(LogRecord::Request(RequestRecord::from(&response)));
        }
        pending.sink.deliver(response, &mut self.responses);
    }

    // ---------------------------------------------------------------------------------------
    // Coherency rounds

    fn start_round(&mut self, line_addr: u64, agent: usize, kind: SnoopKind, qos: u8) -> SimResult<()> {
        let now = self.now();
        let Some(round) = self.engine.begin(line_addr, agent, kind, qos, now) else {
            return Ok(());
        };
        let targets = self.engine.broadcast(round);
        debug!(
            "coherence: round {round} l1[{agent}] {kind:?} {line_addr:#x} snoops {:?}",
            &targets[..]
        );
        if targets.is_empty() {
            self.events.schedule(0, Event::FinalizeRound(round));
        }
        let latency = self.config.sim.snoop_latency;
        for target in targets {
            self.events
                .schedule(latency, Event::SnoopResponse { round, target });
        }
        Ok(())
    }

    fn snoop_response(&mut self, round: RoundId, target: usize) -> SimResult<()> {
        let now = self.now();
        let cache = self.caches.l1.get_mut(target).ok_or_else(|| {
            SimError::protocol(now, format!("snoop response from unknown cache {target}"))
        })?;
        let outcome = self.engine.snoop(round, target, cache, now)?;
        if let Some(data) = outcome.writeback {
            let line_addr = self.round_line(round)?;
            self.write_back(line_addr, &data)?;
        }
        if outcome.last {
            self.events.schedule(0, Event::FinalizeRound(round));
        }
        Ok(())
    }

    fn round_line(&self, round: RoundId) -> SimResult<u64> {
        self.engine
            .round(round)
            .map(|r| r.line_addr)
            .ok_or_else(|| SimError::protocol(self.now(), format!("unknown round {round}")))
    }

    // Every snoop response is in: pick where the requester's data comes from.
    fn finalize_round(&mut self, round: RoundId) -> SimResult<()> {
        let now = self.now();
        let r = self
            .engine
            .round_mut(round)
            .ok_or_else(|| SimError::protocol(now, format!("finalize of unknown round {round}")))?;
        let held = self.caches.l1[r.requester].state(r.line_addr).is_valid();
        let source = if held {
            DataSource::Own
        } else if r.supplied.is_some() {
            DataSource::Peer
        } else {
            DataSource::L2
        };
        r.source = Some(source);
        trace!("coherence: round {round} finalized, data from {source:?}");
        match source {
            DataSource::Own => self.events.schedule(0, Event::L1Fill(round)),
            DataSource::Peer => self
                .events
                .schedule(self.config.sim.transfer_latency, Event::L1Fill(round)),
            _ => self.events.schedule(0, Event::L2Request(round)),
        };
        Ok(())
    }

    fn l1_fill(&mut self, round: RoundId) -> SimResult<()> {
        let now = self.now();
        let r = self
            .engine
            .round_mut(round)
            .ok_or_else(|| SimError::protocol(now, format!("fill for unknown round {round}")))?;
        let (line_addr, requester, kind) = (r.line_addr, r.requester, r.kind);
        let supplied = r.supplied.take();
        let source = r.source;

        let l1 = &self.caches.l1[requester];
        let own = l1.peek(line_addr).map(|line| (line.data.clone(), line.dirty));
        let (data, own_dirty) = match (source, own, supplied) {
            (Some(DataSource::Own), Some((data, dirty)), _) => (data, dirty),
            (Some(DataSource::Peer), _, Some(data)) => (data, false),
            _ => {
                let mut data = vec![0u8; self.caches.l1_line_bytes()].into_boxed_slice();
                self.caches
                    .read_next_level(self.dram.store(), line_addr, &mut data);
                (data, false)
            }
        };

        let others = !self.engine.directory().others(line_addr, requester).is_empty();
        let state = requester_state(kind, others);
        // a write-through L1 has already pushed the write below it
        let write_back = self.config.l1.write_policy == WritePolicy::WriteBack;
        let dirty = own_dirty || (kind == SnoopKind::Write && write_back);
        let victim = self.caches.l1[requester].install(line_addr, state, &data, dirty);
        if let Some(victim) = victim {
            self.evict_l1(requester, victim)?;
        }
        self.engine.record(line_addr, requester, state);
        debug!(
            "l1[{requester}]: fill {line_addr:#x} as {} from {:?} at {now}",
            state.short(),
            source
        );

        if let Some(entry) = self.caches.l1_mshr[requester].remove_entry(line_addr) {
            for aid in entry.waiting {
                self.events.schedule(0, Event::Lookup(aid));
            }
        }
        if let Some(next) = self.engine.finish(round) {
            self.start_round(line_addr, next.requester, next.kind, next.qos)?;
        }
        Ok(())
    }

    fn evict_l1(&mut self, agent: usize, victim: Eviction) -> SimResult<()> {
        self.engine.record(victim.line_addr, agent, LineState::Invalid);
        if victim.needs_writeback() {
            trace!("l1[{agent}]: write back {:#x}", victim.line_addr);
            self.write_back(victim.line_addr, &victim.data)?;
        }
        Ok(())
    }

    // Push bytes below the L1s; DRAM-bound writes become a writeback transaction.
    fn write_back(&mut self, addr: u64, bytes: &[u8]) -> SimResult<()> {
        let landed = self
            .caches
            .write_next_level(self.dram.store_mut(), addr, bytes);
        if landed.to_dram {
            let qos = self.config.interconnect.writeback_class();
            self.submit_txn(TxnKind::Write, addr, bytes.len() as u32, qos, TxnOrigin::Writeback)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------------------
    // L2

    fn l2_request(&mut self, round: RoundId) {
        let now = self.now();
        let bytes = self.caches.l1_line_bytes() as u32;
        match self
            .caches
            .l2_port
            .try_enqueue(now, ServiceRequest::new(round, bytes))
        {
            Ok(ticket) => {
                self.events.schedule_at(ticket.ready_at(), Event::L2Ready);
            }
            Err(bp) => {
                let retry = match bp {
                    Backpressure::Busy { available_at, .. } => available_at,
                    Backpressure::QueueFull { .. } => self.caches.l2_port.retry_at(now),
                };
                trace!("l2: port busy, round {round} retries at {retry}");
                self.events.schedule_at(retry, Event::L2Request(round));
            }
        }
    }

    fn l2_ready(&mut self) -> SimResult<()> {
        let now = self.now();
        let mut ready: SmallVec<[RoundId; 4]> = SmallVec::new();
        self.caches
            .l2_port
            .service_ready(now, |done| ready.push(done.payload));
        for round in ready {
            let line_addr = self.round_line(round)?;
            let l2_line = self.caches.l2.line_addr(line_addr);
            let hit = self.caches.l2.lookup(l2_line).is_some();
            self.metrics.record_l2(hit);
            if hit {
                trace!("l2: hit {l2_line:#x} for round {round}");
                self.events.schedule(0, Event::L1Fill(round));
            } else {
                if let Some(r) = self.engine.round_mut(round) {
                    r.source = Some(DataSource::Dram);
                }
                self.l2_miss(round)?;
            }
        }
        Ok(())
    }

    fn l2_miss(&mut self, round: RoundId) -> SimResult<()> {
        let (line_addr, qos) = {
            let r = self.engine.round(round).ok_or_else(|| {
                SimError::protocol(self.now(), format!("l2 miss for unknown round {round}"))
            })?;
            (r.line_addr, r.qos)
        };
        let l2_line = self.caches.l2.line_addr(line_addr);
        // filled while this round waited for a free fill slot
        if self.caches.l2.peek(l2_line).is_some() {
            self.events.schedule(0, Event::L1Fill(round));
            return Ok(());
        }
        let fills = &mut self.caches.l2_fills;
        if fills.merge(l2_line, round).is_ok() {
            trace!("l2: round {round} joins fetch of {l2_line:#x}");
            return Ok(());
        }
        if fills.allocate(l2_line, round).is_err() {
            self.events.schedule(1, Event::L2Miss(round));
            return Ok(());
        }
        let bytes = self.caches.l2.line_bytes() as u32;
        let id = self.submit_txn(TxnKind::Read, l2_line, bytes, qos, TxnOrigin::L2Fill)?;
        self.txn_lines.insert(id, l2_line);
        debug!("l2: miss {l2_line:#x}, fetch txn {id}");
        Ok(())
    }

    fn l2_fill_done(&mut self, txn: TxnId) -> SimResult<()> {
        let now = self.now();
        let l2_line = self.txn_lines.remove(&txn).ok_or_else(|| {
            SimError::protocol(now, format!("fill transaction {txn} has no L2 line"))
        })?;
        let data = self.dram.store().read(l2_line, self.caches.l2.line_bytes());
        if let Some(victim) = self.caches.fill_l2(self.dram.store_mut(), l2_line, &data) {
            let qos = self.config.interconnect.writeback_class();
            debug!("l2: dirty victim {:#x} written back", victim.line_addr);
            self.submit_txn(
                TxnKind::Write,
                victim.line_addr,
                victim.data.len() as u32,
                qos,
                TxnOrigin::Writeback,
            )?;
        }
        if let Some(entry) = self.caches.l2_fills.remove_entry(l2_line) {
            for round in entry.waiting {
                self.events.schedule(0, Event::L1Fill(round));
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------------------
    // Interconnect and DRAM

    fn submit_txn(
        &mut self,
        kind: TxnKind,
        addr: u64,
        bytes: u32,
        qos: u8,
        origin: TxnOrigin,
    ) -> SimResult<TxnId> {
        let now = self.now();
        let id = self.next_txn;
        self.next_txn += 1;
        let txn = AxiTransaction::new(id, addr, bytes, kind, qos, origin);
        if self.log.is_enabled() {
            self.log
                .push(LogRecord::Transaction(TxnRecord::new(now, TxnEvent::Submitted, &txn)));
        }
        match self.interconnect.submit(now, txn)? {
            Ok(()) => self.schedule_arbitrate(0),
            Err(txn) => self.hold(txn),
        }
        Ok(id)
    }

    fn hold(&mut self, txn: AxiTransaction) {
        if self.held.is_empty() {
            self.events.schedule(1, Event::RetrySubmit);
        }
        self.held.push_back(txn);
    }

    fn retry_submit(&mut self) -> SimResult<()> {
        let now = self.now();
        let held = std::mem::take(&mut self.held);
        for txn in held {
            match self.interconnect.submit(now, txn)? {
                Ok(()) => self.schedule_arbitrate(0),
                Err(txn) => self.hold(txn),
            }
        }
        Ok(())
    }

    fn schedule_arbitrate(&mut self, delay: Cycle) {
        if !self.arbitrate_pending {
            self.arbitrate_pending = true;
            self.events.schedule(delay, Event::Arbitrate);
        }
    }

    fn arbitrate(&mut self) -> SimResult<()> {
        self.arbitrate_pending = false;
        let now = self.now();
        let arrivals = self.interconnect.arbitrate(now)?;
        for at in arrivals {
            self.events.schedule_at(at, Event::Dispatch);
        }
        if self.interconnect.has_pending_grants() {
            self.schedule_arbitrate(1);
        }
        Ok(())
    }

    fn dispatch(&mut self) {
        let now = self.now();
        let dispatched = self.interconnect.dispatch(now, &mut self.dram);
        for channel in dispatched.channels {
            self.kick_dram(channel);
        }
    }

    fn schedule_dram_tick(&mut self, channel: usize, at: Cycle) {
        if at == Cycle::MAX {
            self.dram_ticks[channel] = None;
            return;
        }
        let handle = self.events.schedule_at(at, Event::DramTick(channel));
        self.dram_ticks[channel] = Some((at.max(self.now()), handle));
    }

    // New work for a channel: make sure it is ticked this cycle.
    fn kick_dram(&mut self, channel: usize) {
        let now = self.now();
        if let Some((at, handle)) = self.dram_ticks[channel] {
            if at <= now && self.events.is_pending(handle) {
                return;
            }
            self.events.cancel(handle);
        }
        self.schedule_dram_tick(channel, now);
    }

    fn dram_tick(&mut self, channel: usize) -> SimResult<()> {
        let now = self.now();
        self.dram_ticks[channel] = None;
        let outcome = self.dram.tick(now, channel)?;
        if let Some(command) = outcome.command {
            trace!("dram: {command}");
            if self.log.is_enabled() {
                self.log.push(LogRecord::Dram(command));
            }
        }
        if let Some(done) = outcome.completion {
            self.events.schedule_at(done.done_at, Event::DramDone(done.sub));
            // a queue slot freed up
            if self.interconnect.has_waiting(channel) {
                self.events.schedule(0, Event::Dispatch);
            }
        }
        self.schedule_dram_tick(channel, outcome.next_tick);
        Ok(())
    }

    fn link_ready(&mut self) -> SimResult<()> {
        let now = self.now();
        for txn in self.interconnect.deliver(now)? {
            if self.log.is_enabled() {
                self.log
                    .push(LogRecord::Transaction(TxnRecord::new(now, TxnEvent::Delivered, &txn)));
            }
            match txn.origin {
                TxnOrigin::L2Fill => self.l2_fill_done(txn.id)?,
                TxnOrigin::Writeback => trace!("writeback txn {} done", txn.id),
            }
        }
        Ok(())
    }
}

fn snoop_kind(op: MemOp) -> SnoopKind {
    match op {
        MemOp::Read => SnoopKind::Read,
        MemOp::Write => SnoopKind::Write,
    }
}
