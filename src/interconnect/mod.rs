pub mod arbiter;
pub mod config;
pub mod reorder;
pub mod transaction;

use std::collections::{HashMap, VecDeque};

use log::{debug, trace};
use serde::Serialize;
use smallvec::SmallVec;

pub use arbiter::QosArbiter;
pub use config::InterconnectConfig;
pub use reorder::ReorderBuffer;
pub use transaction::{split_bursts, AxiTransaction, SubTransaction, TxnId, TxnKind, TxnOrigin};

use crate::dram::DramController;
use crate::sim::error::{SimError, SimResult};
use crate::timeq::{Cycle, ServerConfig, ServiceRequest, TimedServer};

#[derive(Debug, Clone, Default, Serialize)]
pub struct InterconnectStats {
    pub submitted: u64,
    pub completed: u64,
    // grants per qos class
    pub grants: Vec<u64>,
    pub pieces: u64,
    pub arbiter_full: u64,
    pub dram_stalls: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Pieces handed to DRAM and the channels that received them.
#[derive(Debug, Default)]
pub struct Dispatched {
    pub channels: SmallVec<[usize; 4]>,
    // a piece is still held back by a full DRAM queue
    pub stalled: bool,
}

/// AXI-style fabric between the L2 and the DRAM controller: QoS arbitration of whole
/// transactions, burst splitting into DRAM-access pieces, and in-order delivery per id.
///
/// Requests and responses each cross a pipelined link whose data path moves
/// `data_width_bytes` per cycle; read requests and write responses carry no data.
#[derive(Debug)]
pub struct Interconnect {
    config: InterconnectConfig,
    access_bytes: u32,
    arbiter: QosArbiter<TxnId>,
    txns: HashMap<TxnId, AxiTransaction>,
    rob: ReorderBuffer,
    request_link: TimedServer<SubTransaction>,
    // granted pieces that crossed the request link, per DRAM channel in grant order
    waiting: Vec<VecDeque<SubTransaction>>,
    response_link: TimedServer<SubTransaction>,
    stats: InterconnectStats,
}

fn link(latency: Cycle, width: u32) -> TimedServer<SubTransaction> {
    TimedServer::new(ServerConfig {
        base_latency: latency,
        bytes_per_cycle: width,
        queue_capacity: usize::MAX,
        issues_per_cycle: u32::MAX,
    })
}

impl Interconnect {
    pub fn new(config: &InterconnectConfig, access_bytes: u64, channels: usize) -> Self {
        Self {
            config: config.clone(),
            access_bytes: access_bytes as u32,
            arbiter: QosArbiter::new(&config.qos_weights, config.queue_capacity),
            txns: HashMap::new(),
            rob: ReorderBuffer::new(),
            request_link: link(config.request_latency, config.data_width_bytes),
            waiting: vec![VecDeque::new(); channels],
            response_link: link(config.response_latency, config.data_width_bytes),
            stats: InterconnectStats {
                grants: vec![0; config.num_classes()],
                ..Default::default()
            },
        }
    }

    pub fn config(&self) -> &InterconnectConfig {
        &self.config
    }

    pub fn stats(&self) -> &InterconnectStats {
        &self.stats
    }

    pub fn has_pending_grants(&self) -> bool {
        !self.arbiter.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.txns.is_empty()
    }

    pub fn class_of(&self, qos: u8) -> usize {
        (qos as usize).min(self.config.num_classes() - 1)
    }

    /// Queue a transaction for arbitration. `Ok(Err(txn))` hands it back when its class queue is
    /// full; malformed transactions are protocol faults.
    pub fn submit(
        &mut self,
        now: Cycle,
        mut txn: AxiTransaction,
    ) -> SimResult<Result<(), AxiTransaction>> {
        if self.txns.contains_key(&txn.id) {
            return Err(SimError::protocol(
                now,
                format!("interconnect: transaction id {} already in flight", txn.id),
            ));
        }
        if txn.bytes == 0 || txn.bytes as u64 > self.config.max_transaction_bytes() {
            return Err(SimError::protocol(
                now,
                format!(
                    "interconnect: transaction {} moves {} bytes (max {})",
                    txn.id,
                    txn.bytes,
                    self.config.max_transaction_bytes()
                ),
            ));
        }
        if self.config.address_width < 64 && txn.end() > 1u64 << self.config.address_width {
            return Err(SimError::protocol(
                now,
                format!("interconnect: address {:#x} beyond the address space", txn.addr),
            ));
        }
        let class = self.class_of(txn.qos);
        if let Err(id) = self.arbiter.try_push(class, txn.id) {
            self.stats.arbiter_full += 1;
            trace!("interconnect: class {class} full, txn {id} held back");
            return Ok(Err(txn));
        }
        txn.issued_at = now;
        self.stats.submitted += 1;
        self.txns.insert(txn.id, txn);
        Ok(Ok(()))
    }

    /// Grant up to `grants_per_cycle` transactions and send their pieces over the request link.
    /// Returns the cycles at which the pieces reach the DRAM side.
    pub fn arbitrate(&mut self, now: Cycle) -> SimResult<SmallVec<[Cycle; 4]>> {
        let mut arrivals = SmallVec::new();
        for _ in 0..self.config.grants_per_cycle {
            let Some((class, id)) = self.arbiter.grant() else {
                break;
            };
            let txn = self.txns.get_mut(&id).ok_or_else(|| {
                SimError::protocol(now, format!("interconnect: granted unknown transaction {id}"))
            })?;
            let pieces = split_bursts(txn, self.access_bytes, self.config.data_width_bytes);
            txn.beats = pieces.iter().map(|p| p.beats).sum();
            txn.granted_at = Some(now);
            txn.outstanding = true;
            self.rob.register(id, pieces.len() as u32);
            self.stats.grants[class] += 1;
            debug!(
                "interconnect: grant txn {id} class {class} {:?} {:#x}+{} in {} pieces at {now}",
                txn.kind,
                txn.addr,
                txn.bytes,
                pieces.len()
            );
            for piece in pieces {
                let payload = if piece.is_write() { piece.bytes } else { 0 };
                let ticket = self
                    .request_link
                    .try_enqueue(now, ServiceRequest::new(piece, payload))
                    .map_err(|_| SimError::protocol(now, "interconnect: request link refused"))?;
                self.stats.pieces += 1;
                if arrivals.last() != Some(&ticket.ready_at()) {
                    arrivals.push(ticket.ready_at());
                }
            }
        }
        Ok(arrivals)
    }

    /// Move pieces that crossed the request link into the DRAM queues, oldest first per channel.
    pub fn dispatch(&mut self, now: Cycle, dram: &mut DramController) -> Dispatched {
        let waiting = &mut self.waiting;
        self.request_link.service_ready(now, |done| {
            let channel = dram.channel_of(done.payload.addr);
            waiting[channel].push_back(done.payload);
        });

        let mut out = Dispatched::default();
        for (channel, queue) in self.waiting.iter_mut().enumerate() {
            while let Some(piece) = queue.pop_front() {
                match dram.try_enqueue(now, piece) {
                    Ok(_) => {
                        if !out.channels.contains(&channel) {
                            out.channels.push(channel);
                        }
                    }
                    Err(piece) => {
                        queue.push_front(piece);
                        self.stats.dram_stalls += 1;
                        out.stalled = true;
                        break;
                    }
                }
            }
        }
        out
    }

    pub fn has_waiting(&self, channel: usize) -> bool {
        !self.waiting[channel].is_empty()
    }

    /// A DRAM access finished. Pieces released in order go onto the response link; returns the
    /// cycle the last of them arrives, if any were released.
    pub fn piece_done(&mut self, now: Cycle, piece: SubTransaction) -> SimResult<Option<Cycle>> {
        let txn = self.txns.get(&piece.txn).ok_or_else(|| {
            SimError::protocol(
                now,
                format!("interconnect: response for unknown transaction {}", piece.txn),
            )
        })?;
        if !self.rob.contains(piece.txn) {
            return Err(SimError::protocol(
                now,
                format!("interconnect: transaction {} not awaiting responses", piece.txn),
            ));
        }
        let (ready, _) = self.rob.complete(piece.txn, piece.index);
        let pieces = split_bursts(txn, self.access_bytes, self.config.data_width_bytes);
        let mut last = None;
        for index in ready {
            let p = pieces[index as usize];
            let payload = if p.is_write() { 0 } else { p.bytes };
            let ticket = self
                .response_link
                .try_enqueue(now, ServiceRequest::new(p, payload))
                .map_err(|_| SimError::protocol(now, "interconnect: response link refused"))?;
            last = Some(ticket.ready_at());
        }
        Ok(last)
    }

    /// Transactions whose last piece crossed the response link by `now`.
    pub fn deliver(&mut self, now: Cycle) -> SimResult<Vec<AxiTransaction>> {
        let mut arrived: Vec<(SubTransaction, Cycle)> = Vec::new();
        self.response_link
            .service_ready(now, |done| arrived.push((done.payload, done.ticket.ready_at())));

        let mut finished = Vec::new();
        for (piece, at) in arrived {
            let txn = self.txns.get_mut(&piece.txn).ok_or_else(|| {
                SimError::protocol(now, format!("interconnect: lost transaction {}", piece.txn))
            })?;
            // one beat per cycle, the last arriving with the piece
            for beat in 0..piece.beats {
                let behind = (piece.beats - 1 - beat) as Cycle;
                let beat_at = if piece.is_write() { at } else { at.saturating_sub(behind) };
                txn.beat_completions.push(beat_at);
            }
            if txn.is_complete() {
                if let Some(mut txn) = self.txns.remove(&piece.txn) {
                    txn.outstanding = false;
                    match txn.kind {
                        TxnKind::Read => self.stats.bytes_read += txn.bytes as u64,
                        TxnKind::Write => self.stats.bytes_written += txn.bytes as u64,
                    }
                    self.stats.completed += 1;
                    trace!("interconnect: txn {} delivered at {now}", txn.id);
                    finished.push(txn);
                }
            }
        }
        Ok(finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dram::DramConfig;

    struct Fabric {
        ic: Interconnect,
        dram: DramController,
    }

    impl Fabric {
        fn new(config: InterconnectConfig, dram: DramConfig) -> Self {
            Self {
                ic: Interconnect::new(&config, dram.access_bytes(), dram.channels),
                dram: DramController::new(&dram),
            }
        }

        fn read(&mut self, id: TxnId, addr: u64, bytes: u32, qos: u8) {
            let txn = AxiTransaction::new(id, addr, bytes, TxnKind::Read, qos, TxnOrigin::L2Fill);
            self.ic.submit(0, txn).unwrap().unwrap();
        }

        /// Drive everything cycle by cycle until all transactions are delivered.
        fn run(&mut self, limit: Cycle) -> Vec<(TxnId, Cycle)> {
            let mut delivered = Vec::new();
            let mut done_at: Vec<(Cycle, SubTransaction)> = Vec::new();
            for now in 0..limit {
                self.ic.arbitrate(now).unwrap();
                self.ic.dispatch(now, &mut self.dram);
                for channel in 0..self.dram.num_channels() {
                    let out = self.dram.tick(now, channel).unwrap();
                    if let Some(c) = out.completion {
                        done_at.push((c.done_at, c.sub));
                    }
                }
                let (due, later): (Vec<_>, Vec<_>) = done_at.into_iter().partition(|(at, _)| *at <= now);
                done_at = later;
                for (_, sub) in due {
                    self.ic.piece_done(now, sub).unwrap();
                }
                for txn in self.ic.deliver(now).unwrap() {
                    delivered.push((txn.id, now));
                    assert!(txn.beat_completions.windows(2).all(|w| w[0] <= w[1]));
                }
                if self.ic.is_idle() {
                    break;
                }
            }
            delivered
        }
    }

    #[test]
    fn single_read_round_trip() {
        let mut f = Fabric::new(InterconnectConfig::default(), DramConfig::default());
        f.read(1, 0x1000, 64, 0);
        let delivered = f.run(500);
        assert_eq!(1, delivered.len());
        let t = DramConfig::default().timing;
        // request link, ACT + RD + data, then the response link with 64B over a 16B path
        let (_, at) = delivered[0];
        assert!(at >= 2 + t.tRCD + t.tCL + t.tBL + 2 + 4, "delivered at {at}");
        assert_eq!(1, f.ic.stats().completed);
        assert_eq!(64, f.ic.stats().bytes_read);
    }

    #[test]
    fn burst_pieces_arrive_in_order() {
        let mut f = Fabric::new(InterconnectConfig::default(), DramConfig::default());
        // 256 bytes from the end of one row into the next channel
        f.read(7, 0x7c0, 256, 0);
        f.run(1000);
        assert_eq!(4, f.ic.stats().pieces);
        assert_eq!(1, f.ic.stats().completed);
    }

    #[test]
    fn duplicate_id_is_a_protocol_fault() {
        let mut f = Fabric::new(InterconnectConfig::default(), DramConfig::default());
        f.read(1, 0, 64, 0);
        let dup = AxiTransaction::new(1, 0x40, 64, TxnKind::Read, 0, TxnOrigin::L2Fill);
        assert!(matches!(f.ic.submit(0, dup), Err(SimError::Protocol { .. })));
    }

    #[test]
    fn oversized_transaction_is_a_protocol_fault() {
        let mut f = Fabric::new(InterconnectConfig::default(), DramConfig::default());
        let big = AxiTransaction::new(1, 0, 4096, TxnKind::Read, 0, TxnOrigin::L2Fill);
        assert!(f.ic.submit(0, big).is_err());
    }

    #[test]
    fn full_class_queue_hands_the_transaction_back() {
        let config = InterconnectConfig {
            queue_capacity: 1,
            ..Default::default()
        };
        let mut f = Fabric::new(config, DramConfig::default());
        f.read(1, 0, 64, 0);
        let second = AxiTransaction::new(2, 0x40, 64, TxnKind::Read, 0, TxnOrigin::L2Fill);
        let back = f.ic.submit(0, second).unwrap().unwrap_err();
        assert_eq!(2, back.id);
        assert_eq!(1, f.ic.stats().arbiter_full);
    }

    #[test]
    fn full_dram_queue_holds_pieces_until_a_slot_frees() {
        let mut dram = DramConfig::default();
        dram.queue_capacity = 1;
        let mut f = Fabric::new(InterconnectConfig::default(), dram);
        for id in 0..4 {
            // all on channel 0, different banks
            f.read(id, id * 0x1000, 64, 0);
        }
        let delivered = f.run(2000);
        assert_eq!(4, delivered.len());
        assert!(f.ic.stats().dram_stalls > 0);
    }
}
