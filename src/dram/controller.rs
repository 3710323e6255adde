use std::collections::VecDeque;

use log::{debug, trace};
use serde::Serialize;
use smallvec::SmallVec;

use super::bank::{BankState, PowerResidency, PowerState, PowerThresholds};
use super::command::{CommandKind, DramCommand};
use super::config::{DramConfig, PagePolicy};
use super::mapping::{AddressMapping, DramCoord};
use super::store::BackingStore;
use super::timing::TimingChecker;
use crate::interconnect::transaction::SubTransaction;
use crate::sim::error::{SimError, SimResult};
use crate::timeq::Cycle;

#[derive(Debug, Clone)]
pub struct QueuedAccess {
    pub sub: SubTransaction,
    pub coord: DramCoord,
    pub arrived: Cycle,
    // an ACT was issued on behalf of this access
    activated: bool,
}

/// A column command finished moving the data of `sub`.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub sub: SubTransaction,
    pub done_at: Cycle,
    pub row_hit: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TickOutcome {
    pub command: Option<DramCommand>,
    pub completion: Option<Completion>,
    // always later than the tick that produced it
    pub next_tick: Cycle,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DramStats {
    pub activates: u64,
    pub precharges: u64,
    pub reads: u64,
    pub writes: u64,
    pub refreshes: u64,
    pub row_hits: u64,
    pub row_misses: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub data_bus_cycles: u64,
    pub wakeups: u64,
    pub queue_full: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DramEnergy {
    pub command_pj: f64,
    pub active_pj: f64,
    pub standby_pj: f64,
    pub powerdown_pj: f64,
}

impl DramEnergy {
    pub fn total_pj(&self) -> f64 {
        self.command_pj + self.active_pj + self.standby_pj + self.powerdown_pj
    }
}

#[derive(Debug, Clone)]
struct RankState {
    banks: Vec<BankState>,
    // tRRD
    next_act: Cycle,
    // recent activates for tFAW, oldest first
    acts: VecDeque<Cycle>,
    // write-to-read turnaround
    next_rd: Cycle,
    refresh_due: Cycle,
    refresh_pending: bool,
    // tRFC of the last refresh
    refresh_until: Cycle,
}

impl RankState {
    fn new(banks: usize, refresh_due: Cycle) -> Self {
        Self {
            banks: vec![BankState::default(); banks],
            next_act: 0,
            acts: VecDeque::with_capacity(4),
            next_rd: 0,
            refresh_due,
            refresh_pending: false,
            refresh_until: 0,
        }
    }

    fn faw_ready(&self, t_faw: Cycle) -> Cycle {
        if self.acts.len() == 4 {
            self.acts[0] + t_faw
        } else {
            0
        }
    }
}

#[derive(Debug, Clone)]
struct Channel {
    queue: VecDeque<QueuedAccess>,
    ranks: Vec<RankState>,
    // tCCD, tRTW
    next_rd: Cycle,
    next_wr: Cycle,
    last_cmd: Option<Cycle>,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    kind: CommandKind,
    rank: usize,
    bank: usize,
    row: u64,
    entry: Option<usize>,
    earliest: Cycle,
}

/// Per-channel FR-FCFS command scheduler with refresh deadlines and lazy bank power states.
///
/// The controller is ticked per channel. A tick issues at most one command and reports the
/// cycle at which the channel next has something to do.
#[derive(Debug)]
pub struct DramController {
    config: DramConfig,
    mapping: AddressMapping,
    thresholds: PowerThresholds,
    channels: Vec<Channel>,
    checker: TimingChecker,
    store: BackingStore,
    stats: DramStats,
    command_pj: f64,
}

impl DramController {
    pub fn new(config: &DramConfig) -> Self {
        let rank = RankState::new(config.banks, config.timing.tREFI);
        let channel = Channel {
            queue: VecDeque::with_capacity(config.queue_capacity),
            ranks: vec![rank; config.ranks],
            next_rd: 0,
            next_wr: 0,
            last_cmd: None,
        };
        Self {
            config: config.clone(),
            mapping: AddressMapping::new(config),
            thresholds: PowerThresholds {
                standby: config.standby_threshold,
                powerdown: config.powerdown_threshold,
            },
            channels: vec![channel; config.channels],
            checker: TimingChecker::for_config(config),
            store: BackingStore::new(config.capacity_bytes),
            stats: DramStats::default(),
            command_pj: 0.0,
        }
    }

    pub fn config(&self) -> &DramConfig {
        &self.config
    }

    pub fn mapping(&self) -> &AddressMapping {
        &self.mapping
    }

    pub fn store(&self) -> &BackingStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut BackingStore {
        &mut self.store
    }

    pub fn stats(&self) -> &DramStats {
        &self.stats
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn channel_of(&self, addr: u64) -> usize {
        self.mapping.channel_of(addr)
    }

    pub fn queued(&self, channel: usize) -> usize {
        self.channels[channel].queue.len()
    }

    pub fn has_room(&self, channel: usize) -> bool {
        self.queued(channel) < self.config.queue_capacity
    }

    pub fn is_idle(&self) -> bool {
        self.channels.iter().all(|ch| ch.queue.is_empty())
    }

    /// Commands validated by the timing checker so far.
    pub fn commands_checked(&self) -> u64 {
        self.checker.checked()
    }

    /// Queue a sub-transaction on its channel. A full queue hands it back.
    pub fn try_enqueue(&mut self, now: Cycle, sub: SubTransaction) -> Result<usize, SubTransaction> {
        let coord = self.mapping.decode(sub.addr);
        let ch = &mut self.channels[coord.channel];
        if ch.queue.len() >= self.config.queue_capacity {
            self.stats.queue_full += 1;
            return Err(sub);
        }
        trace!(
            "dram: queue txn {} piece {} at {:#x} -> ch{} r{} b{} row {}",
            sub.txn,
            sub.index,
            sub.addr,
            coord.channel,
            coord.rank,
            coord.bank,
            coord.row
        );
        ch.queue.push_back(QueuedAccess {
            sub,
            coord,
            arrived: now,
            activated: false,
        });
        Ok(coord.channel)
    }

    /// Cycle at which an idle channel must be ticked to start its next refresh.
    pub fn refresh_wakeup(&self, channel: usize) -> Cycle {
        self.channels[channel]
            .ranks
            .iter()
            .filter(|r| !r.refresh_pending)
            .map(|r| r.refresh_due.saturating_sub(self.config.refresh_margin))
            .min()
            .unwrap_or(Cycle::MAX)
    }

    pub fn tick(&mut self, now: Cycle, channel: usize) -> SimResult<TickOutcome> {
        self.arm_refresh(now, channel);
        self.wake_for_queue(now, channel);

        let candidates = self.candidates(channel);
        let bus_free = self.channels[channel].last_cmd != Some(now);
        let chosen = candidates
            .iter()
            .find(|c| bus_free && c.earliest <= now)
            .copied();

        let mut outcome = TickOutcome {
            command: None,
            completion: None,
            next_tick: 0,
        };
        if let Some(cand) = chosen {
            let (command, completion) = self.issue(now, channel, cand)?;
            outcome.command = Some(command);
            outcome.completion = completion;
        }

        let after = now + 1;
        let next = if chosen.is_some() {
            // the issued command may have unblocked others
            after
        } else {
            let mut next = candidates.iter().map(|c| c.earliest).min();
            if next.is_none() && !self.channels[channel].queue.is_empty() {
                next = Some(after);
            }
            next.unwrap_or(Cycle::MAX).max(after)
        };
        outcome.next_tick = next.min(self.refresh_wakeup(channel).max(after));
        Ok(outcome)
    }

    fn arm_refresh(&mut self, now: Cycle, channel: usize) {
        let margin = self.config.refresh_margin;
        let txp = self.config.timing.tXP;
        let th = self.thresholds;
        let ch = &mut self.channels[channel];
        for (r, rank) in ch.ranks.iter_mut().enumerate() {
            if !rank.refresh_pending && now + margin >= rank.refresh_due {
                rank.refresh_pending = true;
                debug!(
                    "dram: ch{channel} r{r} refresh armed at {now}, due {}",
                    rank.refresh_due
                );
            }
            if rank.refresh_pending {
                for bank in rank.banks.iter_mut() {
                    if bank.power.state_at(now, th) == PowerState::PowerDown {
                        bank.power.touch(now, th);
                        bank.power.wake_ready = now + txp;
                        self.stats.wakeups += 1;
                    }
                }
            }
        }
    }

    fn wake_for_queue(&mut self, now: Cycle, channel: usize) {
        let txp = self.config.timing.tXP;
        let th = self.thresholds;
        let ch = &mut self.channels[channel];
        for entry in ch.queue.iter() {
            let rank = &mut ch.ranks[entry.coord.rank];
            if rank.refresh_pending {
                continue;
            }
            let bank = &mut rank.banks[entry.coord.bank];
            if bank.power.state_at(now, th) == PowerState::PowerDown {
                bank.power.touch(now, th);
                bank.power.wake_ready = now + txp;
                self.stats.wakeups += 1;
                trace!(
                    "dram: ch{channel} r{} b{} wakes up, ready at {}",
                    entry.coord.rank,
                    entry.coord.bank,
                    now + txp
                );
            }
        }
    }

    fn earliest(&self, ch: &Channel, kind: CommandKind, rank: usize, bank: usize) -> Cycle {
        let t = &self.config.timing;
        let r = &ch.ranks[rank];
        let b = &r.banks[bank];
        let wake = b.power.wake_ready;
        match kind {
            CommandKind::Act => b
                .next_act
                .max(r.next_act)
                .max(r.faw_ready(t.tFAW))
                .max(r.refresh_until)
                .max(wake),
            CommandKind::Pre => b.next_pre.max(wake),
            CommandKind::Rd => b.next_col.max(ch.next_rd).max(r.next_rd).max(wake),
            CommandKind::Wr => b.next_col.max(ch.next_wr).max(wake),
            CommandKind::Ref => r
                .banks
                .iter()
                .map(|b| b.next_act.max(b.power.wake_ready))
                .max()
                .unwrap_or(0)
                .max(r.refresh_until),
        }
    }

    fn has_queued_hit(ch: &Channel, rank: usize, bank: usize, row: u64) -> bool {
        ch.queue
            .iter()
            .any(|e| e.coord.rank == rank && e.coord.bank == bank && e.coord.row == row)
    }

    fn older_conflict(ch: &Channel, index: usize) -> bool {
        let c = ch.queue[index].coord;
        ch.queue
            .iter()
            .take(index)
            .any(|e| e.coord.rank == c.rank && e.coord.bank == c.bank && e.coord.row != c.row)
    }

    /// Every command the channel could issue, in priority order: refresh work, then row hits
    /// oldest first, then row opens and conflict closes oldest first, then closed-page precharges.
    fn candidates(&self, channel: usize) -> Vec<Candidate> {
        let ch = &self.channels[channel];
        let cap = self.config.row_hit_cap;
        let mut out = Vec::new();
        let make = |kind, rank, bank, row, entry| Candidate {
            kind,
            rank,
            bank,
            row,
            entry,
            earliest: self.earliest(ch, kind, rank, bank),
        };

        for (r, rank) in ch.ranks.iter().enumerate() {
            if !rank.refresh_pending {
                continue;
            }
            let mut open = false;
            for (b, bank) in rank.banks.iter().enumerate() {
                if let Some(row) = bank.open_row {
                    open = true;
                    out.push(make(CommandKind::Pre, r, b, row, None));
                }
            }
            if !open {
                out.push(make(CommandKind::Ref, r, 0, 0, None));
            }
        }

        for (i, entry) in ch.queue.iter().enumerate() {
            let c = entry.coord;
            let rank = &ch.ranks[c.rank];
            let bank = &rank.banks[c.bank];
            if rank.refresh_pending || bank.open_row != Some(c.row) {
                continue;
            }
            if bank.hit_streak >= cap && Self::older_conflict(ch, i) {
                continue;
            }
            let kind = if entry.sub.is_write() {
                CommandKind::Wr
            } else {
                CommandKind::Rd
            };
            out.push(make(kind, c.rank, c.bank, c.row, Some(i)));
        }

        let mut claimed: SmallVec<[(usize, usize); 8]> = SmallVec::new();
        for (i, entry) in ch.queue.iter().enumerate() {
            let c = entry.coord;
            let rank = &ch.ranks[c.rank];
            let bank = &rank.banks[c.bank];
            if rank.refresh_pending || claimed.contains(&(c.rank, c.bank)) {
                continue;
            }
            match bank.open_row {
                Some(row) if row == c.row => continue,
                Some(row) => {
                    claimed.push((c.rank, c.bank));
                    if bank.hit_streak >= cap || !Self::has_queued_hit(ch, c.rank, c.bank, row) {
                        out.push(make(CommandKind::Pre, c.rank, c.bank, row, Some(i)));
                    }
                }
                None => {
                    claimed.push((c.rank, c.bank));
                    out.push(make(CommandKind::Act, c.rank, c.bank, c.row, Some(i)));
                }
            }
        }

        if self.config.page_policy == PagePolicy::Closed {
            for (r, rank) in ch.ranks.iter().enumerate() {
                if rank.refresh_pending {
                    continue;
                }
                for (b, bank) in rank.banks.iter().enumerate() {
                    if let Some(row) = bank.open_row {
                        if !Self::has_queued_hit(ch, r, b, row) {
                            out.push(make(CommandKind::Pre, r, b, row, None));
                        }
                    }
                }
            }
        }
        out
    }

    fn issue(
        &mut self,
        now: Cycle,
        channel: usize,
        cand: Candidate,
    ) -> SimResult<(DramCommand, Option<Completion>)> {
        let t = self.config.timing;
        let th = self.thresholds;
        let completes_at = match cand.kind {
            CommandKind::Act => now + t.tRCD,
            CommandKind::Pre => now + t.tRP,
            CommandKind::Rd => now + t.tCL + t.tBL,
            CommandKind::Wr => now + t.tCWL + t.tBL,
            CommandKind::Ref => now + t.tRFC,
        };
        let command = DramCommand {
            kind: cand.kind,
            channel,
            rank: cand.rank,
            bank: cand.bank,
            row: cand.row,
            earliest: cand.earliest,
            issued_at: now,
            completes_at,
        };
        self.checker.observe(&command)?;
        trace!("dram: issue {command}");

        let power = self.config.power;
        let ch = &mut self.channels[channel];
        ch.last_cmd = Some(now);
        let rank = &mut ch.ranks[cand.rank];
        let mut completion = None;
        match cand.kind {
            CommandKind::Act => {
                let bank = &mut rank.banks[cand.bank];
                bank.power.touch(now, th);
                bank.open_row = Some(cand.row);
                bank.last_act = Some(now);
                bank.next_col = now + t.tRCD;
                bank.next_pre = now + t.tRAS;
                bank.next_act = now + t.tRC;
                bank.hit_streak = 0;
                rank.next_act = now + t.tRRD;
                rank.acts.push_back(now);
                if rank.acts.len() > 4 {
                    rank.acts.pop_front();
                }
                if let Some(entry) = cand.entry.and_then(|i| ch.queue.get_mut(i)) {
                    entry.activated = true;
                }
                self.stats.activates += 1;
                self.stats.row_misses += 1;
                self.command_pj += power.act_pj;
            }
            CommandKind::Pre => {
                let bank = &mut rank.banks[cand.bank];
                bank.power.touch(now, th);
                bank.open_row = None;
                bank.last_pre = Some(now);
                bank.next_act = bank.next_act.max(now + t.tRP);
                bank.hit_streak = 0;
                self.stats.precharges += 1;
                self.command_pj += power.pre_pj;
            }
            CommandKind::Rd | CommandKind::Wr => {
                let bank = &mut rank.banks[cand.bank];
                bank.power.touch(now, th);
                bank.hit_streak += 1;
                if cand.kind == CommandKind::Rd {
                    bank.next_pre = bank.next_pre.max(now + t.tRTP);
                    ch.next_rd = ch.next_rd.max(now + t.tCCD);
                    ch.next_wr = ch.next_wr.max(now + t.tCCD.max(t.tRTW));
                } else {
                    bank.next_pre = bank.next_pre.max(now + t.write_to_precharge());
                    rank.next_rd = rank.next_rd.max(now + t.write_to_read());
                    ch.next_rd = ch.next_rd.max(now + t.tCCD);
                    ch.next_wr = ch.next_wr.max(now + t.tCCD);
                }
                let entry = cand
                    .entry
                    .and_then(|i| ch.queue.remove(i))
                    .ok_or_else(|| {
                        SimError::protocol(
                            now,
                            format!("dram: column command without a queued access ({command})"),
                        )
                    })?;
                if entry.sub.is_write() {
                    self.stats.writes += 1;
                    self.stats.bytes_written += entry.sub.bytes as u64;
                    self.command_pj += power.wr_pj;
                } else {
                    self.stats.reads += 1;
                    self.stats.bytes_read += entry.sub.bytes as u64;
                    self.command_pj += power.rd_pj;
                }
                if !entry.activated {
                    self.stats.row_hits += 1;
                }
                self.stats.data_bus_cycles += t.tBL;
                completion = Some(Completion {
                    sub: entry.sub,
                    done_at: completes_at,
                    row_hit: !entry.activated,
                });
            }
            CommandKind::Ref => {
                for bank in rank.banks.iter_mut() {
                    bank.power.touch(now, th);
                    bank.next_act = bank.next_act.max(now + t.tRFC);
                }
                rank.refresh_pending = false;
                rank.refresh_until = now + t.tRFC;
                rank.refresh_due = now + t.tREFI;
                self.stats.refreshes += 1;
                self.command_pj += power.ref_pj;
                debug!(
                    "dram: ch{channel} r{} refreshed at {now}, next due {}",
                    cand.rank, rank.refresh_due
                );
            }
        }
        Ok((command, completion))
    }

    /// Cycles all banks spent in each power state up to `now`.
    pub fn residency(&self, now: Cycle) -> PowerResidency {
        let mut total = PowerResidency::default();
        for bank in self
            .channels
            .iter()
            .flat_map(|ch| ch.ranks.iter())
            .flat_map(|r| r.banks.iter())
        {
            total += bank.power.residency(now, self.thresholds);
        }
        total
    }

    pub fn energy(&self, now: Cycle) -> DramEnergy {
        let r = self.residency(now);
        let p = &self.config.power;
        DramEnergy {
            command_pj: self.command_pj,
            active_pj: r.active as f64 * p.active_pj_per_cycle,
            standby_pj: r.standby as f64 * p.standby_pj_per_cycle,
            powerdown_pj: r.powerdown as f64 * p.powerdown_pj_per_cycle,
        }
    }
}
