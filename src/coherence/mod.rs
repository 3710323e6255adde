/*
Snooping coherency engine.

A miss (or a write to a line held without write permission) opens a round on the line.  The
round queries every peer cache the directory lists for the line; each response is a separate
event, and when the last one arrives the requester's state is finalized and its fill is
scheduled.  Only one round per line is active at a time; later requesters wait in a per-line
queue and start when the active round's fill completes.
*/

pub mod directory;
pub mod protocol;

use std::collections::{BTreeMap, HashMap, VecDeque};

use log::debug;
use serde::Serialize;
use smallvec::SmallVec;

pub use directory::Directory;
pub use protocol::{CoherenceProtocol, LineState, SnoopKind};

use crate::cache::Cache;
use crate::sim::error::{SimError, SimResult};
use crate::timeq::Cycle;

pub type RoundId = u64;

/// Where the requester's copy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataSource {
    // requester already held a readable copy (upgrade)
    Own,
    Peer,
    L2,
    Dram,
}

#[derive(Debug)]
pub struct Round {
    pub id: RoundId,
    pub line_addr: u64,
    pub requester: usize,
    pub kind: SnoopKind,
    pub qos: u8,
    pub started_at: Cycle,
    pending: usize,
    // data handed over by a peer owner
    pub supplied: Option<Box<[u8]>>,
    pub source: Option<DataSource>,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    requester: usize,
    kind: SnoopKind,
    qos: u8,
}

/// A queued requester whose round can start now that the line is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextRound {
    pub requester: usize,
    pub kind: SnoopKind,
    pub qos: u8,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CoherenceStats {
    pub rounds: u64,
    pub upgrades: u64,
    pub snoops: u64,
    pub invalidations: u64,
    pub downgrades: u64,
    pub transfers: u64,
    pub writebacks: u64,
    pub serialized: u64,
}

/// Outcome of applying one snoop response to a peer cache.
#[derive(Debug)]
pub struct SnoopOutcome {
    // dirty data the peer pushed below the L1s
    pub writeback: Option<Box<[u8]>>,
    pub last: bool,
}

#[derive(Debug)]
pub struct CoherenceEngine {
    protocol: CoherenceProtocol,
    directory: Directory,
    rounds: HashMap<RoundId, Round>,
    // line -> active round
    active: BTreeMap<u64, RoundId>,
    waiting: HashMap<u64, VecDeque<Waiter>>,
    next_round: RoundId,
    stats: CoherenceStats,
}

impl CoherenceEngine {
    pub fn new(protocol: CoherenceProtocol) -> Self {
        Self {
            protocol,
            directory: Directory::new(),
            rounds: HashMap::new(),
            active: BTreeMap::new(),
            waiting: HashMap::new(),
            next_round: 0,
            stats: CoherenceStats::default(),
        }
    }

    pub fn protocol(&self) -> CoherenceProtocol {
        self.protocol
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn stats(&self) -> &CoherenceStats {
        &self.stats
    }

    pub fn is_busy(&self, line_addr: u64) -> bool {
        self.active.contains_key(&line_addr)
    }

    pub fn active_rounds(&self) -> usize {
        self.rounds.len()
    }

    /// Open a round for `requester`, or queue it behind the line's active round.
    pub fn begin(
        &mut self,
        line_addr: u64,
        requester: usize,
        kind: SnoopKind,
        qos: u8,
        now: Cycle,
    ) -> Option<RoundId> {
        if self.active.contains_key(&line_addr) {
            debug!(
                "coherence: l1[{requester}] waits for line {:#x} ({:?})",
                line_addr, kind
            );
            self.stats.serialized += 1;
            self.waiting
                .entry(line_addr)
                .or_default()
                .push_back(Waiter {
                    requester,
                    kind,
                    qos,
                });
            return None;
        }
        let id = self.next_round;
        self.next_round += 1;
        self.active.insert(line_addr, id);
        self.rounds.insert(
            id,
            Round {
                id,
                line_addr,
                requester,
                kind,
                qos,
                started_at: now,
                pending: 0,
                supplied: None,
                source: None,
            },
        );
        self.stats.rounds += 1;
        Some(id)
    }

    /// Peers to query for `round`; records how many responses the round waits for.
    pub fn broadcast(&mut self, round: RoundId) -> SmallVec<[usize; 4]> {
        let Some(r) = self.rounds.get_mut(&round) else {
            return SmallVec::new();
        };
        let targets = self.directory.others(r.line_addr, r.requester);
        r.pending = targets.len();
        self.stats.snoops += targets.len() as u64;
        targets
    }

    pub fn round(&self, round: RoundId) -> Option<&Round> {
        self.rounds.get(&round)
    }

    pub fn round_mut(&mut self, round: RoundId) -> Option<&mut Round> {
        self.rounds.get_mut(&round)
    }

    /// Apply a peer's snoop response: move its copy to the remote-transition state, capture any
    /// data it supplies and keep the directory in step.
    pub fn snoop(
        &mut self,
        round: RoundId,
        target: usize,
        cache: &mut Cache,
        now: Cycle,
    ) -> SimResult<SnoopOutcome> {
        let protocol = self.protocol;
        let r = self
            .rounds
            .get_mut(&round)
            .ok_or_else(|| SimError::protocol(now, format!("snoop response for unknown round {round}")))?;
        if r.pending == 0 {
            return Err(SimError::protocol(
                now,
                format!("unexpected snoop response from l1[{target}] for round {round}"),
            ));
        }
        let line_addr = r.line_addr;
        let recorded = self.directory.state_of(line_addr, target);
        let (held, dirty) = cache
            .peek(line_addr)
            .map_or((LineState::Invalid, false), |line| (line.state, line.dirty));
        if held != recorded {
            return Err(SimError::protocol(
                now,
                format!(
                    "l1[{target}] answers {} for {:#x} but the directory records {}",
                    held.short(),
                    line_addr,
                    recorded.short()
                ),
            ));
        }

        let t = protocol::remote_transition(protocol, held, r.kind, dirty);
        let mut writeback = None;
        if let Some(line) = cache.line_mut(line_addr) {
            if t.supplies {
                r.supplied = Some(line.data.clone());
                self.stats.transfers += 1;
            }
            if t.writeback {
                writeback = Some(line.data.clone());
                line.dirty = false;
                self.stats.writebacks += 1;
            }
        }
        if t.next != held {
            if t.next.is_valid() {
                self.stats.downgrades += 1;
            } else {
                self.stats.invalidations += 1;
            }
            cache.set_state(line_addr, t.next);
        }
        self.directory.set(line_addr, target, t.next);
        debug!(
            "coherence: round {round} snoop l1[{target}] {:#x} {} -> {}{}",
            line_addr,
            held.short(),
            t.next.short(),
            if t.supplies { " (supplies)" } else { "" }
        );

        r.pending -= 1;
        Ok(SnoopOutcome {
            writeback,
            last: r.pending == 0,
        })
    }

    pub fn note_upgrade(&mut self) {
        self.stats.upgrades += 1;
    }

    /// Record a local state change of `cache`'s copy.
    pub fn record(&mut self, line_addr: u64, cache: usize, state: LineState) {
        self.directory.set(line_addr, cache, state);
    }

    /// Close a finished round and hand back the next waiter for the same line, if any.
    pub fn finish(&mut self, round: RoundId) -> Option<NextRound> {
        let r = self.rounds.remove(&round)?;
        self.active.remove(&r.line_addr);
        let queue = self.waiting.get_mut(&r.line_addr)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.waiting.remove(&r.line_addr);
        }
        next.map(|w| NextRound {
            requester: w.requester,
            kind: w.kind,
            qos: w.qos,
        })
    }

    /// Check that the directory matches every L1's contents and the single-writer rule holds.
    pub fn check(&self, l1: &[Cache], now: Cycle) -> SimResult<()> {
        for (line_addr, holders) in self.directory.lines() {
            self.directory
                .check_line(line_addr)
                .map_err(|detail| SimError::protocol(now, detail))?;
            for &(cache, state) in holders {
                let held = l1.get(cache).map_or(LineState::Invalid, |c| c.state(line_addr));
                if held != state {
                    return Err(SimError::protocol(
                        now,
                        format!(
                            "directory records l1[{cache}]={} for {:#x}, cache holds {}",
                            state.short(),
                            line_addr,
                            held.short()
                        ),
                    ));
                }
            }
        }
        for (cache, l1) in l1.iter().enumerate() {
            for line in l1.valid_lines() {
                let recorded = self.directory.state_of(line.line_addr, cache);
                if recorded != line.state {
                    return Err(SimError::protocol(
                        now,
                        format!(
                            "l1[{cache}] holds {:#x} in {} but the directory records {}",
                            line.line_addr,
                            line.state.short(),
                            recorded.short()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;

    fn caches(n: usize) -> Vec<Cache> {
        (0..n)
            .map(|i| Cache::new(format!("l1[{i}]"), CacheConfig::default_l1()))
            .collect()
    }

    #[test]
    fn rounds_on_one_line_are_serialized() {
        let mut engine = CoherenceEngine::new(CoherenceProtocol::Moesi);
        let first = engine.begin(0x40, 0, SnoopKind::Read, 0, 0).unwrap();
        assert!(engine.begin(0x40, 1, SnoopKind::Write, 2, 1).is_none());
        assert!(engine.begin(0x80, 1, SnoopKind::Read, 0, 1).is_some());
        assert_eq!(
            Some(NextRound {
                requester: 1,
                kind: SnoopKind::Write,
                qos: 2
            }),
            engine.finish(first)
        );
        assert!(!engine.is_busy(0x40));
        assert_eq!(1, engine.stats().serialized);
    }

    #[test]
    fn modified_peer_supplies_and_keeps_ownership_under_moesi() {
        let mut l1 = caches(2);
        let mut engine = CoherenceEngine::new(CoherenceProtocol::Moesi);
        l1[0].install(0x40, LineState::Modified, &[7; 64], true);
        engine.record(0x40, 0, LineState::Modified);

        let round = engine.begin(0x40, 1, SnoopKind::Read, 0, 0).unwrap();
        assert_eq!(&[0], &engine.broadcast(round)[..]);
        let outcome = engine.snoop(round, 0, &mut l1[0], 4).unwrap();
        assert!(outcome.last);
        assert!(outcome.writeback.is_none());
        assert_eq!(LineState::Owned, l1[0].state(0x40));
        assert!(l1[0].peek(0x40).unwrap().dirty);
        assert_eq!(Some(&[7u8; 64][..]), engine.round(round).unwrap().supplied.as_deref());
        assert!(engine.check(&l1, 4).is_ok());
    }

    #[test]
    fn mesi_downgrade_writes_back() {
        let mut l1 = caches(2);
        let mut engine = CoherenceEngine::new(CoherenceProtocol::Mesi);
        l1[0].install(0x40, LineState::Modified, &[7; 64], true);
        engine.record(0x40, 0, LineState::Modified);
        let round = engine.begin(0x40, 1, SnoopKind::Read, 0, 0).unwrap();
        engine.broadcast(round);
        let outcome = engine.snoop(round, 0, &mut l1[0], 4).unwrap();
        assert_eq!(Some(&[7u8; 64][..]), outcome.writeback.as_deref());
        assert_eq!(LineState::Shared, l1[0].state(0x40));
        assert!(!l1[0].peek(0x40).unwrap().dirty);
    }

    #[test]
    fn write_round_invalidates_every_sharer() {
        let mut l1 = caches(3);
        let mut engine = CoherenceEngine::new(CoherenceProtocol::Moesi);
        for cache in 0..3 {
            l1[cache].install(0x40, LineState::Shared, &[0; 64], false);
            engine.record(0x40, cache, LineState::Shared);
        }
        let round = engine.begin(0x40, 0, SnoopKind::Write, 0, 0).unwrap();
        let targets = engine.broadcast(round);
        assert_eq!(&[1, 2], &targets[..]);
        assert!(!engine.snoop(round, 1, &mut l1[1], 4).unwrap().last);
        assert!(engine.snoop(round, 2, &mut l1[2], 4).unwrap().last);
        assert_eq!(&[(0, LineState::Shared)], engine.directory().holders(0x40));
        assert_eq!(2, engine.stats().invalidations);
    }

    #[test]
    fn contradictory_response_is_a_protocol_fault() {
        let mut l1 = caches(2);
        let mut engine = CoherenceEngine::new(CoherenceProtocol::Moesi);
        l1[0].install(0x40, LineState::Exclusive, &[0; 64], false);
        engine.record(0x40, 0, LineState::Shared);
        let round = engine.begin(0x40, 1, SnoopKind::Read, 0, 0).unwrap();
        engine.broadcast(round);
        assert!(matches!(
            engine.snoop(round, 0, &mut l1[0], 9),
            Err(SimError::Protocol { cycle: 9, .. })
        ));
        assert!(engine.check(&l1, 9).is_err());
    }

    #[test]
    fn stray_response_is_a_protocol_fault() {
        let mut l1 = caches(2);
        let mut engine = CoherenceEngine::new(CoherenceProtocol::Moesi);
        let round = engine.begin(0x40, 1, SnoopKind::Read, 0, 0).unwrap();
        engine.broadcast(round);
        assert!(engine.snoop(round, 0, &mut l1[0], 1).is_err());
        assert!(engine.snoop(99, 0, &mut l1[0], 1).is_err());
    }
}
