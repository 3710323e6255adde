use log::debug;

use super::array::Cache;
use super::config::{CacheConfig, WritePolicy};
use super::line::Eviction;
use super::mshr::MshrTable;
use crate::coherence::{LineState, RoundId};
use crate::dram::store::BackingStore;
use crate::sim::request::AccessId;
use crate::timeq::{ServerConfig, TimedServer};

/// Where a write to the level below the L1s landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextLevelWrite {
    pub l2_hit: bool,
    // the write also has to travel to DRAM as a transaction
    pub to_dram: bool,
}

/// Private L1 per agent plus the shared, non-inclusive L2 and their miss tracking.
#[derive(Debug)]
pub struct CacheHierarchy {
    pub l1: Vec<Cache>,
    pub l1_mshr: Vec<MshrTable<AccessId>>,
    pub l2: Cache,
    pub l2_port: TimedServer<RoundId>,
    // L2 lines with a DRAM fetch in flight, and the rounds waiting on each
    pub l2_fills: MshrTable<RoundId>,
}

impl CacheHierarchy {
    pub fn new(num_agents: usize, l1: &CacheConfig, l2: &CacheConfig) -> Self {
        let l1s = (0..num_agents)
            .map(|agent| {
                let mut config = l1.clone();
                config.seed = config.seed.wrapping_add((agent as u64) << 32);
                Cache::new(format!("l1[{agent}]"), config)
            })
            .collect();
        let port = ServerConfig {
            base_latency: l2.hit_latency,
            bytes_per_cycle: l2.port_bytes_per_cycle,
            queue_capacity: l2.port_queue,
            issues_per_cycle: l2.port_issues_per_cycle,
        };
        Self {
            l1: l1s,
            l1_mshr: (0..num_agents)
                .map(|_| MshrTable::new(l1.mshr_entries))
                .collect(),
            l2: Cache::new("l2", l2.clone()),
            l2_port: TimedServer::new(port),
            l2_fills: MshrTable::new(l2.mshr_entries),
        }
    }

    pub fn l1_line_bytes(&self) -> usize {
        self.l1.first().map_or(0, Cache::line_bytes)
    }

    /// Current contents of `out.len()` bytes at `addr` as seen below the L1s.
    pub fn read_next_level(&self, store: &BackingStore, addr: u64, out: &mut [u8]) {
        let l2_line = self.l2.line_addr(addr);
        match self.l2.peek(l2_line) {
            Some(line) => {
                let offset = (addr - l2_line) as usize;
                out.copy_from_slice(line.read(offset, out.len()));
            }
            None => store.read_into(addr, out),
        }
    }

    /// Push bytes below the L1s. An L2 hit absorbs the write (and forwards it under
    /// write-through); an L2 miss goes straight to memory without allocating.
    pub fn write_next_level(
        &mut self,
        store: &mut BackingStore,
        addr: u64,
        bytes: &[u8],
    ) -> NextLevelWrite {
        let l2_line = self.l2.line_addr(addr);
        let write_policy = self.l2.config().write_policy;
        if let Some(line) = self.l2.line_mut(l2_line) {
            line.write((addr - l2_line) as usize, bytes);
            let to_dram = match write_policy {
                WritePolicy::WriteBack => {
                    line.dirty = true;
                    line.state = LineState::Modified;
                    false
                }
                WritePolicy::WriteThrough => {
                    store.write(addr, bytes);
                    true
                }
            };
            return NextLevelWrite {
                l2_hit: true,
                to_dram,
            };
        }
        debug!("l2: write-around {:#x} ({} bytes)", addr, bytes.len());
        store.write(addr, bytes);
        NextLevelWrite {
            l2_hit: false,
            to_dram: true,
        }
    }

    /// Install a line fetched from DRAM into the L2. A copy already present is newer than the
    /// fetched data and is kept. A dirty victim is written to the store and returned so the caller
    /// can issue its writeback.
    pub fn fill_l2(&mut self, store: &mut BackingStore, l2_line: u64, data: &[u8]) -> Option<Eviction> {
        if self.l2.peek(l2_line).is_some() {
            return None;
        }
        let victim = self.l2.install(l2_line, LineState::Exclusive, data, false)?;
        if !victim.needs_writeback() {
            return None;
        }
        store.write(victim.line_addr, &victim.data);
        Some(victim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_hierarchy(l2_policy: WritePolicy) -> CacheHierarchy {
        let l1 = CacheConfig::default_l1();
        let mut l2 = CacheConfig::default_l2();
        l2.write_policy = l2_policy;
        l2.size_bytes = 2 * 64;
        l2.associativity = 2;
        CacheHierarchy::new(2, &l1, &l2)
    }

    #[test]
    fn write_miss_goes_around_l2() {
        let mut h = small_hierarchy(WritePolicy::WriteBack);
        let mut store = BackingStore::new(1 << 20);
        let outcome = h.write_next_level(&mut store, 0x100, &[9; 8]);
        assert!(!outcome.l2_hit);
        assert!(outcome.to_dram);
        assert!(h.l2.peek(0x100).is_none());
        assert_eq!(vec![9; 8], store.read(0x100, 8));
    }

    #[test]
    fn write_back_l2_absorbs_hits() {
        let mut h = small_hierarchy(WritePolicy::WriteBack);
        let mut store = BackingStore::new(1 << 20);
        h.fill_l2(&mut store, 0x100, &[0; 64]);
        let outcome = h.write_next_level(&mut store, 0x108, &[5; 4]);
        assert_eq!(
            NextLevelWrite {
                l2_hit: true,
                to_dram: false
            },
            outcome
        );
        assert_eq!(vec![0; 4], store.read(0x108, 4));
        let mut seen = [0u8; 4];
        h.read_next_level(&store, 0x108, &mut seen);
        assert_eq!([5; 4], seen);
    }

    #[test]
    fn write_through_l2_forwards_hits() {
        let mut h = small_hierarchy(WritePolicy::WriteThrough);
        let mut store = BackingStore::new(1 << 20);
        h.fill_l2(&mut store, 0x100, &[0; 64]);
        let outcome = h.write_next_level(&mut store, 0x100, &[1; 4]);
        assert!(outcome.l2_hit && outcome.to_dram);
        assert_eq!(vec![1; 4], store.read(0x100, 4));
    }

    #[test]
    fn fill_keeps_present_line_and_spills_dirty_victims() {
        let mut h = small_hierarchy(WritePolicy::WriteBack);
        let mut store = BackingStore::new(1 << 20);
        h.fill_l2(&mut store, 0x000, &[0; 64]);
        h.write_next_level(&mut store, 0x000, &[7; 64]);
        // stale refetch of a present line must not clobber the newer copy
        assert!(h.fill_l2(&mut store, 0x000, &[0; 64]).is_none());
        let mut seen = [0u8; 1];
        h.read_next_level(&store, 0x000, &mut seen);
        assert_eq!([7], seen);

        // single set, two ways: the third line evicts the dirty LRU line 0x000
        h.fill_l2(&mut store, 0x040, &[0; 64]);
        let victim = h.fill_l2(&mut store, 0x080, &[0; 64]).unwrap();
        assert_eq!(0x000, victim.line_addr);
        assert_eq!(vec![7; 64], store.read(0x000, 64));
    }
}
