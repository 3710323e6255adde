use log::debug;

use super::config::CacheConfig;
use super::line::{CacheLine, Eviction};
use super::policy::{ReplacementPolicy, SetPolicy};
use crate::coherence::LineState;

#[derive(Debug)]
struct CacheSet {
    lines: Vec<CacheLine>,
    policy: SetPolicy,
}

impl CacheSet {
    fn find(&self, line_addr: u64) -> Option<usize> {
        self.lines
            .iter()
            .position(|line| line.is_valid() && line.line_addr == line_addr)
    }
}

/// Set-associative cache array shared by the private L1s and the shared L2. The configuration
/// is fixed at construction; the ownership tag only changes how the owner drives it.
#[derive(Debug)]
pub struct Cache {
    name: String,
    config: CacheConfig,
    sets: Vec<CacheSet>,
    line_shift: u32,
    set_mask: u64,
}

impl Cache {
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Self {
        let num_sets = config.num_sets().max(1);
        let sets = (0..num_sets)
            .map(|set| CacheSet {
                lines: (0..config.associativity)
                    .map(|_| CacheLine::empty(config.line_bytes))
                    .collect(),
                policy: SetPolicy::new(
                    config.replacement,
                    config.associativity,
                    config.seed.wrapping_add(set as u64),
                ),
            })
            .collect();
        Self {
            name: name.into(),
            line_shift: config.line_bytes.trailing_zeros(),
            set_mask: num_sets as u64 - 1,
            config,
            sets,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn line_bytes(&self) -> usize {
        self.config.line_bytes
    }

    pub fn line_addr(&self, addr: u64) -> u64 {
        self.config.line_addr(addr)
    }

    fn set_index(&self, line_addr: u64) -> usize {
        ((line_addr >> self.line_shift) & self.set_mask) as usize
    }

    /// Look at a line without updating replacement state.
    pub fn peek(&self, line_addr: u64) -> Option<&CacheLine> {
        let set = &self.sets[self.set_index(line_addr)];
        set.find(line_addr).map(|way| &set.lines[way])
    }

    pub fn state(&self, line_addr: u64) -> LineState {
        self.peek(line_addr)
            .map_or(LineState::Invalid, |line| line.state)
    }

    /// Access a line, marking it most recently used.
    pub fn lookup(&mut self, line_addr: u64) -> Option<&mut CacheLine> {
        let set_idx = self.set_index(line_addr);
        let set = &mut self.sets[set_idx];
        let way = set.find(line_addr)?;
        set.policy.touch(way);
        Some(&mut set.lines[way])
    }

    /// Mutable access without touching replacement state (snoops, directory-driven updates).
    pub fn line_mut(&mut self, line_addr: u64) -> Option<&mut CacheLine> {
        let set_idx = self.set_index(line_addr);
        let set = &mut self.sets[set_idx];
        let way = set.find(line_addr)?;
        Some(&mut set.lines[way])
    }

    /// Install a line. A present copy is overwritten in place; otherwise the policy picks a way
    /// and the previous valid occupant is returned.
    pub fn install(
        &mut self,
        line_addr: u64,
        state: LineState,
        data: &[u8],
        dirty: bool,
    ) -> Option<Eviction> {
        debug_assert_eq!(data.len(), self.config.line_bytes);
        let set_idx = self.set_index(line_addr);
        let set = &mut self.sets[set_idx];
        let (way, evicted) = match set.find(line_addr) {
            Some(way) => (way, None),
            None => {
                let way = set.policy.select();
                let victim = &set.lines[way];
                let evicted = victim.is_valid().then(|| Eviction {
                    line_addr: victim.line_addr,
                    state: victim.state,
                    dirty: victim.dirty,
                    data: victim.data.clone(),
                });
                (way, evicted)
            }
        };
        if let Some(victim) = &evicted {
            debug!(
                "{}: evict {:#x} ({}{}) for {:#x}",
                self.name,
                victim.line_addr,
                victim.state.short(),
                if victim.dirty { ", dirty" } else { "" },
                line_addr
            );
        }
        let line = &mut set.lines[way];
        line.line_addr = line_addr;
        line.state = state;
        line.dirty = dirty;
        line.data.copy_from_slice(data);
        set.policy.insert(way);
        evicted
    }

    /// Drop a line, returning its contents so a dirty copy can be written back.
    pub fn invalidate(&mut self, line_addr: u64) -> Option<Eviction> {
        let set_idx = self.set_index(line_addr);
        let set = &mut self.sets[set_idx];
        let way = set.find(line_addr)?;
        set.policy.invalidate(way);
        let line = &mut set.lines[way];
        let evicted = Eviction {
            line_addr,
            state: line.state,
            dirty: line.dirty,
            data: line.data.clone(),
        };
        line.state = LineState::Invalid;
        line.dirty = false;
        Some(evicted)
    }

    /// Change the state of a present line. Moving to Invalid drops it.
    pub fn set_state(&mut self, line_addr: u64, state: LineState) -> bool {
        if !state.is_valid() {
            return self.invalidate(line_addr).is_some();
        }
        match self.line_mut(line_addr) {
            Some(line) => {
                line.state = state;
                true
            }
            None => false,
        }
    }

    /// Every valid line, in set/way order.
    pub fn valid_lines(&self) -> impl Iterator<Item = &CacheLine> + '_ {
        self.sets
            .iter()
            .flat_map(|set| set.lines.iter())
            .filter(|line| line.is_valid())
    }

    pub fn occupancy(&self) -> usize {
        self.valid_lines().count()
    }
}
