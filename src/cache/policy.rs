use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::config::ReplacementKind;

/// Victim selection for one set. Invalid ways are always chosen first, lowest index first.
pub trait ReplacementPolicy {
    /// A line was installed in `way`.
    fn insert(&mut self, way: usize);

    /// The line in `way` was dropped.
    fn invalidate(&mut self, way: usize);

    /// The line in `way` was accessed.
    fn touch(&mut self, way: usize);

    /// Pick the way to evict.
    fn select(&mut self) -> usize;
}

fn first_invalid(valid: &[bool]) -> Option<usize> {
    valid.iter().position(|v| !v)
}

#[derive(Debug, Clone)]
pub struct Lru {
    valid: Box<[bool]>,
    // most recently used first
    order: Vec<usize>,
}

impl Lru {
    pub fn new(assoc: usize) -> Self {
        Self {
            valid: vec![false; assoc].into_boxed_slice(),
            order: (0..assoc).collect(),
        }
    }

    fn move_to_front(&mut self, way: usize) {
        if let Some(pos) = self.order.iter().position(|&idx| idx == way) {
            self.order.remove(pos);
        }
        self.order.insert(0, way);
    }
}

impl ReplacementPolicy for Lru {
    fn insert(&mut self, way: usize) {
        self.valid[way] = true;
        self.move_to_front(way);
    }

    fn invalidate(&mut self, way: usize) {
        self.valid[way] = false;
        if let Some(pos) = self.order.iter().position(|&idx| idx == way) {
            self.order.remove(pos);
        }
        self.order.push(way);
    }

    fn touch(&mut self, way: usize) {
        self.move_to_front(way);
    }

    fn select(&mut self) -> usize {
        first_invalid(&self.valid).unwrap_or_else(|| self.order.last().copied().unwrap_or(0))
    }
}

/// Binary-tree pseudo-LRU. Each node bit points at the half holding the next victim; a clear
/// bit means the left (lower-index) half, so an untouched tree evicts way 0.
#[derive(Debug, Clone)]
pub struct PseudoLru {
    valid: Box<[bool]>,
    bits: Box<[bool]>,
}

impl PseudoLru {
    pub fn new(assoc: usize) -> Self {
        debug_assert!(assoc.is_power_of_two());
        Self {
            valid: vec![false; assoc].into_boxed_slice(),
            bits: vec![false; assoc.saturating_sub(1)].into_boxed_slice(),
        }
    }

    fn point_away_from(&mut self, way: usize) {
        let ways = self.valid.len();
        let (mut node, mut lo, mut hi) = (0, 0, ways);
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            let right = way >= mid;
            // victim goes to the half that was not just used
            self.bits[node] = !right;
            if right {
                node = 2 * node + 2;
                lo = mid;
            } else {
                node = 2 * node + 1;
                hi = mid;
            }
        }
    }
}

impl ReplacementPolicy for PseudoLru {
    fn insert(&mut self, way: usize) {
        self.valid[way] = true;
        self.point_away_from(way);
    }

    fn invalidate(&mut self, way: usize) {
        self.valid[way] = false;
    }

    fn touch(&mut self, way: usize) {
        self.point_away_from(way);
    }

    fn select(&mut self) -> usize {
        if let Some(way) = first_invalid(&self.valid) {
            return way;
        }
        let (mut node, mut lo, mut hi) = (0, 0, self.valid.len());
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            if self.bits[node] {
                node = 2 * node + 2;
                lo = mid;
            } else {
                node = 2 * node + 1;
                hi = mid;
            }
        }
        lo
    }
}

#[derive(Debug, Clone)]
pub struct Fifo {
    valid: Box<[bool]>,
    ptr: usize,
}

impl Fifo {
    pub fn new(assoc: usize) -> Self {
        Self {
            valid: vec![false; assoc].into_boxed_slice(),
            ptr: 0,
        }
    }
}

impl ReplacementPolicy for Fifo {
    fn insert(&mut self, way: usize) {
        if self.ptr == way {
            self.ptr = (self.ptr + 1) % self.valid.len();
        }
        self.valid[way] = true;
    }

    fn invalidate(&mut self, way: usize) {
        self.valid[way] = false;
    }

    fn touch(&mut self, _way: usize) {}

    fn select(&mut self) -> usize {
        first_invalid(&self.valid).unwrap_or(self.ptr)
    }
}

#[derive(Debug, Clone)]
pub struct Random {
    valid: Box<[bool]>,
    rng: StdRng,
}

impl Random {
    pub fn new(assoc: usize, seed: u64) -> Self {
        Self {
            valid: vec![false; assoc].into_boxed_slice(),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl ReplacementPolicy for Random {
    fn insert(&mut self, way: usize) {
        self.valid[way] = true;
    }

    fn invalidate(&mut self, way: usize) {
        self.valid[way] = false;
    }

    fn touch(&mut self, _way: usize) {}

    fn select(&mut self) -> usize {
        match first_invalid(&self.valid) {
            Some(way) => way,
            None => self.rng.gen_range(0..self.valid.len()),
        }
    }
}

/// Per-set policy state, one variant per `ReplacementKind`.
#[derive(Debug, Clone)]
pub enum SetPolicy {
    Lru(Lru),
    PseudoLru(PseudoLru),
    Fifo(Fifo),
    Random(Random),
}

impl SetPolicy {
    pub fn new(kind: ReplacementKind, assoc: usize, seed: u64) -> Self {
        match kind {
            ReplacementKind::Lru => SetPolicy::Lru(Lru::new(assoc)),
            ReplacementKind::PseudoLru => SetPolicy::PseudoLru(PseudoLru::new(assoc)),
            ReplacementKind::Fifo => SetPolicy::Fifo(Fifo::new(assoc)),
            ReplacementKind::Random => SetPolicy::Random(Random::new(assoc, seed)),
        }
    }

    fn inner(&mut self) -> &mut dyn ReplacementPolicy {
        match self {
            SetPolicy::Lru(p) => p,
            SetPolicy::PseudoLru(p) => p,
            SetPolicy::Fifo(p) => p,
            SetPolicy::Random(p) => p,
        }
    }
}

impl ReplacementPolicy for SetPolicy {
    fn insert(&mut self, way: usize) {
        self.inner().insert(way)
    }

    fn invalidate(&mut self, way: usize) {
        self.inner().invalidate(way)
    }

    fn touch(&mut self, way: usize) {
        self.inner().touch(way)
    }

    fn select(&mut self) -> usize {
        self.inner().select()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(policy: &mut impl ReplacementPolicy, ways: usize) {
        for way in 0..ways {
            assert_eq!(way, policy.select());
            policy.insert(way);
        }
    }

    #[test]
    fn lru_evicts_least_recent() {
        let mut lru = Lru::new(4);
        fill(&mut lru, 4);
        assert_eq!(0, lru.select());
        lru.touch(0);
        assert_eq!(1, lru.select());
        lru.touch(1);
        lru.touch(2);
        assert_eq!(3, lru.select());
    }

    #[test]
    fn invalid_ways_are_chosen_first() {
        let mut lru = Lru::new(4);
        fill(&mut lru, 4);
        lru.invalidate(2);
        assert_eq!(2, lru.select());

        let mut plru = PseudoLru::new(4);
        fill(&mut plru, 4);
        plru.invalidate(1);
        assert_eq!(1, plru.select());
    }

    #[test]
    fn pseudo_lru_follows_tree_bits() {
        let mut plru = PseudoLru::new(4);
        fill(&mut plru, 4);
        // last insert was way 3: root points left, left subtree points at way 0
        assert_eq!(0, plru.select());
        plru.touch(0);
        // root now points right; right subtree last used way 3
        assert_eq!(2, plru.select());
        plru.touch(2);
        assert_eq!(1, plru.select());
    }

    #[test]
    fn single_way_sets() {
        let mut plru = PseudoLru::new(1);
        plru.insert(0);
        assert_eq!(0, plru.select());
        let mut lru = Lru::new(1);
        lru.insert(0);
        assert_eq!(0, lru.select());
    }

    #[test]
    fn fifo_ignores_touches() {
        let mut fifo = Fifo::new(2);
        fill(&mut fifo, 2);
        fifo.touch(0);
        assert_eq!(0, fifo.select());
        fifo.insert(0);
        assert_eq!(1, fifo.select());
    }

    #[test]
    fn random_is_reproducible() {
        let picks = |seed| {
            let mut policy = SetPolicy::new(ReplacementKind::Random, 8, seed);
            fill(&mut policy, 8);
            (0..16).map(|_| policy.select()).collect::<Vec<_>>()
        };
        assert_eq!(picks(7), picks(7));
        assert!(picks(7).iter().all(|&way| way < 8));
    }
}
