use std::collections::BTreeMap;

use smallvec::SmallVec;

use super::protocol::LineState;

pub type Holders = SmallVec<[(usize, LineState); 4]>;

/// Which private caches hold each line and in what state. Filters snoop broadcasts down to the
/// caches that can actually respond.
#[derive(Debug, Default)]
pub struct Directory {
    // holders kept sorted by cache index so snoop order is reproducible
    entries: BTreeMap<u64, Holders>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_of(&self, line_addr: u64, cache: usize) -> LineState {
        self.entries
            .get(&line_addr)
            .and_then(|holders| holders.iter().find(|(c, _)| *c == cache))
            .map_or(LineState::Invalid, |(_, state)| *state)
    }

    /// Record `state` for `cache`; Invalid removes the cache from the holder set.
    pub fn set(&mut self, line_addr: u64, cache: usize, state: LineState) {
        if !state.is_valid() {
            self.remove(line_addr, cache);
            return;
        }
        let holders = self.entries.entry(line_addr).or_default();
        match holders.binary_search_by_key(&cache, |(c, _)| *c) {
            Ok(idx) => holders[idx].1 = state,
            Err(idx) => holders.insert(idx, (cache, state)),
        }
    }

    pub fn remove(&mut self, line_addr: u64, cache: usize) {
        if let Some(holders) = self.entries.get_mut(&line_addr) {
            holders.retain(|(c, _)| *c != cache);
            if holders.is_empty() {
                self.entries.remove(&line_addr);
            }
        }
    }

    pub fn holders(&self, line_addr: u64) -> &[(usize, LineState)] {
        self.entries
            .get(&line_addr)
            .map_or(&[][..], |holders| &holders[..])
    }

    /// Holders other than `cache`, in cache order.
    pub fn others(&self, line_addr: u64, cache: usize) -> SmallVec<[usize; 4]> {
        self.holders(line_addr)
            .iter()
            .filter(|(c, _)| *c != cache)
            .map(|(c, _)| *c)
            .collect()
    }

    /// Single-writer check for one line: an Exclusive or Modified holder must be alone, and at
    /// most one holder may own the line.
    pub fn check_line(&self, line_addr: u64) -> Result<(), String> {
        let holders = self.holders(line_addr);
        let exclusive = holders.iter().filter(|(_, s)| s.is_exclusive()).count();
        let owners = holders.iter().filter(|(_, s)| s.is_owner()).count();
        if exclusive > 0 && holders.len() > 1 {
            return Err(format!(
                "line {line_addr:#x} held exclusively alongside other copies: {}",
                describe(holders)
            ));
        }
        if owners > 1 {
            return Err(format!(
                "line {line_addr:#x} has {owners} owners: {}",
                describe(holders)
            ));
        }
        Ok(())
    }

    pub fn lines(&self) -> impl Iterator<Item = (u64, &[(usize, LineState)])> + '_ {
        self.entries
            .iter()
            .map(|(line, holders)| (*line, &holders[..]))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn describe(holders: &[(usize, LineState)]) -> String {
    holders
        .iter()
        .map(|(cache, state)| format!("l1[{cache}]={}", state.short()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holders_stay_sorted_and_invalid_removes() {
        let mut dir = Directory::new();
        dir.set(0x40, 3, LineState::Shared);
        dir.set(0x40, 1, LineState::Shared);
        dir.set(0x40, 2, LineState::Owned);
        assert_eq!(&[1, 2, 3], &dir.others(0x40, 9)[..]);
        assert_eq!(&[1, 3], &dir.others(0x40, 2)[..]);
        dir.set(0x40, 2, LineState::Invalid);
        assert_eq!(LineState::Invalid, dir.state_of(0x40, 2));
        dir.remove(0x40, 1);
        dir.remove(0x40, 3);
        assert!(dir.is_empty());
    }

    #[test]
    fn single_writer_check() {
        let mut dir = Directory::new();
        dir.set(0x80, 0, LineState::Modified);
        assert!(dir.check_line(0x80).is_ok());
        dir.set(0x80, 1, LineState::Shared);
        assert!(dir.check_line(0x80).is_err());
        dir.set(0x80, 0, LineState::Owned);
        assert!(dir.check_line(0x80).is_ok());
        dir.set(0x80, 1, LineState::Owned);
        assert!(dir.check_line(0x80).is_err());
    }
}
