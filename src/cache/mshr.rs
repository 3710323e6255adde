use smallvec::SmallVec;

/// One outstanding missed line and everything waiting on it, in arrival order.
#[derive(Debug)]
pub struct MshrEntry<T> {
    pub line_addr: u64,
    pub waiting: SmallVec<[T; 4]>,
}

/// Miss status holding registers: at most `capacity` distinct lines in flight, any number of
/// waiters per line.
#[derive(Debug)]
pub struct MshrTable<T> {
    capacity: usize,
    entries: Vec<MshrEntry<T>>,
}

impl<T> MshrTable<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::new(),
        }
    }

    pub fn has_entry(&self, line_addr: u64) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.line_addr == line_addr)
    }

    pub fn can_allocate(&self, line_addr: u64) -> bool {
        self.has_entry(line_addr) || self.entries.len() < self.capacity
    }

    /// Start tracking `line_addr` with `first` as its primary waiter. Fails when full.
    pub fn allocate(&mut self, line_addr: u64, first: T) -> Result<(), T> {
        if self.entries.len() >= self.capacity || self.has_entry(line_addr) {
            return Err(first);
        }
        let mut waiting = SmallVec::new();
        waiting.push(first);
        self.entries.push(MshrEntry { line_addr, waiting });
        Ok(())
    }

    /// Add a secondary waiter to an existing entry. Hands the waiter back if there is none.
    pub fn merge(&mut self, line_addr: u64, waiter: T) -> Result<(), T> {
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.line_addr == line_addr)
        {
            Some(entry) => {
                entry.waiting.push(waiter);
                Ok(())
            }
            None => Err(waiter),
        }
    }

    pub fn remove_entry(&mut self, line_addr: u64) -> Option<MshrEntry<T>> {
        let idx = self
            .entries
            .iter()
            .position(|entry| entry.line_addr == line_addr)?;
        Some(self.entries.remove(idx))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::MshrTable;

    #[test]
    fn merges_waiters_in_arrival_order() {
        let mut table = MshrTable::new(1);
        table.allocate(0x40, 1u64).unwrap();
        assert_eq!(Err(2), table.allocate(0x80, 2));
        table.merge(0x40, 3).unwrap();
        table.merge(0x40, 4).unwrap();
        let entry = table.remove_entry(0x40).unwrap();
        assert_eq!(&[1, 3, 4], &entry.waiting[..]);
        assert!(table.is_empty());
    }

    #[test]
    fn merge_to_missing_line_hands_waiter_back() {
        let mut table = MshrTable::<u64>::new(2);
        assert_eq!(Err(9), table.merge(0x40, 9));
    }

    #[test]
    fn remove_entry_frees_slot() {
        let mut table = MshrTable::new(1);
        table.allocate(1, ()).unwrap();
        assert!(!table.can_allocate(2));
        assert!(table.can_allocate(1));
        table.remove_entry(1).unwrap();
        assert!(table.can_allocate(2));
    }

    #[test]
    fn duplicate_allocate_is_rejected() {
        let mut table = MshrTable::new(4);
        table.allocate(7, 'a').unwrap();
        assert_eq!(Err('b'), table.allocate(7, 'b'));
        assert_eq!(1, table.len());
    }
}
