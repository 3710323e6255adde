use std::collections::{BTreeSet, HashMap};

use smallvec::SmallVec;

use super::transaction::TxnId;

#[derive(Debug)]
struct Tracking {
    expected: u32,
    next: u32,
    // finished pieces waiting for an earlier one
    parked: BTreeSet<u32>,
}

/// Releases the pieces of each transaction in issue order, while different transactions finish
/// in whatever order the memory returns them.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    txns: HashMap<TxnId, Tracking>,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, txn: TxnId, pieces: u32) {
        self.txns.insert(
            txn,
            Tracking {
                expected: pieces,
                next: 0,
                parked: BTreeSet::new(),
            },
        );
    }

    pub fn contains(&self, txn: TxnId) -> bool {
        self.txns.contains_key(&txn)
    }

    /// Mark piece `index` finished. Returns the pieces that can now be delivered, in order, and
    /// whether the transaction is fully delivered (its tracking is dropped then).
    pub fn complete(&mut self, txn: TxnId, index: u32) -> (SmallVec<[u32; 4]>, bool) {
        let mut ready = SmallVec::new();
        let Some(tracking) = self.txns.get_mut(&txn) else {
            return (ready, false);
        };
        if index < tracking.next || index >= tracking.expected {
            return (ready, false);
        }
        tracking.parked.insert(index);
        while tracking.parked.remove(&tracking.next) {
            ready.push(tracking.next);
            tracking.next += 1;
        }
        let done = tracking.next == tracking.expected;
        if done {
            self.txns.remove(&txn);
        }
        (ready, done)
    }

    pub fn len(&self) -> usize {
        self.txns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pieces_of_one_id_are_delivered_in_order() {
        let mut rob = ReorderBuffer::new();
        rob.register(1, 3);
        assert_eq!((SmallVec::<[u32; 4]>::new(), false), rob.complete(1, 2));
        let (ready, done) = rob.complete(1, 0);
        assert_eq!(&[0], &ready[..]);
        assert!(!done);
        let (ready, done) = rob.complete(1, 1);
        assert_eq!(&[1, 2], &ready[..]);
        assert!(done);
        assert!(rob.is_empty());
    }

    #[test]
    fn ids_complete_independently() {
        let mut rob = ReorderBuffer::new();
        rob.register(1, 2);
        rob.register(2, 1);
        assert!(rob.complete(2, 0).1);
        assert!(rob.contains(1));
        assert!(!rob.contains(2));
    }

    #[test]
    fn duplicate_and_unknown_pieces_are_ignored() {
        let mut rob = ReorderBuffer::new();
        rob.register(1, 2);
        rob.complete(1, 0);
        assert!(rob.complete(1, 0).0.is_empty());
        assert!(rob.complete(9, 0).0.is_empty());
    }
}
