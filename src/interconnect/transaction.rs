use serde::Serialize;

use crate::timeq::Cycle;

pub type TxnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TxnKind {
    Read,
    Write,
}

/// Why the transaction exists; decides what happens when it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TxnOrigin {
    L2Fill,
    Writeback,
}

#[derive(Debug, Clone)]
pub struct AxiTransaction {
    pub id: TxnId,
    pub addr: u64,
    pub bytes: u32,
    pub kind: TxnKind,
    pub qos: u8,
    pub origin: TxnOrigin,
    pub beats: u32,
    pub issued_at: Cycle,
    pub granted_at: Option<Cycle>,
    pub outstanding: bool,
    // one entry per beat, in delivery order
    pub beat_completions: Vec<Cycle>,
}

impl AxiTransaction {
    pub fn new(id: TxnId, addr: u64, bytes: u32, kind: TxnKind, qos: u8, origin: TxnOrigin) -> Self {
        Self {
            id,
            addr,
            bytes,
            kind,
            qos,
            origin,
            beats: 0,
            issued_at: 0,
            granted_at: None,
            outstanding: false,
            beat_completions: Vec::new(),
        }
    }

    pub fn end(&self) -> u64 {
        self.addr + self.bytes as u64
    }

    pub fn is_complete(&self) -> bool {
        self.beat_completions.len() as u32 >= self.beats
    }
}

/// One DRAM-access-sized piece of a granted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubTransaction {
    pub txn: TxnId,
    pub index: u32,
    pub addr: u64,
    pub bytes: u32,
    pub beats: u32,
    pub kind: TxnKind,
    pub qos: u8,
}

impl SubTransaction {
    pub fn is_write(&self) -> bool {
        self.kind == TxnKind::Write
    }
}

/// Split a transaction at `access_bytes` boundaries. Each piece carries as many beats as its
/// bytes need on a `data_width`-byte bus.
pub fn split_bursts(txn: &AxiTransaction, access_bytes: u32, data_width: u32) -> Vec<SubTransaction> {
    let access = access_bytes.max(1) as u64;
    let width = data_width.max(1);
    let mut subs = Vec::new();
    let mut addr = txn.addr;
    while addr < txn.end() {
        let boundary = (addr / access + 1) * access;
        let bytes = (boundary.min(txn.end()) - addr) as u32;
        subs.push(SubTransaction {
            txn: txn.id,
            index: subs.len() as u32,
            addr,
            bytes,
            beats: bytes.div_ceil(width),
            kind: txn.kind,
            qos: txn.qos,
        });
        addr += bytes as u64;
    }
    subs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(addr: u64, bytes: u32) -> AxiTransaction {
        AxiTransaction::new(7, addr, bytes, TxnKind::Read, 0, TxnOrigin::L2Fill)
    }

    #[test]
    fn aligned_burst_splits_into_access_sized_pieces() {
        let subs = split_bursts(&txn(0x1000, 128), 64, 16);
        assert_eq!(2, subs.len());
        assert_eq!((0x1000, 64, 4), (subs[0].addr, subs[0].bytes, subs[0].beats));
        assert_eq!((0x1040, 64, 1), (subs[1].addr, subs[1].bytes, subs[1].index));
    }

    #[test]
    fn small_and_straddling_transfers() {
        let subs = split_bursts(&txn(0x1004, 4), 64, 16);
        assert_eq!(1, subs.len());
        assert_eq!(1, subs[0].beats);

        let subs = split_bursts(&txn(0x103c, 8), 64, 16);
        assert_eq!(
            vec![(0x103c, 4), (0x1040, 4)],
            subs.iter().map(|s| (s.addr, s.bytes)).collect::<Vec<_>>()
        );
    }
}
