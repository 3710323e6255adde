use std::collections::HashMap;

const PAGE_SHIFT: u32 = 12;
const PAGE_BYTES: usize = 1 << PAGE_SHIFT;

/// Sparse byte-addressed memory contents behind the DRAM timing model. Anything never written
/// reads as zero; pages are allocated on first write.
#[derive(Debug, Default)]
pub struct BackingStore {
    capacity: u64,
    pages: HashMap<u64, Box<[u8; PAGE_BYTES]>>,
}

impl BackingStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            pages: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read_into(addr, &mut out);
        out
    }

    pub fn read_into(&self, addr: u64, out: &mut [u8]) {
        debug_assert!(addr + out.len() as u64 <= self.capacity);
        let mut done = 0;
        while done < out.len() {
            let at = addr + done as u64;
            let offset = (at as usize) & (PAGE_BYTES - 1);
            let chunk = (PAGE_BYTES - offset).min(out.len() - done);
            match self.pages.get(&(at >> PAGE_SHIFT)) {
                Some(page) => out[done..done + chunk].copy_from_slice(&page[offset..offset + chunk]),
                None => out[done..done + chunk].fill(0),
            }
            done += chunk;
        }
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) {
        debug_assert!(addr + data.len() as u64 <= self.capacity);
        let mut done = 0;
        while done < data.len() {
            let at = addr + done as u64;
            let offset = (at as usize) & (PAGE_BYTES - 1);
            let chunk = (PAGE_BYTES - offset).min(data.len() - done);
            let page = self
                .pages
                .entry(at >> PAGE_SHIFT)
                .or_insert_with(|| Box::new([0u8; PAGE_BYTES]));
            page[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
    }

    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_memory_reads_zero() {
        let store = BackingStore::new(1 << 20);
        assert_eq!(vec![0; 16], store.read(0x1234, 16));
        assert_eq!(0, store.resident_pages());
    }

    #[test]
    fn write_spanning_pages() {
        let mut store = BackingStore::new(1 << 20);
        let data: Vec<u8> = (0..32).collect();
        store.write(PAGE_BYTES as u64 - 8, &data);
        assert_eq!(2, store.resident_pages());
        assert_eq!(data, store.read(PAGE_BYTES as u64 - 8, 32));
        assert_eq!(vec![0, 1], store.read(PAGE_BYTES as u64 - 8, 2));
    }
}
