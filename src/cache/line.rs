use crate::coherence::LineState;

#[derive(Debug, Clone)]
pub struct CacheLine {
    pub line_addr: u64,
    pub state: LineState,
    pub dirty: bool,
    pub data: Box<[u8]>,
}

impl CacheLine {
    pub(crate) fn empty(line_bytes: usize) -> Self {
        Self {
            line_addr: 0,
            state: LineState::Invalid,
            dirty: false,
            data: vec![0; line_bytes].into_boxed_slice(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state.is_valid()
    }

    pub fn read(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

/// A line pushed out of a cache, either by replacement or by invalidation.
#[derive(Debug, Clone)]
pub struct Eviction {
    pub line_addr: u64,
    pub state: LineState,
    pub dirty: bool,
    pub data: Box<[u8]>,
}

impl Eviction {
    pub fn needs_writeback(&self) -> bool {
        self.dirty
    }
}
