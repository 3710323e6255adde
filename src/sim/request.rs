use std::fmt;

use serde::Serialize;
use smallvec::SmallVec;

use crate::timeq::Cycle;

pub type RequestId = u64;

/// One line-sized piece of a request.
pub type AccessId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MemOp {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestStatus {
    Ok,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub id: RequestId,
    pub agent: usize,
    pub addr: u64,
    pub size: u32,
    pub op: MemOp,
    pub status: RequestStatus,
    // read data in address order; None for writes and failed requests
    pub data: Option<Vec<u8>>,
    pub issued_at: Cycle,
    pub completed_at: Cycle,
    pub latency: Cycle,
}

/// Where a finished request's `Response` goes.
#[derive(Default)]
pub enum CompletionSink {
    /// Kept by the memory system until taken with `take_response` or `drain_responses`.
    #[default]
    Queue,
    Callback(Box<dyn FnMut(&Response)>),
}

impl fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionSink::Queue => write!(f, "Queue"),
            CompletionSink::Callback(_) => write!(f, "Callback(..)"),
        }
    }
}

impl CompletionSink {
    pub(crate) fn deliver(&mut self, response: Response, queue: &mut Vec<Response>) {
        match self {
            CompletionSink::Queue => queue.push(response),
            CompletionSink::Callback(callback) => callback(&response),
        }
    }
}

#[derive(Debug)]
pub struct MemoryRequest {
    pub agent: usize,
    pub addr: u64,
    pub size: u32,
    pub op: MemOp,
    pub qos: u8,
    pub data: Option<Vec<u8>>,
    pub sink: CompletionSink,
}

impl MemoryRequest {
    pub fn read(agent: usize, addr: u64, size: u32) -> Self {
        Self {
            agent,
            addr,
            size,
            op: MemOp::Read,
            qos: 0,
            data: None,
            sink: CompletionSink::Queue,
        }
    }

    pub fn write(agent: usize, addr: u64, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Self {
            agent,
            addr,
            size: data.len() as u32,
            op: MemOp::Write,
            qos: 0,
            data: Some(data),
            sink: CompletionSink::Queue,
        }
    }

    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_sink(mut self, sink: CompletionSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_callback(self, callback: impl FnMut(&Response) + 'static) -> Self {
        self.with_sink(CompletionSink::Callback(Box::new(callback)))
    }

    pub fn end(&self) -> u64 {
        self.addr.saturating_add(self.size as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestHandle(pub(crate) RequestId);

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.0
    }
}

/// Split `[addr, addr + size)` at `line_bytes` boundaries into `(addr, len)` pieces.
pub fn split_lines(addr: u64, size: u32, line_bytes: usize) -> SmallVec<[(u64, usize); 4]> {
    let line = line_bytes as u64;
    let end = addr + size as u64;
    let mut pieces = SmallVec::new();
    let mut at = addr;
    while at < end {
        let boundary = (at / line + 1) * line;
        let next = boundary.min(end);
        pieces.push((at, (next - at) as usize));
        at = next;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_at_line_boundaries() {
        assert_eq!(&[(0x10, 8)], &split_lines(0x10, 8, 64)[..]);
        assert_eq!(
            &[(0x38, 8), (0x40, 64), (0x80, 4)],
            &split_lines(0x38, 76, 64)[..]
        );
        assert!(split_lines(0x40, 0, 64).is_empty());
    }

    #[test]
    fn write_size_follows_data() {
        let req = MemoryRequest::write(1, 0x100, vec![1, 2, 3]).with_qos(2);
        assert_eq!((3, MemOp::Write, 2), (req.size, req.op, req.qos));
        assert_eq!(0x103, req.end());
        assert_eq!("Queue", format!("{:?}", req.sink));
    }
}
