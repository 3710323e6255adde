use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::sim::error::{SimError, SimResult};
use crate::sim::request::MemoryRequest;
use crate::traffic::config::{AgentTrafficSpec, TrafficConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
enum PatternKind {
    Sequential,
    Strided { stride: u64 },
    Random,
    Hotspot { hot_bytes: u64, hot_fraction: f64 },
}

#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub name: String,
    pub req_bytes: u32,
    pub qos: u8,
    write_fraction: f64,
    base: u64,
    span: u64,
    kind: PatternKind,
}

impl CompiledPattern {
    // request-aligned slots in the span
    fn slots(&self) -> u64 {
        (self.span / self.req_bytes as u64).max(1)
    }

    fn slot_addr(&self, slot: u64) -> u64 {
        self.base + (slot % self.slots()) * self.req_bytes as u64
    }

    fn offset_addr(&self, offset: u64) -> u64 {
        let req = self.req_bytes as u64;
        let aligned = (offset % self.span) / req * req;
        self.base + aligned.min(self.span - req)
    }

    pub fn addr(&self, idx: u64, rng: &mut StdRng) -> u64 {
        match self.kind {
            PatternKind::Sequential => self.slot_addr(idx),
            PatternKind::Strided { stride } => self.offset_addr(idx.wrapping_mul(stride)),
            PatternKind::Random => self.slot_addr(rng.gen_range(0..self.slots())),
            PatternKind::Hotspot {
                hot_bytes,
                hot_fraction,
            } => {
                let hot_slots = (hot_bytes / self.req_bytes as u64).clamp(1, self.slots());
                let slots = if rng.gen_bool(hot_fraction) {
                    hot_slots
                } else {
                    self.slots()
                };
                self.slot_addr(rng.gen_range(0..slots))
            }
        }
    }
}

/// Deterministic request stream of one agent.
#[derive(Debug, Clone)]
pub struct AddressStream {
    agent: usize,
    pattern: CompiledPattern,
    rng: StdRng,
    issued: u64,
}

impl AddressStream {
    pub fn pattern(&self) -> &CompiledPattern {
        &self.pattern
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn next_request(&mut self) -> MemoryRequest {
        let idx = self.issued;
        self.issued += 1;
        let addr = self.pattern.addr(idx, &mut self.rng);
        let write = self.pattern.write_fraction > 0.0 && self.rng.gen_bool(self.pattern.write_fraction);
        let request = if write {
            let fill = (idx as u8) ^ (self.agent as u8).rotate_left(4);
            MemoryRequest::write(self.agent, addr, vec![fill; self.pattern.req_bytes as usize])
        } else {
            MemoryRequest::read(self.agent, addr, self.pattern.req_bytes)
        };
        request.with_qos(self.pattern.qos)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatternEngine {
    streams: Vec<AddressStream>,
}

impl PatternEngine {
    pub fn new(config: &TrafficConfig, num_agents: usize) -> SimResult<Self> {
        config.validate()?;
        let streams = (0..num_agents)
            .map(|agent| {
                let spec = config.spec_for(agent);
                let region = if config.shared { 0 } else { agent as u64 * config.span_bytes };
                let pattern = compile_pattern(&spec, agent, config.base + region, config.span_bytes)?;
                Ok(AddressStream {
                    agent,
                    pattern,
                    rng: StdRng::seed_from_u64(config.seed.wrapping_add(agent as u64)),
                    issued: 0,
                })
            })
            .collect::<SimResult<Vec<_>>>()?;
        Ok(Self { streams })
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn stream(&self, agent: usize) -> Option<&AddressStream> {
        self.streams.get(agent)
    }

    pub fn next_request(&mut self, agent: usize) -> Option<MemoryRequest> {
        self.streams.get_mut(agent).map(AddressStream::next_request)
    }
}

fn compile_pattern(
    spec: &AgentTrafficSpec,
    agent: usize,
    base: u64,
    span: u64,
) -> SimResult<CompiledPattern> {
    let kind = match spec.pattern.trim().to_ascii_lowercase().as_str() {
        "sequential" | "seq" => PatternKind::Sequential,
        "strided" => PatternKind::Strided {
            stride: spec.stride.max(1),
        },
        "random" => PatternKind::Random,
        "hotspot" => PatternKind::Hotspot {
            hot_bytes: spec.hot_bytes,
            hot_fraction: spec.hot_fraction,
        },
        other => {
            return Err(SimError::config(format!(
                "traffic: unsupported pattern '{other}' for agent {agent} (expected sequential|strided|random|hotspot)"
            )))
        }
    };
    let name = if spec.name.is_empty() {
        format!("{}@{}_a{agent}", spec.pattern.trim(), spec.req_bytes)
    } else {
        spec.name.clone()
    };
    Ok(CompiledPattern {
        name,
        req_bytes: spec.req_bytes.max(1),
        qos: spec.qos,
        write_fraction: spec.write_fraction,
        base,
        span,
        kind,
    })
}
