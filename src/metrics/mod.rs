use std::ops::AddAssign;

use serde::Serialize;

use crate::coherence::CoherenceStats;
use crate::dram::{DramController, DramEnergy, DramStats, PowerResidency};
use crate::interconnect::InterconnectStats;
use crate::sim::request::{MemOp, RequestStatus, Response};
use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HitCounter {
    pub hits: u64,
    pub misses: u64,
}

impl HitCounter {
    pub fn record(&mut self, hit: bool) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
    }

    pub fn accesses(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        ratio(self.hits, self.accesses())
    }
}

impl AddAssign<&HitCounter> for HitCounter {
    fn add_assign(&mut self, other: &HitCounter) {
        self.hits = self.hits.saturating_add(other.hits);
        self.misses = self.misses.saturating_add(other.misses);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LevelSummary {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

impl From<&HitCounter> for LevelSummary {
    fn from(c: &HitCounter) -> Self {
        Self {
            hits: c.hits,
            misses: c.misses,
            hit_rate: c.hit_rate(),
        }
    }
}

/// Power-of-two latency buckets: `[0,4) [4,8) [8,16) ... [512,1024) [1024,inf)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencyHistogram {
    pub buckets: [u64; 10],
}

impl LatencyHistogram {
    pub fn record(&mut self, latency: Cycle) {
        let idx = match latency {
            0..=3 => 0,
            _ => ((64 - latency.leading_zeros()) as usize - 2).min(self.buckets.len() - 1),
        };
        self.buckets[idx] = self.buckets[idx].saturating_add(1);
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean: f64,
    pub p50: Cycle,
    pub p95: Cycle,
    pub p99: Cycle,
    pub max: Cycle,
    pub histogram: LatencyHistogram,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestCounts {
    pub completed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub cycle: Cycle,
    pub requests: RequestCounts,
    pub l1: Vec<LevelSummary>,
    pub l1_total: LevelSummary,
    pub l2: LevelSummary,
    pub latency: LatencySummary,
    pub coherence: CoherenceStats,
    pub interconnect: InterconnectStats,
    pub dram: DramStats,
    pub row_hit_rate: f64,
    // data-bus busy cycles over elapsed channel cycles
    pub bandwidth_utilization: f64,
    pub bytes_per_cycle: f64,
    pub residency: PowerResidency,
    pub energy: DramEnergy,
    pub energy_total_pj: f64,
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

// nearest-rank percentile of sorted samples
fn percentile(sorted: &[Cycle], p: f64) -> Cycle {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Passive observer of lookups and request completions. Component counters are read from the
/// components themselves when a snapshot is taken.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    l1: Vec<HitCounter>,
    l2: HitCounter,
    latencies: Vec<Cycle>,
    histogram: LatencyHistogram,
    requests: RequestCounts,
}

impl MetricsCollector {
    pub fn new(num_agents: usize) -> Self {
        Self {
            l1: vec![HitCounter::default(); num_agents],
            ..Default::default()
        }
    }

    pub fn record_l1(&mut self, agent: usize, hit: bool) {
        if let Some(c) = self.l1.get_mut(agent) {
            c.record(hit);
        }
    }

    pub fn record_l2(&mut self, hit: bool) {
        self.l2.record(hit);
    }

    pub fn record_response(&mut self, response: &Response) {
        let r = &mut self.requests;
        match response.status {
            RequestStatus::Ok => {
                r.completed += 1;
                match response.op {
                    MemOp::Read => {
                        r.reads += 1;
                        r.bytes_read += response.size as u64;
                    }
                    MemOp::Write => {
                        r.writes += 1;
                        r.bytes_written += response.size as u64;
                    }
                }
                self.latencies.push(response.latency);
                self.histogram.record(response.latency);
            }
            RequestStatus::Timeout => r.timed_out += 1,
            RequestStatus::Cancelled => r.cancelled += 1,
        }
    }

    pub fn l1(&self, agent: usize) -> HitCounter {
        self.l1.get(agent).copied().unwrap_or_default()
    }

    pub fn l1_total(&self) -> HitCounter {
        let mut total = HitCounter::default();
        for c in &self.l1 {
            total += c;
        }
        total
    }

    pub fn l2(&self) -> HitCounter {
        self.l2
    }

    pub fn requests(&self) -> RequestCounts {
        self.requests
    }

    pub fn latency(&self) -> LatencySummary {
        let mut sorted = self.latencies.clone();
        sorted.sort_unstable();
        let count = sorted.len() as u64;
        let sum: u64 = sorted.iter().sum();
        LatencySummary {
            count,
            mean: ratio(sum, count),
            p50: percentile(&sorted, 0.50),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
            max: sorted.last().copied().unwrap_or(0),
            histogram: self.histogram,
        }
    }

    pub fn snapshot(
        &self,
        now: Cycle,
        coherence: &CoherenceStats,
        interconnect: &InterconnectStats,
        dram: &DramController,
    ) -> MetricsSnapshot {
        let stats = *dram.stats();
        let energy = dram.energy(now);
        let channel_cycles = now.saturating_mul(dram.num_channels() as u64);
        let columns = stats.reads + stats.writes;
        MetricsSnapshot {
            cycle: now,
            requests: self.requests,
            l1: self.l1.iter().map(LevelSummary::from).collect(),
            l1_total: LevelSummary::from(&self.l1_total()),
            l2: LevelSummary::from(&self.l2),
            latency: self.latency(),
            coherence: *coherence,
            interconnect: interconnect.clone(),
            dram: stats,
            row_hit_rate: ratio(stats.row_hits, columns),
            bandwidth_utilization: ratio(stats.data_bus_cycles, channel_cycles),
            bytes_per_cycle: ratio(stats.bytes_read + stats.bytes_written, now),
            residency: dram.residency(now),
            energy,
            energy_total_pj: energy.total_pj(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_read(latency: Cycle) -> Response {
        Response {
            id: 0,
            agent: 0,
            addr: 0,
            size: 4,
            op: MemOp::Read,
            status: RequestStatus::Ok,
            data: Some(vec![0; 4]),
            issued_at: 0,
            completed_at: latency,
            latency,
        }
    }

    #[test]
    fn histogram_buckets_are_powers_of_two() {
        let mut h = LatencyHistogram::default();
        for latency in [0, 3, 4, 7, 8, 100, 5000] {
            h.record(latency);
        }
        assert_eq!([2, 2, 1, 0, 0, 1, 0, 0, 0, 1], h.buckets);
        assert_eq!(7, h.total());
    }

    #[test]
    fn percentiles_use_nearest_rank() {
        let mut m = MetricsCollector::new(1);
        for latency in 1..=100 {
            m.record_response(&ok_read(latency));
        }
        let s = m.latency();
        assert_eq!(100, s.count);
        assert_eq!(50, s.p50);
        assert_eq!(95, s.p95);
        assert_eq!(99, s.p99);
        assert_eq!(100, s.max);
        assert!((s.mean - 50.5).abs() < 1e-9);
    }

    #[test]
    fn hit_rates_aggregate_over_agents() {
        let mut m = MetricsCollector::new(2);
        m.record_l1(0, true);
        m.record_l1(0, false);
        m.record_l1(1, false);
        m.record_l1(1, false);
        assert_eq!(0.5, m.l1(0).hit_rate());
        assert_eq!(0.25, m.l1_total().hit_rate());
        assert_eq!(0.0, m.l2().hit_rate());
    }

    #[test]
    fn failed_requests_are_counted_apart() {
        let mut m = MetricsCollector::new(1);
        let mut r = ok_read(10);
        r.status = RequestStatus::Timeout;
        m.record_response(&r);
        r.status = RequestStatus::Cancelled;
        m.record_response(&r);
        let c = m.requests();
        assert_eq!((0, 1, 1), (c.completed, c.timed_out, c.cancelled));
        assert_eq!(0, m.latency().count);
    }
}
