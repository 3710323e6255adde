pub mod config;
pub mod patterns;

use log::{info, warn};
use serde::Serialize;

use crate::metrics::MetricsSnapshot;
use crate::sim::error::SimResult;
use crate::sim::request::RequestStatus;
use crate::sim::top::MemorySystem;
use crate::timeq::Cycle;
use config::TrafficConfig;
use patterns::PatternEngine;

#[derive(Debug, Clone, Serialize)]
pub struct TrafficReport {
    pub issued: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub cycles: Cycle,
    // the cycle budget ran out before the workload drained
    pub truncated: bool,
    pub metrics: MetricsSnapshot,
}

/// Closed-loop load generator: each agent keeps up to `max_outstanding_per_agent` requests in
/// flight until the total request budget is spent.
#[derive(Debug)]
pub struct TrafficDriver {
    engine: PatternEngine,
    budget: u64,
    max_outstanding: usize,
    max_cycles: Cycle,
    outstanding: Vec<usize>,
    issued: u64,
    completed: u64,
    timed_out: u64,
}

impl TrafficDriver {
    pub fn new(config: &TrafficConfig, num_agents: usize) -> SimResult<Self> {
        Ok(Self {
            engine: PatternEngine::new(config, num_agents)?,
            budget: config.requests,
            max_outstanding: config.max_outstanding_per_agent,
            max_cycles: config.max_cycles,
            outstanding: vec![0; num_agents],
            issued: 0,
            completed: 0,
            timed_out: 0,
        })
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    fn is_done(&self) -> bool {
        self.issued >= self.budget && self.outstanding.iter().all(|&n| n == 0)
    }

    // Agents take turns so the budget is spread evenly.
    fn top_up(&mut self, system: &mut MemorySystem) -> SimResult<()> {
        loop {
            let mut progressed = false;
            for agent in 0..self.outstanding.len() {
                if self.issued >= self.budget {
                    return Ok(());
                }
                if self.outstanding[agent] >= self.max_outstanding {
                    continue;
                }
                let Some(request) = self.engine.next_request(agent) else {
                    continue;
                };
                system.submit(request)?;
                self.outstanding[agent] += 1;
                self.issued += 1;
                progressed = true;
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    fn collect(&mut self, system: &mut MemorySystem) {
        for response in system.drain_responses() {
            if let Some(n) = self.outstanding.get_mut(response.agent) {
                *n = n.saturating_sub(1);
            }
            match response.status {
                RequestStatus::Ok => self.completed += 1,
                RequestStatus::Timeout => self.timed_out += 1,
                RequestStatus::Cancelled => {}
            }
        }
    }

    pub fn run(&mut self, system: &mut MemorySystem) -> SimResult<TrafficReport> {
        let start = system.now();
        let mut truncated = false;
        while !self.is_done() {
            self.top_up(system)?;
            if system.step()?.is_none() {
                break;
            }
            self.collect(system);
            if system.now() - start > self.max_cycles {
                warn!(
                    "traffic: cycle budget of {} spent with {} requests outstanding",
                    self.max_cycles,
                    self.outstanding.iter().sum::<usize>()
                );
                truncated = true;
                break;
            }
        }
        if !truncated {
            system.run_until_idle()?;
            self.collect(system);
        }
        info!(
            "traffic: {} issued, {} completed, {} timed out in {} cycles",
            self.issued,
            self.completed,
            self.timed_out,
            system.now() - start
        );
        Ok(TrafficReport {
            issued: self.issued,
            completed: self.completed,
            timed_out: self.timed_out,
            cycles: system.now() - start,
            truncated,
            metrics: system.metrics_snapshot(),
        })
    }
}
