use serde::Deserialize;

use crate::sim::config::Config;
use crate::sim::error::{ensure_config, SimResult};
use crate::timeq::Cycle;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrafficConfig {
    // requests issued over all agents
    pub requests: u64,
    pub max_outstanding_per_agent: usize,
    pub base: u64,
    // bytes of address space each agent's stream covers
    pub span_bytes: u64,
    // every agent streams over the same region instead of its own
    pub shared: bool,
    pub seed: u64,
    // give up after this many cycles even if requests are outstanding
    pub max_cycles: Cycle,
    // one entry per agent; agents past the end reuse the last entry
    pub agents: Vec<AgentTrafficSpec>,
}

impl Config for TrafficConfig {}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            requests: 10_000,
            max_outstanding_per_agent: 4,
            base: 0,
            span_bytes: 1 << 20,
            shared: false,
            seed: 1,
            max_cycles: 50_000_000,
            agents: Vec::new(),
        }
    }
}

impl TrafficConfig {
    pub fn spec_for(&self, agent: usize) -> AgentTrafficSpec {
        self.agents
            .get(agent)
            .or_else(|| self.agents.last())
            .cloned()
            .unwrap_or_default()
    }

    pub fn validate(&self) -> SimResult<()> {
        ensure_config!(
            self.max_outstanding_per_agent > 0,
            "traffic: max_outstanding_per_agent must be > 0"
        );
        ensure_config!(self.span_bytes > 0, "traffic: span_bytes must be > 0");
        for (idx, spec) in self.agents.iter().enumerate() {
            spec.validate(idx, self.span_bytes)?;
        }
        if self.agents.is_empty() {
            AgentTrafficSpec::default().validate(0, self.span_bytes)?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentTrafficSpec {
    pub name: String,
    // sequential | strided | random | hotspot
    pub pattern: String,
    pub req_bytes: u32,
    pub stride: u64,
    pub write_fraction: f64,
    pub qos: u8,
    // hotspot: the first `hot_bytes` of the span receive `hot_fraction` of the requests
    pub hot_bytes: u64,
    pub hot_fraction: f64,
}

impl Default for AgentTrafficSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            pattern: "random".to_string(),
            req_bytes: 64,
            stride: 256,
            write_fraction: 0.3,
            qos: 0,
            hot_bytes: 4096,
            hot_fraction: 0.8,
        }
    }
}

impl AgentTrafficSpec {
    fn validate(&self, idx: usize, span: u64) -> SimResult<()> {
        ensure_config!(
            self.req_bytes > 0 && self.req_bytes as u64 <= span,
            "traffic.agents[{idx}]: req_bytes must be in 1..={span}, got {}",
            self.req_bytes
        );
        ensure_config!(
            (0.0..=1.0).contains(&self.write_fraction),
            "traffic.agents[{idx}]: write_fraction must be in [0, 1], got {}",
            self.write_fraction
        );
        ensure_config!(
            (0.0..=1.0).contains(&self.hot_fraction),
            "traffic.agents[{idx}]: hot_fraction must be in [0, 1], got {}",
            self.hot_fraction
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::error::SimError;
    use toml::Table;

    #[test]
    fn agents_past_the_list_reuse_the_last_spec() {
        let table: Table = toml::from_str(
            r#"
            [traffic]
            requests = 64
            [[traffic.agents]]
            pattern = "sequential"
            qos = 0
            [[traffic.agents]]
            pattern = "hotspot"
            qos = 2
            "#,
        )
        .unwrap();
        let config = TrafficConfig::from_section(table.get("traffic")).unwrap();
        assert_eq!(64, config.requests);
        assert_eq!("sequential", config.spec_for(0).pattern);
        assert_eq!(2, config.spec_for(1).qos);
        assert_eq!("hotspot", config.spec_for(5).pattern);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_agent_list_uses_defaults() {
        let config = TrafficConfig::default();
        assert_eq!("random", config.spec_for(3).pattern);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_fractions() {
        let mut config = TrafficConfig::default();
        config.agents.push(AgentTrafficSpec {
            write_fraction: 1.5,
            ..Default::default()
        });
        assert!(matches!(config.validate(), Err(SimError::Config(_))));
    }
}
