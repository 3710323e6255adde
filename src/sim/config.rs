use std::path::PathBuf;

use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use toml::{Table, Value};

use crate::cache::config::CacheConfig;
use crate::coherence::CoherenceProtocol;
use crate::dram::config::DramConfig;
use crate::interconnect::config::InterconnectConfig;
use crate::sim::error::{ensure_config, SimError, SimResult};
use crate::timeq::Cycle;
use crate::traffic::config::TrafficConfig;

pub const MAX_AGENTS: usize = 64;

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> SimResult<Self> {
        match section {
            Some(value) => value
                .clone()
                .try_into()
                .map_err(|err| SimError::config(format!("cannot deserialize config: {err}"))),
            None => {
                warn!("config section not found, using defaults");
                Ok(Self::default())
            }
        }
    }
}

/// Deserialize `section` on top of `base`, so keys missing from the section keep the values of
/// `base` rather than the type's `Default`.
pub fn overlay<T: Serialize + DeserializeOwned>(base: &T, section: Option<&Value>) -> SimResult<T> {
    let mut merged = Value::try_from(base)
        .map_err(|err| SimError::config(format!("cannot serialize defaults: {err}")))?;
    if let Some(section) = section {
        merge_into(&mut merged, section);
    }
    merged
        .try_into()
        .map_err(|err| SimError::config(format!("cannot deserialize config: {err}")))
}

// nested tables merge key by key; anything else replaces
fn merge_into(base: &mut Value, section: &Value) {
    match (base, section) {
        (Value::Table(base), Value::Table(section)) => {
            for (key, value) in section {
                match base.get_mut(key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, section) => *base = section.clone(),
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub num_agents: usize,
    pub protocol: CoherenceProtocol,
    // cycles for a snoop query to reach a peer cache and come back
    pub snoop_latency: Cycle,
    // extra cycles for a cache-to-cache data transfer after the snoop completes
    pub transfer_latency: Cycle,
    // watchdog bound on request lifetime
    pub timeout: Cycle,
    pub log_level: u64,
    // keep every log record in memory for `command_log()`; long runs should stream instead
    pub record_log: bool,
    pub command_log: Option<PathBuf>,
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            num_agents: 2,
            protocol: CoherenceProtocol::Moesi,
            snoop_latency: 4,
            transfer_latency: 6,
            timeout: 1_000_000,
            log_level: 0,
            record_log: false,
            command_log: None,
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> SimResult<()> {
        ensure_config!(
            self.num_agents > 0 && self.num_agents <= MAX_AGENTS,
            "num_agents must be in 1..={MAX_AGENTS}, got {}",
            self.num_agents
        );
        ensure_config!(self.timeout > 0, "timeout must be > 0");
        Ok(())
    }
}

/// Everything `MemorySystem::configure` accepts.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub sim: SimConfig,
    pub l1: CacheConfig,
    pub l2: CacheConfig,
    pub interconnect: InterconnectConfig,
    pub dram: DramConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            sim: SimConfig::default(),
            l1: CacheConfig::default_l1(),
            l2: CacheConfig::default_l2(),
            interconnect: InterconnectConfig::default(),
            dram: DramConfig::default(),
        }
    }
}

impl SystemConfig {
    pub fn from_table(table: &Table) -> SimResult<Self> {
        Ok(Self {
            sim: SimConfig::from_section(table.get("sim"))?,
            l1: overlay(&CacheConfig::default_l1(), table.get("l1"))?,
            l2: overlay(&CacheConfig::default_l2(), table.get("l2"))?,
            interconnect: InterconnectConfig::from_section(table.get("interconnect"))?,
            dram: DramConfig::from_section(table.get("dram"))?,
        })
    }

    pub fn validate(&self) -> SimResult<()> {
        self.sim.validate()?;
        self.l1.validate("l1")?;
        self.l2.validate("l2")?;
        ensure_config!(
            self.l2.line_bytes >= self.l1.line_bytes,
            "l2 line ({}) must not be smaller than l1 line ({})",
            self.l2.line_bytes,
            self.l1.line_bytes
        );
        self.interconnect.validate()?;
        self.dram.validate()?;
        ensure_config!(
            self.interconnect.address_width >= 64
                || self.dram.capacity_bytes <= 1u64 << self.interconnect.address_width,
            "dram capacity {:#x} exceeds the {}-bit interconnect address space",
            self.dram.capacity_bytes,
            self.interconnect.address_width
        );
        ensure_config!(
            self.l2.line_bytes as u64 <= self.interconnect.max_transaction_bytes(),
            "l2 line ({}) does not fit one interconnect burst ({} bytes)",
            self.l2.line_bytes,
            self.interconnect.max_transaction_bytes()
        );
        Ok(())
    }
}

/// Sections the driver binary reads besides the system configuration.
#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    pub system: SystemConfig,
    pub traffic: TrafficConfig,
}

impl DriverConfig {
    pub fn from_table(table: &Table) -> SimResult<Self> {
        Ok(Self {
            system: SystemConfig::from_table(table)?,
            traffic: TrafficConfig::from_section(table.get("traffic"))?,
        })
    }
}
