use serde::{Deserialize, Serialize};

use crate::sim::error::{ensure_config, SimResult};
use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementKind {
    #[default]
    Lru,
    PseudoLru,
    Fifo,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    #[default]
    WriteBack,
    WriteThrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    #[default]
    Private,
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub size_bytes: usize,
    pub associativity: usize,
    pub line_bytes: usize,
    pub replacement: ReplacementKind,
    pub write_policy: WritePolicy,
    pub hit_latency: Cycle,
    pub ownership: Ownership,
    // outstanding missed lines (L1 MSHR, L2 fill-merge table)
    pub mshr_entries: usize,
    // access port; only the shared cache routes requests through one
    pub port_bytes_per_cycle: u32,
    pub port_queue: usize,
    pub port_issues_per_cycle: u32,
    pub seed: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::default_l1()
    }
}

impl CacheConfig {
    pub fn default_l1() -> Self {
        Self {
            size_bytes: 32 * 1024,
            associativity: 4,
            line_bytes: 64,
            replacement: ReplacementKind::Lru,
            write_policy: WritePolicy::WriteBack,
            hit_latency: 2,
            ownership: Ownership::Private,
            mshr_entries: 8,
            port_bytes_per_cycle: 64,
            port_queue: 8,
            port_issues_per_cycle: 1,
            seed: 0,
        }
    }

    pub fn default_l2() -> Self {
        Self {
            size_bytes: 512 * 1024,
            associativity: 8,
            line_bytes: 64,
            replacement: ReplacementKind::PseudoLru,
            write_policy: WritePolicy::WriteBack,
            hit_latency: 12,
            ownership: Ownership::Shared,
            mshr_entries: 16,
            port_bytes_per_cycle: 32,
            port_queue: 16,
            port_issues_per_cycle: 2,
            seed: 0,
        }
    }

    pub fn num_sets(&self) -> usize {
        self.size_bytes / (self.associativity * self.line_bytes).max(1)
    }

    pub fn line_addr(&self, addr: u64) -> u64 {
        addr & !(self.line_bytes as u64 - 1)
    }

    pub fn offset(&self, addr: u64) -> usize {
        (addr & (self.line_bytes as u64 - 1)) as usize
    }

    pub fn validate(&self, name: &str) -> SimResult<()> {
        ensure_config!(
            self.line_bytes.is_power_of_two(),
            "{name}: line_bytes must be a power of two, got {}",
            self.line_bytes
        );
        ensure_config!(
            self.associativity.is_power_of_two(),
            "{name}: associativity must be a power of two, got {}",
            self.associativity
        );
        let set_bytes = self.associativity * self.line_bytes;
        ensure_config!(
            self.size_bytes >= set_bytes && self.size_bytes % set_bytes == 0,
            "{name}: size {} is not a multiple of associativity x line ({set_bytes})",
            self.size_bytes
        );
        ensure_config!(
            self.num_sets().is_power_of_two(),
            "{name}: set count {} must be a power of two",
            self.num_sets()
        );
        ensure_config!(self.mshr_entries > 0, "{name}: mshr_entries must be > 0");
        ensure_config!(
            self.port_bytes_per_cycle > 0,
            "{name}: port_bytes_per_cycle must be > 0"
        );
        ensure_config!(self.port_queue > 0, "{name}: port_queue must be > 0");
        ensure_config!(
            self.port_issues_per_cycle > 0,
            "{name}: port_issues_per_cycle must be > 0"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::error::SimError;

    #[test]
    fn default_l1_geometry() {
        let config = CacheConfig::default_l1();
        assert_eq!(128, config.num_sets());
        assert!(config.validate("l1").is_ok());
        assert_eq!(0x1040, config.line_addr(0x107f));
        assert_eq!(0x3f, config.offset(0x107f));
    }

    #[test]
    fn rejects_non_power_of_two_line() {
        let mut config = CacheConfig::default_l1();
        config.line_bytes = 48;
        assert!(matches!(config.validate("l1"), Err(SimError::Config(_))));
    }

    #[test]
    fn rejects_size_not_matching_geometry() {
        let mut config = CacheConfig::default_l1();
        config.size_bytes = 3 * 4 * 64;
        assert!(matches!(config.validate("l1"), Err(SimError::Config(_))));
        config.size_bytes = 100;
        assert!(matches!(config.validate("l1"), Err(SimError::Config(_))));
    }

    #[test]
    fn parses_policy_names() {
        let config: CacheConfig =
            toml::from_str("replacement = \"pseudo_lru\"\nwrite_policy = \"write_through\"\n")
                .unwrap();
        assert_eq!(ReplacementKind::PseudoLru, config.replacement);
        assert_eq!(WritePolicy::WriteThrough, config.write_policy);
    }
}
