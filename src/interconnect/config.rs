use serde::{Deserialize, Serialize};

use crate::sim::config::Config;
use crate::sim::error::{ensure_config, SimResult};
use crate::timeq::Cycle;

pub const MAX_QOS_CLASSES: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterconnectConfig {
    pub data_width_bytes: u32,
    pub address_width: u32,
    // maximum beats per transaction
    pub burst_length: u32,
    // one weight per QoS class, class 0 first
    pub qos_weights: Vec<u32>,
    // per-class arbitration queue depth
    pub queue_capacity: usize,
    pub grants_per_cycle: u32,
    pub request_latency: Cycle,
    pub response_latency: Cycle,
    // class used for writebacks; defaults to the last (lowest priority) class
    pub writeback_class: Option<u8>,
}

impl Config for InterconnectConfig {}

impl Default for InterconnectConfig {
    fn default() -> Self {
        Self {
            data_width_bytes: 16,
            address_width: 40,
            burst_length: 16,
            qos_weights: vec![4, 2, 1],
            queue_capacity: 16,
            grants_per_cycle: 1,
            request_latency: 2,
            response_latency: 2,
            writeback_class: None,
        }
    }
}

impl InterconnectConfig {
    pub fn num_classes(&self) -> usize {
        self.qos_weights.len()
    }

    pub fn max_transaction_bytes(&self) -> u64 {
        self.data_width_bytes as u64 * self.burst_length as u64
    }

    pub fn writeback_class(&self) -> u8 {
        self.writeback_class
            .unwrap_or(self.qos_weights.len().saturating_sub(1) as u8)
    }

    pub fn validate(&self) -> SimResult<()> {
        ensure_config!(
            self.data_width_bytes.is_power_of_two(),
            "interconnect: data_width_bytes must be a power of two, got {}",
            self.data_width_bytes
        );
        ensure_config!(
            (12..=64).contains(&self.address_width),
            "interconnect: address_width must be in 12..=64, got {}",
            self.address_width
        );
        ensure_config!(
            (1..=256).contains(&self.burst_length),
            "interconnect: burst_length must be in 1..=256, got {}",
            self.burst_length
        );
        ensure_config!(
            !self.qos_weights.is_empty() && self.qos_weights.len() <= MAX_QOS_CLASSES,
            "interconnect: need 1..={MAX_QOS_CLASSES} qos classes, got {}",
            self.qos_weights.len()
        );
        ensure_config!(
            self.qos_weights.iter().all(|&w| w > 0),
            "interconnect: every qos weight must be > 0, got {:?}",
            self.qos_weights
        );
        ensure_config!(
            self.queue_capacity > 0,
            "interconnect: queue_capacity must be > 0"
        );
        ensure_config!(
            self.grants_per_cycle > 0,
            "interconnect: grants_per_cycle must be > 0"
        );
        ensure_config!(
            (self.writeback_class() as usize) < self.num_classes(),
            "interconnect: writeback_class {} out of range",
            self.writeback_class()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::error::SimError;

    #[test]
    fn defaults_are_valid() {
        let config = InterconnectConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(256, config.max_transaction_bytes());
        assert_eq!(2, config.writeback_class());
    }

    #[test]
    fn zero_weight_is_rejected() {
        let config = InterconnectConfig {
            qos_weights: vec![3, 0],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SimError::Config(_))));
    }

    #[test]
    fn odd_data_width_is_rejected() {
        let config = InterconnectConfig {
            data_width_bytes: 12,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
