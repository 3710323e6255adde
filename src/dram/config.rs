use serde::{Deserialize, Serialize};
use toml::Value;

use crate::sim::config::{overlay, Config};
use crate::sim::error::{ensure_config, SimError, SimResult};
use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DramKind {
    Ddr3,
    #[default]
    Ddr4,
    Lpddr4,
    Hbm2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PagePolicy {
    #[default]
    Open,
    Closed,
}

/// Command timing in controller cycles.
#[allow(non_snake_case)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingParameters {
    pub tRCD: Cycle,
    pub tRP: Cycle,
    pub tRAS: Cycle,
    pub tRC: Cycle,
    pub tRRD: Cycle,
    pub tFAW: Cycle,
    pub tCCD: Cycle,
    pub tCL: Cycle,
    pub tCWL: Cycle,
    pub tBL: Cycle,
    pub tWR: Cycle,
    pub tWTR: Cycle,
    pub tRTP: Cycle,
    pub tRTW: Cycle,
    pub tRFC: Cycle,
    pub tREFI: Cycle,
    pub tXP: Cycle,
}

impl Default for TimingParameters {
    fn default() -> Self {
        Self::preset(DramKind::Ddr4)
    }
}

impl TimingParameters {
    pub fn preset(kind: DramKind) -> Self {
        match kind {
            DramKind::Ddr3 => Self {
                tRCD: 11,
                tRP: 11,
                tRAS: 28,
                tRC: 39,
                tRRD: 5,
                tFAW: 24,
                tCCD: 4,
                tCL: 11,
                tCWL: 8,
                tBL: 4,
                tWR: 12,
                tWTR: 6,
                tRTP: 6,
                tRTW: 9,
                tRFC: 208,
                tREFI: 6240,
                tXP: 5,
            },
            DramKind::Ddr4 => Self {
                tRCD: 16,
                tRP: 16,
                tRAS: 39,
                tRC: 55,
                tRRD: 6,
                tFAW: 26,
                tCCD: 4,
                tCL: 16,
                tCWL: 12,
                tBL: 4,
                tWR: 18,
                tWTR: 9,
                tRTP: 9,
                tRTW: 10,
                tRFC: 420,
                tREFI: 9360,
                tXP: 8,
            },
            DramKind::Lpddr4 => Self {
                tRCD: 18,
                tRP: 18,
                tRAS: 42,
                tRC: 60,
                tRRD: 10,
                tFAW: 40,
                tCCD: 8,
                tCL: 20,
                tCWL: 10,
                tBL: 8,
                tWR: 18,
                tWTR: 10,
                tRTP: 8,
                tRTW: 20,
                tRFC: 280,
                tREFI: 3904,
                tXP: 8,
            },
            DramKind::Hbm2 => Self {
                tRCD: 14,
                tRP: 14,
                tRAS: 33,
                tRC: 47,
                tRRD: 4,
                tFAW: 16,
                tCCD: 2,
                tCL: 14,
                tCWL: 4,
                tBL: 2,
                tWR: 16,
                tWTR: 8,
                tRTP: 4,
                tRTW: 12,
                tRFC: 260,
                tREFI: 3900,
                tXP: 8,
            },
        }
    }

    /// Write recovery measured from the WR command.
    pub fn write_to_precharge(&self) -> Cycle {
        self.tCWL + self.tBL + self.tWR
    }

    /// Write-to-read turnaround on the same rank, measured from the WR command.
    pub fn write_to_read(&self) -> Cycle {
        self.tCWL + self.tBL + self.tWTR
    }

    /// Smallest refresh margin that still lets a rank drain and refresh before its deadline:
    /// wake from power-down, let the slowest open bank become prechargeable, precharge every bank
    /// one command per cycle, then wait out tRP.
    pub fn min_refresh_margin(&self, ranks: usize, banks: usize) -> Cycle {
        self.tXP + self.drain() + self.tRP + 2 * (ranks * banks) as Cycle + 1
    }

    /// Longest a just-used bank can take before it may be precharged and activated again.
    pub fn drain(&self) -> Cycle {
        self.tRC
            .max(self.tRAS)
            .max(self.tRTP)
            .max(self.write_to_precharge())
    }

    pub fn validate(&self) -> SimResult<()> {
        ensure_config!(self.tBL > 0, "dram.timing: tBL must be > 0");
        ensure_config!(self.tRCD > 0, "dram.timing: tRCD must be > 0");
        ensure_config!(self.tRP > 0, "dram.timing: tRP must be > 0");
        ensure_config!(
            self.tCCD >= self.tBL,
            "dram.timing: tCCD ({}) must cover a burst (tBL {})",
            self.tCCD,
            self.tBL
        );
        ensure_config!(
            self.tRC >= self.tRAS,
            "dram.timing: tRC ({}) must be >= tRAS ({})",
            self.tRC,
            self.tRAS
        );
        ensure_config!(
            self.tRTW + self.tCWL >= self.tCL + self.tBL,
            "dram.timing: tRTW ({}) lets write data overlap read data",
            self.tRTW
        );
        ensure_config!(
            self.tREFI > self.tRFC,
            "dram.timing: tREFI ({}) must exceed tRFC ({})",
            self.tREFI,
            self.tRFC
        );
        Ok(())
    }
}

/// Energy per command (pJ) and per bank-cycle in each power state (pJ).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerParameters {
    pub act_pj: f64,
    pub pre_pj: f64,
    pub rd_pj: f64,
    pub wr_pj: f64,
    pub ref_pj: f64,
    pub active_pj_per_cycle: f64,
    pub standby_pj_per_cycle: f64,
    pub powerdown_pj_per_cycle: f64,
}

impl Default for PowerParameters {
    fn default() -> Self {
        Self {
            act_pj: 1500.0,
            pre_pj: 900.0,
            rd_pj: 1200.0,
            wr_pj: 1300.0,
            ref_pj: 20000.0,
            active_pj_per_cycle: 40.0,
            standby_pj_per_cycle: 20.0,
            powerdown_pj_per_cycle: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DramConfig {
    pub kind: DramKind,
    pub capacity_bytes: u64,
    pub data_rate_mts: u32,
    pub channels: usize,
    pub ranks: usize,
    pub banks: usize,
    pub row_bytes: u64,
    pub bus_width_bytes: u32,
    pub burst_length: u32,
    // per-channel request queue
    pub queue_capacity: usize,
    pub page_policy: PagePolicy,
    // column hits served from one open row before a conflicting request may close it
    pub row_hit_cap: u32,
    pub refresh_margin: Cycle,
    pub standby_threshold: Cycle,
    pub powerdown_threshold: Cycle,
    pub timing: TimingParameters,
    pub power: PowerParameters,
}

impl Default for DramConfig {
    fn default() -> Self {
        Self::for_kind(DramKind::Ddr4)
    }
}

impl Config for DramConfig {
    /// The `kind` key selects the timing preset that the rest of the section (including a
    /// partial `[dram.timing]`) is applied on top of.
    fn from_section(section: Option<&Value>) -> SimResult<Self> {
        let kind = match section.and_then(|s| s.get("kind")) {
            Some(kind) => kind
                .clone()
                .try_into()
                .map_err(|err| SimError::config(format!("dram.kind: {err}")))?,
            None => DramKind::default(),
        };
        overlay(&Self::for_kind(kind), section)
    }
}

impl DramConfig {
    pub fn for_kind(kind: DramKind) -> Self {
        let (data_rate_mts, bus_width_bytes, burst_length) = match kind {
            DramKind::Ddr3 => (1600, 8, 8),
            DramKind::Ddr4 => (2400, 8, 8),
            DramKind::Lpddr4 => (3200, 4, 16),
            DramKind::Hbm2 => (2000, 16, 4),
        };
        Self {
            kind,
            capacity_bytes: 1 << 30,
            data_rate_mts,
            channels: 2,
            ranks: 1,
            banks: 8,
            row_bytes: 2048,
            bus_width_bytes,
            burst_length,
            queue_capacity: 32,
            page_policy: PagePolicy::Open,
            row_hit_cap: 4,
            refresh_margin: 160,
            standby_threshold: 16,
            powerdown_threshold: 128,
            timing: TimingParameters::preset(kind),
            power: PowerParameters::default(),
        }
    }

    /// Bytes moved by one column command.
    pub fn access_bytes(&self) -> u64 {
        self.bus_width_bytes as u64 * self.burst_length as u64
    }

    pub fn rows(&self) -> u64 {
        let per_row = self.channels as u64 * self.ranks as u64 * self.banks as u64 * self.row_bytes;
        self.capacity_bytes / per_row.max(1)
    }

    pub fn columns(&self) -> u64 {
        self.row_bytes / self.access_bytes().max(1)
    }

    /// Peak data rate of all channels, in GB/s.
    pub fn peak_bandwidth_gbps(&self) -> f64 {
        self.channels as f64 * self.bus_width_bytes as f64 * self.data_rate_mts as f64 / 1000.0
    }

    pub fn validate(&self) -> SimResult<()> {
        for (name, value) in [
            ("channels", self.channels as u64),
            ("ranks", self.ranks as u64),
            ("banks", self.banks as u64),
            ("row_bytes", self.row_bytes),
            ("bus_width_bytes", self.bus_width_bytes as u64),
            ("burst_length", self.burst_length as u64),
            ("capacity_bytes", self.capacity_bytes),
        ] {
            ensure_config!(
                value.is_power_of_two(),
                "dram: {name} must be a power of two, got {value}"
            );
        }
        ensure_config!(
            self.row_bytes >= self.access_bytes(),
            "dram: row ({}) smaller than one access ({})",
            self.row_bytes,
            self.access_bytes()
        );
        ensure_config!(
            self.rows() >= 1
                && self.rows() * self.channels as u64 * self.ranks as u64 * self.banks as u64
                    * self.row_bytes
                    == self.capacity_bytes,
            "dram: capacity {:#x} does not match channels x ranks x banks x row_bytes",
            self.capacity_bytes
        );
        ensure_config!(self.queue_capacity > 0, "dram: queue_capacity must be > 0");
        ensure_config!(self.row_hit_cap > 0, "dram: row_hit_cap must be > 0");
        ensure_config!(
            self.powerdown_threshold >= self.standby_threshold,
            "dram: powerdown_threshold ({}) below standby_threshold ({})",
            self.powerdown_threshold,
            self.standby_threshold
        );
        self.timing.validate()?;
        ensure_config!(
            self.powerdown_threshold > self.timing.tXP + self.timing.drain(),
            "dram: powerdown_threshold ({}) must exceed tXP + bank drain ({})",
            self.powerdown_threshold,
            self.timing.tXP + self.timing.drain()
        );
        let min_margin = self.timing.min_refresh_margin(self.ranks, self.banks);
        ensure_config!(
            self.refresh_margin >= min_margin,
            "dram: refresh_margin {} cannot guarantee the refresh deadline (need >= {min_margin})",
            self.refresh_margin
        );
        ensure_config!(
            self.timing.tREFI > self.refresh_margin + self.timing.tRFC,
            "dram: tREFI ({}) must exceed refresh_margin + tRFC ({})",
            self.timing.tREFI,
            self.refresh_margin + self.timing.tRFC
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        for kind in [DramKind::Ddr3, DramKind::Ddr4, DramKind::Lpddr4, DramKind::Hbm2] {
            let config = DramConfig::for_kind(kind);
            assert!(config.validate().is_ok(), "{kind:?}: {:?}", config.validate());
        }
    }

    #[test]
    fn default_geometry() {
        let config = DramConfig::default();
        assert_eq!(64, config.access_bytes());
        assert_eq!(32, config.columns());
        assert_eq!(32768, config.rows());
    }

    #[test]
    fn kind_selects_the_timing_preset_under_overrides() {
        let section: Value = toml::from_str("kind = \"ddr3\"\n[timing]\ntCL = 12\n").unwrap();
        let config = DramConfig::from_section(Some(&section)).unwrap();
        assert_eq!(DramKind::Ddr3, config.kind);
        assert_eq!(12, config.timing.tCL);
        assert_eq!(TimingParameters::preset(DramKind::Ddr3).tRFC, config.timing.tRFC);
    }

    #[test]
    fn small_refresh_margin_is_rejected() {
        let mut config = DramConfig::default();
        config.refresh_margin = 10;
        assert!(matches!(config.validate(), Err(SimError::Config(_))));
    }

    #[test]
    fn inconsistent_capacity_is_rejected() {
        let mut config = DramConfig::default();
        config.capacity_bytes = 1024;
        assert!(config.validate().is_err());
    }
}
