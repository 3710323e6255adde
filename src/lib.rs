pub mod cache;
pub mod coherence;
pub mod dram;
pub mod interconnect;
pub mod metrics;
pub mod sim;
pub mod timeq;
pub mod traffic;
