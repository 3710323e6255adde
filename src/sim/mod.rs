pub mod config;
pub mod error;
pub mod perf_log;
pub mod request;
pub mod top;


pub use config::{Config, DriverConfig, SimConfig, SystemConfig};
pub use error::{SimError, SimResult};
pub use request::{CompletionSink, MemOp, MemoryRequest, RequestHandle, RequestStatus, Response};
pub use top::{MemorySystem, TopologySnapshot};
