pub mod bank;
pub mod command;
pub mod config;
pub mod controller;
pub mod mapping;
pub mod store;
pub mod timing;

pub use bank::{PowerResidency, PowerState};
pub use command::{CommandKind, DramCommand};
pub use config::{DramConfig, DramKind, PagePolicy, PowerParameters, TimingParameters};
pub use controller::{Completion, DramController, DramEnergy, DramStats, TickOutcome};
pub use mapping::{AddressMapping, DramCoord};
pub use store::BackingStore;
pub use timing::{check_refresh_deadlines, check_trace, TimingChecker};
