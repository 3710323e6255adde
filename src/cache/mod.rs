pub mod array;
pub mod config;
pub mod hierarchy;
pub mod line;
pub mod mshr;
pub mod policy;

pub use array::Cache;
pub use config::{CacheConfig, Ownership, ReplacementKind, WritePolicy};
pub use hierarchy::{CacheHierarchy, NextLevelWrite};
pub use line::{CacheLine, Eviction};
pub use mshr::{MshrEntry, MshrTable};
pub use policy::{ReplacementPolicy, SetPolicy};
