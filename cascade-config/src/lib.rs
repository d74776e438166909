//! Configuration types and loading for cascade workers.

mod environment;
mod load;
pub mod shared;

pub use environment::Environment;
pub use load::{ConfigSource, LoadConfigError, load_config};
