pub mod cli;
pub mod engine;
pub mod error;
pub mod stats;
pub mod threshold;
pub mod utils;

pub use engine::{Engine, EngineOptions};
pub use error::ConfigError;
pub use utils::parse_duration_str;
