pub mod builder;
pub mod config;
pub mod error;
pub mod flow;
pub mod jobs;
pub mod sandbox;
pub mod types;

pub use config::{ConfigLoader, ConfigValidator, RuntimeConfig};
pub use error::AppError;
pub use types::*;
