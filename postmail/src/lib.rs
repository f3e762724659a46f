pub mod config;
pub mod controller;

pub use config::{Config, ConfigError, DkimConfig};
pub use controller::Postmail;
