//! Configuration and bootstrap for the quarry binary.

pub mod bootstrap;
pub mod config;

pub use bootstrap::App;
pub use config::Config;
