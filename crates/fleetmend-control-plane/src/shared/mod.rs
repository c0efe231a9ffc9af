pub mod config;
pub mod error;
pub mod fan_out;
pub mod types;
