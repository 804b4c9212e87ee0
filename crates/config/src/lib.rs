//! Configuration for the RecodeX daemon
//!
//! Handles loading watch targets, profiles and runtime settings from TOML files
//! with environment variable overrides.

pub mod config;
pub mod profile;

pub use config::*;
pub use profile::*;
