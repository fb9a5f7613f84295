//! Logging utilities.
//!
//! The engine logs through the `log` facade only; this module installs
//! `env_logger` as the sink for binaries that want it.

mod init;

pub use init::{FILTER_ENV, LoggingConfig, init_logging};
