//! # App
//!
//! Wires configuration, logging and a storage backend, then runs the
//! load-mutate-commit cycle over a batch of orders.

pub mod config;
pub mod error;
pub mod workflow;

pub use config::{Backend, Config, LogFormat, PostgresConfig};
pub use error::{AppError, ConfigError};
