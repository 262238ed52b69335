//! Core types for the allegrex module loader
//!
//! This crate provides the foundational error types, configuration,
//! and logging infrastructure shared by the memory and loader crates.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, LoaderConfig, LogLevel};
pub use error::{EmulatorError, LoaderError, MemoryError, Result};
