//! Shared utilities for toolmesh
//!
//! This crate provides the logging setup shared by the toolmesh binaries,
//! examples and integration tests.

pub mod logging;

pub use logging::{LogFormat, LogSettings, LoggingError, init_tracing, init_tracing_with};
