//! Shared utilities for tickerflow
//!
//! This crate provides common functionality used across the tickerflow workspace:
//! tracing setup and typed access to environment overrides.

pub mod env;
pub mod logging;

pub use env::{EnvError, env_flag, env_parsed};
pub use logging::{LogFormat, init_tracing, init_tracing_with};
