//! Infrastructure layer for Stepwise.
//!
//! Contains implementations of the ports defined in `stepwise-core`: the
//! subprocess-backed `ResourceInvoker` and the `config.toml` loader.

pub mod config;
pub mod workflow;
