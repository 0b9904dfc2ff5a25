//! Shared domain types for Stepwise.
//!
//! This crate contains the definition model of a workflow (state machine,
//! states, retry/catch policies), the reference-path evaluator, payload
//! templates, choice rules and the error types shared by the engine.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod choice;
pub mod config;
pub mod error;
pub mod path;
pub mod payload;
pub mod resource;
pub mod workflow;
