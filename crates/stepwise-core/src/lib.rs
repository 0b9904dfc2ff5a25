//! Workflow interpreter for Stepwise.
//!
//! This crate defines the `ResourceInvoker` port that the infrastructure
//! layer implements. It depends only on `stepwise-types` -- never on
//! `stepwise-infra` or any process/IO crate.

pub mod workflow;
