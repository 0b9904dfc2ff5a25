//! Workflow infrastructure adapters.

pub mod process_invoker;
