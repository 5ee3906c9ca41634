//! Application services - the flow catalog and the interpreter

/// Immutable registry of validated flow definitions
pub mod flow_catalog;

/// The setup-flow interpreter
pub mod setup_flow_service;
