// tlc — Tensor Layout Compiler
//
// Library root. Assigns memory formats to neural-network computation
// graphs and materializes the remaining conversions as reorder nodes.

pub mod advisor;
pub mod diag;
pub mod direction;
pub mod dot;
pub mod factory;
pub mod graph;
pub mod layout;
pub mod overrides;
pub mod pass;
pub mod pipeline;
pub mod reorder;
