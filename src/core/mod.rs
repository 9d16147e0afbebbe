//! Core graph logic: addressing, deferred values, constructs, resolution and planning.

pub mod batch;
pub mod binding;
pub mod construct;
pub mod error;
pub mod output;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod script;
pub mod session;
pub mod state;
pub mod types;
pub mod urn;
