//! Kiln: construct graphs with deferred outputs for declarative cloud IR.
//!
//! Scripts declare constructs whose properties may wait on values only the
//! deployment engine knows. Each resolution round feeds reported outputs
//! back in and resolves every deferred value it can, to a fixpoint.

pub mod cli;
pub mod core;
pub mod host;
pub mod provenance;
