//! KN-011: Language host: the two inbound operations.
//!
//! A host runs one script at a time. Running a script builds a fresh session
//! (dropping the previous one); resolution rounds then act on that session
//! until the next script replaces it. Both operations can be called
//! independently and any number of times.

use crate::core::batch::{self, BatchReader};
use crate::core::error::{Error, Result};
use crate::core::parser;
use crate::core::script;
use crate::core::session::Session;
use crate::core::types::{Blueprint, IrDocument, OutputFacts, ResolvedOutput, Value};
use crate::core::urn::Urn;
use indexmap::IndexMap;
use std::path::Path;

/// Owns the session produced by the most recent script run.
#[derive(Debug, Default)]
pub struct Host {
    session: Option<Session>,
}

impl Host {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Evaluate a blueprint into a new session and return its IR.
    pub fn run_script(&mut self, blueprint: &Blueprint) -> Result<IrDocument> {
        // a failed run leaves no half-built session behind
        self.session = None;
        let mut session = script::run_script(blueprint)?;
        let ir = session.to_ir()?;
        tracing::debug!(app = %ir.app_urn, constructs = ir.constructs.len(), "IR built");
        self.session = Some(session);
        Ok(ir)
    }

    /// Run the blueprint at `path` and return the IR as YAML.
    pub fn send_ir(&mut self, path: &Path) -> Result<String> {
        let blueprint = parser::parse_blueprint_file(path)?;
        let ir = self.run_script(&blueprint)?;
        Ok(serde_yaml_ng::to_string(&ir)?)
    }

    /// Run a resolution round on a YAML `{urn: {output: value}}` payload.
    ///
    /// Returns the deferred values resolved in this round as YAML.
    pub fn register_construct(&mut self, payload: &str) -> Result<String> {
        let facts: OutputFacts = if payload.trim().is_empty() {
            OutputFacts::new()
        } else {
            serde_yaml_ng::from_str(payload)?
        };
        let resolved = self.resolve(&facts)?;
        Ok(serde_yaml_ng::to_string(&resolved)?)
    }

    /// Run a resolution round on already-parsed facts.
    pub fn resolve(&mut self, facts: &OutputFacts) -> Result<Vec<ResolvedOutput>> {
        let session = self.session.as_mut().ok_or(Error::NoSession)?;
        session.resolve_round(facts)
    }

    /// Fetch reported outputs for `urns` from a batched store and resolve them.
    ///
    /// URNs the store has nothing for are left out of the round.
    pub fn pull_outputs<R>(&mut self, reader: &mut R, urns: &[Urn]) -> Result<Vec<ResolvedOutput>>
    where
        R: BatchReader<Key = Urn, Item = IndexMap<String, Value>>,
    {
        if self.session.is_none() {
            return Err(Error::NoSession);
        }
        let items = batch::get_many(
            reader,
            urns,
            batch::DEFAULT_CHUNK_SIZE,
            batch::DEFAULT_MAX_ATTEMPTS,
        )?;
        let facts: OutputFacts = urns
            .iter()
            .zip(items)
            .filter_map(|(urn, outputs)| outputs.map(|o| (urn.to_string(), o)))
            .collect();
        tracing::debug!(requested = urns.len(), found = facts.len(), "outputs pulled");
        self.resolve(&facts)
    }
}
