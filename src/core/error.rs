//! KN-016: Error taxonomy for graph construction and resolution.
//!
//! Structural errors raised while building a graph abort that build.
//! Errors raised while resolving are contained to the failing item by the
//! caller and never abort a round.

use thiserror::Error;

/// Every failure the core can report.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or unparsable address string.
    #[error("invalid URN '{urn}': {reason}")]
    AddressFormat { urn: String, reason: String },

    /// A deferred value was created with an id that is already registered.
    #[error("output with id {0} already exists")]
    DuplicateId(String),

    /// A construct was bound to itself.
    #[error("construct {0} cannot be bound to itself")]
    SelfBinding(String),

    /// A construct (or the IR) was requested before an application context was set.
    #[error("no application context for '{0}': set an application first")]
    NoApplication(String),

    /// A deferred value was read before it was resolved.
    #[error("output {0} is not resolved")]
    UnresolvedValue(String),

    /// A batched read still had unprocessed keys after every retry.
    #[error("{remaining} item(s) could not be processed after {attempts} attempt(s)")]
    UnprocessedItems { remaining: usize, attempts: usize },

    /// A handle referenced a construct the session does not own.
    #[error("unknown construct '{0}'")]
    UnknownConstruct(String),

    /// A resolution round was requested before any script ran.
    #[error("no script has been run in this host")]
    NoSession,

    /// The construct graph contains a dependency cycle.
    #[error("dependency cycle detected involving: {0}")]
    DependencyCycle(String),

    /// A construct depends on something outside the graph.
    #[error("construct '{construct}' depends on unknown '{dependency}'")]
    UnknownDependency {
        construct: String,
        dependency: String,
    },

    /// A state lock status change that the lifecycle does not allow.
    #[error("invalid transition for {construct}: {from} -> {to}")]
    InvalidTransition {
        construct: String,
        from: String,
        to: String,
    },

    /// The state lock was written by an incompatible schema.
    #[error("state schema version mismatch: state has {state}, IR has {ir}")]
    SchemaMismatch { state: u32, ir: u32 },

    /// The default region changed while constructs are still deployed.
    #[error("cannot change region ({from} -> {to}) with deployed constructs: {deployed}")]
    RegionChange {
        from: String,
        to: String,
        deployed: String,
    },

    /// One or more blueprint validation problems.
    #[error("{0}")]
    Validation(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn address(urn: &str, reason: impl Into<String>) -> Self {
        Self::AddressFormat {
            urn: urn.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<Error> for String {
    fn from(e: Error) -> String {
        e.to_string()
    }
}
