//! KN-001: Wire types: the IR document, construct wire form, resolution
//! payloads, blueprints, plans, and provenance events.
//!
//! All types derive Serialize/Deserialize for YAML roundtripping.

use super::urn::Urn;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque construct value.
pub type Value = serde_yaml_ng::Value;

/// Concrete outputs reported by the deployment engine:
/// resource URN string → output name → value.
pub type OutputFacts = IndexMap<String, IndexMap<String, Value>>;

/// Current IR schema.
pub const SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Application identity
// ============================================================================

/// The application every construct in a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    /// Application name
    pub name: String,

    /// Project the application belongs to
    pub project: String,

    /// Deployment environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Cloud account id
    #[serde(default = "default_account")]
    pub account_id: String,

    /// Region used when a construct does not choose one
    #[serde(default = "default_region")]
    pub default_region: String,
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_account() -> String {
    "default".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Application {
    pub fn new(project: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            project: project.to_string(),
            environment: default_environment(),
            account_id: default_account(),
            default_region: default_region(),
        }
    }

    pub fn with_environment(mut self, environment: &str) -> Self {
        self.environment = environment.to_string();
        self
    }

    pub fn project_urn(&self) -> Urn {
        Urn {
            account_id: self.account_id.clone(),
            project: self.project.clone(),
            ..Default::default()
        }
    }

    pub fn app_urn(&self) -> Urn {
        Urn {
            environment: self.environment.clone(),
            application: self.name.clone(),
            ..self.project_urn()
        }
    }
}

// ============================================================================
// Construct wire form
// ============================================================================

/// Construct lifecycle inside a session. Only moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstructStatus {
    #[default]
    New,
    Pending,
    Resolved,
}

impl fmt::Display for ConstructStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Pending => write!(f, "pending"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// Input descriptor: either a known value or a pointer to what it waits on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Input {
    Resolved {
        value: Value,
    },
    Pending {
        #[serde(rename = "dependsOn")]
        depends_on: String,
    },
}

impl Input {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Resolved { value } => Some(value),
            Self::Pending { .. } => None,
        }
    }
}

/// Binding as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireBinding {
    pub to: Urn,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub inputs: IndexMap<String, Input>,
}

/// One construct in the IR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireConstruct {
    pub urn: Urn,

    #[serde(rename = "type")]
    pub construct_type: String,

    pub status: ConstructStatus,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub inputs: IndexMap<String, Input>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub outputs: IndexMap<String, Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<WireBinding>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub options: IndexMap<String, Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<Urn>,
}

/// The document handed to the deployment engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrDocument {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    pub version: u32,

    pub project_urn: Urn,

    pub app_urn: Urn,

    pub environment: String,

    pub default_region: String,

    /// Construct name → wire form (declaration order)
    #[serde(default)]
    pub constructs: IndexMap<String, WireConstruct>,
}

/// A deferred value resolved during a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedOutput {
    pub id: String,
    pub value: Value,
}

// ============================================================================
// Blueprint (declarative script)
// ============================================================================

/// A declarative script: an application plus its constructs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blueprint {
    /// Blueprint format version (must be "1.0")
    pub version: String,

    pub app: Application,

    /// Construct declarations (order-preserving)
    #[serde(default)]
    pub constructs: IndexMap<String, ConstructDecl>,
}

/// A single declared construct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstructDecl {
    #[serde(rename = "type")]
    pub construct_type: String,

    /// Property expressions (see `script`)
    #[serde(default)]
    pub properties: IndexMap<String, Value>,

    #[serde(default)]
    pub bindings: Vec<BindingDecl>,

    #[serde(default)]
    pub options: IndexMap<String, Value>,
}

/// A declared binding to another construct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingDecl {
    /// Destination construct name
    pub to: String,

    /// Shorthand for the `ReadOnly` input
    #[serde(default)]
    pub access: Option<AccessMode>,

    #[serde(default)]
    pub inputs: IndexMap<String, Value>,
}

/// Access granted by a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

// ============================================================================
// Plan
// ============================================================================

/// Action to take on a construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Create,
    Update,
    Destroy,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Destroy => write!(f, "DESTROY"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub construct: String,
    pub urn: Urn,
    pub action: PlanAction,
    /// BLAKE3 of the desired wire form (empty for destroys)
    pub hash: String,
}

/// Full deployment plan.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    pub app_urn: Urn,
    pub changes: Vec<PlannedChange>,
    /// Waves of constructs that can deploy together
    pub groups: Vec<Vec<Urn>>,
    pub to_create: u32,
    pub to_update: u32,
    pub to_destroy: u32,
    pub unchanged: u32,
}

// ============================================================================
// State lock
// ============================================================================

/// Deployment status of a construct as recorded in the state lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Creating,
    CreateComplete,
    CreateFailed,
    Updating,
    UpdateComplete,
    UpdateFailed,
    Deleting,
    DeleteComplete,
    DeleteFailed,
}

impl LockStatus {
    /// An operation is in flight.
    pub fn is_operating(self) -> bool {
        matches!(self, Self::Creating | Self::Updating | Self::Deleting)
    }

    /// Next deploy must create it from scratch.
    pub fn is_creatable(self) -> bool {
        matches!(self, Self::Creating | Self::CreateFailed | Self::DeleteComplete)
    }

    /// Something exists in the cloud that a delete would remove.
    pub fn is_deletable(self) -> bool {
        matches!(
            self,
            Self::CreateComplete
                | Self::CreateFailed
                | Self::UpdateComplete
                | Self::UpdateFailed
                | Self::DeleteFailed
        )
    }

    /// Terminal status for the in-flight operation.
    pub fn settled(self, success: bool) -> Option<Self> {
        match (self, success) {
            (Self::Creating, true) => Some(Self::CreateComplete),
            (Self::Creating, false) => Some(Self::CreateFailed),
            (Self::Updating, true) => Some(Self::UpdateComplete),
            (Self::Updating, false) => Some(Self::UpdateFailed),
            (Self::Deleting, true) => Some(Self::DeleteComplete),
            (Self::Deleting, false) => Some(Self::DeleteFailed),
            _ => None,
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// An in-flight operation may only settle; a settled construct may start
    /// any operation.
    pub fn can_transition(self, next: Self) -> bool {
        if self.is_operating() {
            self.settled(true) == Some(next) || self.settled(false) == Some(next)
        } else {
            next.is_operating()
        }
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::CreateComplete => "create_complete",
            Self::CreateFailed => "create_failed",
            Self::Updating => "updating",
            Self::UpdateComplete => "update_complete",
            Self::UpdateFailed => "update_failed",
            Self::Deleting => "deleting",
            Self::DeleteComplete => "delete_complete",
            Self::DeleteFailed => "delete_failed",
        };
        f.write_str(s)
    }
}

/// Per-construct lock entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstructLock {
    pub urn: Urn,

    #[serde(rename = "type")]
    pub construct_type: String,

    pub status: LockStatus,

    /// BLAKE3 of the wire form last deployed
    pub hash: String,

    pub last_updated: String,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub inputs: IndexMap<String, Input>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub outputs: IndexMap<String, Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<Urn>,
}

/// State lock for one application environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateLock {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    /// Bumped on every deploy
    pub version: u32,

    pub generated_at: String,
    pub generator: String,
    pub project_urn: Urn,
    pub app_urn: Urn,
    pub environment: String,
    pub default_region: String,

    /// Construct name → lock entry (order-preserving)
    #[serde(default)]
    pub constructs: IndexMap<String, ConstructLock>,
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    UpStarted {
        app: String,
        run_id: String,
        kiln_version: String,
    },
    ConstructPlanned {
        construct: String,
        action: PlanAction,
    },
    RoundApplied {
        run_id: String,
        round: u32,
        facts: usize,
        resolved: usize,
    },
    OutputResolved {
        run_id: String,
        id: String,
        hash: String,
    },
    ConstructFinalized {
        construct: String,
        status: String,
    },
    UpCompleted {
        run_id: String,
        rounds: u32,
        resolved: usize,
        pending: usize,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Value helper
// ============================================================================

/// Render a value as a plain string (used by concatenation).
pub fn value_to_string(val: &Value) -> String {
    match val {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => serde_yaml_ng::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}
