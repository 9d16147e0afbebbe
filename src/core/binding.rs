//! KN-008: Bindings: typed edges between constructs.
//!
//! A binding is distinct from a plain dependency: it carries its own named
//! inputs (access mode, routing rules, ...) classified exactly like a
//! construct's properties. A source holds at most one binding per
//! destination; binding again replaces the earlier one.

use super::construct::{classify, fold_dependency, Construct, ConstructRef, Property};
use super::error::{Error, Result};
use super::output::Registry;
use super::types::{AccessMode, Input, WireBinding};
use super::urn::Urn;
use indexmap::{IndexMap, IndexSet};

/// Input name carrying the access mode.
pub const READ_ONLY: &str = "ReadOnly";

/// A binding as declared, before classification.
#[derive(Debug, Clone)]
pub struct BindingArgs {
    pub to: Urn,
    pub properties: IndexMap<String, Property>,
}

impl BindingArgs {
    pub fn new(to: &ConstructRef) -> Self {
        Self {
            to: to.urn.clone(),
            properties: IndexMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<Property>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    pub fn access(self, mode: AccessMode) -> Self {
        self.with(READ_ONLY, mode == AccessMode::ReadOnly)
    }
}

impl ConstructRef {
    /// Bind with read-only access.
    pub fn use_read_only(&self) -> BindingArgs {
        BindingArgs::new(self).access(AccessMode::ReadOnly)
    }

    /// Bind with read-write access.
    pub fn use_read_write(&self) -> BindingArgs {
        BindingArgs::new(self).access(AccessMode::ReadWrite)
    }
}

/// A classified binding held by its source construct.
#[derive(Debug, Clone)]
pub struct Binding {
    pub to: Urn,
    pub(crate) inputs: IndexMap<String, Input>,
    pub(crate) references: IndexMap<String, Urn>,
    /// Raw addresses referenced by the inputs
    pub depends_on: IndexSet<String>,
}

impl Binding {
    pub(crate) fn classify(registry: &Registry, args: BindingArgs) -> Self {
        let mut inputs = IndexMap::new();
        let mut depends_on = IndexSet::new();
        let mut references = IndexMap::new();
        for (key, property) in args.properties {
            if let Property::Construct(target) = &property {
                references.insert(key.clone(), target.clone());
            }
            let (input, raw_deps) = classify(registry, property);
            depends_on.extend(raw_deps);
            inputs.insert(key, input);
        }
        Self {
            to: args.to,
            inputs,
            references,
            depends_on,
        }
    }

    pub fn inputs(&self) -> &IndexMap<String, Input> {
        &self.inputs
    }

    pub fn to_wire(&self) -> WireBinding {
        WireBinding {
            to: self.to.clone(),
            inputs: self.inputs.clone(),
        }
    }
}

/// Attach a binding to `source`.
///
/// Rejects self-bindings without touching the source. Otherwise replaces any
/// binding to the same destination, appends the new one, and folds the
/// destination plus every resource the inputs reference into the source's
/// dependency set.
pub fn add_binding(source: &mut Construct, registry: &Registry, args: BindingArgs) -> Result<()> {
    if &args.to == source.urn() {
        return Err(Error::SelfBinding(source.urn().to_string()));
    }

    let binding = Binding::classify(registry, args);
    let owner = source.urn().clone();

    source.bindings_mut().retain(|b| b.to != binding.to);

    let deps = source.depends_on_mut();
    deps.insert(binding.to.clone());
    for address in &binding.depends_on {
        fold_dependency(deps, &owner, address);
    }

    tracing::debug!(from = %owner, to = %binding.to, inputs = binding.inputs.len(), "binding added");
    source.bindings_mut().push(binding);
    Ok(())
}
