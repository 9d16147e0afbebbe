//! KN-007: Constructs: declared resource nodes and input classification.
//!
//! Every raw property handed to a construct is classified once, at
//! declaration time:
//! - a construct reference becomes a pending input on that construct's URN
//! - an output becomes a pending input on the output's id, and every
//!   resource address the output waits on joins the owner's `depends_on`
//! - anything else is a resolved input

use super::binding::Binding;
use super::output::{Output, Registry};
use super::types::{ConstructStatus, Input, Value, WireConstruct};
use super::urn::{AddressKind, Urn};
use indexmap::{IndexMap, IndexSet};

/// Cheap handle to a construct owned by a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConstructRef {
    pub name: String,
    pub urn: Urn,
}

/// A raw property value, tagged by what it refers to.
#[derive(Debug, Clone)]
pub enum Property {
    Value(Value),
    Construct(Urn),
    Output(Output),
}

impl From<Value> for Property {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<&str> for Property {
    fn from(s: &str) -> Self {
        Self::Value(Value::String(s.to_string()))
    }
}

impl From<String> for Property {
    fn from(s: String) -> Self {
        Self::Value(Value::String(s))
    }
}

impl From<bool> for Property {
    fn from(b: bool) -> Self {
        Self::Value(Value::Bool(b))
    }
}

impl From<i64> for Property {
    fn from(n: i64) -> Self {
        Self::Value(Value::from(n))
    }
}

impl From<Output> for Property {
    fn from(o: Output) -> Self {
        Self::Output(o)
    }
}

impl From<&Output> for Property {
    fn from(o: &Output) -> Self {
        Self::Output(o.clone())
    }
}

impl From<&ConstructRef> for Property {
    fn from(c: &ConstructRef) -> Self {
        Self::Construct(c.urn.clone())
    }
}

/// Classify a property into an input descriptor plus the raw addresses it
/// depends on.
pub(crate) fn classify(registry: &Registry, property: Property) -> (Input, Vec<String>) {
    match property {
        Property::Value(value) => (Input::Resolved { value }, vec![]),
        Property::Construct(urn) => {
            let address = urn.to_string();
            (
                Input::Pending {
                    depends_on: address.clone(),
                },
                vec![address],
            )
        }
        Property::Output(output) => {
            let deps = registry
                .entry(&output)
                .map(|e| e.depends_on.iter().cloned().collect())
                .unwrap_or_default();
            // no round ever reports an output that was settled at creation
            let input = match registry.value(&output) {
                Ok(value) => Input::Resolved {
                    value: value.clone(),
                },
                Err(_) => Input::Pending {
                    depends_on: output.id().to_string(),
                },
            };
            (input, deps)
        }
    }
}

/// Fold a raw address into a resource-granular dependency set.
///
/// Opaque addresses and the owner itself are skipped.
pub(crate) fn fold_dependency(deps: &mut IndexSet<Urn>, owner: &Urn, address: &str) {
    if let Some(resource) = AddressKind::classify(address).resource() {
        if &resource != owner {
            deps.insert(resource);
        }
    }
}

fn refresh(
    references: &IndexMap<String, Urn>,
    inputs: &mut IndexMap<String, Input>,
    target: &Urn,
    outputs: &Value,
) -> usize {
    let mut refreshed = 0;
    for (key, referenced) in references {
        if referenced != target {
            continue;
        }
        if let Some(input) = inputs.get_mut(key) {
            *input = Input::Resolved {
                value: outputs.clone(),
            };
            refreshed += 1;
        }
    }
    refreshed
}

/// A declared resource node.
#[derive(Debug, Clone)]
pub struct Construct {
    name: String,
    construct_type: String,
    urn: Urn,
    inputs: IndexMap<String, Input>,
    /// Inputs that reference another construct, by target
    references: IndexMap<String, Urn>,
    outputs: IndexMap<String, Value>,
    bindings: Vec<Binding>,
    depends_on: IndexSet<Urn>,
    status: ConstructStatus,
    options: IndexMap<String, Value>,
}

impl Construct {
    pub(crate) fn new(
        name: &str,
        construct_type: &str,
        urn: Urn,
        registry: &Registry,
        properties: IndexMap<String, Property>,
        options: IndexMap<String, Value>,
    ) -> Self {
        let mut construct = Self {
            name: name.to_string(),
            construct_type: construct_type.to_string(),
            urn,
            inputs: IndexMap::new(),
            references: IndexMap::new(),
            outputs: IndexMap::new(),
            bindings: Vec::new(),
            depends_on: IndexSet::new(),
            status: ConstructStatus::New,
            options,
        };
        for (key, property) in properties {
            if let Property::Construct(target) = &property {
                construct.references.insert(key.clone(), target.clone());
            }
            let (input, raw_deps) = classify(registry, property);
            for address in &raw_deps {
                fold_dependency(&mut construct.depends_on, &construct.urn, address);
            }
            construct.inputs.insert(key, input);
        }
        construct
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn construct_type(&self) -> &str {
        &self.construct_type
    }

    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    pub fn handle(&self) -> ConstructRef {
        ConstructRef {
            name: self.name.clone(),
            urn: self.urn.clone(),
        }
    }

    pub fn inputs(&self) -> &IndexMap<String, Input> {
        &self.inputs
    }

    pub fn outputs(&self) -> &IndexMap<String, Value> {
        &self.outputs
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub(crate) fn bindings_mut(&mut self) -> &mut Vec<Binding> {
        &mut self.bindings
    }

    pub fn depends_on(&self) -> &IndexSet<Urn> {
        &self.depends_on
    }

    pub(crate) fn depends_on_mut(&mut self) -> &mut IndexSet<Urn> {
        &mut self.depends_on
    }

    pub fn status(&self) -> ConstructStatus {
        self.status
    }

    pub fn options(&self) -> &IndexMap<String, Value> {
        &self.options
    }

    /// Move the lifecycle forward. Backwards moves are ignored.
    pub(crate) fn advance(&mut self, status: ConstructStatus) {
        if status > self.status {
            tracing::debug!(construct = %self.name, from = %self.status, to = %status, "status");
            self.status = status;
        }
    }

    /// Record outputs reported by the deployment engine.
    pub(crate) fn record_outputs(&mut self, outputs: &IndexMap<String, Value>) {
        for (key, value) in outputs {
            self.outputs.insert(key.clone(), value.clone());
        }
        self.advance(ConstructStatus::Resolved);
    }

    /// Resolve every pending input that waits on `address`.
    pub(crate) fn resolve_inputs(&mut self, address: &str, value: &Value) -> usize {
        let mut resolved = 0;
        let inputs = self
            .inputs
            .values_mut()
            .chain(self.bindings.iter_mut().flat_map(|b| b.inputs.values_mut()));
        for input in inputs {
            let waiting = matches!(&*input, Input::Pending { depends_on } if depends_on == address);
            if waiting {
                *input = Input::Resolved {
                    value: value.clone(),
                };
                resolved += 1;
            }
        }
        resolved
    }

    /// Point every input referencing `target` at its outputs so far.
    ///
    /// Unlike [`Construct::resolve_inputs`] this overwrites inputs that were
    /// already resolved, so outputs reported over several rounds accumulate.
    pub(crate) fn refresh_references(&mut self, target: &Urn, outputs: &Value) -> usize {
        let mut refreshed = refresh(&self.references, &mut self.inputs, target, outputs);
        for binding in &mut self.bindings {
            refreshed += refresh(&binding.references, &mut binding.inputs, target, outputs);
        }
        refreshed
    }

    /// Wire form for the IR.
    pub fn to_wire(&self) -> WireConstruct {
        WireConstruct {
            urn: self.urn.clone(),
            construct_type: self.construct_type.clone(),
            status: self.status,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            bindings: self.bindings.iter().map(Binding::to_wire).collect(),
            options: self.options.clone(),
            depends_on: self.depends_on.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::output::Combinator;

    fn urn(name: &str) -> Urn {
        Urn::parse(&format!("urn:acct:proj:dev:app:construct/Test:{}", name)).unwrap()
    }

    #[test]
    fn test_kn007_classify_value() {
        let r = Registry::new();
        let (input, deps) = classify(&r, Property::from("nginx"));
        assert_eq!(input.value(), Some(&Value::from("nginx")));
        assert!(deps.is_empty());
    }

    #[test]
    fn test_kn007_classify_construct_ref() {
        let r = Registry::new();
        let target = ConstructRef {
            name: "db".into(),
            urn: urn("db"),
        };
        let (input, deps) = classify(&r, Property::from(&target));
        assert_eq!(
            input,
            Input::Pending {
                depends_on: urn("db").to_string()
            }
        );
        assert_eq!(deps, vec![urn("db").to_string()]);
    }

    #[test]
    fn test_kn007_output_deps_fold_to_resource() {
        let mut r = Registry::new();
        let address = urn("db").with_output("Endpoint").to_string();
        let endpoint = r
            .new_output([address.clone()], Some(address.clone()), None, Combinator::Passthrough)
            .unwrap();
        let opaque = r.new_output([], None, None, Combinator::Passthrough).unwrap();
        let joined = r.concat([endpoint, opaque]).unwrap();

        let mut props = IndexMap::new();
        props.insert("Url".to_string(), Property::from(&joined));
        props.insert("Port".to_string(), Property::from(5432i64));
        let c = Construct::new("web", "Test", urn("web"), &r, props, IndexMap::new());

        assert_eq!(c.depends_on().len(), 1);
        assert!(c.depends_on().contains(&urn("db")));
        assert_eq!(
            c.inputs()["Url"],
            Input::Pending {
                depends_on: joined.id().to_string()
            }
        );
        assert!(!c.inputs()["Port"].is_pending());
    }

    #[test]
    fn test_kn007_status_monotonic() {
        let r = Registry::new();
        let mut c = Construct::new("a", "Test", urn("a"), &r, IndexMap::new(), IndexMap::new());
        c.advance(ConstructStatus::Resolved);
        c.advance(ConstructStatus::Pending);
        assert_eq!(c.status(), ConstructStatus::Resolved);
    }

    #[test]
    fn test_kn007_resolve_inputs() {
        let r = Registry::new();
        let mut props = IndexMap::new();
        props.insert("Db".to_string(), Property::Construct(urn("db")));
        let mut c = Construct::new("a", "Test", urn("a"), &r, props, IndexMap::new());
        let n = c.resolve_inputs(&urn("db").to_string(), &Value::from("ok"));
        assert_eq!(n, 1);
        assert_eq!(c.inputs()["Db"].value(), Some(&Value::from("ok")));
        assert_eq!(c.resolve_inputs("other", &Value::Null), 0);
    }

    #[test]
    fn test_kn007_wire_form() {
        let r = Registry::new();
        let mut props = IndexMap::new();
        props.insert("Db".to_string(), Property::Construct(urn("db")));
        let mut options = IndexMap::new();
        options.insert("protect".to_string(), Value::Bool(true));
        let c = Construct::new("a", "Test", urn("a"), &r, props, options);
        let wire = c.to_wire();
        assert_eq!(wire.depends_on, vec![urn("db")]);
        assert_eq!(wire.options["protect"], Value::Bool(true));
        assert!(wire.bindings.is_empty());
        assert!(wire.outputs.is_empty());
    }
}
