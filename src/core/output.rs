//! KN-006: Deferred values (`Output`) and the registry that owns them.
//!
//! An [`Output`] is a handle; the state lives in a [`Registry`] entry that
//! records the addresses it waits on, an optional [`Combinator`], and the
//! value once known. Values are single-assignment: after the first
//! resolution an entry never changes.
//!
//! The registry also owns the resolved-value cache: every fact reported by
//! the deployment engine and every resolved output is published there under
//! its address, which is what pending outputs look up during a round.

use super::error::{Error, Result};
use super::types::{value_to_string, Value};
use indexmap::{IndexMap, IndexSet};
use rustc_hash::FxHashMap;
use serde_yaml_ng::Mapping;
use std::fmt;
use std::sync::Arc;

/// Handle to a deferred value registered in a [`Registry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Output {
    id: String,
}

impl Output {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Output({})", self.id)
    }
}

/// A named pure function over positional values.
#[derive(Clone)]
pub struct PureFn {
    name: String,
    func: Arc<dyn Fn(&[Value]) -> Value + Send + Sync>,
}

impl PureFn {
    pub fn new(name: &str, func: impl Fn(&[Value]) -> Value + Send + Sync + 'static) -> Self {
        Self {
            name: name.to_string(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for PureFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PureFn({})", self.name)
    }
}

/// A named pure function over keyed values.
#[derive(Clone)]
pub struct KeyedFn {
    name: String,
    func: Arc<dyn Fn(&IndexMap<String, Value>) -> Value + Send + Sync>,
}

impl KeyedFn {
    pub fn new(
        name: &str,
        func: impl Fn(&IndexMap<String, Value>) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for KeyedFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyedFn({})", self.name)
    }
}

/// How an output derives its value from its resolved dependencies.
///
/// Positions index into the entry's recorded dependency list.
#[derive(Debug, Clone)]
pub enum Combinator {
    /// Value of the first dependency.
    Passthrough,
    /// String concatenation of the selected dependencies.
    Concat { inputs: Vec<usize> },
    /// Already-known entries merged with the resolved pending ones.
    MergeMapping {
        resolved: Mapping,
        pending: Vec<(String, usize)>,
    },
    /// N-ary apply.
    Apply { inputs: Vec<usize>, func: PureFn },
    /// Apply over keyed inputs.
    ApplyKeyed {
        inputs: Vec<(String, usize)>,
        func: KeyedFn,
    },
}

impl Combinator {
    fn combine(&self, values: &[Value]) -> Value {
        let at = |i: &usize| values.get(*i).cloned().unwrap_or(Value::Null);
        match self {
            Self::Passthrough => values.first().cloned().unwrap_or(Value::Null),
            Self::Concat { inputs } => {
                Value::String(inputs.iter().map(|i| value_to_string(&at(i))).collect())
            }
            Self::MergeMapping { resolved, pending } => {
                let mut merged = resolved.clone();
                for (key, i) in pending {
                    merged.insert(Value::String(key.clone()), at(i));
                }
                Value::Mapping(merged)
            }
            Self::Apply { inputs, func } => {
                let args: Vec<Value> = inputs.iter().map(at).collect();
                (func.func)(&args)
            }
            Self::ApplyKeyed { inputs, func } => {
                let args: IndexMap<String, Value> =
                    inputs.iter().map(|(k, i)| (k.clone(), at(i))).collect();
                (func.func)(&args)
            }
        }
    }
}

/// Registry state of one deferred value.
#[derive(Debug, Clone)]
pub struct OutputEntry {
    pub id: String,
    /// Addresses this value waits on, in recorded order
    pub depends_on: IndexSet<String>,
    pub combinator: Combinator,
    value: Option<Value>,
}

impl OutputEntry {
    pub fn is_resolved(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }
}

/// Input to [`Registry::concat`]: a plain string or another output.
#[derive(Debug, Clone)]
pub enum Piece {
    Text(String),
    Output(Output),
}

impl From<&str> for Piece {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Piece {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Output> for Piece {
    fn from(o: Output) -> Self {
        Self::Output(o)
    }
}

impl From<&Output> for Piece {
    fn from(o: &Output) -> Self {
        Self::Output(o.clone())
    }
}

/// Entry of a mapping handed to [`Registry::from_mapping`].
#[derive(Debug, Clone)]
pub enum MappingEntry {
    Value(Value),
    Output(Output),
}

/// Table of deferred values plus the resolved-value cache.
///
/// One registry per session; ids are unique only within it.
#[derive(Debug, Default)]
pub struct Registry {
    entries: IndexMap<String, OutputEntry>,
    resolved: FxHashMap<String, Value>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new deferred value.
    ///
    /// A supplied `value` resolves it immediately. A combinator with no
    /// dependencies is computed immediately.
    pub fn new_output(
        &mut self,
        depends_on: impl IntoIterator<Item = String>,
        id: Option<String>,
        value: Option<Value>,
        combinator: Combinator,
    ) -> Result<Output> {
        let id = match id {
            Some(id) if self.entries.contains_key(&id) => return Err(Error::DuplicateId(id)),
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };
        let depends_on: IndexSet<String> = depends_on.into_iter().collect();

        let value = match value {
            Some(v) => Some(v),
            None if depends_on.is_empty() && !matches!(combinator, Combinator::Passthrough) => {
                Some(combinator.combine(&[]))
            }
            None => None,
        };
        if let Some(ref v) = value {
            self.resolved.insert(id.clone(), v.clone());
        }

        tracing::trace!(%id, deps = depends_on.len(), resolved = value.is_some(), "register output");
        self.entries.insert(
            id.clone(),
            OutputEntry {
                id: id.clone(),
                depends_on,
                combinator,
                value,
            },
        );
        Ok(Output { id })
    }

    /// Look up an output by id.
    pub fn output(&self, id: &str) -> Option<Output> {
        self.entries.get(id).map(|e| Output { id: e.id.clone() })
    }

    pub fn entry(&self, output: &Output) -> Option<&OutputEntry> {
        self.entries.get(&output.id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &OutputEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_resolved(&self, output: &Output) -> bool {
        self.entry(output).is_some_and(OutputEntry::is_resolved)
    }

    /// Read a resolved value. Unresolved (or unknown) outputs are an error.
    pub fn value(&self, output: &Output) -> Result<&Value> {
        self.entry(output)
            .and_then(OutputEntry::value)
            .ok_or_else(|| Error::UnresolvedValue(output.id.clone()))
    }

    /// Resolve an output from its dependency values, given in recorded order.
    ///
    /// Returns `false` (and changes nothing) when it was already resolved.
    pub fn resolve(&mut self, output: &Output, resolved_deps: &[Value]) -> Result<bool> {
        let entry = self
            .entries
            .get_mut(&output.id)
            .ok_or_else(|| Error::UnresolvedValue(output.id.clone()))?;
        if entry.value.is_some() {
            return Ok(false);
        }
        let value = entry.combinator.combine(resolved_deps);
        entry.value = Some(value.clone());
        self.resolved.insert(output.id.clone(), value);
        Ok(true)
    }

    /// Publish a concrete value under an address.
    pub fn publish(&mut self, address: String, value: Value) {
        self.resolved.insert(address, value);
    }

    /// A value previously published under `address`.
    pub fn cached(&self, address: &str) -> Option<&Value> {
        self.resolved.get(address)
    }

    /// Ids of every output still waiting, in registration order.
    pub fn unresolved(&self) -> Vec<Output> {
        self.entries
            .values()
            .filter(|e| !e.is_resolved())
            .map(|e| Output { id: e.id.clone() })
            .collect()
    }

    /// Dependency set of an output combined with its own id, for `all`.
    fn union_deps<'a>(&self, outputs: impl Iterator<Item = &'a Output>) -> IndexSet<String> {
        let outputs: Vec<&Output> = outputs.collect();
        let mut deps: IndexSet<String> = outputs.iter().map(|o| o.id.clone()).collect();
        for o in outputs {
            if let Some(entry) = self.entries.get(&o.id) {
                deps.extend(entry.depends_on.iter().cloned());
            }
        }
        deps
    }

    fn position(deps: &IndexSet<String>, output: &Output) -> usize {
        deps.get_index_of(&output.id).unwrap_or_default()
    }

    /// Combine several outputs with `func`, called with their values in the
    /// order given.
    pub fn all(&mut self, outputs: &[Output], func: PureFn) -> Result<Output> {
        let deps = self.union_deps(outputs.iter());
        let inputs = outputs.iter().map(|o| Self::position(&deps, o)).collect();
        self.new_output(deps, None, None, Combinator::Apply { inputs, func })
    }

    /// Combine keyed outputs with `func`, called with a map of the same keys.
    pub fn all_keyed(&mut self, outputs: &IndexMap<String, Output>, func: KeyedFn) -> Result<Output> {
        let deps = self.union_deps(outputs.values());
        let inputs = outputs
            .iter()
            .map(|(k, o)| (k.clone(), Self::position(&deps, o)))
            .collect();
        self.new_output(deps, None, None, Combinator::ApplyKeyed { inputs, func })
    }

    /// Apply `func` to a single output.
    pub fn apply(&mut self, output: &Output, func: PureFn) -> Result<Output> {
        self.all(std::slice::from_ref(output), func)
    }

    /// Concatenate strings and outputs.
    pub fn concat<P: Into<Piece>>(&mut self, pieces: impl IntoIterator<Item = P>) -> Result<Output> {
        let mut outputs = Vec::new();
        for piece in pieces {
            let output = match piece.into() {
                Piece::Output(o) => o,
                Piece::Text(s) => {
                    self.new_output([], None, Some(Value::String(s)), Combinator::Passthrough)?
                }
            };
            outputs.push(output);
        }
        let deps = self.union_deps(outputs.iter());
        let inputs = outputs.iter().map(|o| Self::position(&deps, o)).collect();
        self.new_output(deps, None, None, Combinator::Concat { inputs })
    }

    /// An output for a mapping whose values may be pending.
    pub fn from_mapping(&mut self, mapping: IndexMap<String, MappingEntry>) -> Result<Output> {
        let mut resolved = Mapping::new();
        let mut waiting: Vec<(String, Output)> = Vec::new();
        for (key, entry) in mapping {
            match entry {
                MappingEntry::Value(v) => {
                    resolved.insert(Value::String(key), v);
                }
                MappingEntry::Output(o) => waiting.push((key, o)),
            }
        }
        let deps = self.union_deps(waiting.iter().map(|(_, o)| o));
        let pending = waiting
            .iter()
            .map(|(k, o)| (k.clone(), Self::position(&deps, o)))
            .collect();
        self.new_output(deps, None, None, Combinator::MergeMapping { resolved, pending })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(registry: &mut Registry, address: &str) -> Output {
        registry
            .new_output([address.to_string()], Some(address.to_string()), None, Combinator::Passthrough)
            .unwrap()
    }

    #[test]
    fn test_kn006_generated_ids_unique() {
        let mut r = Registry::new();
        let a = r.new_output([], None, None, Combinator::Passthrough).unwrap();
        let b = r.new_output([], None, None, Combinator::Passthrough).unwrap();
        assert_ne!(a, b);
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn test_kn006_duplicate_id_rejected() {
        let mut r = Registry::new();
        raw(&mut r, "x");
        let err = r
            .new_output([], Some("x".to_string()), None, Combinator::Passthrough)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateId(id) if id == "x"));
    }

    #[test]
    fn test_kn006_unresolved_read_is_error() {
        let mut r = Registry::new();
        let o = raw(&mut r, "x");
        assert!(matches!(r.value(&o), Err(Error::UnresolvedValue(_))));
    }

    #[test]
    fn test_kn006_single_assignment() {
        let mut r = Registry::new();
        let o = raw(&mut r, "x");
        assert!(r.resolve(&o, &[Value::from("first")]).unwrap());
        assert!(!r.resolve(&o, &[Value::from("second")]).unwrap());
        assert_eq!(r.value(&o).unwrap(), &Value::from("first"));
        assert_eq!(r.cached("x"), Some(&Value::from("first")));
    }

    #[test]
    fn test_kn006_value_given_at_creation() {
        let mut r = Registry::new();
        let o = r
            .new_output([], None, Some(Value::from(7)), Combinator::Passthrough)
            .unwrap();
        assert!(r.is_resolved(&o));
        assert_eq!(r.cached(o.id()), Some(&Value::from(7)));
        assert!(r.unresolved().is_empty());
    }

    #[test]
    fn test_kn006_all_union_and_order() {
        let mut r = Registry::new();
        let a = raw(&mut r, "a");
        let b = raw(&mut r, "b");
        let joined = r
            .all(
                &[b.clone(), a.clone()],
                PureFn::new("pair", |v| {
                    Value::String(format!("{}|{}", value_to_string(&v[0]), value_to_string(&v[1])))
                }),
            )
            .unwrap();
        let entry = r.entry(&joined).unwrap();
        // own ids first, then their dependencies (deduplicated)
        let deps: Vec<&str> = entry.depends_on.iter().map(String::as_str).collect();
        assert_eq!(deps, vec!["b", "a"]);
        r.resolve(&joined, &[Value::from("B"), Value::from("A")]).unwrap();
        assert_eq!(r.value(&joined).unwrap(), &Value::from("B|A"));
    }

    #[test]
    fn test_kn006_all_keyed() {
        let mut r = Registry::new();
        let a = raw(&mut r, "a");
        let mut keyed = IndexMap::new();
        keyed.insert("host".to_string(), a);
        let o = r
            .all_keyed(
                &keyed,
                KeyedFn::new("url", |m| {
                    Value::String(format!("https://{}", value_to_string(&m["host"])))
                }),
            )
            .unwrap();
        r.resolve(&o, &[Value::from("example.com")]).unwrap();
        assert_eq!(r.value(&o).unwrap(), &Value::from("https://example.com"));
    }

    #[test]
    fn test_kn006_concat_wraps_text() {
        let mut r = Registry::new();
        let host = raw(&mut r, "host");
        let url = r
            .concat([Piece::from("https://"), Piece::from(&host), Piece::from("/v1")])
            .unwrap();
        let entry = r.entry(&url).unwrap();
        assert_eq!(entry.depends_on.len(), 3);
        // the literal pieces were published already
        let literal = entry.depends_on.get_index(0).unwrap();
        assert_eq!(r.cached(literal), Some(&Value::from("https://")));
    }

    #[test]
    fn test_kn006_from_mapping_merges() {
        let mut r = Registry::new();
        let arn = raw(&mut r, "arn");
        let mut m = IndexMap::new();
        m.insert("Region".to_string(), MappingEntry::Value(Value::from("us-east-1")));
        m.insert("Arn".to_string(), MappingEntry::Output(arn));
        let o = r.from_mapping(m).unwrap();
        assert!(!r.is_resolved(&o));
        r.resolve(&o, &[Value::from("arn:aws:s3:::b")]).unwrap();
        let Value::Mapping(merged) = r.value(&o).unwrap() else {
            panic!("expected mapping");
        };
        assert_eq!(merged.get("Region"), Some(&Value::from("us-east-1")));
        assert_eq!(merged.get("Arn"), Some(&Value::from("arn:aws:s3:::b")));
    }

    #[test]
    fn test_kn006_from_mapping_all_known_resolves_now() {
        let mut r = Registry::new();
        let mut m = IndexMap::new();
        m.insert("A".to_string(), MappingEntry::Value(Value::from(1)));
        let o = r.from_mapping(m).unwrap();
        assert!(r.is_resolved(&o));
    }

    #[test]
    fn test_kn006_apply() {
        let mut r = Registry::new();
        let n = raw(&mut r, "n");
        let doubled = r
            .apply(
                &n,
                PureFn::new("double", |v| Value::from(v[0].as_i64().unwrap_or(0) * 2)),
            )
            .unwrap();
        r.resolve(&doubled, &[Value::from(21)]).unwrap();
        assert_eq!(r.value(&doubled).unwrap(), &Value::from(42));
    }

    #[test]
    fn test_kn006_combinator_debug_names_function() {
        let c = Combinator::Apply {
            inputs: vec![0],
            func: PureFn::new("upper", |v| v[0].clone()),
        };
        assert!(format!("{:?}", c).contains("PureFn(upper)"));
    }
}
