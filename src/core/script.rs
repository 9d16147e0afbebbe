//! KN-010: Blueprint scripts: declarative construct graphs.
//!
//! A blueprint stands in for the user-authored script: each construct's
//! properties and binding inputs are expressions evaluated against a fresh
//! session. Expressions are plain YAML values, or single-key maps:
//!
//! - `{$ref: name}`: reference to another construct
//! - `{$output: name.Attr}`: deferred attribute of another construct
//! - `{$concat: [expr, ...]}`: string concatenation
//! - `{$merge: {key: expr, ...}}`: mapping whose values may be deferred
//!
//! Constructs are evaluated in dependency order so every reference points at
//! an already-declared construct.

use super::binding::BindingArgs;
use super::construct::{ConstructRef, Property};
use super::error::{Error, Result};
use super::output::{MappingEntry, Piece};
use super::parser;
use super::resolver;
use super::session::Session;
use super::types::{value_to_string, Blueprint, ConstructDecl, Value};
use indexmap::IndexMap;

const REF: &str = "$ref";
const OUTPUT: &str = "$output";
const CONCAT: &str = "$concat";
const MERGE: &str = "$merge";

/// A parsed property expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ref(String),
    Output { construct: String, attribute: String },
    Concat(Vec<Expr>),
    Merge(IndexMap<String, Expr>),
}

impl Expr {
    pub fn parse(value: &Value) -> std::result::Result<Expr, String> {
        let Value::Mapping(map) = value else {
            return Ok(Expr::Literal(value.clone()));
        };
        let mut entries = map.iter();
        let (Some((Value::String(key), arg)), None) = (entries.next(), entries.next()) else {
            return Ok(Expr::Literal(value.clone()));
        };
        match key.as_str() {
            REF => match arg {
                Value::String(name) => Ok(Expr::Ref(name.clone())),
                _ => Err(format!("{} expects a construct name", REF)),
            },
            OUTPUT => {
                let target = arg.as_str().unwrap_or_default();
                match target.split_once('.') {
                    Some((construct, attribute))
                        if !construct.is_empty()
                            && !attribute.is_empty()
                            && !attribute.contains([':', '/']) =>
                    {
                        Ok(Expr::Output {
                            construct: construct.to_string(),
                            attribute: attribute.to_string(),
                        })
                    }
                    _ => Err(format!(
                        "{} expects '<construct>.<attribute>', got '{}'",
                        OUTPUT,
                        value_to_string(arg)
                    )),
                }
            }
            CONCAT => match arg {
                Value::Sequence(items) => items
                    .iter()
                    .map(Expr::parse)
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map(Expr::Concat),
                _ => Err(format!("{} expects a list", CONCAT)),
            },
            MERGE => match arg {
                Value::Mapping(m) => {
                    let mut merged = IndexMap::new();
                    for (k, v) in m {
                        let Value::String(k) = k else {
                            return Err(format!("{} keys must be strings", MERGE));
                        };
                        merged.insert(k.clone(), Expr::parse(v)?);
                    }
                    Ok(Expr::Merge(merged))
                }
                _ => Err(format!("{} expects a mapping", MERGE)),
            },
            _ => Ok(Expr::Literal(value.clone())),
        }
    }

    /// Names of every construct this expression refers to.
    pub fn references(&self, out: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ref(name) => out.push(name.clone()),
            Expr::Output { construct, .. } => out.push(construct.clone()),
            Expr::Concat(items) => items.iter().for_each(|e| e.references(out)),
            Expr::Merge(entries) => entries.values().for_each(|e| e.references(out)),
        }
    }
}

/// Every expression of a declaration, binding inputs included.
pub(crate) fn expressions(decl: &ConstructDecl) -> impl Iterator<Item = (&str, &Value)> {
    decl.properties
        .iter()
        .chain(decl.bindings.iter().flat_map(|b| b.inputs.iter()))
        .map(|(k, v)| (k.as_str(), v))
}

/// Constructs each declaration must follow, deduplicated.
pub(crate) fn construct_dependencies(decl: &ConstructDecl) -> Vec<String> {
    let mut refs = Vec::new();
    for (_, value) in expressions(decl) {
        if let Ok(expr) = Expr::parse(value) {
            expr.references(&mut refs);
        }
    }
    refs.extend(decl.bindings.iter().map(|b| b.to.clone()));
    let mut seen = indexmap::IndexSet::new();
    refs.retain(|r| seen.insert(r.clone()));
    refs
}

/// Evaluate a blueprint into a fresh session.
pub fn run_script(blueprint: &Blueprint) -> Result<Session> {
    let errors = parser::validate_blueprint(blueprint);
    if !errors.is_empty() {
        let joined: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(Error::Validation(joined.join("; ")));
    }

    let deps: IndexMap<String, Vec<String>> = blueprint
        .constructs
        .iter()
        .map(|(name, decl)| (name.clone(), construct_dependencies(decl)))
        .collect();
    let order = resolver::topological_order(&deps)?;

    let mut session = Session::with_application(blueprint.app.clone());
    let mut handles: IndexMap<String, ConstructRef> = IndexMap::new();

    for name in order {
        let Some(decl) = blueprint.constructs.get(&name) else {
            continue;
        };
        let mut properties = IndexMap::new();
        for (key, value) in &decl.properties {
            properties.insert(key.clone(), evaluate(&mut session, &handles, value)?);
        }

        let mut bindings = Vec::new();
        for b in &decl.bindings {
            let mut args = BindingArgs::new(lookup(&handles, &b.to)?);
            if let Some(mode) = b.access {
                args = args.access(mode);
            }
            for (key, value) in &b.inputs {
                args = args.with(key, evaluate(&mut session, &handles, value)?);
            }
            bindings.push(args);
        }

        let handle = session.new_construct(
            &name,
            &decl.construct_type,
            properties,
            bindings,
            decl.options.clone(),
        )?;
        handles.insert(name, handle);
    }

    tracing::info!(
        app = %blueprint.app.name,
        constructs = handles.len(),
        outputs = session.registry().len(),
        "script evaluated"
    );
    Ok(session)
}

fn lookup<'a>(handles: &'a IndexMap<String, ConstructRef>, name: &str) -> Result<&'a ConstructRef> {
    handles
        .get(name)
        .ok_or_else(|| Error::UnknownConstruct(name.to_string()))
}

fn evaluate(
    session: &mut Session,
    handles: &IndexMap<String, ConstructRef>,
    value: &Value,
) -> Result<Property> {
    let expr = Expr::parse(value).map_err(Error::Validation)?;
    eval_expr(session, handles, &expr)
}

fn eval_expr(
    session: &mut Session,
    handles: &IndexMap<String, ConstructRef>,
    expr: &Expr,
) -> Result<Property> {
    match expr {
        Expr::Literal(v) => Ok(Property::Value(v.clone())),
        Expr::Ref(name) => Ok(Property::from(lookup(handles, name)?)),
        Expr::Output {
            construct,
            attribute,
        } => {
            let target = lookup(handles, construct)?;
            Ok(Property::Output(session.output_of(target, attribute)?))
        }
        Expr::Concat(items) => {
            let mut pieces = Vec::with_capacity(items.len());
            for item in items {
                pieces.push(match eval_expr(session, handles, item)? {
                    Property::Value(v) => Piece::Text(value_to_string(&v)),
                    Property::Output(o) => Piece::Output(o),
                    Property::Construct(urn) => {
                        return Err(Error::Validation(format!(
                            "{} cannot take a construct reference ({})",
                            CONCAT, urn
                        )))
                    }
                });
            }
            Ok(Property::Output(session.registry_mut().concat(pieces)?))
        }
        Expr::Merge(entries) => {
            let mut mapping = IndexMap::new();
            for (key, item) in entries {
                let entry = match eval_expr(session, handles, item)? {
                    Property::Value(v) => MappingEntry::Value(v),
                    Property::Output(o) => MappingEntry::Output(o),
                    Property::Construct(urn) => {
                        return Err(Error::Validation(format!(
                            "{} cannot take a construct reference ({})",
                            MERGE, urn
                        )))
                    }
                };
                mapping.insert(key.clone(), entry);
            }
            Ok(Property::Output(session.registry_mut().from_mapping(mapping)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::binding::READ_ONLY;
    use crate::core::types::{Input, OutputFacts};

    const BLUEPRINT: &str = r#"
version: "1.0"
app:
  name: shop
  project: acme
  environment: prod
  account_id: "1234"
constructs:
  api:
    type: Container
    properties:
      Image: nginx:1.27
      BucketUrl:
        $concat: ["s3://", { $output: assets.BucketName }, "/static"]
      Settings:
        $merge:
          Region: us-east-1
          Bucket: { $output: assets.BucketName }
    bindings:
      - to: assets
        access: read_only
  assets:
    type: Bucket
    properties:
      Versioned: true
"#;

    fn blueprint() -> Blueprint {
        serde_yaml_ng::from_str(BLUEPRINT).unwrap()
    }

    fn yaml(s: &str) -> Value {
        serde_yaml_ng::from_str(s).unwrap()
    }

    #[test]
    fn test_kn010_expr_parse() {
        assert_eq!(Expr::parse(&yaml("{$ref: db}")).unwrap(), Expr::Ref("db".into()));
        assert_eq!(
            Expr::parse(&yaml("{$output: db.Endpoint}")).unwrap(),
            Expr::Output {
                construct: "db".into(),
                attribute: "Endpoint".into()
            }
        );
        assert_eq!(
            Expr::parse(&yaml("{a: 1}")).unwrap(),
            Expr::Literal(yaml("{a: 1}"))
        );
        assert!(Expr::parse(&yaml("{$output: nodot}")).is_err());
        assert!(Expr::parse(&yaml("{$output: \"db.Host:Port\"}")).is_err());
        assert!(Expr::parse(&yaml("{$output: db.a/b}")).is_err());
        assert!(Expr::parse(&yaml("{$concat: notalist}")).is_err());
    }

    #[test]
    fn test_kn010_expr_references() {
        let expr = Expr::parse(&yaml("{$concat: [{$ref: a}, x, {$output: b.Url}]}")).unwrap();
        let mut refs = Vec::new();
        expr.references(&mut refs);
        assert_eq!(refs, vec!["a", "b"]);
    }

    #[test]
    fn test_kn010_runs_in_dependency_order() {
        let mut session = run_script(&blueprint()).unwrap();
        let ir = session.to_ir().unwrap();
        let names: Vec<&String> = ir.constructs.keys().collect();
        assert_eq!(names, vec!["assets", "api"]);

        let api = &ir.constructs["api"];
        let assets_urn = &ir.constructs["assets"].urn;
        assert_eq!(api.depends_on, vec![assets_urn.clone()]);
        assert_eq!(api.bindings.len(), 1);
        assert_eq!(
            api.bindings[0].inputs[READ_ONLY],
            Input::Resolved {
                value: Value::Bool(true)
            }
        );
        assert!(api.inputs["BucketUrl"].is_pending());
        assert_eq!(api.inputs["Image"].value(), Some(&Value::from("nginx:1.27")));
        assert_eq!(
            assets_urn.to_string(),
            "urn:1234:acme:prod:shop:construct/Bucket:assets"
        );
    }

    #[test]
    fn test_kn010_round_resolves_expressions() {
        let mut session = run_script(&blueprint()).unwrap();
        let mut outputs = IndexMap::new();
        outputs.insert("BucketName".to_string(), Value::from("assets-7f3a"));
        let mut facts = OutputFacts::new();
        facts.insert("urn:1234:acme:prod:shop:construct/Bucket:assets".to_string(), outputs);
        session.resolve_round(&facts).unwrap();

        let ir = session.to_ir().unwrap();
        let api = &ir.constructs["api"];
        assert_eq!(
            api.inputs["BucketUrl"].value(),
            Some(&Value::from("s3://assets-7f3a/static"))
        );
        let Some(Value::Mapping(settings)) = api.inputs["Settings"].value() else {
            panic!("expected merged mapping");
        };
        assert_eq!(settings.get("Bucket"), Some(&Value::from("assets-7f3a")));
        assert_eq!(settings.get("Region"), Some(&Value::from("us-east-1")));
    }

    #[test]
    fn test_kn010_invalid_blueprint_rejected() {
        let mut bp = blueprint();
        bp.version = "2.0".to_string();
        let err = run_script(&bp).unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m.contains("version")));
    }

    #[test]
    fn test_kn010_cycle_rejected() {
        let bp: Blueprint = serde_yaml_ng::from_str(
            r#"
version: "1.0"
app: { name: a, project: p }
constructs:
  x: { type: T, properties: { Peer: { $ref: y } } }
  y: { type: T, properties: { Peer: { $ref: x } } }
"#,
        )
        .unwrap();
        assert!(matches!(run_script(&bp), Err(Error::DependencyCycle(_))));
    }

    #[test]
    fn test_kn010_concat_rejects_construct() {
        let bp: Blueprint = serde_yaml_ng::from_str(
            r#"
version: "1.0"
app: { name: a, project: p }
constructs:
  x: { type: T }
  y: { type: T, properties: { Bad: { $concat: [{ $ref: x }] } } }
"#,
        )
        .unwrap();
        assert!(matches!(run_script(&bp), Err(Error::Validation(_))));
    }
}
