//! KN-002: Blueprint parsing and validation.
//!
//! Parses kiln.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Application name and project must be set, and no identity field may
//!   contain ':'
//! - Construct names must be usable as URN resource ids
//! - `$ref` / `$output` targets and binding destinations must exist
//! - No construct may reference or bind to itself

use super::error::{Error, Result};
use super::script::{expressions, Expr};
use super::types::Blueprint;
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a kiln.yaml file from disk.
pub fn parse_blueprint_file(path: &Path) -> Result<Blueprint> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
    parse_blueprint(&content)
}

/// Parse a blueprint from a string.
pub fn parse_blueprint(yaml: &str) -> Result<Blueprint> {
    Ok(serde_yaml_ng::from_str(yaml)?)
}

/// Validate a parsed blueprint. Returns a list of errors (empty = valid).
pub fn validate_blueprint(blueprint: &Blueprint) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut fail = |message: String| errors.push(ValidationError { message });

    if blueprint.version != "1.0" {
        fail(format!(
            "version must be \"1.0\", got \"{}\"",
            blueprint.version
        ));
    }
    if blueprint.app.name.is_empty() {
        fail("app.name must not be empty".to_string());
    }
    if blueprint.app.project.is_empty() {
        fail("app.project must not be empty".to_string());
    }
    let app = &blueprint.app;
    for (field, value) in [
        ("account_id", &app.account_id),
        ("project", &app.project),
        ("environment", &app.environment),
        ("name", &app.name),
    ] {
        if value.contains(':') {
            fail(format!("app.{} '{}' must contain no ':'", field, value));
        }
    }

    for (name, decl) in &blueprint.constructs {
        if name.is_empty() || name.contains([':', '/']) {
            fail(format!(
                "construct name '{}' must be non-empty and contain no ':' or '/'",
                name
            ));
        }
        if decl.construct_type.is_empty() {
            fail(format!("construct '{}' has no type", name));
        } else if decl.construct_type.contains([':', '/']) {
            fail(format!(
                "construct '{}' type '{}' must contain no ':' or '/'",
                name, decl.construct_type
            ));
        }

        let mut references = Vec::new();
        for (key, value) in expressions(decl) {
            match Expr::parse(value) {
                Ok(expr) => expr.references(&mut references),
                Err(e) => fail(format!("construct '{}' input '{}': {}", name, key, e)),
            }
        }
        references.sort();
        references.dedup();
        for target in references {
            if &target == name {
                fail(format!("construct '{}' references itself", name));
            } else if !blueprint.constructs.contains_key(&target) {
                fail(format!(
                    "construct '{}' references unknown construct '{}'",
                    name, target
                ));
            }
        }

        for binding in &decl.bindings {
            if &binding.to == name {
                fail(format!("construct '{}' is bound to itself", name));
            } else if !blueprint.constructs.contains_key(&binding.to) {
                fail(format!(
                    "construct '{}' binds to unknown construct '{}'",
                    name, binding.to
                ));
            }
        }
    }

    errors
}
