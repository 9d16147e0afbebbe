//! KN-013: State lock management: load, atomic save, lifecycle transitions.
//!
//! One lock per application environment, at
//! `<state>/<project>/<application>/<environment>/state.lock.yaml`.

use super::construct::Construct;
use super::error::{Error, Result};
use super::types::{
    ConstructLock, DeploymentPlan, Input, IrDocument, LockStatus, PlanAction, StateLock, Value,
    SCHEMA_VERSION,
};
use super::urn::Urn;
use crate::provenance::eventlog::now_iso8601;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "state.lock.yaml";

/// Derive the lock file path for an application environment.
pub fn lock_file_path(state_dir: &Path, app_urn: &Urn) -> PathBuf {
    state_dir.join(app_urn.path()).join(LOCK_FILE)
}

/// Load the lock for an application. Returns None if the file doesn't exist.
pub fn load_lock(state_dir: &Path, app_urn: &Urn) -> Result<Option<StateLock>> {
    let path = lock_file_path(state_dir, app_urn);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::io(format!("cannot read {}", path.display()), e))?;
    let lock: StateLock = serde_yaml_ng::from_str(&content)?;
    Ok(Some(lock))
}

/// Find every lock under `state_dir`, sorted by application URN.
pub fn find_locks(state_dir: &Path) -> Result<Vec<StateLock>> {
    let mut locks = Vec::new();
    collect_locks(state_dir, &mut locks)?;
    locks.sort_by(|a, b| a.app_urn.cmp(&b.app_urn));
    Ok(locks)
}

fn collect_locks(dir: &Path, locks: &mut Vec<StateLock>) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::io(format!("cannot read state dir {}", dir.display()), e))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_locks(&path, locks)?;
        } else if path.file_name().is_some_and(|n| n == LOCK_FILE) {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| Error::io(format!("cannot read {}", path.display()), e))?;
            locks.push(serde_yaml_ng::from_str(&content)?);
        }
    }
    Ok(())
}

/// Save a lock file atomically (write to temp, then rename).
pub fn save_lock(state_dir: &Path, lock: &StateLock) -> Result<()> {
    let path = lock_file_path(state_dir, &lock.app_urn);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("cannot create dir {}", parent.display()), e))?;
    }

    let yaml = serde_yaml_ng::to_string(lock)?;

    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, &yaml)
        .map_err(|e| Error::io(format!("cannot write {}", tmp_path.display()), e))?;
    std::fs::rename(&tmp_path, &path).map_err(|e| {
        Error::io(
            format!("cannot rename {} → {}", tmp_path.display(), path.display()),
            e,
        )
    })?;

    tracing::debug!(path = %path.display(), constructs = lock.constructs.len(), "lock saved");
    Ok(())
}

/// Create an empty lock for the application an IR describes.
pub fn new_lock(ir: &IrDocument) -> StateLock {
    StateLock {
        schema_version: SCHEMA_VERSION,
        version: 0,
        generated_at: now_iso8601(),
        generator: format!("kiln {}", env!("CARGO_PKG_VERSION")),
        project_urn: ir.project_urn.clone(),
        app_urn: ir.app_urn.clone(),
        environment: ir.environment.clone(),
        default_region: ir.default_region.clone(),
        constructs: IndexMap::new(),
    }
}

/// Move a construct to `next`, rejecting transitions the lifecycle forbids.
pub fn transition(name: &str, entry: &mut ConstructLock, next: LockStatus) -> Result<()> {
    if !entry.status.can_transition(next) {
        return Err(Error::InvalidTransition {
            construct: name.to_string(),
            from: entry.status.to_string(),
            to: next.to_string(),
        });
    }
    tracing::debug!(construct = %name, from = %entry.status, to = %next, "lock transition");
    entry.status = next;
    entry.last_updated = now_iso8601();
    Ok(())
}

/// Record the start of every planned operation.
///
/// Creates enter `creating`, updates `updating`, destroys `deleting`.
/// Unchanged constructs keep their status and their recorded inputs.
pub fn apply_plan(lock: &mut StateLock, ir: &IrDocument, plan: &DeploymentPlan) -> Result<()> {
    lock.version += 1;
    lock.generated_at = now_iso8601();
    lock.project_urn = ir.project_urn.clone();
    lock.app_urn = ir.app_urn.clone();
    lock.environment = ir.environment.clone();
    lock.default_region = ir.default_region.clone();

    for change in &plan.changes {
        let next = match change.action {
            PlanAction::Create => Some(LockStatus::Creating),
            PlanAction::Update => Some(LockStatus::Updating),
            PlanAction::Destroy => Some(LockStatus::Deleting),
            PlanAction::NoOp => None,
        };

        if let Some(wire) = ir.constructs.get(&change.construct) {
            let entry = lock
                .constructs
                .entry(change.construct.clone())
                .or_insert_with(|| ConstructLock {
                    urn: wire.urn.clone(),
                    construct_type: wire.construct_type.clone(),
                    status: LockStatus::DeleteComplete,
                    hash: String::new(),
                    last_updated: now_iso8601(),
                    inputs: IndexMap::new(),
                    outputs: IndexMap::new(),
                    depends_on: Vec::new(),
                });
            entry.urn = wire.urn.clone();
            entry.construct_type = wire.construct_type.clone();
            entry.depends_on = wire.depends_on.clone();
            if next.is_some() {
                entry.inputs = wire.inputs.clone();
                entry.hash = change.hash.clone();
            }
        }

        if let Some(next) = next {
            let entry = lock
                .constructs
                .get_mut(&change.construct)
                .ok_or_else(|| Error::UnknownConstruct(change.construct.clone()))?;
            if let Some(interrupted) = entry.status.settled(false) {
                tracing::warn!(construct = %change.construct, status = %entry.status, "previous operation never settled");
                transition(&change.construct, entry, interrupted)?;
            }
            transition(&change.construct, entry, next)?;
        }
    }
    Ok(())
}

/// Record outputs reported for `urn` and settle its in-flight operation.
///
/// Other constructs' inputs waiting on one of the reported attributes are
/// resolved in place.
pub fn register_outputs(
    lock: &mut StateLock,
    urn: &Urn,
    outputs: &IndexMap<String, Value>,
) -> Result<()> {
    let name = &urn.resource_id;
    let entry = lock
        .constructs
        .get_mut(name)
        .filter(|c| &c.urn == urn)
        .ok_or_else(|| Error::UnknownConstruct(urn.to_string()))?;
    for (key, value) in outputs {
        entry.outputs.insert(key.clone(), value.clone());
    }
    if let Some(done) = entry.status.settled(true) {
        transition(name, entry, done)?;
    }

    let addresses: IndexMap<String, &Value> = outputs
        .iter()
        .map(|(k, v)| (urn.with_output(k).to_string(), v))
        .collect();
    for (other, construct) in lock.constructs.iter_mut() {
        if &construct.urn == urn {
            continue;
        }
        for input in construct.inputs.values_mut() {
            let value = match &*input {
                Input::Pending { depends_on } => addresses.get(depends_on).copied(),
                Input::Resolved { .. } => None,
            };
            if let Some(value) = value {
                tracing::debug!(construct = %other, from = %urn, "lock input resolved");
                *input = Input::Resolved {
                    value: value.clone(),
                };
            }
        }
    }
    Ok(())
}

/// Copy inputs the session has resolved into the lock.
///
/// Values derived through combinators resolve only in the session, so the
/// lock follows it after every round. Inputs still pending in the session
/// leave the lock's value alone, and constructs the lock doesn't know under
/// the same URN are skipped. Returns how many entries changed.
pub fn sync_inputs<'a>(
    lock: &mut StateLock,
    constructs: impl IntoIterator<Item = &'a Construct>,
) -> usize {
    let mut synced = 0;
    for construct in constructs {
        let Some(entry) = lock
            .constructs
            .get_mut(construct.name())
            .filter(|e| &e.urn == construct.urn())
        else {
            continue;
        };
        let mut changed = false;
        for (key, input) in construct.inputs() {
            if input.is_pending() || entry.inputs.get(key) == Some(input) {
                continue;
            }
            entry.inputs.insert(key.clone(), input.clone());
            changed = true;
        }
        if changed {
            tracing::debug!(construct = %construct.name(), "lock inputs synced");
            synced += 1;
        }
    }
    synced
}

/// Mark every construct still operating as failed.
///
/// Returns the constructs that changed, with their final status.
pub fn finalize(lock: &mut StateLock) -> Result<Vec<(String, LockStatus)>> {
    let mut failed = Vec::new();
    for (name, entry) in lock.constructs.iter_mut() {
        if let Some(next) = entry.status.settled(false) {
            transition(name, entry, next)?;
            tracing::warn!(construct = %name, status = %next, "operation did not complete");
            failed.push((name.clone(), next));
        }
    }
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::construct::Property;
    use crate::core::output::Piece;
    use crate::core::session::Session;
    use crate::core::types::{Application, OutputFacts, PlannedChange, WireConstruct};

    fn urn(name: &str) -> Urn {
        Urn::parse(&format!("urn:acct:shop:dev:web:construct/Bucket:{}", name)).unwrap()
    }

    fn ir() -> IrDocument {
        let mut constructs = IndexMap::new();
        for name in ["assets", "api"] {
            let mut wire = WireConstruct {
                urn: urn(name),
                construct_type: "Bucket".to_string(),
                status: Default::default(),
                inputs: IndexMap::new(),
                outputs: IndexMap::new(),
                bindings: vec![],
                options: IndexMap::new(),
                depends_on: vec![],
            };
            if name == "api" {
                wire.inputs.insert(
                    "Bucket".to_string(),
                    Input::Pending {
                        depends_on: urn("assets").with_output("Name").to_string(),
                    },
                );
                wire.depends_on.push(urn("assets"));
            }
            constructs.insert(name.to_string(), wire);
        }
        IrDocument {
            schema_version: SCHEMA_VERSION,
            version: 1,
            project_urn: Urn::parse("urn:acct:shop").unwrap(),
            app_urn: Urn::parse("urn:acct:shop:dev:web").unwrap(),
            environment: "dev".to_string(),
            default_region: "us-east-1".to_string(),
            constructs,
        }
    }

    fn plan_of(actions: &[(&str, PlanAction)]) -> DeploymentPlan {
        DeploymentPlan {
            app_urn: Urn::parse("urn:acct:shop:dev:web").unwrap(),
            changes: actions
                .iter()
                .map(|(name, action)| PlannedChange {
                    construct: name.to_string(),
                    urn: urn(name),
                    action: *action,
                    hash: format!("blake3:{}", name),
                })
                .collect(),
            groups: vec![],
            to_create: 0,
            to_update: 0,
            to_destroy: 0,
            unchanged: 0,
        }
    }

    #[test]
    fn test_kn013_lock_file_path() {
        let p = lock_file_path(Path::new("/state"), &Urn::parse("urn:acct:shop:dev:web").unwrap());
        assert_eq!(p, PathBuf::from("/state/shop/web/dev/state.lock.yaml"));
    }

    #[test]
    fn test_kn013_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let ir = ir();
        let mut lock = new_lock(&ir);
        apply_plan(&mut lock, &ir, &plan_of(&[("assets", PlanAction::Create)])).unwrap();
        save_lock(dir.path(), &lock).unwrap();

        let loaded = load_lock(dir.path(), &ir.app_urn).unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.constructs["assets"].status, LockStatus::Creating);
        assert_eq!(loaded.constructs["assets"].urn, urn("assets"));

        let tmp = lock_file_path(dir.path(), &ir.app_urn).with_extension("yaml.tmp");
        assert!(!tmp.exists());
    }

    #[test]
    fn test_kn013_load_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_lock(dir.path(), &Urn::parse("urn:acct:ghost").unwrap()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_kn013_find_locks() {
        let dir = tempfile::tempdir().unwrap();
        let ir = ir();
        save_lock(dir.path(), &new_lock(&ir)).unwrap();
        let mut other = new_lock(&ir);
        other.app_urn = Urn::parse("urn:acct:shop:prod:web").unwrap();
        save_lock(dir.path(), &other).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let locks = find_locks(dir.path()).unwrap();
        assert_eq!(locks.len(), 2);
        assert_eq!(locks[0].app_urn.to_string(), "urn:acct:shop:dev:web");
        assert_eq!(locks[1].app_urn.to_string(), "urn:acct:shop:prod:web");
    }

    #[test]
    fn test_kn013_new_lock() {
        let lock = new_lock(&ir());
        assert_eq!(lock.version, 0);
        assert!(lock.generator.starts_with("kiln "));
        assert!(lock.generated_at.contains('T'));
        assert!(lock.constructs.is_empty());
    }

    #[test]
    fn test_kn013_register_outputs_settles_and_resolves() {
        let ir = ir();
        let mut lock = new_lock(&ir);
        apply_plan(
            &mut lock,
            &ir,
            &plan_of(&[("assets", PlanAction::Create), ("api", PlanAction::Create)]),
        )
        .unwrap();

        let mut outputs = IndexMap::new();
        outputs.insert("Name".to_string(), Value::from("assets-1"));
        register_outputs(&mut lock, &urn("assets"), &outputs).unwrap();

        let assets = &lock.constructs["assets"];
        assert_eq!(assets.status, LockStatus::CreateComplete);
        assert_eq!(assets.outputs["Name"], Value::from("assets-1"));
        assert_eq!(
            lock.constructs["api"].inputs["Bucket"].value(),
            Some(&Value::from("assets-1"))
        );
        assert_eq!(lock.constructs["api"].status, LockStatus::Creating);
    }

    #[test]
    fn test_kn013_sync_inputs_from_session() {
        let mut app = Application::new("shop", "web");
        app.account_id = "acct".to_string();
        let mut session = Session::with_application(app);
        let assets = session
            .new_construct("assets", "Bucket", IndexMap::new(), vec![], IndexMap::new())
            .unwrap();
        let name = session.output_of(&assets, "Name").unwrap();
        let url = session
            .registry_mut()
            .concat([Piece::from("s3://"), Piece::from(&name)])
            .unwrap();
        let mut props = IndexMap::new();
        props.insert("Url".to_string(), Property::from(&url));
        session
            .new_construct("api", "Container", props, vec![], IndexMap::new())
            .unwrap();

        let ir = session.to_ir().unwrap();
        let mut lock = new_lock(&ir);
        apply_plan(
            &mut lock,
            &ir,
            &plan_of(&[("assets", PlanAction::Create), ("api", PlanAction::Create)]),
        )
        .unwrap();
        assert!(lock.constructs["api"].inputs["Url"].is_pending());

        let mut outputs = IndexMap::new();
        outputs.insert("Name".to_string(), Value::from("assets-1"));
        let mut facts = OutputFacts::new();
        facts.insert(assets.urn.to_string(), outputs.clone());
        session.resolve_round(&facts).unwrap();
        register_outputs(&mut lock, &assets.urn, &outputs).unwrap();
        assert!(lock.constructs["api"].inputs["Url"].is_pending());

        assert_eq!(sync_inputs(&mut lock, session.constructs()), 1);
        assert_eq!(
            lock.constructs["api"].inputs["Url"].value(),
            Some(&Value::from("s3://assets-1"))
        );
        assert_eq!(sync_inputs(&mut lock, session.constructs()), 0);

        apply_plan(
            &mut lock,
            &ir,
            &plan_of(&[("assets", PlanAction::NoOp), ("api", PlanAction::NoOp)]),
        )
        .unwrap();
        assert_eq!(
            lock.constructs["api"].inputs["Url"].value(),
            Some(&Value::from("s3://assets-1"))
        );
    }

    #[test]
    fn test_kn013_register_unknown() {
        let mut lock = new_lock(&ir());
        let err = register_outputs(&mut lock, &urn("ghost"), &IndexMap::new()).unwrap_err();
        assert!(matches!(err, Error::UnknownConstruct(_)));
    }

    #[test]
    fn test_kn013_finalize_fails_operating() {
        let ir = ir();
        let mut lock = new_lock(&ir);
        apply_plan(
            &mut lock,
            &ir,
            &plan_of(&[("assets", PlanAction::Create), ("api", PlanAction::Create)]),
        )
        .unwrap();
        register_outputs(&mut lock, &urn("assets"), &IndexMap::new()).unwrap();

        let failed = finalize(&mut lock).unwrap();
        assert_eq!(failed, vec![("api".to_string(), LockStatus::CreateFailed)]);
        assert_eq!(lock.constructs["assets"].status, LockStatus::CreateComplete);
    }

    #[test]
    fn test_kn013_update_and_destroy_cycle() {
        let ir = ir();
        let mut lock = new_lock(&ir);
        apply_plan(&mut lock, &ir, &plan_of(&[("assets", PlanAction::Create)])).unwrap();
        register_outputs(&mut lock, &urn("assets"), &IndexMap::new()).unwrap();

        apply_plan(&mut lock, &ir, &plan_of(&[("assets", PlanAction::Update)])).unwrap();
        assert_eq!(lock.constructs["assets"].status, LockStatus::Updating);
        assert_eq!(lock.version, 2);
        register_outputs(&mut lock, &urn("assets"), &IndexMap::new()).unwrap();

        apply_plan(&mut lock, &ir, &plan_of(&[("assets", PlanAction::Destroy)])).unwrap();
        assert_eq!(lock.constructs["assets"].status, LockStatus::Deleting);
    }

    #[test]
    fn test_kn013_interrupted_operation_fails_first() {
        let ir = ir();
        let mut lock = new_lock(&ir);
        apply_plan(&mut lock, &ir, &plan_of(&[("assets", PlanAction::Create)])).unwrap();
        apply_plan(&mut lock, &ir, &plan_of(&[("assets", PlanAction::Create)])).unwrap();
        assert_eq!(lock.constructs["assets"].status, LockStatus::Creating);
    }

    #[test]
    fn test_kn013_invalid_transition() {
        let ir = ir();
        let mut lock = new_lock(&ir);
        apply_plan(&mut lock, &ir, &plan_of(&[("assets", PlanAction::Create)])).unwrap();
        let entry = lock.constructs.get_mut("assets").unwrap();
        let err = transition("assets", entry, LockStatus::UpdateComplete).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { ref from, .. } if from == "creating"));
    }
}
