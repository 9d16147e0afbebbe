//! KN-004: Plan generation: diff the IR against the state lock.
//!
//! Every construct in the IR is hashed (BLAKE3 over its desired wire form)
//! and compared with the lock. Constructs the lock knows but the IR dropped
//! are destroyed. Changes are ordered by deployment group.

use super::error::{Error, Result};
use super::resolver::{self, DeployNode};
use super::types::{
    DeploymentPlan, Input, IrDocument, LockStatus, PlanAction, PlannedChange, StateLock,
    WireConstruct,
};
use super::urn::{AddressKind, Urn};
use crate::provenance::hasher;
use indexmap::{IndexMap, IndexSet};

/// Generate a deployment plan by comparing the IR to the lock.
pub fn plan(ir: &IrDocument, lock: Option<&StateLock>) -> Result<DeploymentPlan> {
    if let Some(lock) = lock {
        check_compatibility(ir, lock)?;
    }

    let mut planned: IndexMap<Urn, (String, PlanAction, String)> = IndexMap::new();
    let mut nodes: IndexMap<Urn, DeployNode> = IndexMap::new();

    for (name, wire) in &ir.constructs {
        let hash = hash_desired_state(wire)?;
        let action = determine_action(name, &hash, lock);
        nodes.insert(
            wire.urn.clone(),
            DeployNode {
                action,
                depends_on: edges(wire),
            },
        );
        planned.insert(wire.urn.clone(), (name.clone(), action, hash));
    }

    if let Some(lock) = lock {
        for (name, entry) in &lock.constructs {
            if ir.constructs.contains_key(name) || entry.status == LockStatus::DeleteComplete {
                continue;
            }
            nodes.insert(
                entry.urn.clone(),
                DeployNode {
                    action: PlanAction::Destroy,
                    depends_on: Vec::new(),
                },
            );
            planned.insert(
                entry.urn.clone(),
                (name.clone(), PlanAction::Destroy, String::new()),
            );
        }
        // destroyed constructs only keep edges to constructs still in the graph
        for entry in lock.constructs.values() {
            let deps: Vec<Urn> = entry
                .depends_on
                .iter()
                .filter(|d| nodes.contains_key(*d))
                .cloned()
                .collect();
            if let Some(node) = nodes.get_mut(&entry.urn) {
                if node.action == PlanAction::Destroy {
                    node.depends_on = deps;
                }
            }
        }
    }

    let groups = resolver::deployment_groups(&nodes)?;

    let mut changes = Vec::with_capacity(planned.len());
    let (mut to_create, mut to_update, mut to_destroy, mut unchanged) = (0u32, 0u32, 0u32, 0u32);
    for urn in groups.iter().flatten() {
        let Some((name, action, hash)) = planned.get(urn) else {
            continue;
        };
        match action {
            PlanAction::Create => to_create += 1,
            PlanAction::Update => to_update += 1,
            PlanAction::Destroy => to_destroy += 1,
            PlanAction::NoOp => unchanged += 1,
        }
        changes.push(PlannedChange {
            construct: name.clone(),
            urn: urn.clone(),
            action: *action,
            hash: hash.clone(),
        });
    }

    tracing::info!(
        create = to_create,
        update = to_update,
        destroy = to_destroy,
        unchanged,
        groups = groups.len(),
        "plan computed"
    );

    Ok(DeploymentPlan {
        app_urn: ir.app_urn.clone(),
        changes,
        groups,
        to_create,
        to_update,
        to_destroy,
        unchanged,
    })
}

/// Reject IRs the lock cannot be moved to.
fn check_compatibility(ir: &IrDocument, lock: &StateLock) -> Result<()> {
    if lock.default_region != ir.default_region {
        let deployed: Vec<&str> = lock
            .constructs
            .iter()
            .filter(|(_, c)| c.status.is_deletable())
            .map(|(name, _)| name.as_str())
            .collect();
        if !deployed.is_empty() {
            return Err(Error::RegionChange {
                from: lock.default_region.clone(),
                to: ir.default_region.clone(),
                deployed: deployed.join(", "),
            });
        }
    }
    if lock.schema_version != ir.schema_version {
        return Err(Error::SchemaMismatch {
            state: lock.schema_version,
            ir: ir.schema_version,
        });
    }
    Ok(())
}

/// Plain dependencies plus binding targets, deduplicated.
fn edges(wire: &WireConstruct) -> Vec<Urn> {
    let all: IndexSet<Urn> = wire
        .depends_on
        .iter()
        .chain(wire.bindings.iter().map(|b| &b.to))
        .cloned()
        .collect();
    all.into_iter().collect()
}

/// Determine what action to take for a construct.
fn determine_action(name: &str, hash: &str, lock: Option<&StateLock>) -> PlanAction {
    let Some(entry) = lock.and_then(|l| l.constructs.get(name)) else {
        return PlanAction::Create;
    };
    if entry.status.is_creatable() {
        return PlanAction::Create;
    }
    let settled = matches!(
        entry.status,
        LockStatus::CreateComplete | LockStatus::UpdateComplete
    );
    if settled && entry.hash == hash {
        return PlanAction::NoOp;
    }
    // Changed or previously failed: re-apply
    PlanAction::Update
}

/// Compute a hash of the desired state for comparison.
///
/// Lifecycle status and reported outputs are excluded; they change without
/// the desired state changing. Inputs pending on a combinator are hashed
/// without its id, which is fresh on every script run.
pub fn hash_desired_state(wire: &WireConstruct) -> Result<String> {
    let depends_on: Vec<String> = wire.depends_on.iter().map(Urn::to_string).collect();
    let bindings: Vec<(&Urn, IndexMap<&String, Input>)> = wire
        .bindings
        .iter()
        .map(|b| (&b.to, stable_inputs(&b.inputs)))
        .collect();
    let inputs = hasher::hash_serialized(&stable_inputs(&wire.inputs))?;
    let bindings = hasher::hash_serialized(&bindings)?;
    let options = hasher::hash_serialized(&wire.options)?;
    let deps = depends_on.join(",");
    Ok(hasher::composite_hash(&[
        wire.construct_type.as_str(),
        inputs.as_str(),
        bindings.as_str(),
        options.as_str(),
        deps.as_str(),
    ]))
}

fn stable_inputs(inputs: &IndexMap<String, Input>) -> IndexMap<&String, Input> {
    inputs
        .iter()
        .map(|(k, input)| {
            let stable = match input {
                Input::Pending { depends_on } if AddressKind::classify(depends_on).resource().is_none() => {
                    Input::Pending {
                        depends_on: String::new(),
                    }
                }
                other => other.clone(),
            };
            (k, stable)
        })
        .collect()
}
