//! KN-003: Resolution rounds and dependency ordering.
//!
//! A round publishes the facts reported by the deployment engine, then sweeps
//! every pending output repeatedly until a pass resolves nothing. Chains of
//! outputs therefore settle within a single call.
//!
//! Ordering uses Kahn's algorithm with deterministic (alphabetical)
//! tie-breaking, emitted as waves of mutually independent nodes.

use super::error::{Error, Result};
use super::output::{Output, Registry};
use super::types::{OutputFacts, PlanAction, ResolvedOutput, Value};
use super::urn::Urn;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};

/// Run one resolution round against `facts`.
///
/// Returns the outputs resolved by this call, in resolution order. Outputs
/// that still wait on something stay pending for a later round. A malformed
/// resource URN in `facts` is skipped with a warning; it never aborts the
/// round.
pub fn resolve_round(registry: &mut Registry, facts: &OutputFacts) -> Result<Vec<ResolvedOutput>> {
    let mut published = 0usize;
    for (urn, outputs) in facts {
        let urn = match Urn::parse(urn) {
            Ok(u) => u,
            Err(e) => {
                tracing::warn!(error = %e, "skipping facts for malformed URN");
                continue;
            }
        };
        for (name, value) in outputs {
            registry.publish(urn.with_output(name).to_string(), value.clone());
            published += 1;
        }
    }

    let mut working: Vec<Output> = registry
        .unresolved()
        .into_iter()
        .filter(|o| registry.entry(o).is_some_and(|e| !e.depends_on.is_empty()))
        .collect();

    let mut resolved = Vec::new();
    let mut passes = 0u32;
    loop {
        passes += 1;
        let mut waiting = Vec::with_capacity(working.len());
        let before = resolved.len();

        for output in working {
            let Some(values) = dependency_values(registry, &output) else {
                waiting.push(output);
                continue;
            };
            if registry.resolve(&output, &values)? {
                let value = registry.value(&output)?.clone();
                tracing::debug!(id = %output.id(), pass = passes, "resolved");
                resolved.push(ResolvedOutput {
                    id: output.id().to_string(),
                    value,
                });
            }
        }

        working = waiting;
        if resolved.len() == before || working.is_empty() {
            break;
        }
    }

    tracing::info!(
        facts = published,
        resolved = resolved.len(),
        pending = working.len(),
        passes,
        "resolution round complete"
    );
    Ok(resolved)
}

/// Dependency values in recorded order, or `None` while any is missing.
fn dependency_values(registry: &Registry, output: &Output) -> Option<Vec<Value>> {
    let entry = registry.entry(output)?;
    entry
        .depends_on
        .iter()
        .map(|address| registry.cached(address).cloned())
        .collect()
}

/// Group `nodes` into waves with Kahn's algorithm.
///
/// `deps` maps each node to the nodes that must come before it. Every
/// dependency must itself be a node. Waves are sorted alphabetically.
pub fn topological_waves(deps: &IndexMap<String, Vec<String>>) -> Result<Vec<Vec<String>>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

    for id in deps.keys() {
        in_degree.insert(id.as_str(), 0);
        adjacency.insert(id.as_str(), Vec::new());
    }

    for (id, before) in deps {
        for dep in before {
            let Some(successors) = adjacency.get_mut(dep.as_str()) else {
                return Err(Error::UnknownDependency {
                    construct: id.clone(),
                    dependency: dep.clone(),
                });
            };
            successors.push(id.as_str());
            *in_degree.entry(id.as_str()).or_default() += 1;
        }
    }

    let mut wave: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut waves = Vec::new();
    let mut placed = 0;
    while !wave.is_empty() {
        wave.sort_unstable();
        let mut next = Vec::new();
        for current in &wave {
            for neighbor in adjacency.get(current).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(neighbor) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*neighbor);
                    }
                }
            }
        }
        placed += wave.len();
        waves.push(wave.iter().map(|s| s.to_string()).collect());
        wave = next;
    }

    if placed != deps.len() {
        let ordered: HashSet<&str> = waves.iter().flatten().map(String::as_str).collect();
        let mut cycle: Vec<&str> = deps
            .keys()
            .map(String::as_str)
            .filter(|id| !ordered.contains(id))
            .collect();
        cycle.sort_unstable();
        return Err(Error::DependencyCycle(cycle.join(", ")));
    }

    Ok(waves)
}

/// Flattened topological order.
pub fn topological_order(deps: &IndexMap<String, Vec<String>>) -> Result<Vec<String>> {
    Ok(topological_waves(deps)?.into_iter().flatten().collect())
}

/// A construct as seen by the deployment orderer.
#[derive(Debug, Clone)]
pub struct DeployNode {
    pub action: PlanAction,
    /// Constructs this one depends on (plain dependencies and binding targets)
    pub depends_on: Vec<Urn>,
}

/// Waves of constructs that may be deployed together.
///
/// A dependency normally deploys first. When either end of an edge is being
/// destroyed the edge flips, so dependents are torn down before what they
/// rely on.
pub fn deployment_groups(nodes: &IndexMap<Urn, DeployNode>) -> Result<Vec<Vec<Urn>>> {
    let mut deps: IndexMap<String, Vec<String>> = nodes
        .keys()
        .map(|urn| (urn.to_string(), Vec::new()))
        .collect();

    for (urn, node) in nodes {
        for dep in &node.depends_on {
            let Some(target) = nodes.get(dep) else {
                return Err(Error::UnknownDependency {
                    construct: urn.to_string(),
                    dependency: dep.to_string(),
                });
            };
            let destroying =
                node.action == PlanAction::Destroy || target.action == PlanAction::Destroy;
            let (before, after) = if destroying { (urn, dep) } else { (dep, urn) };
            if let Some(list) = deps.get_mut(&after.to_string()) {
                list.push(before.to_string());
            }
        }
    }

    let by_name: HashMap<String, &Urn> = nodes.keys().map(|u| (u.to_string(), u)).collect();
    Ok(topological_waves(&deps)?
        .into_iter()
        .map(|wave| {
            wave.iter()
                .filter_map(|s| by_name.get(s).map(|u| (*u).clone()))
                .collect()
        })
        .collect())
}
