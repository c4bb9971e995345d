use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactDescriptor, DependencySource, DependencySpec, join_path, normalize_path};
use crate::cycle_check::{Adjacency, find_cycles};
use crate::{BatchItem, DeployError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeReason {
    Path,
    Workspace,
}

/// `from` depends on `to`; `to` has to be deployed first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub reason: EdgeReason,
    pub dependency_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub nodes: Vec<String>,
    pub edges: Vec<DependencyEdge>,
    /// Dependencies first. Empty when `cycles` is not.
    pub order: Vec<String>,
    /// Waves: every node's dependencies live in earlier waves.
    pub levels: Vec<Vec<String>>,
    /// Each cycle starts and ends on the same key.
    pub cycles: Vec<Vec<String>>,
}

impl DependencyGraph {
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }

    pub fn level_of(&self, key: &str) -> Option<usize> {
        self.levels.iter().position(|level| level.iter().any(|k| k == key))
    }

    pub fn dependencies_of(&self, key: &str) -> Vec<&str> {
        let deps: BTreeSet<&str> = self
            .edges
            .iter()
            .filter(|e| e.from == key)
            .map(|e| e.to.as_str())
            .collect();
        deps.into_iter().collect()
    }

    pub fn dependents_of(&self, key: &str) -> Vec<&str> {
        let dependents: BTreeSet<&str> = self
            .edges
            .iter()
            .filter(|e| e.to == key)
            .map(|e| e.from.as_str())
            .collect();
        dependents.into_iter().collect()
    }

    /// Message to show when no safe order exists, `None` for acyclic graphs.
    pub fn cycle_report(&self) -> Option<String> {
        if self.cycles.is_empty() {
            return None;
        }
        let mut report = String::from(
            "cannot resolve a safe deploy order due to the following circular dependency chains:",
        );
        for cycle in &self.cycles {
            let _ = write!(report, "\n  {}", cycle.join(" -> "));
        }
        Some(report)
    }

    /// ASCII tree rooted at the nodes without dependencies, each followed by
    /// the nodes that depend on it. A subtree is printed once; later
    /// occurrences are marked "(see above)". Nodes only reachable through a
    /// cycle get a tree of their own.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        let mut printed: BTreeSet<&str> = BTreeSet::new();
        let roots = self
            .nodes
            .iter()
            .filter(|n| self.dependencies_of(n).is_empty());

        for root in roots.chain(self.nodes.iter()) {
            if !printed.insert(root.as_str()) {
                continue;
            }
            let _ = writeln!(out, "{root}");
            let mut path = vec![root.as_str()];
            self.render_chain(root, "  ", &mut path, &mut printed, &mut out);
        }
        out
    }

    fn render_chain<'a>(
        &'a self,
        key: &str,
        prefix: &str,
        path: &mut Vec<&'a str>,
        printed: &mut BTreeSet<&'a str>,
        out: &mut String,
    ) {
        for child in self.dependents_of(key) {
            if path.contains(&child) {
                let _ = writeln!(out, "{prefix}└─> {child} (cycle)");
                continue;
            }
            if !printed.insert(child) {
                let _ = writeln!(out, "{prefix}└─> {child} (see above)");
                continue;
            }
            let _ = writeln!(out, "{prefix}└─> {child}");
            path.push(child);
            self.render_chain(child, &format!("{prefix}    "), path, printed, out);
            path.pop();
        }
    }

    /// Scheduler items in deploy order, keyed by manifest path.
    pub fn to_batch_items(&self, artifacts: &[ArtifactDescriptor]) -> Result<Vec<BatchItem>, DeployError> {
        if self.has_cycles() {
            return Err(DeployError::CircularDependency {
                cycles: self.cycles.clone(),
            });
        }

        let by_key: HashMap<String, &ArtifactDescriptor> =
            artifacts.iter().map(|a| (a.key(), a)).collect();

        Ok(self
            .order
            .iter()
            .filter_map(|key| by_key.get(key).map(|artifact| (key, *artifact)))
            .map(|(key, artifact)| {
                BatchItem::new(key.clone(), artifact.contract_name.clone(), artifact.contract_dir.clone())
                    .depends_on(self.dependencies_of(key).into_iter().map(str::to_string))
            })
            .collect())
    }
}

/// Turns manifest-declared dependencies into a leveled dependency graph.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraphResolver {
    include_dev_dependencies: bool,
}

impl DependencyGraphResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include_dev_dependencies(mut self, include: bool) -> Self {
        self.include_dev_dependencies = include;
        self
    }

    pub fn resolve(&self, artifacts: &[ArtifactDescriptor]) -> DependencyGraph {
        let mut nodes = Vec::new();
        let mut by_path: HashMap<String, usize> = HashMap::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();

        for (idx, artifact) in artifacts.iter().enumerate() {
            let key = artifact.key();
            if by_path.contains_key(&key) {
                warn!(manifest = %key, "duplicate artifact ignored");
                continue;
            }
            by_path.insert(key.clone(), idx);
            by_name
                .entry(artifact.contract_name.to_lowercase())
                .or_insert(idx);
            nodes.push(key);
        }

        let mut edges = Vec::new();
        let mut adjacency: Adjacency = nodes.iter().map(|n| (n.clone(), BTreeSet::new())).collect();

        for from_key in &nodes {
            let artifact = &artifacts[by_path[from_key]];
            let manifest_dir = artifact.manifest_dir();

            for dep in self.declared(artifact) {
                let target = match &dep.source {
                    DependencySource::Path(path) => {
                        let mut resolved = join_path(&manifest_dir, path);
                        if !resolved.ends_with("Cargo.toml") {
                            resolved = normalize_path(&format!("{resolved}/Cargo.toml"));
                        }
                        by_path.get(&resolved).map(|&i| (i, EdgeReason::Path))
                    }
                    DependencySource::Workspace => by_name
                        .get(&dep.name.to_lowercase())
                        .map(|&i| (i, EdgeReason::Workspace)),
                    DependencySource::Registry => None,
                };

                let Some((target_idx, reason)) = target else {
                    continue;
                };
                let to_key = artifacts[target_idx].key();
                if to_key == *from_key {
                    continue;
                }

                debug!(from = %from_key, to = %to_key, dependency = %dep.name, ?reason, "dependency edge");
                adjacency.entry(from_key.clone()).or_default().insert(to_key.clone());
                edges.push(DependencyEdge {
                    from: from_key.clone(),
                    to: to_key,
                    reason,
                    dependency_name: dep.name.clone(),
                });
            }
        }

        let cycles = find_cycles(&adjacency);
        if !cycles.is_empty() {
            warn!(cycles = cycles.len(), "circular dependencies detected");
            return DependencyGraph {
                nodes,
                edges,
                order: Vec::new(),
                levels: Vec::new(),
                cycles,
            };
        }

        let levels = level(&adjacency);
        let order: Vec<String> = levels.iter().flatten().cloned().collect();
        info!(nodes = nodes.len(), edges = edges.len(), waves = levels.len(), "dependency graph resolved");

        DependencyGraph {
            nodes,
            edges,
            order,
            levels,
            cycles: Vec::new(),
        }
    }

    fn declared<'a>(&self, artifact: &'a ArtifactDescriptor) -> impl Iterator<Item = &'a DependencySpec> {
        let dev: &'a [DependencySpec] = if self.include_dev_dependencies {
            &artifact.dev_dependencies
        } else {
            &[]
        };
        artifact
            .dependencies
            .iter()
            .chain(artifact.build_dependencies.iter())
            .chain(dev.iter())
    }
}

/// Wave-based Kahn: each wave is every node whose dependencies all sit in
/// earlier waves, sorted by key.
fn level(adjacency: &Adjacency) -> Vec<Vec<String>> {
    let mut remaining: BTreeMap<&str, usize> = adjacency
        .iter()
        .map(|(node, deps)| (node.as_str(), deps.len()))
        .collect();

    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (node, deps) in adjacency {
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().push(node.as_str());
        }
    }

    let mut levels = Vec::new();
    let mut wave: Vec<&str> = remaining
        .iter()
        .filter(|&(_, &count)| count == 0)
        .map(|(&node, _)| node)
        .collect();

    while !wave.is_empty() {
        let mut next = BTreeSet::new();
        for node in &wave {
            remaining.remove(node);
            for dependent in dependents.get(node).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        next.insert(*dependent);
                    }
                }
            }
        }
        levels.push(wave.iter().map(|n| n.to_string()).collect());
        wave = next.into_iter().collect();
    }

    levels
}
