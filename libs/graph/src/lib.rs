//! Dependency graph resolution for agent fleets.
//!
//! Builds a directed "depends-on" graph from [`AgentSpec`]s and splits it into
//! launch waves: every agent in wave `i` depends only on agents in waves `< i`,
//! so all members of one wave can be launched in parallel.
//!
//! # Invariants
//!
//! - Every dependency names an agent in the same spec set
//! - The graph is acyclic; a cycle is reported with its full member list
//! - Wave membership is deterministic for a given spec set
//!
//! Resolution happens once per run. Any error here is fatal: the orchestrator
//! never proceeds with a partially resolved graph.

use std::collections::{btree_set, BTreeMap, BTreeSet};

use fleet_events::AgentSpec;
use thiserror::Error;
use tracing::debug;

/// Graph resolution errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// An agent depends on a name that is not declared.
    #[error("agent '{agent}' depends on unknown agent '{missing}'")]
    UnknownDependency { agent: String, missing: String },

    /// The dependency relation contains a cycle.
    #[error("cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<String> },

    /// Two specs share a name.
    #[error("agent '{name}' is declared more than once")]
    DuplicateAgent { name: String },
}

fn format_cycle(cycle: &[String]) -> String {
    match cycle.first() {
        Some(first) => format!("{} -> {}", cycle.join(" -> "), first),
        None => String::new(),
    }
}

/// Ordered launch waves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchWaves {
    waves: Vec<BTreeSet<String>>,
}

impl LaunchWaves {
    /// Wrap precomputed waves.
    pub fn from_waves(waves: Vec<BTreeSet<String>>) -> Self {
        Self { waves }
    }

    /// All waves in launch order.
    pub fn waves(&self) -> &[BTreeSet<String>] {
        &self.waves
    }

    /// Number of waves.
    pub fn len(&self) -> usize {
        self.waves.len()
    }

    /// Returns true if there is nothing to launch.
    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    /// Iterate over waves in launch order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &BTreeSet<String>> {
        self.waves.iter()
    }

    /// Index of the wave containing `agent`.
    pub fn wave_of(&self, agent: &str) -> Option<usize> {
        self.waves.iter().position(|w| w.contains(agent))
    }

    /// Total number of agents across all waves.
    pub fn agent_count(&self) -> usize {
        self.waves.iter().map(BTreeSet::len).sum()
    }

    /// Restrict the plan to `members`, keeping relative order and dropping
    /// waves that end up empty.
    pub fn restricted_to(&self, members: &BTreeSet<String>) -> LaunchWaves {
        let waves = self
            .waves
            .iter()
            .map(|w| w.intersection(members).cloned().collect::<BTreeSet<_>>())
            .filter(|w| !w.is_empty())
            .collect();
        LaunchWaves { waves }
    }

    /// The first `count` waves.
    pub fn truncated(&self, count: usize) -> LaunchWaves {
        LaunchWaves {
            waves: self.waves.iter().take(count).cloned().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a LaunchWaves {
    type Item = &'a BTreeSet<String>;
    type IntoIter = std::slice::Iter<'a, BTreeSet<String>>;

    fn into_iter(self) -> Self::IntoIter {
        self.waves.iter()
    }
}

/// Validated, acyclic dependency graph.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    specs: BTreeMap<String, AgentSpec>,
    /// `dependent -> {dependency, ...}`
    upstream: BTreeMap<String, BTreeSet<String>>,
    /// `dependency -> {dependent, ...}`
    downstream: BTreeMap<String, BTreeSet<String>>,
    waves: LaunchWaves,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    /// Validate specs, detect cycles, and compute launch waves.
    pub fn build(specs: &[AgentSpec]) -> Result<Self, GraphError> {
        let mut by_name = BTreeMap::new();
        for spec in specs {
            if by_name.insert(spec.name.clone(), spec.clone()).is_some() {
                return Err(GraphError::DuplicateAgent {
                    name: spec.name.clone(),
                });
            }
        }

        for spec in by_name.values() {
            if let Some(missing) = spec
                .dependencies
                .iter()
                .find(|dep| !by_name.contains_key(*dep))
            {
                return Err(GraphError::UnknownDependency {
                    agent: spec.name.clone(),
                    missing: missing.clone(),
                });
            }
        }

        let upstream: BTreeMap<String, BTreeSet<String>> = by_name
            .values()
            .map(|s| (s.name.clone(), s.dependencies.clone()))
            .collect();

        let mut downstream: BTreeMap<String, BTreeSet<String>> = by_name
            .keys()
            .map(|name| (name.clone(), BTreeSet::new()))
            .collect();
        for (dependent, deps) in &upstream {
            for dep in deps {
                if let Some(set) = downstream.get_mut(dep) {
                    set.insert(dependent.clone());
                }
            }
        }

        if let Some(cycle) = find_cycle(&upstream) {
            return Err(GraphError::CyclicDependency { cycle });
        }

        let waves = compute_waves(&upstream);
        debug!(
            agents = by_name.len(),
            waves = waves.len(),
            "Resolved dependency graph"
        );

        Ok(Self {
            specs: by_name,
            upstream,
            downstream,
            waves,
        })
    }

    /// Launch waves for the whole fleet.
    pub fn waves(&self) -> &LaunchWaves {
        &self.waves
    }

    /// Spec for `agent`.
    pub fn spec(&self, agent: &str) -> Option<&AgentSpec> {
        self.specs.get(agent)
    }

    /// All specs, ordered by name.
    pub fn specs(&self) -> impl Iterator<Item = &AgentSpec> {
        self.specs.values()
    }

    /// Direct dependencies of `agent`.
    pub fn dependencies_of(&self, agent: &str) -> Option<&BTreeSet<String>> {
        self.upstream.get(agent)
    }

    /// Agents that directly depend on `agent`.
    pub fn dependents_of(&self, agent: &str) -> Option<&BTreeSet<String>> {
        self.downstream.get(agent)
    }

    /// Names of every agent in `group`.
    pub fn group_members(&self, group: &str) -> BTreeSet<String> {
        self.specs
            .values()
            .filter(|s| s.group == group)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Launch waves restricted to the members of `group`, in dependency order.
    pub fn group_waves(&self, group: &str) -> LaunchWaves {
        self.waves.restricted_to(&self.group_members(group))
    }
}

/// Build the graph and return only its launch waves.
pub fn build(specs: &[AgentSpec]) -> Result<LaunchWaves, GraphError> {
    DependencyGraph::build(specs).map(|g| g.waves)
}

/// Three-color DFS. Returns the members of the first cycle found, in
/// dependency order starting from the node where the back-edge lands.
///
/// The walk keeps its own stack so chain depth is bounded by memory, not
/// by the thread's call stack.
fn find_cycle(upstream: &BTreeMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    let mut marks: BTreeMap<&str, Mark> = upstream
        .keys()
        .map(|name| (name.as_str(), Mark::Unvisited))
        .collect();
    // The current path: each node with the dependencies it has left to visit.
    let mut path: Vec<(&str, btree_set::Iter<'_, String>)> = Vec::new();

    for (start, deps) in upstream {
        if marks[start.as_str()] != Mark::Unvisited {
            continue;
        }
        marks.insert(start.as_str(), Mark::InProgress);
        path.push((start.as_str(), deps.iter()));

        while let Some((node, remaining)) = path.last_mut() {
            let node = *node;
            let Some(dep) = remaining.next() else {
                marks.insert(node, Mark::Done);
                path.pop();
                continue;
            };
            match marks.get(dep.as_str()).copied().unwrap_or(Mark::Done) {
                Mark::InProgress => {
                    let from = path
                        .iter()
                        .position(|(n, _)| *n == dep.as_str())
                        .unwrap_or(0);
                    return Some(path[from..].iter().map(|(n, _)| n.to_string()).collect());
                }
                Mark::Unvisited => {
                    if let Some((key, next)) = upstream.get_key_value(dep) {
                        marks.insert(key.as_str(), Mark::InProgress);
                        path.push((key.as_str(), next.iter()));
                    }
                }
                Mark::Done => {}
            }
        }
    }
    None
}

/// Layered Kahn's algorithm: each round places every agent whose
/// dependencies are already placed. Assumes the graph is acyclic.
fn compute_waves(upstream: &BTreeMap<String, BTreeSet<String>>) -> LaunchWaves {
    let mut placed: BTreeSet<&str> = BTreeSet::new();
    let mut waves = Vec::new();

    while placed.len() < upstream.len() {
        let wave: BTreeSet<String> = upstream
            .iter()
            .filter(|(name, _)| !placed.contains(name.as_str()))
            .filter(|(_, deps)| deps.iter().all(|d| placed.contains(d.as_str())))
            .map(|(name, _)| name.clone())
            .collect();

        if wave.is_empty() {
            // Unreachable for acyclic input.
            break;
        }

        for name in &wave {
            if let Some((key, _)) = upstream.get_key_value(name) {
                placed.insert(key.as_str());
            }
        }
        waves.push(wave);
    }

    LaunchWaves { waves }
}
