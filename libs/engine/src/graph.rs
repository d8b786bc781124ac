//! Dependency graph over resource ids (C2).
//!
//! Resources reference each other by id (a schema reference into another resource's status,
//! or an explicit `dependsOn`); this graph orders them into levels that can be applied in
//! parallel within a level, and strictly after every earlier level. Grounded on a level-based
//! Kahn's-algorithm topological sort.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::Error;

pub type ResourceId = String;

/// Directed graph of "depends on" edges between resource ids.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    nodes: HashSet<ResourceId>,
    /// resource -> the set of resources it depends on (must apply before it).
    dependencies: HashMap<ResourceId, HashSet<ResourceId>>,
    /// resource -> the set of resources that depend on it (inverse of `dependencies`).
    dependents: HashMap<ResourceId, HashSet<ResourceId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: impl Into<ResourceId>) {
        let id = id.into();
        self.dependencies.entry(id.clone()).or_default();
        self.dependents.entry(id.clone()).or_default();
        self.nodes.insert(id);
    }

    /// Records that `resource` depends on `depends_on` (the latter must be applied first).
    pub fn add_dependency(&mut self, resource: impl Into<ResourceId>, depends_on: impl Into<ResourceId>) {
        let resource = resource.into();
        let depends_on = depends_on.into();
        self.add_node(resource.clone());
        self.add_node(depends_on.clone());
        self.dependencies.get_mut(&resource).unwrap().insert(depends_on.clone());
        self.dependents.get_mut(&depends_on).unwrap().insert(resource);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dependencies_of(&self, id: &str) -> impl Iterator<Item = &ResourceId> {
        self.dependencies.get(id).into_iter().flatten()
    }

    /// Groups nodes into levels such that every dependency of a node in level N lies in some
    /// level < N. Nodes within a level have no dependency relationship among them and can be
    /// applied concurrently. Returns `Error::CyclicDependency` naming every node that never
    /// reached in-degree zero.
    pub fn topological_levels(&self) -> Result<Vec<Vec<ResourceId>>, Error> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|id| (id.as_str(), self.dependencies.get(id).map_or(0, |d| d.len())))
            .collect();

        let mut ready: VecDeque<ResourceId> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| (*id).to_owned())
            .collect();

        let mut levels = Vec::new();
        let mut visited: HashSet<ResourceId> = HashSet::new();

        while !ready.is_empty() {
            let mut level: Vec<ResourceId> = ready.drain(..).collect();
            level.sort();
            for id in &level {
                visited.insert(id.clone());
            }

            let mut next_ready = Vec::new();
            for id in &level {
                for dependent in self.dependents.get(id).into_iter().flatten() {
                    let deg = in_degree.get_mut(dependent.as_str()).expect("known node");
                    *deg -= 1;
                    if *deg == 0 {
                        next_ready.push(dependent.clone());
                    }
                }
            }
            levels.push(level);
            ready.extend(next_ready);
        }

        if visited.len() != self.nodes.len() {
            let mut stuck: Vec<ResourceId> = self
                .nodes
                .iter()
                .filter(|id| !visited.contains(*id))
                .cloned()
                .collect();
            stuck.sort();
            return Err(Error::CyclicDependency { nodes: stuck });
        }

        Ok(levels)
    }

    /// Levels in reverse dependency order (dependents deleted before their dependencies), for
    /// rollback and teardown.
    pub fn reverse_levels(&self) -> Result<Vec<Vec<ResourceId>>, Error> {
        let mut levels = self.topological_levels()?;
        levels.reverse();
        Ok(levels)
    }
}
