/*
 * rescenter - Resource aggregation and transaction engine for software centers.
 * Copyright (C) 2025  compiledkernel-idk and rescenter contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Requirement graph over an upgradeable set.
//!
//! Provides:
//! - Closure of required siblings when marking updates
//! - Dependents closure when unmarking
//! - Requirement-first ordering for starting a batch

use std::collections::{HashMap, HashSet};

use crate::resource::ResourceRef;

/// Graph of `requires` edges between resources of one backend
#[derive(Debug, Default)]
pub struct UpdateGraph {
    requires: HashMap<String, Vec<String>>,
    reverse_deps: HashMap<String, HashSet<String>>,
}

impl UpdateGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph for `resources`; edges leaving the set are ignored
    pub fn from_resources(resources: &[ResourceRef]) -> Self {
        let mut graph = Self::new();
        let ids: HashSet<&str> = resources.iter().map(|r| r.id()).collect();
        for resource in resources {
            let requires: Vec<String> = resource
                .info()
                .requires
                .into_iter()
                .filter(|dep| ids.contains(dep.as_str()) && dep != resource.id())
                .collect();
            graph.add(resource.id(), requires);
        }
        graph
    }

    pub fn add(&mut self, id: &str, requires: Vec<String>) {
        for dep in &requires {
            self.reverse_deps
                .entry(dep.clone())
                .or_default()
                .insert(id.to_string());
        }
        self.requires.insert(id.to_string(), requires);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.requires.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.requires.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requires.is_empty()
    }

    /// Ids that depend on `id` directly
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.reverse_deps
            .get(id)
            .map(|deps| deps.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// `ids` plus everything they require, transitively
    pub fn with_requirements<'a, I>(&self, ids: I) -> HashSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = HashSet::new();
        let mut stack: Vec<String> = ids.into_iter().map(str::to_string).collect();
        while let Some(id) = stack.pop() {
            if !out.insert(id.clone()) {
                continue;
            }
            if let Some(deps) = self.requires.get(&id) {
                stack.extend(deps.iter().filter(|d| !out.contains(*d)).cloned());
            }
        }
        out
    }

    /// Everything that would lose a requirement if `id` were dropped
    pub fn removal_impact(&self, id: &str) -> Vec<String> {
        let mut affected = Vec::new();
        let mut visited = HashSet::new();
        self.find_dependents_recursive(id, &mut affected, &mut visited);
        affected
    }

    fn find_dependents_recursive(&self, id: &str, affected: &mut Vec<String>, visited: &mut HashSet<String>) {
        if !visited.insert(id.to_string()) {
            return;
        }
        for dep in self.dependents(id) {
            if !visited.contains(dep) {
                affected.push(dep.to_string());
            }
            self.find_dependents_recursive(dep, affected, visited);
        }
    }

    /// Order `ids` so requirements come first; ties keep the input order.
    /// Falls back to the input order when the requirements form a cycle.
    pub fn ordered(&self, ids: &[String]) -> Result<Vec<String>, CycleError> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut result = Vec::with_capacity(ids.len());
        let mut visited = HashSet::new();
        let mut in_stack = Vec::new();
        for id in ids {
            self.dfs_order(id, &wanted, &mut result, &mut visited, &mut in_stack)?;
        }
        Ok(result)
    }

    fn dfs_order(
        &self,
        id: &str,
        wanted: &HashSet<&str>,
        result: &mut Vec<String>,
        visited: &mut HashSet<String>,
        in_stack: &mut Vec<String>,
    ) -> Result<(), CycleError> {
        if in_stack.iter().any(|s| s == id) {
            let mut ids = in_stack.clone();
            ids.push(id.to_string());
            return Err(CycleError { ids });
        }
        if visited.contains(id) {
            return Ok(());
        }
        in_stack.push(id.to_string());
        visited.insert(id.to_string());
        if let Some(deps) = self.requires.get(id) {
            for dep in deps {
                if wanted.contains(dep.as_str()) {
                    self.dfs_order(dep, wanted, result, visited, in_stack)?;
                }
            }
        }
        in_stack.pop();
        result.push(id.to_string());
        Ok(())
    }
}

/// Requirements that loop back on themselves
#[derive(Debug)]
pub struct CycleError {
    pub ids: Vec<String>,
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Requirement cycle detected: {}", self.ids.join(" -> "))
    }
}

impl std::error::Error for CycleError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> UpdateGraph {
        // app -> lib -> runtime, plugin -> app
        let mut g = UpdateGraph::new();
        g.add("app", vec!["lib".to_string()]);
        g.add("lib", vec!["runtime".to_string()]);
        g.add("runtime", Vec::new());
        g.add("plugin", vec!["app".to_string()]);
        g.add("other", Vec::new());
        g
    }

    #[test]
    fn test_requirements_closure() {
        let g = graph();
        let mut closure: Vec<String> = g.with_requirements(["app"]).into_iter().collect();
        closure.sort();
        assert_eq!(closure, vec!["app", "lib", "runtime"]);
        assert_eq!(g.with_requirements(["other"]).len(), 1);
    }

    #[test]
    fn test_removal_impact() {
        let g = graph();
        let mut impact = g.removal_impact("lib");
        impact.sort();
        assert_eq!(impact, vec!["app", "plugin"]);
        assert!(g.removal_impact("plugin").is_empty());
    }

    #[test]
    fn test_requirements_first() {
        let g = graph();
        let ids: Vec<String> = ["plugin", "app", "lib", "runtime"].iter().map(|s| s.to_string()).collect();
        let order = g.ordered(&ids).unwrap();
        assert_eq!(order, vec!["runtime", "lib", "app", "plugin"]);
    }

    #[test]
    fn test_cycle_detected() {
        let mut g = UpdateGraph::new();
        g.add("a", vec!["b".to_string()]);
        g.add("b", vec!["a".to_string()]);
        let err = g.ordered(&["a".to_string(), "b".to_string()]).unwrap_err();
        assert!(err.to_string().starts_with("Requirement cycle detected"));
    }
}
