//! DAG builder for constructing dependency graphs from phase definitions.
//!
//! The builder takes a template's phases and constructs a directed acyclic
//! graph used for frontier computation. Duplicate ids, dangling dependency
//! references and cycles are rejected with typed errors at build time.

use std::collections::{HashMap, HashSet};

use crate::errors::TemplateError;
use crate::template::PhaseDefinition;

/// Index into the phase list.
pub type PhaseIndex = usize;

/// A directed acyclic graph of phase definitions.
#[derive(Debug, Clone)]
pub struct PhaseGraph {
    /// Phases indexed by their position
    phases: Vec<PhaseDefinition>,
    /// Map from phase id to index
    index_map: HashMap<String, PhaseIndex>,
    /// Forward edges: index -> phases that depend on it
    forward_edges: Vec<Vec<PhaseIndex>>,
    /// Reverse edges: index -> phases it depends on
    reverse_edges: Vec<Vec<PhaseIndex>>,
}

impl PhaseGraph {
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn get_phase(&self, index: PhaseIndex) -> Option<&PhaseDefinition> {
        self.phases.get(index)
    }

    pub fn get_phase_by_id(&self, id: &str) -> Option<&PhaseDefinition> {
        self.index_map.get(id).and_then(|&i| self.phases.get(i))
    }

    pub fn get_index(&self, id: &str) -> Option<PhaseIndex> {
        self.index_map.get(id).copied()
    }

    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    /// Phases that depend on the given phase (forward edges).
    pub fn dependents(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Phases that the given phase depends on (reverse edges).
    pub fn dependencies(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Phases with no dependencies (entry points).
    pub fn root_phases(&self) -> Vec<PhaseIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Check whether every dependency of a phase is in the satisfied set.
    pub fn dependencies_satisfied(
        &self,
        index: PhaseIndex,
        satisfied: &HashSet<PhaseIndex>,
    ) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| satisfied.contains(dep))
    }
}

/// Builder for constructing phase graphs.
pub struct DagBuilder {
    phases: Vec<PhaseDefinition>,
}

impl DagBuilder {
    pub fn new(phases: Vec<PhaseDefinition>) -> Self {
        Self { phases }
    }

    /// Build the phase graph.
    ///
    /// Validates the graph structure: all dependencies must reference
    /// existing phases, ids must be unique and no cycles are allowed.
    pub fn build(self) -> Result<PhaseGraph, TemplateError> {
        let mut index_map = HashMap::new();
        for (i, phase) in self.phases.iter().enumerate() {
            if index_map.contains_key(&phase.id) {
                return Err(TemplateError::DuplicatePhase(phase.id.clone()));
            }
            index_map.insert(phase.id.clone(), i);
        }

        let mut forward_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.phases.len()];
        let mut reverse_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.phases.len()];

        for (to_idx, phase) in self.phases.iter().enumerate() {
            for dep in &phase.depends_on {
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| TemplateError::UnknownDependency {
                            phase: phase.id.clone(),
                            dependency: dep.clone(),
                        })?;

                // from_idx must complete before to_idx
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = PhaseGraph {
            phases: self.phases,
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    /// Validate that the graph has no cycles using Kahn's algorithm.
    fn validate_no_cycles(graph: &PhaseGraph) -> Result<(), TemplateError> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<PhaseIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;

            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let phases: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| graph.get_phase(i).map(|p| p.id.clone()))
                .collect();

            return Err(TemplateError::DependencyCycle { phases });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::PhaseDefinition;

    fn phase(id: &str, deps: Vec<&str>) -> PhaseDefinition {
        PhaseDefinition::new(id, &format!("Phase {}", id), "out").depends_on(&deps)
    }

    #[test]
    fn test_build_simple_graph() {
        let phases = vec![
            phase("01", vec![]),
            phase("02", vec!["01"]),
            phase("03", vec!["01"]),
            phase("04", vec!["02", "03"]),
        ];

        let graph = DagBuilder::new(phases).build().unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.root_phases(), vec![0]);
    }

    #[test]
    fn test_dependencies_and_dependents() {
        let phases = vec![
            phase("01", vec![]),
            phase("02", vec!["01"]),
            phase("03", vec!["01"]),
        ];

        let graph = DagBuilder::new(phases).build().unwrap();

        assert!(graph.dependencies(0).is_empty());
        assert_eq!(graph.dependencies(1), &[0]);
        assert_eq!(graph.dependencies(2), &[0]);
        let dependents = graph.dependents(0);
        assert!(dependents.contains(&1));
        assert!(dependents.contains(&2));
    }

    #[test]
    fn test_cycle_detection() {
        let phases = vec![
            phase("01", vec!["03"]),
            phase("02", vec!["01"]),
            phase("03", vec!["02"]),
        ];

        let err = DagBuilder::new(phases).build().unwrap_err();
        match err {
            TemplateError::DependencyCycle { phases } => {
                assert_eq!(phases.len(), 3);
            }
            other => panic!("Expected DependencyCycle, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_dependency() {
        let phases = vec![phase("01", vec!["nonexistent"])];

        let err = DagBuilder::new(phases).build().unwrap_err();
        match err {
            TemplateError::UnknownDependency { dependency, .. } => {
                assert_eq!(dependency, "nonexistent");
            }
            other => panic!("Expected UnknownDependency, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_phase_id() {
        let phases = vec![phase("01", vec![]), phase("01", vec![])];

        let err = DagBuilder::new(phases).build().unwrap_err();
        assert!(matches!(err, TemplateError::DuplicatePhase(id) if id == "01"));
    }

    #[test]
    fn test_empty_graph() {
        let graph = DagBuilder::new(vec![]).build().unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn test_dependencies_satisfied() {
        let phases = vec![
            phase("01", vec![]),
            phase("02", vec!["01"]),
            phase("03", vec!["01", "02"]),
        ];

        let graph = DagBuilder::new(phases).build().unwrap();
        let mut satisfied = HashSet::new();

        assert!(graph.dependencies_satisfied(0, &satisfied));
        assert!(!graph.dependencies_satisfied(1, &satisfied));

        satisfied.insert(0);
        assert!(graph.dependencies_satisfied(1, &satisfied));
        assert!(!graph.dependencies_satisfied(2, &satisfied));

        satisfied.insert(1);
        assert!(graph.dependencies_satisfied(2, &satisfied));
    }
}
