use std::collections::HashMap;

use crate::error::ProvisionerError;
use crate::graph::ResourceGraph;

/// Dependency-ordered waves. Every resource in a wave depends only on
/// resources in earlier waves, so a wave can run concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    waves: Vec<Vec<String>>,
    wave_index: HashMap<String, usize>,
}

impl Schedule {
    /// Kahn's algorithm: each round takes every node with no remaining
    /// in-edges as one wave. Within a wave ids keep declaration order, so
    /// an unchanged graph always yields the same schedule.
    pub fn build(graph: &ResourceGraph) -> Result<Self, ProvisionerError> {
        let n = graph.len();
        let mut in_degree: Vec<usize> = (0..n).map(|i| graph.dependency_indices(i).len()).collect();
        let mut current: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut placed = 0;
        let mut waves: Vec<Vec<String>> = Vec::new();

        while !current.is_empty() {
            current.sort_unstable();
            let mut next = Vec::new();
            for &node in &current {
                for &dependent in graph.dependent_indices(node) {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            placed += current.len();
            waves.push(
                current
                    .iter()
                    .map(|&i| graph.specs()[i].id.clone())
                    .collect(),
            );
            current = next;
        }

        if placed != n {
            let residue: Vec<&str> = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| graph.specs()[i].id.as_str())
                .collect();
            return Err(ProvisionerError::Internal(format!(
                "scheduler left {} resources unplaced after validation: {}",
                n - placed,
                residue.join(", ")
            )));
        }

        let wave_index = waves
            .iter()
            .enumerate()
            .flat_map(|(w, ids)| ids.iter().map(move |id| (id.clone(), w)))
            .collect();

        Ok(Self { waves, wave_index })
    }

    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    pub fn len(&self) -> usize {
        self.waves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    pub fn wave_of(&self, id: &str) -> Option<usize> {
        self.wave_index.get(id).copied()
    }

    /// Waves last-to-first, the order for tearing resources down.
    pub fn teardown_order(&self) -> impl Iterator<Item = &Vec<String>> {
        self.waves.iter().rev()
    }
}
