use std::collections::{HashMap, VecDeque};

use stratum_core::{ResourceKind, ResourceSpec};

use crate::error::ValidationError;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// A validated resource graph.
///
/// Edges come from explicit `depends_on`, attribute references, and secret
/// references (a consumer depends on the `secret-version` resource that
/// manages the secret). Construction fails on any structural problem, so
/// holding a `ResourceGraph` means the input is well formed and acyclic.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    specs: Vec<ResourceSpec>,
    index: HashMap<String, usize>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    secret_owners: HashMap<String, usize>,
}

impl ResourceGraph {
    pub fn build(specs: Vec<ResourceSpec>) -> Result<Self, ValidationError> {
        let mut index = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if spec.id.is_empty() {
                return Err(ValidationError::InvalidSpec {
                    resource: format!("#{i}"),
                    reason: "resource id must not be empty".into(),
                });
            }
            if index.insert(spec.id.clone(), i).is_some() {
                return Err(ValidationError::DuplicateId(spec.id.clone()));
            }
        }

        let mut secret_owners: HashMap<String, usize> = HashMap::new();
        for (i, spec) in specs.iter().enumerate() {
            if spec.kind != ResourceKind::SecretVersion {
                continue;
            }
            let name = spec
                .managed_secret_name()
                .ok_or_else(|| ValidationError::InvalidSpec {
                    resource: spec.id.clone(),
                    reason: "secret-version requires a literal string `secret` attribute".into(),
                })?;
            if let Some(&first) = secret_owners.get(name) {
                return Err(ValidationError::DuplicateSecret {
                    secret: name.to_string(),
                    first: specs[first].id.clone(),
                    second: spec.id.clone(),
                });
            }
            secret_owners.insert(name.to_string(), i);
        }

        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
        for (i, spec) in specs.iter().enumerate() {
            for dep in spec.declared_dependencies() {
                let j = *index
                    .get(&dep)
                    .ok_or_else(|| ValidationError::DanglingDependency {
                        resource: spec.id.clone(),
                        dependency: dep.clone(),
                    })?;
                deps[i].push(j);
            }

            for (key, value) in &spec.attributes {
                let stratum_core::AttrValue::Ref(r) = value else {
                    continue;
                };
                let target = &specs[index[&r.resource]];
                if !target.kind.is_producible(&r.attribute) {
                    return Err(ValidationError::UnknownAttribute {
                        resource: spec.id.clone(),
                        key: key.clone(),
                        target: target.id.clone(),
                        kind: target.kind.to_string(),
                        attribute: r.attribute.clone(),
                    });
                }
            }

            for selector in spec.secret_selectors() {
                let owner = *secret_owners.get(&selector.name).ok_or_else(|| {
                    ValidationError::UnknownSecret {
                        resource: spec.id.clone(),
                        secret: selector.name.clone(),
                    }
                })?;
                if owner != i && !deps[i].contains(&owner) {
                    deps[i].push(owner);
                }
            }
        }

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                dependents[d].push(i);
            }
        }

        let graph = Self {
            specs,
            index,
            deps,
            dependents,
            secret_owners,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Depth-first traversal with an in-progress marker. Reaching a node
    /// that is still in progress closes a cycle.
    fn check_acyclic(&self) -> Result<(), ValidationError> {
        let mut marks = vec![Mark::Unvisited; self.specs.len()];
        let mut stack: Vec<usize> = Vec::new();
        for start in 0..self.specs.len() {
            if marks[start] == Mark::Unvisited {
                self.visit(start, &mut marks, &mut stack)?;
            }
        }
        Ok(())
    }

    fn visit(
        &self,
        node: usize,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Result<(), ValidationError> {
        marks[node] = Mark::InProgress;
        stack.push(node);
        for &dep in &self.deps[node] {
            match marks[dep] {
                Mark::Done => {}
                Mark::InProgress => {
                    let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut path: Vec<String> = stack[start..]
                        .iter()
                        .map(|&n| self.specs[n].id.clone())
                        .collect();
                    path.push(self.specs[dep].id.clone());
                    return Err(ValidationError::Cycle { path });
                }
                Mark::Unvisited => self.visit(dep, marks, stack)?,
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
        Ok(())
    }

    /// Specs in declaration order.
    pub fn specs(&self) -> &[ResourceSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ResourceSpec> {
        self.index.get(id).map(|&i| &self.specs[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Position of `id` in the input, used as the scheduler tie-break.
    pub fn declaration_index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Direct dependencies, including those implied by references.
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| {
                self.deps[i]
                    .iter()
                    .map(|&d| self.specs[d].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| {
                self.dependents[i]
                    .iter()
                    .map(|&d| self.specs[d].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Everything downstream of `id`, breadth-first.
    pub fn transitive_dependents(&self, id: &str) -> Vec<&str> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.specs.len()];
        let mut queue = VecDeque::from([start]);
        let mut out = Vec::new();
        while let Some(n) = queue.pop_front() {
            for &d in &self.dependents[n] {
                if !seen[d] {
                    seen[d] = true;
                    out.push(self.specs[d].id.as_str());
                    queue.push_back(d);
                }
            }
        }
        out
    }

    /// The `secret-version` resource managing secret `name`.
    pub fn secret_owner(&self, name: &str) -> Option<&ResourceSpec> {
        self.secret_owners.get(name).map(|&i| &self.specs[i])
    }

    pub(crate) fn dependency_indices(&self, i: usize) -> &[usize] {
        &self.deps[i]
    }

    pub(crate) fn dependent_indices(&self, i: usize) -> &[usize] {
        &self.dependents[i]
    }
}
