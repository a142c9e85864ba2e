use crate::types::{StageDefinition, StageId};
use std::collections::{HashMap, HashSet};
use weft_core::{WeftError, WeftResult};

/// Execution plan of a workflow: topological generations of stage ids.
///
/// Every stage appears in exactly one level, and every dependency of a stage
/// sits in a strictly earlier level. Stages inside a level may run in
/// parallel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    levels: Vec<Vec<StageId>>,
}

impl ExecutionPlan {
    pub fn levels(&self) -> &[Vec<StageId>] {
        &self.levels
    }

    pub fn into_levels(self) -> Vec<Vec<StageId>> {
        self.levels
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn stage_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Index of the level containing `stage_id`.
    pub fn level_of(&self, stage_id: &str) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.iter().any(|s| s == stage_id))
    }
}

/// Compute execution levels with Kahn's algorithm.
///
/// Fails fast on an empty stage list, duplicate stage ids, a dependency on an
/// unknown stage, or a cycle. Stage order inside a level follows declaration
/// order so plans are deterministic.
pub fn plan_levels(stages: &[StageDefinition]) -> WeftResult<ExecutionPlan> {
    if stages.is_empty() {
        return Err(WeftError::Validation(
            "workflow must declare at least one stage".to_string(),
        ));
    }

    let mut index: HashMap<&str, usize> = HashMap::with_capacity(stages.len());
    for (i, stage) in stages.iter().enumerate() {
        if stage.id.trim().is_empty() {
            return Err(WeftError::Validation("stage id must not be empty".to_string()));
        }
        if index.insert(stage.id.as_str(), i).is_some() {
            return Err(WeftError::Validation(format!(
                "duplicate stage id '{}'",
                stage.id
            )));
        }
    }

    let mut in_degree = vec![0usize; stages.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    for (i, stage) in stages.iter().enumerate() {
        let mut seen = HashSet::new();
        for dep in &stage.dependencies {
            let &d = index.get(dep.as_str()).ok_or_else(|| {
                WeftError::Validation(format!(
                    "stage '{}' depends on unknown stage '{}'",
                    stage.id, dep
                ))
            })?;
            // Repeated entries count once.
            if seen.insert(d) {
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut levels = Vec::new();
    let mut frontier: Vec<usize> = (0..stages.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut placed = 0;

    while !frontier.is_empty() {
        placed += frontier.len();
        let mut next = Vec::new();
        for &i in &frontier {
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();
        levels.push(frontier.iter().map(|&i| stages[i].id.clone()).collect());
        frontier = next;
    }

    if placed != stages.len() {
        let mut cyclic: Vec<&str> = (0..stages.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| stages[i].id.as_str())
            .collect();
        cyclic.sort_unstable();
        return Err(WeftError::Validation(format!(
            "dependency cycle detected among stages: {}",
            cyclic.join(", ")
        )));
    }

    Ok(ExecutionPlan { levels })
}
