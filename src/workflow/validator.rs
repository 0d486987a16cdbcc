//! Workflow Validation
//!
//! Structural checks performed before a workflow is registered, saved or
//! executed:
//! - Non-empty, unique step IDs
//! - Every dependency names an existing step
//! - No cyclic dependencies (Kahn's algorithm)

use std::collections::{HashMap, HashSet};

use log::debug;

use super::model::Workflow;
use crate::error::ValidationError;

/// Validates the workflow structure.
///
/// Performs the following checks:
/// 1. Every step has a non-empty ID
/// 2. No duplicate step IDs
/// 3. All `depends_on` entries point to existing steps
/// 4. No cyclic dependencies
pub fn validate_workflow(workflow: &Workflow) -> Result<(), ValidationError> {
    let mut seen_ids: HashSet<&str> = HashSet::with_capacity(workflow.steps.len());
    for step in &workflow.steps {
        if step.id.trim().is_empty() {
            return Err(ValidationError::EmptyStepId);
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }

    for step in &workflow.steps {
        for dep in &step.depends_on {
            if !seen_ids.contains(dep.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    topological_order(workflow)?;

    debug!(
        "Workflow '{}' validated: {} steps",
        workflow.intent,
        workflow.steps.len()
    );
    Ok(())
}

/// Computes a topological order of step indices using Kahn's algorithm.
///
/// Steps are released in waves: a wave holds every step whose dependencies
/// all sit in earlier waves, sorted by declaration index. The order is
/// therefore fully determined by the workflow definition. Dependencies
/// naming unknown steps are ignored here.
pub fn topological_order(workflow: &Workflow) -> Result<Vec<usize>, ValidationError> {
    let index: HashMap<&str, usize> = workflow
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; workflow.steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); workflow.steps.len()];
    for (i, step) in workflow.steps.iter().enumerate() {
        for dep in &step.depends_on {
            if let Some(&d) = index.get(dep.as_str()) {
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    // Start with root nodes (in-degree = 0)
    let mut wave: Vec<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(workflow.steps.len());
    while !wave.is_empty() {
        let mut next_wave = Vec::new();
        for &current in &wave {
            for &next in &dependents[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    next_wave.push(next);
                }
            }
        }
        order.extend(wave);
        next_wave.sort_unstable();
        wave = next_wave;
    }

    if order.len() != workflow.steps.len() {
        return Err(ValidationError::CyclicDependency);
    }

    Ok(order)
}
