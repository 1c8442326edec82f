//! Step ordering for one run.
//!
//! Steps become ready when every upstream step completed. Ready steps are
//! handed out in step-number order. A failed step skips everything
//! downstream of it, transitively.

use indexmap::{IndexMap, IndexSet};
use sluice_plan::PipelineGraph;
use std::collections::BTreeSet;

/// Step ordering error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// A dependency names a step that was never added
    StepNotFound { step: u32 },
    /// A dependency would close a cycle
    CycleDetected { step: u32 },
    /// A step was reported finished without being handed out
    NotRunning { step: u32 },
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StepNotFound { step } => write!(f, "Step not found: {}", step),
            Self::CycleDetected { step } => write!(f, "Cycle detected at step {}", step),
            Self::NotRunning { step } => write!(f, "Step {} is not running", step),
        }
    }
}

impl std::error::Error for ScheduleError {}

/// Hands out steps whose dependencies are complete
#[derive(Debug, Default)]
pub struct StepScheduler {
    all: IndexSet<u32>,
    ready: BTreeSet<u32>,
    running: BTreeSet<u32>,
    completed: BTreeSet<u32>,
    failed: BTreeSet<u32>,
    skipped: BTreeSet<u32>,
    dependencies: IndexMap<u32, IndexSet<u32>>,
    dependents: IndexMap<u32, IndexSet<u32>>,
}

impl StepScheduler {
    /// Create an empty scheduler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a pipeline's step dependencies
    ///
    /// # Errors
    ///
    /// Returns error if a step depends on a later or unknown step
    pub fn from_graph(graph: &PipelineGraph) -> Result<Self, ScheduleError> {
        let mut scheduler = Self::new();
        let mut steps: Vec<u32> = graph.steps.iter().map(|s| s.step_num).collect();
        steps.sort_unstable();
        for step in steps {
            scheduler.add_step(step, graph.step_dependencies(step))?;
        }
        Ok(scheduler)
    }

    /// Add a step; its dependencies must already be present
    ///
    /// # Errors
    ///
    /// Returns error on a self-dependency, a cycle or an unknown dependency
    pub fn add_step(&mut self, step: u32, deps: IndexSet<u32>) -> Result<(), ScheduleError> {
        if deps.contains(&step) {
            return Err(ScheduleError::CycleDetected { step });
        }
        for dep in &deps {
            if !self.all.contains(dep) {
                return Err(ScheduleError::StepNotFound { step: *dep });
            }
            if self.depends_on(*dep, step) {
                return Err(ScheduleError::CycleDetected { step });
            }
        }

        self.all.insert(step);
        for dep in &deps {
            self.dependents.entry(*dep).or_default().insert(step);
        }
        let ready = deps.iter().all(|d| self.completed.contains(d));
        self.dependencies.insert(step, deps);
        if ready {
            self.ready.insert(step);
        }
        Ok(())
    }

    fn depends_on(&self, a: u32, b: u32) -> bool {
        self.dependencies
            .get(&a)
            .is_some_and(|deps| deps.contains(&b) || deps.iter().any(|&d| self.depends_on(d, b)))
    }

    /// Take every ready step, marking them running
    pub fn take_ready(&mut self) -> Vec<u32> {
        let ready: Vec<u32> = std::mem::take(&mut self.ready).into_iter().collect();
        self.running.extend(ready.iter().copied());
        ready
    }

    /// Record a completed step; returns steps that became ready
    ///
    /// # Errors
    ///
    /// Returns error if the step was not running
    pub fn mark_complete(&mut self, step: u32) -> Result<Vec<u32>, ScheduleError> {
        if !self.running.remove(&step) {
            return Err(ScheduleError::NotRunning { step });
        }
        self.completed.insert(step);

        let mut newly = Vec::new();
        if let Some(dependents) = self.dependents.get(&step) {
            for &dep in dependents {
                if self.is_ready(dep) {
                    self.ready.insert(dep);
                    newly.push(dep);
                }
            }
        }
        Ok(newly)
    }

    /// Record a failed step; returns the downstream steps now skipped
    ///
    /// # Errors
    ///
    /// Returns error if the step was not running
    pub fn mark_failed(&mut self, step: u32) -> Result<Vec<u32>, ScheduleError> {
        if !self.running.remove(&step) {
            return Err(ScheduleError::NotRunning { step });
        }
        self.failed.insert(step);

        let mut skipped = Vec::new();
        let mut frontier = vec![step];
        while let Some(current) = frontier.pop() {
            let Some(dependents) = self.dependents.get(&current) else {
                continue;
            };
            for &dep in dependents {
                if self.skipped.contains(&dep) || self.completed.contains(&dep) || self.failed.contains(&dep) {
                    continue;
                }
                self.ready.remove(&dep);
                self.skipped.insert(dep);
                skipped.push(dep);
                frontier.push(dep);
            }
        }
        skipped.sort_unstable();
        Ok(skipped)
    }

    /// Skip every step not yet handed out; returns them
    pub fn skip_remaining(&mut self) -> Vec<u32> {
        let remaining: Vec<u32> = self
            .all
            .iter()
            .copied()
            .filter(|s| !self.running.contains(s) && !self.is_settled(*s))
            .collect();
        self.ready.clear();
        self.skipped.extend(remaining.iter().copied());
        remaining
    }

    fn is_settled(&self, step: u32) -> bool {
        self.completed.contains(&step) || self.failed.contains(&step) || self.skipped.contains(&step)
    }

    fn is_ready(&self, step: u32) -> bool {
        !self.is_settled(step)
            && !self.running.contains(&step)
            && self
                .dependencies
                .get(&step)
                .is_none_or(|deps| deps.iter().all(|d| self.completed.contains(d)))
    }

    /// Whether every step is completed, failed or skipped
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.all.iter().all(|s| self.is_settled(*s))
    }

    /// Number of running steps
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Steps that completed
    #[must_use]
    pub fn completed(&self) -> &BTreeSet<u32> {
        &self.completed
    }

    /// Steps that failed
    #[must_use]
    pub fn failed(&self) -> &BTreeSet<u32> {
        &self.failed
    }

    /// Steps skipped after an upstream failure
    #[must_use]
    pub fn skipped(&self) -> &BTreeSet<u32> {
        &self.skipped
    }
}
