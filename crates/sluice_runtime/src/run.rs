//! A Run: one execution of a pipeline over concrete inputs.

use crate::component::{ComponentKind, ComponentState, RunComponent};
use indexmap::IndexMap;
use serde::Serialize;
use sluice_core::{ComponentId, ContentIdentity, Md5Digest, RunId, Stopwatch};
use sluice_storage::{ExecRecordStore, Principal, RemovalPlan};
use std::collections::BTreeMap;

/// One pipeline execution and its components
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    /// Run id
    pub id: RunId,
    /// Pipeline name
    pub pipeline: String,
    /// Who the run executes for
    pub principal: Principal,
    /// Pipeline input identities, in input order
    pub inputs: Vec<ContentIdentity>,
    /// Wall-clock span
    pub stopwatch: Stopwatch,
    /// Stopped by request
    pub cancelled: bool,
    components: IndexMap<ComponentId, RunComponent>,
    #[serde(skip)]
    by_kind: BTreeMap<ComponentKind, ComponentId>,
    expected_steps: usize,
    expected_outcables: usize,
}

impl Run {
    /// Create a run expecting the given numbers of steps and outputs
    #[must_use]
    pub fn new(
        pipeline: impl Into<String>,
        principal: Principal,
        inputs: Vec<ContentIdentity>,
        expected_steps: usize,
        expected_outcables: usize,
    ) -> Self {
        Self {
            id: RunId::new(),
            pipeline: pipeline.into(),
            principal,
            inputs,
            stopwatch: Stopwatch::started(),
            cancelled: false,
            components: IndexMap::new(),
            by_kind: BTreeMap::new(),
            expected_steps,
            expected_outcables,
        }
    }

    /// Get or create the component for a node
    pub fn add_component(&mut self, kind: ComponentKind) -> &mut RunComponent {
        let id = match self.by_kind.get(&kind) {
            Some(id) => *id,
            None => {
                let component = RunComponent::new(kind);
                let id = component.id;
                self.components.insert(id, component);
                self.by_kind.insert(kind, id);
                id
            }
        };
        &mut self.components[&id]
    }

    /// Component by id
    #[must_use]
    pub fn component(&self, id: &ComponentId) -> Option<&RunComponent> {
        self.components.get(id)
    }

    /// Mutable component by id
    pub fn component_mut(&mut self, id: &ComponentId) -> Option<&mut RunComponent> {
        self.components.get_mut(id)
    }

    /// Component for a node
    #[must_use]
    pub fn by_kind(&self, kind: &ComponentKind) -> Option<&RunComponent> {
        self.by_kind.get(kind).and_then(|id| self.components.get(id))
    }

    /// Mutable component for a node
    pub fn by_kind_mut(&mut self, kind: &ComponentKind) -> Option<&mut RunComponent> {
        let id = *self.by_kind.get(kind)?;
        self.components.get_mut(&id)
    }

    /// Components in creation order
    pub fn components(&self) -> impl Iterator<Item = &RunComponent> {
        self.components.values()
    }

    fn count(&self, pred: impl Fn(&ComponentKind) -> bool) -> usize {
        self.components.values().filter(|c| pred(&c.kind)).count()
    }

    /// Whether every component settled
    ///
    /// A cancelled or failed run is complete once nothing is in flight; an
    /// unhindered run also needs every step and output to exist.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        let settled = self
            .components
            .values()
            .all(|c| c.get_state().is_terminal());
        if !settled {
            return false;
        }
        if self.cancelled || self.failing_component().is_some() {
            return true;
        }
        self.count(ComponentKind::is_step) == self.expected_steps
            && self.count(|k| matches!(k, ComponentKind::OutputCable { .. })) == self.expected_outcables
    }

    /// Whether the run completed with every component successful
    #[must_use]
    pub fn is_successful(&self) -> bool {
        !self.cancelled
            && self.is_complete()
            && self
                .components
                .values()
                .all(RunComponent::successful_execution)
    }

    /// First component that failed
    #[must_use]
    pub fn failing_component(&self) -> Option<&RunComponent> {
        self.components
            .values()
            .find(|c| c.get_state() == ComponentState::Failed)
    }

    /// Component that first produced the digest in this run
    ///
    /// Trivial cables pass a digest through without producing it, so a
    /// cable counts only when the digest is not among its inputs. Steps are
    /// preferred over cables.
    #[must_use]
    pub fn generator_of(&self, md5: &Md5Digest) -> Option<&RunComponent> {
        let mut producers = self.components.values().filter(|c| {
            c.is_complete()
                && c.outputs().iter().any(|o| o.md5 == *md5)
                && (c.kind.is_step() || !c.inputs().iter().any(|i| i.md5 == *md5))
        });
        let first = producers.next()?;
        if first.kind.is_step() {
            return Some(first);
        }
        Some(producers.find(|c| c.kind.is_step()).unwrap_or(first))
    }

    /// Plan removing everything this run produced
    #[must_use]
    pub fn build_removal_plan(&self, store: &ExecRecordStore) -> RemovalPlan {
        let mut plan = RemovalPlan::new();
        let produced: std::collections::BTreeSet<Md5Digest> = self
            .components
            .values()
            .flat_map(|c| c.outputs().iter().map(|o| o.md5))
            .filter(|md5| !self.inputs.iter().any(|i| i.md5 == *md5))
            .collect();
        for md5 in &produced {
            plan.merge(store.build_removal_plan(md5));
        }
        plan.runs.insert(self.id);
        plan
    }

    /// Mark components touching the digest as redacted
    pub fn redact(&mut self, md5: &Md5Digest) -> Vec<ComponentId> {
        self.components
            .values_mut()
            .filter(|c| {
                c.outputs().iter().any(|o| o.md5 == *md5) || c.inputs().iter().any(|i| i.md5 == *md5)
            })
            .map(|c| {
                c.redact();
                c.id
            })
            .collect()
    }

    /// Stop the run clock
    pub fn finish(&mut self) {
        self.stopwatch.stop();
    }

    /// Steps whose component completed by reuse
    #[must_use]
    pub fn reused_steps(&self) -> Vec<u32> {
        self.components
            .values()
            .filter_map(|c| match c.kind {
                ComponentKind::Step { step_num } if c.reused() == Some(true) => Some(step_num),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ExecLog;
    use sluice_plan::{CableSignature, Computation};
    use sluice_storage::{ExecRecord, ExecRecordOutput, FsDatasetStore};
    use std::sync::Arc;

    fn identity(body: &[u8]) -> ContentIdentity {
        ContentIdentity::raw(Md5Digest::compute(body))
    }

    fn record(inputs: &[&[u8]], outputs: &[&[u8]]) -> ExecRecord {
        ExecRecord::new(
            Computation::Cable(CableSignature::trivial()),
            inputs.iter().map(|b| identity(b)).collect(),
            outputs
                .iter()
                .map(|b| ExecRecordOutput::checked(identity(b)))
                .collect(),
            Principal::new("alice"),
        )
    }

    fn complete(run: &mut Run, kind: ComponentKind, inputs: &[&[u8]], outputs: &[&[u8]]) {
        let component = run.add_component(kind);
        component
            .mark_pending(inputs.iter().map(|b| identity(b)).collect())
            .unwrap();
        component.start(ExecLog::started()).unwrap();
        component.begin_saving().unwrap();
        component.complete(&record(inputs, outputs)).unwrap();
    }

    fn one_step_run() -> Run {
        let mut run = Run::new("demo", Principal::new("alice"), vec![identity(b"in")], 1, 1);
        complete(
            &mut run,
            ComponentKind::InputCable {
                step_num: 1,
                input_idx: 0,
            },
            &[b"in"],
            &[b"in"],
        );
        complete(&mut run, ComponentKind::Step { step_num: 1 }, &[b"in"], &[b"out"]);
        complete(&mut run, ComponentKind::OutputCable { output_idx: 0 }, &[b"out"], &[b"out"]);
        run
    }

    #[test]
    fn test_add_component_is_idempotent() {
        let mut run = Run::new("demo", Principal::new("alice"), Vec::new(), 1, 0);
        let a = run.add_component(ComponentKind::Step { step_num: 1 }).id;
        let b = run.add_component(ComponentKind::Step { step_num: 1 }).id;
        assert_eq!(a, b);
        assert_eq!(run.components().count(), 1);
    }

    #[test]
    fn test_completion_and_success() {
        let run = one_step_run();
        assert!(run.is_complete());
        assert!(run.is_successful());
        assert!(run.failing_component().is_none());
    }

    #[test]
    fn test_missing_step_is_not_complete() {
        let mut run = one_step_run();
        run.expected_steps = 2;
        assert!(!run.is_complete());
    }

    #[test]
    fn test_failure_completes_without_success() {
        let mut run = Run::new("demo", Principal::new("alice"), Vec::new(), 2, 1);
        let step = run.add_component(ComponentKind::Step { step_num: 1 });
        step.mark_pending(Vec::new()).unwrap();
        step.fail("boom").unwrap();
        assert!(run.is_complete());
        assert!(!run.is_successful());
        assert_eq!(
            run.failing_component().map(|c| c.kind),
            Some(ComponentKind::Step { step_num: 1 })
        );
    }

    #[test]
    fn test_generator_skips_pass_through_cables() {
        let run = one_step_run();
        let md5 = Md5Digest::compute(b"out");
        assert_eq!(
            run.generator_of(&md5).map(|c| c.kind),
            Some(ComponentKind::Step { step_num: 1 })
        );
        assert!(run.generator_of(&Md5Digest::compute(b"in")).is_none());
    }

    #[test]
    fn test_redact_marks_touching_components() {
        let mut run = one_step_run();
        let touched = run.redact(&Md5Digest::compute(b"out"));
        assert_eq!(touched.len(), 2);
        assert!(run.components().filter(|c| c.redacted).all(|c| c.outputs().is_empty()));
    }

    #[test]
    fn test_removal_plan_names_run() {
        let tmp = tempfile::tempdir().unwrap();
        let datasets = Arc::new(FsDatasetStore::open(tmp.path()).unwrap());
        let store = ExecRecordStore::in_memory(datasets);
        let run = one_step_run();
        let plan = run.build_removal_plan(&store);
        assert!(plan.runs.contains(&run.id));
        assert!(plan.datasets.contains(&Md5Digest::compute(b"out")));
        assert!(!plan.datasets.contains(&Md5Digest::compute(b"in")));
    }
}
