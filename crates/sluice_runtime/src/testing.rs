//! Shared fixtures: shell-script methods run through the local scheduler.

use crate::config::SandboxConfig;
use crate::sandbox::{Sandbox, register_inputs};
use sluice_cluster::{LocalScheduler, LocalSchedulerConfig, NativeLauncher};
use sluice_core::ContentIdentity;
use sluice_plan::{
    Cable, CableSource, ColumnSpec, CompoundDatatype, MethodSpec, OutputCable, PipelineGraph,
    PipelineStep, XputSpec,
};
use sluice_storage::{ExecRecordStore, FsDatasetStore, Principal};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub(crate) const DOUBLE: &str = r#"awk -F, 'NR==1 {print; next} {print $1*2 "," $2*2}' "$1" > "$2""#;
pub(crate) const INCREMENT: &str = r#"awk -F, 'NR==1 {print; next} {print $1+1 "," $2+1}' "$1" > "$2""#;
pub(crate) const INPUT: &str = "a,b\n1,2\n3,4\n";

pub(crate) struct Fixture {
    pub tmp: TempDir,
    pub store: Arc<ExecRecordStore>,
    pub scheduler: Arc<LocalScheduler>,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("bin")).unwrap();
        let datasets = Arc::new(FsDatasetStore::open(tmp.path().join("datasets")).unwrap());
        let store = Arc::new(ExecRecordStore::in_memory(datasets));
        let scheduler = Arc::new(LocalScheduler::new(
            LocalSchedulerConfig::new().with_tick_interval(10),
        ));
        Self {
            tmp,
            store,
            scheduler,
        }
    }

    /// Write an executable driver script
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.tmp.path().join("bin").join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub fn method(&self, name: &str, body: &str) -> MethodSpec {
        let driver = format!("{name}.sh");
        let source = self.script(&driver, body);
        MethodSpec::new(name, driver).with_driver_source(source)
    }

    /// `double` into `increment`; step 1's output is discarded after the run
    pub fn pipeline(&self, first: MethodSpec, second: MethodSpec) -> Arc<PipelineGraph> {
        Arc::new(
            Self::head(first)
                .with_step(Self::fed_by_first(2, "increment", second))
                .with_outcable(OutputCable::direct("result", 2, 0).with_compound("pair")),
        )
    }

    /// Step 1 feeding both step 2 and step 3, each with its own output
    pub fn diamond(&self, first: MethodSpec, second: MethodSpec, third: MethodSpec) -> Arc<PipelineGraph> {
        Arc::new(
            Self::head(first)
                .with_step(Self::fed_by_first(2, "increment", second))
                .with_step(Self::fed_by_first(3, "redouble", third))
                .with_outcable(OutputCable::direct("result", 2, 0).with_compound("pair"))
                .with_outcable(OutputCable::direct("other", 3, 0).with_compound("pair")),
        )
    }

    fn head(first: MethodSpec) -> PipelineGraph {
        let pair = CompoundDatatype::new(
            "pair",
            vec![
                ColumnSpec::new(1, "a", "integer"),
                ColumnSpec::new(2, "b", "integer"),
            ],
        );
        PipelineGraph::new("doubler")
            .with_compound(pair)
            .with_input(XputSpec::typed("numbers", "pair"))
            .with_step(
                PipelineStep::new(1, "double", first)
                    .with_input(
                        XputSpec::typed("in", "pair"),
                        Cable::direct(CableSource::PipelineInput { idx: 0 }),
                    )
                    .with_output(XputSpec::typed("out", "pair").discarded()),
            )
    }

    fn fed_by_first(step_num: u32, name: &str, method: MethodSpec) -> PipelineStep {
        PipelineStep::new(step_num, name, method)
            .with_input(
                XputSpec::typed("in", "pair"),
                Cable::direct(CableSource::StepOutput { step: 1, output: 0 }),
            )
            .with_output(XputSpec::typed("out", "pair"))
    }

    pub fn standard(&self, increment_revision: u32) -> Arc<PipelineGraph> {
        self.pipeline(
            self.method("double", DOUBLE),
            self.method("increment", INCREMENT).with_revision(increment_revision),
        )
    }

    pub fn inputs(&self, pipeline: &PipelineGraph) -> Vec<ContentIdentity> {
        let path = self.tmp.path().join("numbers.csv");
        std::fs::write(&path, INPUT).unwrap();
        register_inputs(pipeline, self.store.datasets().as_ref(), &[path]).unwrap()
    }

    pub fn sandbox(&self, pipeline: Arc<PipelineGraph>) -> Sandbox {
        let config = SandboxConfig::new(self.tmp.path().join("runs")).with_polling(10, 50);
        Sandbox::new(
            config,
            pipeline,
            self.store.clone(),
            self.scheduler.clone(),
            Arc::new(NativeLauncher::new()),
            Principal::new("alice"),
        )
    }
}
