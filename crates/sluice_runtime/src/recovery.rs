//! Finding dataset bytes, regenerating them when they are gone.
//!
//! Lookup order is the sandbox's own files, then the dataset store, then
//! recovery. Recovery reruns the component that first produced the digest
//! in this run and checks the regenerated bytes against the recorded
//! identity. Each digest is recovered at most once per sandbox; callers
//! that need it while that attempt runs wait for its outcome.

use crate::component::{ComponentKind, ExecLog};
use crate::error::SandboxError;
use crate::sandbox::Sandbox;
use futures::future::BoxFuture;
use sluice_cluster::JobState;
use sluice_core::{ContentIdentity, Md5Digest};
use sluice_plan::Cable;
use sluice_storage::IntegrityCheckLog;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use tracing::{debug, info, warn};

tokio::task_local! {
    /// Digests being regenerated by the enclosing recovery chain
    static RECOVERING: Vec<Md5Digest>;
}

impl Sandbox {
    /// Path of a file holding the identity's bytes
    ///
    /// # Errors
    ///
    /// Returns `Recovery` if the bytes are gone and cannot be regenerated,
    /// or `Corruption` if nothing in the run produced them
    pub fn locate<'a>(
        &'a self,
        identity: &'a ContentIdentity,
    ) -> BoxFuture<'a, Result<PathBuf, SandboxError>> {
        Box::pin(async move {
            if let Some(path) = self.find_local(&identity.md5) {
                return Ok(path);
            }
            if let Some(path) = self.store.datasets().path_of(&identity.md5) {
                self.register_location(identity.md5, &path);
                return Ok(path);
            }
            self.recover(&identity.md5).await
        })
    }

    fn find_local(&self, md5: &Md5Digest) -> Option<PathBuf> {
        self.with_state(|s| s.locations.find(md5).map(Path::to_path_buf))
    }

    /// Regenerate the digest, sharing one attempt between all callers
    ///
    /// Concurrent callers wait on the attempt already in flight and receive
    /// its outcome; later callers receive the stored outcome.
    async fn recover(&self, md5: &Md5Digest) -> Result<PathBuf, SandboxError> {
        let mut chain = RECOVERING.try_with(Clone::clone).unwrap_or_default();
        if chain.contains(md5) {
            return Err(SandboxError::Recovery {
                md5: *md5,
                reason: "regenerating it requires itself".to_string(),
            });
        }
        chain.push(*md5);

        let attempt = Arc::clone(
            self.recovered
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(*md5)
                .or_default(),
        );
        if attempt.initialized() {
            debug!(%md5, "recovery already attempted, sharing its outcome");
        }
        attempt
            .get_or_init(|| RECOVERING.scope(chain, self.regenerate(md5)))
            .await
            .clone()
    }

    async fn regenerate(&self, md5: &Md5Digest) -> Result<PathBuf, SandboxError> {
        let (generator, is_input) = self.with_state(|s| {
            (
                s.run.generator_of(md5).map(|c| c.kind),
                s.run.inputs.iter().any(|i| i.md5 == *md5),
            )
        });
        let Some(kind) = generator else {
            if is_input {
                return Err(SandboxError::Recovery {
                    md5: *md5,
                    reason: "pipeline input has no stored data".to_string(),
                });
            }
            return Err(SandboxError::Corruption {
                reason: format!("no component of this run produced {md5}"),
            });
        };

        info!(%md5, component = %kind, "recovering dataset");
        match kind {
            ComponentKind::Step { step_num } => self.recover_step(step_num, md5).await?,
            _ => self.recover_cable(kind, md5).await?,
        }
        self.find_local(md5).ok_or_else(|| SandboxError::Recovery {
            md5: *md5,
            reason: format!("{kind} did not regenerate it"),
        })
    }

    async fn recover_step(&self, step_num: u32, target: &Md5Digest) -> Result<(), SandboxError> {
        let kind = ComponentKind::Step { step_num };
        let step = self.step_spec(step_num)?;
        let (inputs, expected, record) = self
            .with_state(|s| {
                s.run
                    .by_kind(&kind)
                    .map(|c| (c.inputs().to_vec(), c.outputs().to_vec(), c.execrecord()))
            })
            .ok_or_else(|| SandboxError::Corruption {
                reason: format!("{kind} has no component"),
            })?;

        self.place_inputs(step, &inputs).await?;
        let (mut log, handle) = self.submit_step(step, true).await?;
        let (state, code) = self.await_job(&handle).await?;
        log.finish(code);
        let ran = state == JobState::Completed && code == Some(0);

        let mut checks = Vec::with_capacity(expected.len());
        if ran {
            for (spec, want) in step.outputs.iter().zip(&expected) {
                let path = self.output_path(step_num, spec);
                let check = IntegrityCheckLog::check(&path, Some(want.md5));
                if check.is_ok() {
                    self.register_location(want.md5, &path);
                }
                checks.push(check);
            }
        }
        let verified = ran && checks.iter().all(IntegrityCheckLog::is_ok);
        if !verified && step.method.deterministic {
            if let Some(id) = record {
                warn!(step = step_num, record = %id, "regeneration disagrees with record");
                self.store.quarantine(&id)?;
            }
        }
        let attempts = self.with_component(kind, |c| {
            c.integrity_checks.extend(checks);
            c.record_recovery(log)
        })?;

        if !ran {
            return Err(SandboxError::Recovery {
                md5: *target,
                reason: format!("{kind} rerun ended {state:?} with code {code:?}"),
            });
        }
        if !verified {
            return Err(SandboxError::Recovery {
                md5: *target,
                reason: format!("{kind} rerun produced different bytes"),
            });
        }
        info!(step = step_num, attempts, "step outputs regenerated");
        Ok(())
    }

    fn cable_of(&self, kind: ComponentKind) -> Option<(Cable, PathBuf, Option<String>)> {
        match kind {
            ComponentKind::InputCable {
                step_num,
                input_idx,
            } => {
                let step = self.pipeline.step(step_num)?;
                let spec = step.inputs.get(input_idx)?;
                Some((
                    step.cables_in.get(input_idx)?.clone(),
                    self.input_path(step_num, spec),
                    spec.compound.clone(),
                ))
            }
            ComponentKind::OutputCable { output_idx } => {
                let oc = self.pipeline.outcables.get(output_idx)?;
                Some((
                    oc.as_cable(),
                    self.outcable_path(output_idx)?,
                    oc.compound.clone(),
                ))
            }
            ComponentKind::Step { .. } => None,
        }
    }

    async fn recover_cable(&self, kind: ComponentKind, target: &Md5Digest) -> Result<(), SandboxError> {
        let (cable, dest, compound) = self.cable_of(kind).ok_or_else(|| SandboxError::Corruption {
            reason: format!("{kind} is not a cable of this pipeline"),
        })?;
        let (source, expected) = self
            .with_state(|s| {
                s.run.by_kind(&kind).and_then(|c| {
                    Some((c.inputs().first()?.clone(), c.outputs().first()?.clone()))
                })
            })
            .ok_or_else(|| SandboxError::Corruption {
                reason: format!("{kind} has no recorded data"),
            })?;

        let mut log = ExecLog::started();
        let path = self.locate(&source).await?;
        let produced = self
            .cables
            .run(&cable, &path, &dest, &source, compound.as_deref())?;
        log.finish(Some(0));
        if produced.md5 != expected.md5 {
            return Err(SandboxError::Recovery {
                md5: *target,
                reason: format!("{kind} produced {} instead of {}", produced.md5, expected.md5),
            });
        }
        self.register_location(produced.md5, &dest);
        self.with_component(kind, |c| c.record_recovery(log))?;
        Ok(())
    }
}
