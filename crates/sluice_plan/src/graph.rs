//! The pipeline graph read model.
//!
//! Steps are numbered contiguously from 1. Each step input is fed by exactly
//! one cable, and cables only read from pipeline inputs or from the outputs of
//! lower-numbered steps, so step-number order is a topological order.

use crate::cable::{Cable, CableSource, OutputCable};
use crate::datatype::{CompoundDatatype, DatatypeRegistry};
use crate::method::MethodSpec;
use crate::rows::RowBounds;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use sluice_core::{CoreError, CoreResult};

/// A typed input or output slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XputSpec {
    /// Slot name, used in file names
    pub name: String,
    /// Compound datatype name, `None` for raw bytes
    #[serde(default)]
    pub compound: Option<String>,
    /// Allowed row counts (typed slots only)
    #[serde(default)]
    pub rows: RowBounds,
    /// Whether produced data is kept after the run
    #[serde(default = "default_retain")]
    pub retain: bool,
}

fn default_retain() -> bool {
    true
}

impl XputSpec {
    /// A raw slot
    #[must_use]
    pub fn raw(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            compound: None,
            rows: RowBounds::new(),
            retain: true,
        }
    }

    /// A typed slot
    #[must_use]
    pub fn typed(name: impl Into<String>, compound: impl Into<String>) -> Self {
        Self {
            compound: Some(compound.into()),
            ..Self::raw(name)
        }
    }

    /// Set row bounds
    #[must_use]
    pub fn with_rows(mut self, rows: RowBounds) -> Self {
        self.rows = rows;
        self
    }

    /// Do not keep the produced data after the run
    #[must_use]
    pub fn discarded(mut self) -> Self {
        self.retain = false;
        self
    }

    /// Whether the slot carries untyped bytes
    #[must_use]
    pub fn is_raw(&self) -> bool {
        self.compound.is_none()
    }

    /// File extension used for this slot's data
    #[must_use]
    pub fn extension(&self) -> &'static str {
        if self.is_raw() { "raw" } else { "csv" }
    }
}

/// One numbered step of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStep {
    /// 1-based step number
    pub step_num: u32,
    /// Display name
    pub name: String,
    /// Code to run
    pub method: MethodSpec,
    /// Inputs in driver argument order
    pub inputs: Vec<XputSpec>,
    /// Outputs in driver argument order
    pub outputs: Vec<XputSpec>,
    /// One cable per input, in input order
    pub cables_in: Vec<Cable>,
}

impl PipelineStep {
    /// Create a step
    #[must_use]
    pub fn new(step_num: u32, name: impl Into<String>, method: MethodSpec) -> Self {
        Self {
            step_num,
            name: name.into(),
            method,
            inputs: Vec::new(),
            outputs: Vec::new(),
            cables_in: Vec::new(),
        }
    }

    /// Add an input and the cable feeding it
    #[must_use]
    pub fn with_input(mut self, spec: XputSpec, cable: Cable) -> Self {
        self.inputs.push(spec);
        self.cables_in.push(cable);
        self
    }

    /// Add an output
    #[must_use]
    pub fn with_output(mut self, spec: XputSpec) -> Self {
        self.outputs.push(spec);
        self
    }
}

/// Immutable pipeline definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineGraph {
    /// Pipeline family name
    pub name: String,
    /// Revision within the family
    #[serde(default)]
    pub revision: u32,
    /// Pipeline inputs in order
    pub inputs: Vec<XputSpec>,
    /// Steps in step-number order
    pub steps: Vec<PipelineStep>,
    /// Output cables in order
    #[serde(default)]
    pub outcables: Vec<OutputCable>,
    /// Known datatypes
    #[serde(default)]
    pub datatypes: DatatypeRegistry,
    /// Known compound datatypes keyed by name
    #[serde(default)]
    pub compounds: IndexMap<String, CompoundDatatype>,
}

impl PipelineGraph {
    /// Create an empty pipeline with builtin datatypes
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: 1,
            inputs: Vec::new(),
            steps: Vec::new(),
            outcables: Vec::new(),
            datatypes: DatatypeRegistry::with_builtins(),
            compounds: IndexMap::new(),
        }
    }

    /// Parse from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the JSON does not describe a pipeline
    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::ParseError {
            message: e.to_string(),
        })
    }

    /// Register a compound datatype
    #[must_use]
    pub fn with_compound(mut self, compound: CompoundDatatype) -> Self {
        self.compounds.insert(compound.name.clone(), compound);
        self
    }

    /// Add a pipeline input
    #[must_use]
    pub fn with_input(mut self, spec: XputSpec) -> Self {
        self.inputs.push(spec);
        self
    }

    /// Add a step
    #[must_use]
    pub fn with_step(mut self, step: PipelineStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Add an output cable
    #[must_use]
    pub fn with_outcable(mut self, cable: OutputCable) -> Self {
        self.outcables.push(cable);
        self
    }

    /// Get a step by number
    #[must_use]
    pub fn step(&self, step_num: u32) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.step_num == step_num)
    }

    /// Get a compound datatype by name
    #[must_use]
    pub fn compound(&self, name: &str) -> Option<&CompoundDatatype> {
        self.compounds.get(name)
    }

    /// Slot a cable source reads from
    #[must_use]
    pub fn source_spec(&self, source: &CableSource) -> Option<&XputSpec> {
        match *source {
            CableSource::PipelineInput { idx } => self.inputs.get(idx),
            CableSource::StepOutput { step, output } => {
                self.step(step).and_then(|s| s.outputs.get(output))
            }
        }
    }

    /// Steps whose outputs feed the given step
    #[must_use]
    pub fn step_dependencies(&self, step_num: u32) -> IndexSet<u32> {
        self.step(step_num)
            .map(|s| s.cables_in.iter().filter_map(|c| c.source.step()).collect())
            .unwrap_or_default()
    }

    /// Steps fed by the given step
    #[must_use]
    pub fn dependents(&self, step_num: u32) -> Vec<u32> {
        self.steps
            .iter()
            .filter(|s| s.cables_in.iter().any(|c| c.source.step() == Some(step_num)))
            .map(|s| s.step_num)
            .collect()
    }

    /// Every consumer of a source: `(step, input)` pairs and output cable indexes
    #[must_use]
    pub fn consumers(&self, source: &CableSource) -> (Vec<(u32, usize)>, Vec<usize>) {
        let steps = self
            .steps
            .iter()
            .flat_map(|s| {
                s.cables_in
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.source == *source)
                    .map(move |(i, _)| (s.step_num, i))
            })
            .collect();
        let outs = self
            .outcables
            .iter()
            .enumerate()
            .filter(|(_, c)| c.source == *source)
            .map(|(i, _)| i)
            .collect();
        (steps, outs)
    }

    /// Number of steps
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}
