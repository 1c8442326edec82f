//! Structural validation of pipeline graphs and of supplied inputs.

use crate::cable::{CableSource, Wire};
use crate::graph::{PipelineGraph, XputSpec};
use sluice_core::ContentIdentity;

/// Validation error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Steps are not numbered 1..=n in order
    #[error("Expected step {expected}, found step {found}")]
    NonContiguousSteps { expected: u32, found: u32 },

    /// A step has a different number of cables than inputs
    #[error("Step {step} has {inputs} inputs but {cables} cables")]
    CableCountMismatch {
        step: u32,
        inputs: usize,
        cables: usize,
    },

    /// A cable reads from something that does not exist or comes later
    #[error("Cable into {at} reads from {origin}: {reason}")]
    BadCableSource {
        at: String,
        origin: String,
        reason: String,
    },

    /// A wire references an impossible column
    #[error("Bad wire into {at}: {reason}")]
    BadWire { at: String, reason: String },

    /// A compound datatype is referenced but not defined
    #[error("Unknown compound datatype: {name}")]
    UnknownCompound { name: String },

    /// A datatype is referenced but not defined
    #[error("Unknown datatype: {name}")]
    UnknownDatatype { name: String },

    /// Wrong number of inputs supplied
    #[error("Pipeline takes {expected} inputs, {found} supplied")]
    InputArity { expected: usize, found: usize },

    /// Raw data where typed data was expected, or the reverse
    #[error("Input {input}: expected {expected} data")]
    RawMismatch { input: String, expected: String },

    /// Supplied compound type does not restrict the declared one
    #[error("Input {input}: {found} does not restrict {expected}")]
    TypeMismatch {
        input: String,
        expected: String,
        found: String,
    },

    /// Row count outside the declared bounds
    #[error("Input {input}: {rows} rows outside {bounds}")]
    RowCount {
        input: String,
        rows: u64,
        bounds: String,
    },
}

/// Validator for graphs and input tuples
pub struct Validator {
    /// Require every pipeline to declare at least one output cable
    pub require_output: bool,
}

impl Validator {
    /// Create a new validator
    #[must_use]
    pub fn new() -> Self {
        Self {
            require_output: false,
        }
    }

    /// Require output cables
    #[must_use]
    pub fn requiring_output(mut self) -> Self {
        self.require_output = true;
        self
    }

    /// Validate graph structure
    ///
    /// # Errors
    ///
    /// Returns every problem found
    pub fn validate(&self, graph: &PipelineGraph) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        for spec in graph.inputs.iter().chain(graph.steps.iter().flat_map(|s| {
            s.inputs.iter().chain(s.outputs.iter())
        })) {
            self.check_compound(graph, spec, &mut errors);
        }

        for (i, step) in graph.steps.iter().enumerate() {
            let expected = u32::try_from(i + 1).unwrap_or(u32::MAX);
            if step.step_num != expected {
                errors.push(ValidationError::NonContiguousSteps {
                    expected,
                    found: step.step_num,
                });
            }
            if step.cables_in.len() != step.inputs.len() {
                errors.push(ValidationError::CableCountMismatch {
                    step: step.step_num,
                    inputs: step.inputs.len(),
                    cables: step.cables_in.len(),
                });
            }
            for (idx, (cable, dest)) in step.cables_in.iter().zip(&step.inputs).enumerate() {
                let at = format!("step{}.input[{}]", step.step_num, idx);
                self.check_source(graph, &cable.source, Some(step.step_num), &at, &mut errors);
                self.check_wires(graph, &cable.source, dest.compound.as_deref(), &cable.wires, &at, &mut errors);
            }
        }

        for cable in &graph.outcables {
            let at = format!("output {}", cable.name);
            if matches!(cable.source, CableSource::PipelineInput { .. }) {
                errors.push(ValidationError::BadCableSource {
                    at: at.clone(),
                    origin: cable.source.to_string(),
                    reason: "output cables must read from a step".to_string(),
                });
                continue;
            }
            self.check_source(graph, &cable.source, None, &at, &mut errors);
            self.check_wires(graph, &cable.source, cable.compound.as_deref(), &cable.wires, &at, &mut errors);
            if let Some(name) = &cable.compound {
                if graph.compound(name).is_none() {
                    errors.push(ValidationError::UnknownCompound { name: name.clone() });
                }
            }
        }

        if self.require_output && graph.outcables.is_empty() {
            errors.push(ValidationError::BadCableSource {
                at: "pipeline".to_string(),
                origin: "-".to_string(),
                reason: "no output cables".to_string(),
            });
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn check_compound(&self, graph: &PipelineGraph, spec: &XputSpec, errors: &mut Vec<ValidationError>) {
        let Some(name) = &spec.compound else {
            return;
        };
        match graph.compound(name) {
            None => errors.push(ValidationError::UnknownCompound { name: name.clone() }),
            Some(cdt) => {
                for col in &cdt.columns {
                    if !graph.datatypes.contains(&col.datatype) {
                        errors.push(ValidationError::UnknownDatatype {
                            name: col.datatype.clone(),
                        });
                    }
                }
            }
        }
    }

    fn check_source(
        &self,
        graph: &PipelineGraph,
        source: &CableSource,
        consumer_step: Option<u32>,
        at: &str,
        errors: &mut Vec<ValidationError>,
    ) {
        let bad = |reason: &str| ValidationError::BadCableSource {
            at: at.to_string(),
            origin: source.to_string(),
            reason: reason.to_string(),
        };
        if let (Some(producer), Some(consumer)) = (source.step(), consumer_step) {
            if producer >= consumer {
                errors.push(bad("source step does not come earlier"));
                return;
            }
        }
        if graph.source_spec(source).is_none() {
            errors.push(bad("no such slot"));
        }
    }

    fn check_wires(
        &self,
        graph: &PipelineGraph,
        source: &CableSource,
        dest_compound: Option<&str>,
        wires: &[Wire],
        at: &str,
        errors: &mut Vec<ValidationError>,
    ) {
        let Some(source_spec) = graph.source_spec(source) else {
            return;
        };
        let source_cdt = source_spec.compound.as_deref().and_then(|n| graph.compound(n));
        let dest_cdt = dest_compound.and_then(|n| graph.compound(n));
        let bad = |reason: String| ValidationError::BadWire {
            at: at.to_string(),
            reason,
        };

        match (source_cdt.is_some(), dest_compound.is_some()) {
            (true, false) | (false, true) => {
                errors.push(bad("cannot connect raw and typed data".to_string()));
                return;
            }
            (false, false) => {
                if !wires.is_empty() {
                    errors.push(bad("raw cables cannot have wires".to_string()));
                }
                return;
            }
            (true, true) => {}
        }
        let (Some(source_cdt), Some(dest_cdt)) = (source_cdt, dest_cdt) else {
            return;
        };

        if wires.is_empty() {
            if !source_cdt.is_restriction_of(dest_cdt, &graph.datatypes) {
                errors.push(bad(format!(
                    "{} does not restrict {}",
                    source_cdt.name, dest_cdt.name
                )));
            }
            return;
        }

        if wires.len() != dest_cdt.width() {
            errors.push(bad(format!(
                "{} wires for {} destination columns",
                wires.len(),
                dest_cdt.width()
            )));
        }
        if wires.iter().all(Wire::is_identity) && wires.len() != source_cdt.width() {
            errors.push(bad("identity wiring must cover every source column".to_string()));
        }
        for wire in wires {
            match source_cdt.column(wire.source.idx) {
                Some(col) if col.name == wire.source.name => {
                    if !graph.datatypes.is_restriction(&col.datatype, &wire.dest.datatype) {
                        errors.push(bad(format!(
                            "column {} ({}) does not restrict {}",
                            col.name, col.datatype, wire.dest.datatype
                        )));
                    }
                }
                _ => errors.push(bad(format!(
                    "source has no column {} named {}",
                    wire.source.idx, wire.source.name
                ))),
            }
            if dest_cdt.column(wire.dest.idx).is_none() {
                errors.push(bad(format!("destination has no column {}", wire.dest.idx)));
            }
        }
    }

    /// Check a supplied input tuple against the declared pipeline inputs
    ///
    /// # Errors
    ///
    /// Returns every mismatch found
    pub fn check_inputs(
        &self,
        graph: &PipelineGraph,
        inputs: &[ContentIdentity],
    ) -> Result<(), Vec<ValidationError>> {
        if inputs.len() != graph.inputs.len() {
            return Err(vec![ValidationError::InputArity {
                expected: graph.inputs.len(),
                found: inputs.len(),
            }]);
        }

        let mut errors = Vec::new();
        for (spec, supplied) in graph.inputs.iter().zip(inputs) {
            match (&spec.compound, &supplied.compound_type) {
                (None, None) => {}
                (None, Some(_)) => errors.push(ValidationError::RawMismatch {
                    input: spec.name.clone(),
                    expected: "raw".to_string(),
                }),
                (Some(_), None) => errors.push(ValidationError::RawMismatch {
                    input: spec.name.clone(),
                    expected: "typed".to_string(),
                }),
                (Some(want), Some(have)) => {
                    let ok = match (graph.compound(have), graph.compound(want)) {
                        (Some(h), Some(w)) => h.is_restriction_of(w, &graph.datatypes),
                        _ => have == want,
                    };
                    if !ok {
                        errors.push(ValidationError::TypeMismatch {
                            input: spec.name.clone(),
                            expected: want.clone(),
                            found: have.clone(),
                        });
                    }
                    let rows = supplied.num_rows.unwrap_or(0);
                    if !spec.rows.check(rows) {
                        errors.push(ValidationError::RowCount {
                            input: spec.name.clone(),
                            rows,
                            bounds: spec.rows.to_string(),
                        });
                    }
                }
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}
