//! Cables: wirings from a producer output to a consumer input.
//!
//! A cable without wires, or whose wires keep every column's position and
//! name, is trivial and moves bytes unchanged. Any other cable projects and
//! renames columns, so its output has different bytes than its input.

use crate::datatype::DatatypeRegistry;
use serde::{Deserialize, Serialize};

/// Where a cable reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CableSource {
    /// A pipeline input, by 0-based position
    PipelineInput {
        /// Input position
        idx: usize,
    },
    /// A step output
    StepOutput {
        /// 1-based step number
        step: u32,
        /// 0-based output position
        output: usize,
    },
}

impl CableSource {
    /// Producing step number, if any
    #[must_use]
    pub const fn step(&self) -> Option<u32> {
        match self {
            Self::PipelineInput { .. } => None,
            Self::StepOutput { step, .. } => Some(*step),
        }
    }
}

impl std::fmt::Display for CableSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PipelineInput { idx } => write!(f, "input[{}]", idx),
            Self::StepOutput { step, output } => write!(f, "step{}.output[{}]", step, output),
        }
    }
}

/// A column as seen by one end of a wire
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    /// 1-based position
    pub idx: u32,
    /// Header name
    pub name: String,
    /// Datatype name
    pub datatype: String,
}

impl ColumnRef {
    /// Create a column reference
    #[must_use]
    pub fn new(idx: u32, name: impl Into<String>, datatype: impl Into<String>) -> Self {
        Self {
            idx,
            name: name.into(),
            datatype: datatype.into(),
        }
    }
}

/// Maps one source column to one destination column
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Wire {
    /// Column read from the source
    pub source: ColumnRef,
    /// Column written to the destination
    pub dest: ColumnRef,
}

impl Wire {
    /// Create a wire
    #[must_use]
    pub fn new(source: ColumnRef, dest: ColumnRef) -> Self {
        Self { source, dest }
    }

    /// Whether the wire keeps position and name
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.source.idx == self.dest.idx && self.source.name == self.dest.name
    }
}

/// Feeds one step input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cable {
    /// Where the data comes from
    pub source: CableSource,
    /// Column wiring; empty for a straight copy
    #[serde(default)]
    pub wires: Vec<Wire>,
}

impl Cable {
    /// A wireless cable
    #[must_use]
    pub const fn direct(source: CableSource) -> Self {
        Self {
            source,
            wires: Vec::new(),
        }
    }

    /// Add a wire
    #[must_use]
    pub fn with_wire(mut self, wire: Wire) -> Self {
        self.wires.push(wire);
        self
    }

    /// Whether the cable moves bytes unchanged
    #[must_use]
    pub fn is_trivial(&self) -> bool {
        self.wires.iter().all(Wire::is_identity)
    }

    /// Signature used for ExecRecord compatibility
    #[must_use]
    pub fn signature(&self) -> CableSignature {
        CableSignature::from_wires(&self.wires)
    }
}

/// Feeds one pipeline output from a step output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputCable {
    /// Pipeline output name
    pub name: String,
    /// Where the data comes from
    pub source: CableSource,
    /// Column wiring; empty for a straight copy
    #[serde(default)]
    pub wires: Vec<Wire>,
    /// Compound datatype of the pipeline output, `None` for raw
    #[serde(default)]
    pub compound: Option<String>,
}

impl OutputCable {
    /// A wireless output cable
    #[must_use]
    pub fn direct(name: impl Into<String>, step: u32, output: usize) -> Self {
        Self {
            name: name.into(),
            source: CableSource::StepOutput { step, output },
            wires: Vec::new(),
            compound: None,
        }
    }

    /// Set the output's compound datatype
    #[must_use]
    pub fn with_compound(mut self, compound: impl Into<String>) -> Self {
        self.compound = Some(compound.into());
        self
    }

    /// Add a wire
    #[must_use]
    pub fn with_wire(mut self, wire: Wire) -> Self {
        self.wires.push(wire);
        self
    }

    /// View as a plain cable
    #[must_use]
    pub fn as_cable(&self) -> Cable {
        Cable {
            source: self.source,
            wires: self.wires.clone(),
        }
    }
}

/// The part of a wire that matters for reuse
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WireSignature {
    /// Destination position
    pub dest_idx: u32,
    /// Destination header name
    pub dest_name: String,
    /// Source position
    pub source_idx: u32,
    /// Source datatype
    pub source_datatype: String,
}

/// Wiring summary of a cable; empty wires mean trivial
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CableSignature {
    /// Non-identity wiring sorted by destination position
    pub wires: Vec<WireSignature>,
}

impl CableSignature {
    /// Signature of a trivial cable
    #[must_use]
    pub const fn trivial() -> Self {
        Self { wires: Vec::new() }
    }

    /// Build from wires
    #[must_use]
    pub fn from_wires(wires: &[Wire]) -> Self {
        if wires.iter().all(Wire::is_identity) {
            return Self::trivial();
        }
        let mut sigs: Vec<WireSignature> = wires
            .iter()
            .map(|w| WireSignature {
                dest_idx: w.dest.idx,
                dest_name: w.dest.name.clone(),
                source_idx: w.source.idx,
                source_datatype: w.source.datatype.clone(),
            })
            .collect();
        sigs.sort();
        Self { wires: sigs }
    }

    /// Whether this is a trivial cable's signature
    #[must_use]
    pub fn is_trivial(&self) -> bool {
        self.wires.is_empty()
    }

    /// Whether an ExecRecord made by `candidate` may stand in for a run of `self`
    ///
    /// Both trivial, or the same wiring with each candidate source datatype
    /// restricting the required one.
    #[must_use]
    pub fn accepts(&self, candidate: &Self, registry: &DatatypeRegistry) -> bool {
        match (self.is_trivial(), candidate.is_trivial()) {
            (true, true) => return true,
            (true, false) | (false, true) => return false,
            (false, false) => {}
        }
        if self.wires.len() != candidate.wires.len() {
            return false;
        }
        self.wires.iter().all(|want| {
            candidate.wires.iter().any(|have| {
                have.dest_idx == want.dest_idx
                    && have.dest_name == want.dest_name
                    && have.source_idx == want.source_idx
                    && registry.is_restriction(&have.source_datatype, &want.source_datatype)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(src: u32, src_name: &str, src_dt: &str, dst: u32, dst_name: &str) -> Wire {
        Wire::new(
            ColumnRef::new(src, src_name, src_dt),
            ColumnRef::new(dst, dst_name, src_dt),
        )
    }

    fn step1() -> CableSource {
        CableSource::StepOutput { step: 1, output: 0 }
    }

    #[test]
    fn test_wireless_cable_is_trivial() {
        assert!(Cable::direct(step1()).is_trivial());
        assert!(Cable::direct(step1()).signature().is_trivial());
    }

    #[test]
    fn test_identity_wires_are_trivial() {
        let cable = Cable::direct(step1())
            .with_wire(wire(1, "a", "string", 1, "a"))
            .with_wire(wire(2, "b", "string", 2, "b"));
        assert!(cable.is_trivial());
    }

    #[test]
    fn test_rename_is_not_trivial() {
        let cable = Cable::direct(step1()).with_wire(wire(1, "a", "string", 1, "alpha"));
        assert!(!cable.is_trivial());
        assert_eq!(cable.signature().wires.len(), 1);
    }

    #[test]
    fn test_trivial_only_accepts_trivial() {
        let reg = DatatypeRegistry::with_builtins();
        let trivial = CableSignature::trivial();
        let custom = CableSignature::from_wires(&[wire(2, "b", "string", 1, "b")]);
        assert!(trivial.accepts(&trivial, &reg));
        assert!(!trivial.accepts(&custom, &reg));
        assert!(!custom.accepts(&trivial, &reg));
    }

    #[test]
    fn test_accepts_restricted_source_type() {
        let reg = DatatypeRegistry::with_builtins();
        let required = CableSignature::from_wires(&[wire(2, "b", "string", 1, "x")]);
        let narrower = CableSignature::from_wires(&[wire(2, "b", "integer", 1, "x")]);
        assert!(required.accepts(&narrower, &reg));
        assert!(!narrower.accepts(&required, &reg));
    }

    #[test]
    fn test_rejects_different_wiring() {
        let reg = DatatypeRegistry::with_builtins();
        let required = CableSignature::from_wires(&[wire(2, "b", "string", 1, "x")]);
        let renamed = CableSignature::from_wires(&[wire(2, "b", "string", 1, "y")]);
        let moved = CableSignature::from_wires(&[wire(3, "b", "string", 1, "x")]);
        assert!(!required.accepts(&renamed, &reg));
        assert!(!required.accepts(&moved, &reg));
    }

    #[test]
    fn test_source_display() {
        assert_eq!(step1().to_string(), "step1.output[0]");
        assert_eq!(CableSource::PipelineInput { idx: 2 }.to_string(), "input[2]");
        assert_eq!(CableSource::PipelineInput { idx: 2 }.step(), None);
    }
}
