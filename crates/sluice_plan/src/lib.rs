//! SLUICE Pipeline Graph
//!
//! Immutable read model of a pipeline: typed inputs, numbered steps running
//! methods, and the cables that wire step outputs to step inputs. Also holds
//! the datatype restriction lattice and the checks run before execution.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cable;
pub mod datatype;
pub mod graph;
pub mod method;
pub mod rows;
pub mod validate;

pub use cable::{Cable, CableSignature, CableSource, ColumnRef, OutputCable, Wire, WireSignature};
pub use datatype::{BuiltinType, ColumnSpec, CompoundDatatype, Datatype, DatatypeRegistry};
pub use graph::{PipelineGraph, PipelineStep, XputSpec};
pub use method::{Computation, DependencySpec, MethodSpec};
pub use rows::RowBounds;
pub use validate::{ValidationError, Validator};
