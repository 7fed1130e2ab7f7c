/// Residual, Jacobian and sparsity assembly of the bulk regions and the gate contacts
pub mod assembly;
/// Lumped external circuits driving an electrode
pub mod circuit;
/// JSON device descriptions
pub mod config;
/// Mesh, control volumes, regions, the FVM node graph and boundary contacts
pub mod domain;
pub mod error;
/// Vector and sparse matrix sinks
pub mod linalg;
/// Collectives and node ownership of SPMD runs
pub mod parallel;

pub use assembly::{Clock, SimulationContext, TimeScheme};
pub use circuit::{CircuitMode, ExternalCircuit, Waveform};
pub use config::SimulationConfig;
pub use domain::{
    boundary::{GateContact, GateParameters},
    mesh::{control_volume::ControlVolume, space::Symmetry, Mesh},
    region::{AdvancedModel, Region, RegionKind},
    Domain,
};
pub use error::{Error, Result};
pub use linalg::{sparse_matrix::SparseMatrix, vector::Vector, MatrixSink, VectorSink};
pub use parallel::{Communicator, NoComm, Partition, ThreadComm};
