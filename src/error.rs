use thiserror::Error;

/// Errors reported by geometry building, equation numbering and assembly
///
/// None of these are recoverable locally: they indicate a corrupt mesh, a region/boundary
/// configuration mismatch or a driver calling assembly before numbering. The outer solver
/// is expected to abort the run when it receives one.
#[derive(Debug, Error)]
pub enum Error {
    #[error("element {elem} is degenerate (circumcircle determinant {det:e})")]
    DegenerateElement { elem: usize, det: f64 },

    #[error("element {elem} has {count} edges flagged obtuse; cannot truncate its control volume")]
    MultipleObtuseEdges { elem: usize, count: usize },

    #[error("element {elem}: partial volumes sum to {sum:e} but the element volume is {volume:e}")]
    VolumeMismatch { elem: usize, sum: f64, volume: f64 },

    #[error("{equation} reached a {kind} region ('{region}') it has no equations for")]
    UnexpectedRegion {
        equation: String,
        region: String,
        kind: String,
    },

    #[error("boundary '{boundary}' node {node} has no insulator region to reference")]
    MissingReferenceRegion { boundary: String, node: usize },

    #[error("{0} was used before equation numbering assigned its offset")]
    UnassignedOffset(String),

    #[error("region '{region}' does not solve for {variable}")]
    MissingVariable { region: String, variable: String },

    #[error("entry ({row}, {col}) was not reserved in the sparsity pattern")]
    PatternViolation { row: usize, col: usize },

    #[error("cannot {attempted} values while the sink holds un-assembled {pending} values")]
    ModeConflict {
        attempted: &'static str,
        pending: &'static str,
    },

    #[error("index {index} exceeds dimension {dimension}")]
    OutOfBounds { index: usize, dimension: usize },

    #[error("mesh error: {0}")]
    Mesh(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
