use thiserror::Error;

use crate::extraction::ExtractedParameters;
use crate::hybrid::Termination;

#[derive(Debug, Error)]
pub enum PvError {
    #[error("logarithm argument {argument:e} is not positive at V = {voltage} V")]
    LogDomain { voltage: f64, argument: f64 },

    #[error("exponential overflow while computing {quantity}")]
    Overflow { quantity: &'static str },

    #[error("open-circuit voltage {open_circuit_voltage} V leaves fewer than two curve samples")]
    DegenerateCurve { open_circuit_voltage: f64 },

    #[error("Newton iteration did not converge after {iterations} iterations (last estimate {estimate})")]
    NewtonNotConverged { iterations: usize, estimate: f64 },

    #[error("Newton derivative vanished at x = {x}")]
    ZeroDerivative { x: f64 },

    #[error("parameter extraction did not converge ({status}) after {evaluations} evaluations: {last}")]
    ExtractionNotConverged {
        status: Termination,
        evaluations: usize,
        last: ExtractedParameters,
    },

    #[error("shading ratio {ratio} is outside [0, 1]")]
    ShadingRatioOutOfRange { ratio: f64 },

    #[error("module index {module} is out of range for a string of {modules} modules")]
    ModuleIndexOutOfRange { module: usize, modules: usize },

    #[error("module {module} appears in more than one shading group")]
    DuplicateModule { module: usize },

    #[error("shading group with ratio {ratio} lists no modules")]
    EmptyShadingGroup { ratio: f64 },

    #[error("invalid module parameters: {reason}")]
    InvalidParameters { reason: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PvError>;
