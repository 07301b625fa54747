pub mod constants;
pub mod error;
pub mod extraction;
pub mod hybrid;
pub mod irradiance;
pub mod pvcell;
pub mod report;
pub mod series;
pub mod solver;

pub use error::{PvError, Result};
pub use extraction::{ExtractedParameters, ParameterEstimate, ParameterExtraction};
pub use irradiance::SingleVoltageIrradianceDependence;
pub use pvcell::{Curve, ModuleParameters, OperatingPoint, SingleDiodeModel};
pub use series::{MultipleModulesSingleDiodeModel, ShadingGroup};
