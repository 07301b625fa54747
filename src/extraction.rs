//! Series resistance, shunt resistance and diode quality factor from
//! datasheet values.
//!
//! The three unknowns `(Rs, Rsh, Vt)` solve equations (12), (18) and (19) of
//! D. Sera, R. Teodorescu and P. Rodriguez, "PV panel model based on datasheet
//! values", ISIE 2007: the I-V relation at the maximum power point, `dP/dV = 0`
//! there, and `dI/dV = -1/Rsh` at short circuit.

use std::fmt;

use nalgebra::DVector;
use tracing::{debug, info};

use crate::constants::{quality_factor, thermal_voltage, T_NOMINAL};
use crate::error::{PvError, Result};
use crate::hybrid::{hybrid, HybridSettings};

/// Starting point of the extraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterEstimate {
    pub series_resistance: f64,    // [Ohm]
    pub shunt_resistance: f64,     // [Ohm]
    pub diode_quality_factor: f64, // [-]
}

impl Default for ParameterEstimate {
    fn default() -> Self {
        ParameterEstimate { series_resistance: 1.0, shunt_resistance: 1000.0, diode_quality_factor: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedParameters {
    pub series_resistance: f64,
    pub shunt_resistance: f64,
    pub thermal_voltage: f64,      // [V] per cell at the nominal temperature
    pub diode_quality_factor: f64,
    pub evaluations: usize,
}

impl fmt::Display for ExtractedParameters {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Rs={} Ohm, Rsh={} Ohm, Vt={} V, n={}",
            self.series_resistance, self.shunt_resistance, self.thermal_voltage, self.diode_quality_factor)
    }
}

#[derive(Debug, Clone)]
pub struct ParameterExtraction {
    short_circuit_current: f64,
    open_circuit_voltage: f64,
    maximum_power_point_current: f64,
    maximum_power_point_voltage: f64,
    cells_in_series: f64,
    solver: HybridSettings,
    parameters: Option<ExtractedParameters>,
}

impl ParameterExtraction {
    pub fn new(
        short_circuit_current: f64,
        open_circuit_voltage: f64,
        maximum_power_point_current: f64,
        maximum_power_point_voltage: f64,
        cells_in_series: u32,
    ) -> Self {
        ParameterExtraction {
            short_circuit_current,
            open_circuit_voltage,
            maximum_power_point_current,
            maximum_power_point_voltage,
            cells_in_series: cells_in_series as f64,
            solver: HybridSettings::default(),
            parameters: None,
        }
    }

    /// Caps the number of residual evaluations of the root finder.
    pub fn with_max_evaluations(mut self, max_evaluations: usize) -> Self {
        self.solver = self.solver.with_max_evaluations(max_evaluations);
        self
    }

    /// Result of the last converged [`calculate`](Self::calculate).
    pub fn parameters(&self) -> Option<&ExtractedParameters> { self.parameters.as_ref() }

    pub fn calculate(&mut self, estimate: ParameterEstimate) -> Result<&ExtractedParameters> {
        self.parameters = None;
        let x0 = DVector::from_vec(vec![
            estimate.series_resistance,
            estimate.shunt_resistance,
            thermal_voltage(estimate.diode_quality_factor, T_NOMINAL),
        ]);

        let solution = hybrid(|x| self.residuals(x), &x0, &self.solver);
        debug!("ParameterExtraction: residuals {:?}", solution.residuals.as_slice());

        let extracted = ExtractedParameters {
            series_resistance: solution.x[0],
            shunt_resistance: solution.x[1],
            thermal_voltage: solution.x[2],
            diode_quality_factor: quality_factor(solution.x[2]),
            evaluations: solution.evaluations,
        };
        if !solution.converged() {
            return Err(PvError::ExtractionNotConverged {
                status: solution.status,
                evaluations: solution.evaluations,
                last: extracted,
            });
        }

        info!("ParameterExtraction: {} ({} evaluations)", extracted, extracted.evaluations);
        Ok(self.parameters.insert(extracted))
    }

    fn residuals(&self, x: &DVector<f64>) -> DVector<f64> {
        let (rs, rsh, vt) = (x[0], x[1], x[2]);
        let isc = self.short_circuit_current;
        let voc = self.open_circuit_voltage;
        let impp = self.maximum_power_point_current;
        let vmpp = self.maximum_power_point_voltage;

        let a = self.cells_in_series * vt;
        let e_mpp = ((vmpp + impp * rs - voc) / a).exp();
        let e_sc = ((isc * rs - voc) / a).exp();
        let g = isc * rsh - voc + isc * rs;

        // eq. (12)
        let f1 = isc - (vmpp + impp * rs - isc * rs) / rsh - (isc - (voc - isc * rs) / rsh) * e_mpp - impp;

        // eq. (18), dP/dV = I + V dI/dV at the maximum power point
        let k_mpp = g * e_mpp / (a * rsh);
        let f2 = impp + vmpp * ((-k_mpp - 1.0 / rsh) / (1.0 + k_mpp + rs / rsh));

        // eq. (19)
        let k_sc = g * e_sc / (a * rsh);
        let f3 = (-k_sc - 1.0 / rsh) / (1.0 + k_sc + rs / rsh) + 1.0 / rsh;

        DVector::from_vec(vec![f1, f2, f3])
    }
}
