//! Irradiance dependence of the open-circuit voltage.
//!
//! With the terminal current set to zero the single-diode equation reduces
//! to Sera et al. (2007), eq. (23):
//!
//! `ln((Iph Rsh - V) / (I0 Rsh)) Ns Vt - V = 0`
//!
//! which is solved for `V` by Newton's method.

use crate::error::{PvError, Result};
use crate::solver::{newton, NewtonSettings};

#[derive(Debug, Clone, PartialEq)]
pub struct SingleVoltageIrradianceDependence {
    photo_current: f64,      // [A]
    saturation_current: f64, // [A]
    shunt_resistance: f64,   // [Ohm]
    cells_in_series: f64,    // [-]
    thermal_voltage: f64,    // [V] per cell, quality factor included
    solver: NewtonSettings,
}

impl SingleVoltageIrradianceDependence {
    pub fn new(
        photo_current: f64,
        saturation_current: f64,
        shunt_resistance: f64,
        cells_in_series: u32,
        thermal_voltage: f64,
    ) -> Self {
        SingleVoltageIrradianceDependence {
            photo_current,
            saturation_current,
            shunt_resistance,
            cells_in_series: cells_in_series as f64,
            thermal_voltage,
            solver: NewtonSettings::default(),
        }
    }

    pub fn with_solver(mut self, settings: NewtonSettings) -> Self { self.solver = settings; self }

    /// Open-circuit voltage for the stored photo current, seeded at `voltage_estimate`.
    pub fn calculate(&self, voltage_estimate: f64) -> Result<f64> {
        newton(|v| self.residual(v), voltage_estimate, &self.solver)
    }

    fn residual(&self, v: f64) -> Result<(f64, f64)> {
        let headroom = self.photo_current * self.shunt_resistance - v;
        let argument = headroom / (self.saturation_current * self.shunt_resistance);
        if !(argument > 0.0) {
            return Err(PvError::LogDomain { voltage: v, argument });
        }
        let scale = self.cells_in_series * self.thermal_voltage;
        Ok((argument.ln() * scale - v, -scale / headroom - 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{thermal_voltage, T_NOMINAL};
    use approx::assert_abs_diff_eq;

    const VOC: f64 = 42.1;

    fn warm_module() -> SingleVoltageIrradianceDependence {
        SingleVoltageIrradianceDependence::new(3.895, 4.00e-7, 1365.0, 72, 0.0345)
    }

    #[test]
    fn warm_module_loses_voltage() {
        let v = warm_module().calculate(VOC).unwrap();
        assert!(v <= VOC);
        assert_abs_diff_eq!(v, 39.953, epsilon = 0.001);
    }

    #[test]
    fn voltage_grows_with_irradiance() {
        let isc = 3.87;
        let vt = thermal_voltage(1.318, T_NOMINAL);
        let i0 = isc / ((VOC / (72.0 * vt)).exp() - 1.0);

        let mut previous = 0.0;
        for g in [200.0, 500.0, 800.0, 1000.0, 1200.0] {
            let iph = isc * g / 1000.0;
            let v = SingleVoltageIrradianceDependence::new(iph, i0, 1398.0, 72, vt).calculate(VOC).unwrap();
            if g < 1000.0 {
                assert!(v <= VOC, "G={g}: {v}");
            }
            assert!(v > previous, "G={g}: {v} <= {previous}");
            previous = v;
        }
    }

    #[test]
    fn non_positive_log_argument_is_a_domain_error() {
        // Iph Rsh = 0.1 V, far below the seed
        let dependence = SingleVoltageIrradianceDependence::new(1e-4, 4.00e-7, 1000.0, 72, 0.0345);
        let err = dependence.calculate(VOC).unwrap_err();
        assert!(matches!(err, PvError::LogDomain { .. }));
    }

    #[test]
    fn iteration_cap_is_honoured() {
        let dependence = warm_module().with_solver(NewtonSettings::default().with_max_iter(1));
        let err = dependence.calculate(VOC).unwrap_err();
        assert!(matches!(err, PvError::NewtonNotConverged { iterations: 1, .. }));
    }
}
