use std::fmt;

use tracing::{debug, warn};

use crate::constants::{round_to, thermal_voltage, BAND_GAP, BOLTZMANN, ELECTRON_CHARGE, G_NOMINAL, T_NOMINAL};
use crate::error::{PvError, Result};
use crate::irradiance::SingleVoltageIrradianceDependence;
use crate::solver::NewtonSettings;

/// Datasheet and equivalent-circuit parameters of one module.
#[derive(Clone, PartialEq)]
pub struct ModuleParameters {
    pub short_circuit_current: f64,   // [A]
    pub open_circuit_voltage: f64,    // [V]
    pub cells_in_series: u32,         // [-]
    pub voltage_decimal_digits: u32,  // [-] sampling precision of the voltage axis
    pub temperature_voltage_coefficient: f64, // [V/degC]
    pub temperature_current_coefficient: f64, // [A/degC]
    pub series_resistance: f64,       // [Ohm]
    pub shunt_resistance: f64,        // [Ohm]
    pub diode_quality_factor: f64,    // [-]
}

impl ModuleParameters {
    pub fn new(short_circuit_current: f64, open_circuit_voltage: f64, cells_in_series: u32) -> Self {
        ModuleParameters {
            short_circuit_current,
            open_circuit_voltage,
            cells_in_series,
            voltage_decimal_digits: 1,
            temperature_voltage_coefficient: -0.123,
            temperature_current_coefficient: 0.0032,
            series_resistance: 0.221,
            shunt_resistance: 415.405,
            diode_quality_factor: 1.3,
        }
    }

    /// builders
    pub fn with_voltage_decimal_digits(mut self, digits: u32) -> Self { self.voltage_decimal_digits = digits; self }
    pub fn with_temperature_voltage_coefficient(mut self, coef: f64) -> Self { self.temperature_voltage_coefficient = coef; self }
    pub fn with_temperature_current_coefficient(mut self, coef: f64) -> Self { self.temperature_current_coefficient = coef; self }
    pub fn with_series_resistance(mut self, rs: f64) -> Self { self.series_resistance = rs; self }
    pub fn with_shunt_resistance(mut self, rsh: f64) -> Self { self.shunt_resistance = rsh; self }
    pub fn with_diode_quality_factor(mut self, n: f64) -> Self { self.diode_quality_factor = n; self }

    /// Equivalent module of `modules` identical modules in series. Cell count,
    /// open-circuit voltage and the voltage temperature coefficient scale with
    /// `modules`; resistances, quality factor and the current coefficient are
    /// kept at their single-module values.
    pub fn in_series(&self, modules: u32) -> Self {
        let m = modules as f64;
        ModuleParameters {
            open_circuit_voltage: self.open_circuit_voltage * m,
            cells_in_series: self.cells_in_series * modules,
            temperature_voltage_coefficient: self.temperature_voltage_coefficient * m,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let finite = [
            self.short_circuit_current,
            self.open_circuit_voltage,
            self.temperature_voltage_coefficient,
            self.temperature_current_coefficient,
            self.series_resistance,
            self.shunt_resistance,
            self.diode_quality_factor,
        ];
        if finite.iter().any(|v| !v.is_finite()) {
            return Err(PvError::InvalidParameters { reason: "parameters must be finite" });
        }
        if self.short_circuit_current <= 0.0 || self.open_circuit_voltage <= 0.0 {
            return Err(PvError::InvalidParameters { reason: "short-circuit current and open-circuit voltage must be positive" });
        }
        if self.cells_in_series == 0 {
            return Err(PvError::InvalidParameters { reason: "at least one cell in series is required" });
        }
        if self.series_resistance < 0.0 || self.shunt_resistance <= 0.0 {
            return Err(PvError::InvalidParameters { reason: "resistances must be positive" });
        }
        if self.diode_quality_factor <= 0.0 {
            return Err(PvError::InvalidParameters { reason: "diode quality factor must be positive" });
        }
        if self.voltage_decimal_digits > 6 {
            return Err(PvError::InvalidParameters { reason: "at most 6 voltage decimal digits are supported" });
        }
        Ok(())
    }
}

impl fmt::Debug for ModuleParameters {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{Isc={}, Voc={}, Ns={}, Rs={}, Rsh={}, n={}}}",
            self.short_circuit_current, self.open_circuit_voltage, self.cells_in_series,
            self.series_resistance, self.shunt_resistance, self.diode_quality_factor)
    }
}

/// Sampled I-V/P-V characteristic. The three sequences are index aligned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Curve {
    voltages: Vec<f64>,
    currents: Vec<f64>,
    powers: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperatingPoint {
    pub index: usize,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

impl Curve {
    /// Builds a curve from voltages and currents; powers are derived.
    pub(crate) fn from_samples(voltages: Vec<f64>, currents: Vec<f64>) -> Curve {
        debug_assert_eq!(voltages.len(), currents.len());
        let powers = voltages.iter().zip(&currents).map(|(v, i)| v * i).collect();
        Curve { voltages, currents, powers }
    }

    pub fn voltages(&self) -> &[f64] { &self.voltages }
    pub fn currents(&self) -> &[f64] { &self.currents }
    pub fn powers(&self) -> &[f64] { &self.powers }

    pub fn len(&self) -> usize { self.voltages.len() }
    pub fn is_empty(&self) -> bool { self.voltages.is_empty() }

    pub fn short_circuit_current(&self) -> f64 {
        self.currents.first().copied().unwrap_or(0.0)
    }

    pub fn open_circuit_voltage(&self) -> f64 {
        self.voltages.last().copied().unwrap_or(0.0)
    }

    /// Sample with the largest power; the first one on ties.
    pub fn maximum_power_point(&self) -> Option<OperatingPoint> {
        let (index, power) = self.powers.iter().copied().enumerate()
            .fold(None, |best: Option<(usize, f64)>, (k, p)| match best {
                Some((_, bp)) if bp >= p => best,
                _ => Some((k, p)),
            })?;
        Some(OperatingPoint { index, voltage: self.voltages[index], current: self.currents[index], power })
    }
}

/// Single-diode equivalent circuit of a module (or of a group of identical
/// modules treated as one larger module).
///
/// The diode exponent is scaled by `Ns * Vt`, where `Vt = n k T / q` is the
/// per-cell thermal voltage including the quality factor (Sera et al., 2007).
#[derive(Debug, Clone)]
pub struct SingleDiodeModel {
    params: ModuleParameters,
    solver: NewtonSettings,
    curve: Option<Curve>,
}

impl SingleDiodeModel {
    pub fn new(params: ModuleParameters) -> Result<Self> {
        params.validate()?;
        let params = ModuleParameters {
            open_circuit_voltage: round_to(params.open_circuit_voltage, params.voltage_decimal_digits),
            ..params
        };
        Ok(SingleDiodeModel { params, solver: NewtonSettings::default(), curve: None })
    }

    /// Settings of the open-circuit voltage Newton solve.
    pub fn with_solver(mut self, settings: NewtonSettings) -> Self { self.solver = settings; self }

    pub fn parameters(&self) -> &ModuleParameters { &self.params }

    /// Curve of the last successful [`calculate`](Self::calculate).
    pub fn curve(&self) -> Option<&Curve> { self.curve.as_ref() }

    /// Computes the curve at `operating_temperature` [K] and `actual_irradiance` [W/m^2].
    pub fn calculate(&mut self, operating_temperature: f64, actual_irradiance: f64) -> Result<&Curve> {
        self.curve = None;
        let p = &self.params;
        let ns = p.cells_in_series as f64;

        let nominal_vt = thermal_voltage(p.diode_quality_factor, T_NOMINAL);
        let operating_vt = thermal_voltage(p.diode_quality_factor, operating_temperature);

        let nominal_i0 = self.nominal_saturation_current(nominal_vt)?;
        let i0 = self.saturation_current(nominal_i0, operating_temperature)?;
        let iph = self.actual_short_circuit_current(operating_temperature, actual_irradiance);
        let voc = self.actual_open_circuit_voltage(nominal_i0, nominal_vt, operating_temperature, actual_irradiance)?;

        let digits = p.voltage_decimal_digits;
        let samples = (voc * 10f64.powi(digits as i32)).round();
        if !(samples >= 1.0) {
            return Err(PvError::DegenerateCurve { open_circuit_voltage: voc });
        }
        let n = samples as usize + 1;
        let last = n - 1;

        let voltages: Vec<f64> = (0..n)
            .map(|k| if k == last { voc } else { voc * k as f64 / last as f64 })
            .collect();

        let mut currents = vec![0.0; n];
        currents[0] = iph;
        let scale = ns * operating_vt;
        let mut clamped = 0;
        for k in 1..last {
            let i = diode_current(voltages[k], currents[k - 1], iph, i0, scale, p.series_resistance, p.shunt_resistance)?;
            // one-step fixed point may undershoot at low irradiance
            currents[k] = if i < 0.0 { clamped += 1; 0.0 } else { i };
        }

        debug!("SingleDiodeModel::calculate(T={}, G={}) {:?}: Isc={:.4} Voc={} samples={}",
            operating_temperature, actual_irradiance, p, iph, voc, n);
        if clamped > 0 {
            warn!("{} negative current samples clamped to 0", clamped);
        }

        Ok(self.curve.insert(Curve::from_samples(voltages, currents)))
    }

    fn nominal_saturation_current(&self, nominal_vt: f64) -> Result<f64> {
        let p = &self.params;
        let e = (p.open_circuit_voltage / (p.cells_in_series as f64 * nominal_vt)).exp();
        if !e.is_finite() {
            return Err(PvError::Overflow { quantity: "nominal saturation current" });
        }
        Ok(p.short_circuit_current / (e - 1.0))
    }

    fn saturation_current(&self, nominal_i0: f64, temperature: f64) -> Result<f64> {
        let n = self.params.diode_quality_factor;
        let band = (ELECTRON_CHARGE * BAND_GAP / (n * BOLTZMANN)) * (1.0 / T_NOMINAL - 1.0 / temperature);
        let i0 = nominal_i0 * (temperature / T_NOMINAL).powi(3) * band.exp();
        if !i0.is_finite() {
            return Err(PvError::Overflow { quantity: "saturation current" });
        }
        Ok(i0)
    }

    fn actual_short_circuit_current(&self, temperature: f64, irradiance: f64) -> f64 {
        let p = &self.params;
        (irradiance / G_NOMINAL) * (p.short_circuit_current + p.temperature_current_coefficient * (temperature - T_NOMINAL))
    }

    fn actual_open_circuit_voltage(&self, nominal_i0: f64, nominal_vt: f64, temperature: f64, irradiance: f64) -> Result<f64> {
        let p = &self.params;
        let iph = p.short_circuit_current * irradiance / G_NOMINAL;
        // the root lies below Iph Rsh; a seed past it starts outside the log domain
        let seed = p.open_circuit_voltage.min(iph * p.shunt_resistance * (1.0 - SEED_MARGIN));
        let irradiance_voc = SingleVoltageIrradianceDependence::new(iph, nominal_i0, p.shunt_resistance, p.cells_in_series, nominal_vt)
            .with_solver(self.solver)
            .calculate(seed)?;
        let voc = irradiance_voc + p.temperature_voltage_coefficient * (temperature - T_NOMINAL);
        Ok(round_to(voc, p.voltage_decimal_digits))
    }
}

const SEED_MARGIN: f64 = 1e-6;

/// One successive-substitution step of the implicit diode equation, seeded
/// with `current`.
fn diode_current(voltage: f64, current: f64, iph: f64, i0: f64, scale: f64, rs: f64, rsh: f64) -> Result<f64> {
    let vd = voltage + current * rs;
    let e = (vd / scale).exp();
    if !e.is_finite() {
        return Err(PvError::Overflow { quantity: "diode current" });
    }
    Ok(iph - i0 * (e - 1.0) - vd / rsh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn msx120() -> ModuleParameters {
        ModuleParameters::new(3.87, 42.1, 72)
            .with_temperature_voltage_coefficient(-0.08)
            .with_temperature_current_coefficient(0.065)
            .with_series_resistance(0.581350667)
            .with_shunt_resistance(1398.292572)
            .with_diode_quality_factor(1.317954479)
    }

    #[test]
    fn rounds_open_circuit_voltage_at_construction() {
        let model = SingleDiodeModel::new(ModuleParameters::new(8.21, 32.94, 10)).unwrap();
        assert_eq!(model.parameters().open_circuit_voltage, 32.9);
    }

    #[test]
    fn curve_shape_at_standard_conditions() {
        let mut model = SingleDiodeModel::new(msx120()).unwrap();
        let curve = model.calculate(T_NOMINAL, G_NOMINAL).unwrap();

        assert_eq!(curve.len(), 422);
        assert_eq!(curve.currents().len(), 422);
        assert_eq!(curve.powers().len(), 422);
        assert_eq!(curve.voltages()[0], 0.0);
        assert_eq!(curve.voltages()[421], 42.1);
        assert_eq!(curve.currents()[0], 3.87);
        assert_eq!(curve.currents()[421], 0.0);
        assert_eq!(curve.powers()[0], 0.0);
        assert_eq!(curve.powers()[421], 0.0);
        assert_relative_eq!(curve.voltages()[1], 0.1, epsilon = 1e-12);
    }

    #[test]
    fn maximum_power_point_is_inside_the_curve() {
        let mut model = SingleDiodeModel::new(msx120()).unwrap();
        let mpp = model.calculate(T_NOMINAL, G_NOMINAL).unwrap().maximum_power_point().unwrap();
        assert!(mpp.voltage > 30.0 && mpp.voltage < 38.0, "{:?}", mpp);
        assert_relative_eq!(mpp.power, mpp.voltage * mpp.current, epsilon = 1e-12);
    }

    #[test]
    fn powers_are_voltage_times_current() {
        let mut model = SingleDiodeModel::new(msx120()).unwrap();
        let curve = model.calculate(318.0, 700.0).unwrap();
        for k in 0..curve.len() {
            assert_eq!(curve.powers()[k], curve.voltages()[k] * curve.currents()[k]);
        }
    }

    #[test]
    fn recalculation_overwrites_the_curve() {
        let mut model = SingleDiodeModel::new(msx120()).unwrap();
        let bright = model.calculate(T_NOMINAL, G_NOMINAL).unwrap().len();
        let dim = model.calculate(T_NOMINAL, 200.0).unwrap().len();
        assert!(dim < bright);
        assert_eq!(model.curve().unwrap().len(), dim);
        assert_relative_eq!(model.curve().unwrap().short_circuit_current(), 3.87 * 0.2, epsilon = 1e-12);
    }

    #[test]
    fn dark_module_is_a_domain_error() {
        let mut model = SingleDiodeModel::new(msx120()).unwrap();
        let err = model.calculate(T_NOMINAL, 0.0).unwrap_err();
        assert!(matches!(err, PvError::LogDomain { .. }));
        assert!(model.curve().is_none());
    }

    #[test]
    fn overflow_propagates() {
        // a vanishing quality factor drives the nominal saturation exponent past f64::MAX
        let params = msx120().with_diode_quality_factor(1e-4);
        let mut model = SingleDiodeModel::new(params).unwrap();
        let err = model.calculate(T_NOMINAL, G_NOMINAL).unwrap_err();
        assert!(matches!(err, PvError::Overflow { .. }));
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(SingleDiodeModel::new(ModuleParameters::new(3.87, 42.1, 0)).is_err());
        assert!(SingleDiodeModel::new(msx120().with_shunt_resistance(0.0)).is_err());
        assert!(SingleDiodeModel::new(ModuleParameters::new(f64::NAN, 42.1, 72)).is_err());
    }

    #[test]
    fn series_equivalent_scales_voltage_and_cells() {
        let group = msx120().in_series(3);
        assert_eq!(group.cells_in_series, 216);
        assert_relative_eq!(group.open_circuit_voltage, 126.3, epsilon = 1e-12);
        assert_eq!(group.short_circuit_current, 3.87);
        assert_eq!(group.series_resistance, 0.581350667);
        assert_relative_eq!(group.temperature_voltage_coefficient, -0.24, epsilon = 1e-12);
    }

    #[test]
    fn deep_shade_on_a_module_group_solves() {
        // seed 126.3 V lies above Iph Rsh = 108.2 V at 20 W/m^2
        let mut model = SingleDiodeModel::new(msx120().in_series(3)).unwrap();
        let curve = model.calculate(T_NOMINAL, 20.0).unwrap();
        assert_eq!(curve.open_circuit_voltage(), 86.1);
        assert_eq!(curve.len(), 862);
        assert_relative_eq!(curve.short_circuit_current(), 3.87 * 0.02, epsilon = 1e-12);
    }

    #[test]
    fn newton_cap_applies_to_the_voltage_solve() {
        let mut model = SingleDiodeModel::new(msx120())
            .unwrap()
            .with_solver(NewtonSettings::default().with_max_iter(1));
        let err = model.calculate(T_NOMINAL, 500.0).unwrap_err();
        assert!(matches!(err, PvError::NewtonNotConverged { iterations: 1, .. }));
        assert!(model.curve().is_none());
    }

    #[test]
    fn two_decimal_digits_refine_the_grid() {
        let mut model = SingleDiodeModel::new(msx120().with_voltage_decimal_digits(2)).unwrap();
        let curve = model.calculate(T_NOMINAL, G_NOMINAL).unwrap();
        // irradiance Voc 42.081 V rounds to 42.08 V
        assert_eq!(curve.len(), 4209);
        assert_eq!(curve.open_circuit_voltage(), 42.08);
        assert_relative_eq!(curve.voltages()[1], 0.01, epsilon = 1e-12);
        for w in curve.voltages().windows(2) {
            assert_relative_eq!(w[1] - w[0], 0.01, epsilon = 1e-9);
        }
        assert_eq!(curve.currents()[4208], 0.0);
    }

    #[test]
    fn hot_module_below_one_step_is_degenerate() {
        let mut model = SingleDiodeModel::new(msx120().with_temperature_voltage_coefficient(-5.0)).unwrap();
        let err = model.calculate(308.0, G_NOMINAL).unwrap_err();
        assert!(matches!(err, PvError::DegenerateCurve { .. }));
    }
}
