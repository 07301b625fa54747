//! Physical constants shared by every model in the crate.

pub const BOLTZMANN: f64 = 1.38065e-23; // [J/K]
pub const ELECTRON_CHARGE: f64 = 1.602e-19; // [C]
pub const T_NOMINAL: f64 = 25.0 + 273.0; // [K] standard test condition temperature
pub const G_NOMINAL: f64 = 1000.0; // [W/m^2] standard test condition irradiance
pub const BAND_GAP: f64 = 1.12; // [eV] silicon at 25 degC

/// Thermal voltage `n k T / q` of a single cell, quality factor included.
pub fn thermal_voltage(quality_factor: f64, temperature: f64) -> f64 {
    quality_factor * BOLTZMANN * temperature / ELECTRON_CHARGE
}

/// Inverse of [`thermal_voltage`] at the nominal temperature.
pub fn quality_factor(thermal_voltage: f64) -> f64 {
    thermal_voltage * ELECTRON_CHARGE / (BOLTZMANN * T_NOMINAL)
}

/// Rounds `value` to `digits` decimal places.
pub fn round_to(value: f64, digits: u32) -> f64 {
    let scale = 10f64.powi(digits as i32);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn quality_factor_inverts_thermal_voltage() {
        let vt = thermal_voltage(1.3, T_NOMINAL);
        assert_relative_eq!(quality_factor(vt), 1.3, epsilon = 1e-12);
    }

    #[test]
    fn rounds_to_decimal_digits() {
        assert_eq!(round_to(32.9, 1), 32.9);
        assert_eq!(round_to(31.6668, 1), 31.7);
        assert_eq!(round_to(42.081, 2), 42.08);
    }
}
