//! Curve output (CSV).

use std::io::Write;

use chrono::Local;

use crate::error::Result;
use crate::pvcell::Curve;

/// Write a curve as CSV, one row per sample.
///
/// Format:
/// ```csv
/// voltage,current,power
/// 0,3.87,0
/// 0.1,3.8699,0.38699
/// ```
pub fn write_curve_csv<W: Write>(curve: &Curve, writer: &mut W) -> Result<()> {
    writeln!(writer, "voltage,current,power")?;
    for ((v, i), p) in curve.voltages().iter().zip(curve.currents()).zip(curve.powers()) {
        writeln!(writer, "{},{},{}", v, i, p)?;
    }
    Ok(())
}

/// `<name>_<YYYYmmddHHMMSS>.<extension>` stamped with the local time.
pub fn timestamped_file_name(name: &str, extension: &str) -> String {
    format!("{}_{}.{}", name, Local::now().format("%Y%m%d%H%M%S"), extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_header_and_rows() {
        let curve = Curve::from_samples(vec![0.0, 0.5, 1.0], vec![2.0, 1.5, 0.0]);
        let mut out = Vec::new();
        write_curve_csv(&curve, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "voltage,current,power\n0,2,0\n0.5,1.5,0.75\n1,0,0\n");
    }

    #[test]
    fn file_name_carries_timestamp() {
        let name = timestamped_file_name("rng-100d", "csv");
        let stamp = name.strip_prefix("rng-100d_").unwrap().strip_suffix(".csv").unwrap();
        assert_eq!(stamp.len(), 14);
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
    }
}
