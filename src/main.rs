use std::fs::File;
use std::io::{BufWriter, Write};

use clap::{Parser, Subcommand};
use pv_modeling::constants::{G_NOMINAL, T_NOMINAL};
use pv_modeling::extraction::{ParameterEstimate, ParameterExtraction};
use pv_modeling::pvcell::ModuleParameters;
use pv_modeling::report;
use pv_modeling::series::{MultipleModulesSingleDiodeModel, ShadingGroup};

/// Single-diode photovoltaic module modeling
#[derive(Parser)]
#[command(name = "pv-model", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract Rs, Rsh and the diode quality factor from datasheet values.
    #[command(name = "parameter_extraction")]
    ParameterExtraction {
        #[arg(long = "short_circuit_current")]
        short_circuit_current: f64,
        #[arg(long = "open_circuit_voltage")]
        open_circuit_voltage: f64,
        #[arg(long = "maximum_power_point_current")]
        maximum_power_point_current: f64,
        #[arg(long = "maximum_power_point_voltage")]
        maximum_power_point_voltage: f64,
        /// Accepts integral floats such as 72.0.
        #[arg(long = "number_of_cells_in_series", value_parser = parse_cell_count)]
        number_of_cells_in_series: u32,
        #[arg(long = "series_resistance_estimate", default_value_t = 1.0)]
        series_resistance_estimate: f64,
        #[arg(long = "shunt_resistance_estimate", default_value_t = 1000.0)]
        shunt_resistance_estimate: f64,
        #[arg(long = "diode_quality_factor_estimate", default_value_t = 1.0)]
        diode_quality_factor_estimate: f64,
        /// Cap on residual evaluations (default 200 * (n + 1)).
        #[arg(long = "number_of_evaluations")]
        number_of_evaluations: Option<usize>,
    },
    /// Compute the I-V/P-V curve of a string and write it as CSV.
    Curve {
        #[arg(long = "short_circuit_current")]
        short_circuit_current: f64,
        #[arg(long = "open_circuit_voltage")]
        open_circuit_voltage: f64,
        /// Accepts integral floats such as 72.0.
        #[arg(long = "number_of_cells_in_series", value_parser = parse_cell_count)]
        number_of_cells_in_series: u32,
        #[arg(long = "number_of_voltage_decimal_digits", default_value_t = 1)]
        number_of_voltage_decimal_digits: u32,
        #[arg(long = "temperature_voltage_coefficient", default_value_t = -0.123, allow_hyphen_values = true)]
        temperature_voltage_coefficient: f64,
        #[arg(long = "temperature_current_coefficient", default_value_t = 0.0032, allow_hyphen_values = true)]
        temperature_current_coefficient: f64,
        #[arg(long = "series_resistance", default_value_t = 0.221)]
        series_resistance: f64,
        #[arg(long = "shunt_resistance", default_value_t = 415.405)]
        shunt_resistance: f64,
        #[arg(long = "diode_quality_factor", default_value_t = 1.3)]
        diode_quality_factor: f64,
        /// Cell temperature [K].
        #[arg(long = "operating_temperature", default_value_t = T_NOMINAL)]
        operating_temperature: f64,
        /// Irradiance on unshaded modules [W/m^2].
        #[arg(long = "actual_irradiance", default_value_t = G_NOMINAL)]
        actual_irradiance: f64,
        #[arg(long = "number_of_modules_in_series", default_value_t = 1)]
        number_of_modules_in_series: usize,
        /// Partial shading of one module, as <module>:<ratio> (e.g. 1:0.5). Repeatable.
        #[arg(long = "shading", value_parser = parse_shading)]
        shading: Vec<ShadingGroup>,
        /// Report name; the file is <name>_<timestamp>.csv unless --output is given.
        #[arg(long, default_value = "single_diode_model")]
        name: String,
        #[arg(long)]
        output: Option<String>,
    },
}

fn parse_shading(arg: &str) -> Result<ShadingGroup, String> {
    let (module, ratio) = arg
        .split_once(':')
        .ok_or_else(|| format!("expected <module>:<ratio>, got '{}'", arg))?;
    let module: usize = module.trim().parse().map_err(|e| format!("module index '{}': {}", module, e))?;
    let ratio: f64 = ratio.trim().parse().map_err(|e| format!("shading ratio '{}': {}", ratio, e))?;
    Ok(ShadingGroup::new(ratio, vec![module]))
}

fn parse_cell_count(arg: &str) -> Result<u32, String> {
    let count: f64 = arg.trim().parse().map_err(|e| format!("cell count '{}': {}", arg, e))?;
    if count.fract() != 0.0 || !(1.0..=u32::MAX as f64).contains(&count) {
        return Err(format!("cell count '{}' is not a positive whole number", arg));
    }
    Ok(count as u32)
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::ParameterExtraction {
            short_circuit_current,
            open_circuit_voltage,
            maximum_power_point_current,
            maximum_power_point_voltage,
            number_of_cells_in_series,
            series_resistance_estimate,
            shunt_resistance_estimate,
            diode_quality_factor_estimate,
            number_of_evaluations,
        } => {
            let mut extraction = ParameterExtraction::new(
                short_circuit_current,
                open_circuit_voltage,
                maximum_power_point_current,
                maximum_power_point_voltage,
                number_of_cells_in_series,
            );
            if let Some(n) = number_of_evaluations {
                extraction = extraction.with_max_evaluations(n);
            }
            let estimate = ParameterEstimate {
                series_resistance: series_resistance_estimate,
                shunt_resistance: shunt_resistance_estimate,
                diode_quality_factor: diode_quality_factor_estimate,
            };
            let p = extraction.calculate(estimate).unwrap_or_else(|e| {
                eprintln!("Parameter extraction error: {}", e);
                std::process::exit(1);
            });
            println!("series_resistance={}", p.series_resistance);
            println!("shunt_resistance={}", p.shunt_resistance);
            println!("diode_quality_factor={}", p.diode_quality_factor);
        }
        Command::Curve {
            short_circuit_current,
            open_circuit_voltage,
            number_of_cells_in_series,
            number_of_voltage_decimal_digits,
            temperature_voltage_coefficient,
            temperature_current_coefficient,
            series_resistance,
            shunt_resistance,
            diode_quality_factor,
            operating_temperature,
            actual_irradiance,
            number_of_modules_in_series,
            shading,
            name,
            output,
        } => {
            let params = ModuleParameters::new(short_circuit_current, open_circuit_voltage, number_of_cells_in_series)
                .with_voltage_decimal_digits(number_of_voltage_decimal_digits)
                .with_temperature_voltage_coefficient(temperature_voltage_coefficient)
                .with_temperature_current_coefficient(temperature_current_coefficient)
                .with_series_resistance(series_resistance)
                .with_shunt_resistance(shunt_resistance)
                .with_diode_quality_factor(diode_quality_factor);

            let mut string = MultipleModulesSingleDiodeModel::new(params, number_of_modules_in_series)
                .unwrap_or_else(|e| {
                    eprintln!("Model error: {}", e);
                    std::process::exit(1);
                });
            let shading = (!shading.is_empty()).then_some(shading.as_slice());
            let curve = string
                .calculate(operating_temperature, actual_irradiance, shading)
                .unwrap_or_else(|e| {
                    eprintln!("Curve error: {}", e);
                    std::process::exit(1);
                });

            let path = output.unwrap_or_else(|| report::timestamped_file_name(&name, "csv"));
            let file = File::create(&path).unwrap_or_else(|e| {
                eprintln!("Error creating {}: {}", path, e);
                std::process::exit(1);
            });
            let mut writer = BufWriter::new(file);
            report::write_curve_csv(curve, &mut writer)
                .and_then(|()| writer.flush().map_err(Into::into))
                .unwrap_or_else(|e| {
                    eprintln!("Output error: {}", e);
                    std::process::exit(1);
                });

            println!("file={}", path);
            println!("samples={}", curve.len());
            if let Some(mpp) = curve.maximum_power_point() {
                println!("maximum_power_point_voltage={}", mpp.voltage);
                println!("maximum_power_point_current={}", mpp.current);
                println!("maximum_power={}", mpp.power);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_count_accepts_integral_floats() {
        assert_eq!(parse_cell_count("72"), Ok(72));
        assert_eq!(parse_cell_count("72.0"), Ok(72));
        assert!(parse_cell_count("72.5").is_err());
        assert!(parse_cell_count("0").is_err());
        assert!(parse_cell_count("-36").is_err());
        assert!(parse_cell_count("NaN").is_err());
    }

    #[test]
    fn shading_argument_is_module_and_ratio() {
        assert_eq!(parse_shading("1:0.5"), Ok(ShadingGroup::new(0.5, vec![1])));
        assert!(parse_shading("1").is_err());
        assert!(parse_shading("x:0.5").is_err());
    }

    #[test]
    fn cli_parses_float_cell_count() {
        let cli = Cli::try_parse_from([
            "pv-model", "parameter_extraction",
            "--short_circuit_current", "3.87",
            "--open_circuit_voltage", "42.1",
            "--maximum_power_point_current", "3.56",
            "--maximum_power_point_voltage", "33.7",
            "--number_of_cells_in_series", "72.0",
        ])
        .unwrap();
        match cli.command {
            Command::ParameterExtraction { number_of_cells_in_series, shunt_resistance_estimate, .. } => {
                assert_eq!(number_of_cells_in_series, 72);
                assert_eq!(shunt_resistance_estimate, 1000.0);
            }
            _ => panic!("wrong subcommand"),
        }
    }
}
