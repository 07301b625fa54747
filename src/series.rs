use std::fmt;

use tracing::{debug, trace};

use crate::error::{PvError, Result};
use crate::pvcell::{Curve, ModuleParameters, SingleDiodeModel};

/// Modules of a string sharing one partial-shading ratio (1.0 = unshaded).
#[derive(Debug, Clone, PartialEq)]
pub struct ShadingGroup {
    pub ratio: f64,
    pub modules: Vec<usize>,
}

impl ShadingGroup {
    pub fn new(ratio: f64, modules: Vec<usize>) -> Self {
        ShadingGroup { ratio, modules }
    }
}

/// Modules with the same ratio collapsed into one equivalent module.
#[derive(Clone, PartialEq)]
struct EquivalentGroup {
    ratio: f64,
    modules: u32,
}

impl fmt::Debug for EquivalentGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x@{}", self.modules, self.ratio)
    }
}

/// String of identical modules in series, each module possibly shaded.
#[derive(Debug, Clone)]
pub struct MultipleModulesSingleDiodeModel {
    params: ModuleParameters,
    modules_in_series: usize,
    curve: Option<Curve>,
}

impl MultipleModulesSingleDiodeModel {
    pub fn new(params: ModuleParameters, modules_in_series: usize) -> Result<Self> {
        params.validate()?;
        if modules_in_series == 0 {
            return Err(PvError::InvalidParameters { reason: "a string needs at least one module" });
        }
        Ok(MultipleModulesSingleDiodeModel { params, modules_in_series, curve: None })
    }

    pub fn curve(&self) -> Option<&Curve> { self.curve.as_ref() }

    /// Stitched string curve. Modules not listed in `shading_groups` are unshaded.
    pub fn calculate(
        &mut self,
        operating_temperature: f64,
        actual_irradiance: f64,
        shading_groups: Option<&[ShadingGroup]>,
    ) -> Result<&Curve> {
        self.curve = None;
        let groups = self.reduce(shading_groups.unwrap_or(&[]))?;
        debug!("MultipleModulesSingleDiodeModel::calculate(T={}, G={}) groups: {:?}",
            operating_temperature, actual_irradiance, groups);

        let mut curves: Vec<Curve> = Vec::with_capacity(groups.len());
        for group in &groups {
            let mut model = SingleDiodeModel::new(self.params.in_series(group.modules))?;
            let curve = model.calculate(operating_temperature, actual_irradiance * group.ratio)?;
            trace!("group {:?}: Isc={} Voc={} samples={}",
                group, curve.short_circuit_current(), curve.open_circuit_voltage(), curve.len());
            curves.push(curve.clone());
        }

        Ok(self.curve.insert(stitch(&curves)))
    }

    /// Validates the shading description and merges modules by ratio, sorted
    /// from the brightest group to the darkest.
    fn reduce(&self, shading_groups: &[ShadingGroup]) -> Result<Vec<EquivalentGroup>> {
        let mut assigned = vec![false; self.modules_in_series];
        let mut reduced: Vec<EquivalentGroup> = Vec::new();

        for group in shading_groups {
            if !(0.0..=1.0).contains(&group.ratio) {
                return Err(PvError::ShadingRatioOutOfRange { ratio: group.ratio });
            }
            if group.modules.is_empty() {
                return Err(PvError::EmptyShadingGroup { ratio: group.ratio });
            }
            for &module in &group.modules {
                match assigned.get_mut(module) {
                    None => return Err(PvError::ModuleIndexOutOfRange { module, modules: self.modules_in_series }),
                    Some(true) => return Err(PvError::DuplicateModule { module }),
                    Some(slot) => *slot = true,
                }
            }
            merge(&mut reduced, group.ratio, group.modules.len() as u32);
        }

        let unshaded = assigned.iter().filter(|a| !**a).count() as u32;
        if unshaded > 0 {
            merge(&mut reduced, 1.0, unshaded);
        }

        reduced.sort_by(|a, b| b.ratio.total_cmp(&a.ratio));
        Ok(reduced)
    }
}

fn merge(reduced: &mut Vec<EquivalentGroup>, ratio: f64, modules: u32) {
    match reduced.iter_mut().find(|g| g.ratio == ratio) {
        Some(g) => g.modules += modules,
        None => reduced.push(EquivalentGroup { ratio, modules }),
    }
}

/// Index in `currents` closest to `target`, first one on ties.
fn crossover_index(currents: &[f64], target: f64) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (k, i) in currents.iter().enumerate() {
        let distance = (i - target).abs();
        if distance < best_distance {
            best = k;
            best_distance = distance;
        }
    }
    best
}

/// Joins group curves (brightest first). Each group runs up to the point where
/// its current meets the next group's short-circuit current; the next group
/// continues from that voltage.
fn stitch(curves: &[Curve]) -> Curve {
    let total = curves.iter().map(Curve::len).sum();
    let mut voltages = Vec::with_capacity(total);
    let mut currents = Vec::with_capacity(total);
    let mut offset = 0.0;

    for (k, curve) in curves.iter().enumerate() {
        let end = match curves.get(k + 1) {
            Some(next) => crossover_index(curve.currents(), next.short_circuit_current()),
            None => curve.len(),
        };
        voltages.extend(curve.voltages()[..end].iter().map(|v| offset + v));
        currents.extend_from_slice(&curve.currents()[..end]);
        if end < curve.len() {
            trace!("crossover at sample {} of {} (V={})", end, curve.len(), offset + curve.voltages()[end]);
            offset += curve.voltages()[end];
        }
    }

    Curve::from_samples(voltages, currents)
}
