//! Powell's hybrid method for square systems of nonlinear equations, after
//! MINPACK `hybrd`: a dogleg step inside a scaled trust region, a
//! forward-difference Jacobian and Broyden rank-one updates between Jacobian
//! evaluations.
//!
//! The upper triangular factor `R` is kept packed by rows: row `i` holds
//! `r(i, i..n)`.

use std::fmt;

use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

const P1: f64 = 0.1;
const P5: f64 = 0.5;
const P001: f64 = 1e-3;
const P0001: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridSettings {
    pub xtol: f64,                       // relative tolerance on the scaled step bound
    pub max_evaluations: Option<usize>,  // None -> 200 * (n + 1)
    pub factor: f64,                     // initial step bound factor
    pub epsfcn: f64,                     // relative error of the function values
}

impl Default for HybridSettings {
    fn default() -> Self {
        HybridSettings { xtol: 1.49012e-8, max_evaluations: None, factor: 100.0, epsfcn: f64::EPSILON }
    }
}

impl HybridSettings {
    pub fn with_max_evaluations(mut self, max_evaluations: usize) -> Self {
        self.max_evaluations = Some(max_evaluations);
        self
    }

    pub fn evaluation_budget(&self, n: usize) -> usize {
        self.max_evaluations.unwrap_or(200 * (n + 1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The relative error between two consecutive iterates is at most `xtol`.
    Converged,
    /// The evaluation budget was used up.
    EvaluationLimit,
    /// `xtol` is too small; no further improvement of `x` is possible.
    ToleranceTooSmall,
    /// Five Jacobian evaluations without progress.
    NoProgressJacobian,
    /// Ten iterations without progress.
    NoProgress,
    /// The residual or its Jacobian is not finite at the current iterate.
    NonFinite,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            Termination::Converged => "converged",
            Termination::EvaluationLimit => "evaluation limit reached",
            Termination::ToleranceTooSmall => "tolerance too small",
            Termination::NoProgressJacobian => "no progress over the last Jacobian evaluations",
            Termination::NoProgress => "no progress over the last iterations",
            Termination::NonFinite => "non-finite residual",
        };
        write!(f, "{}", msg)
    }
}

#[derive(Debug, Clone)]
pub struct HybridSolution {
    pub x: DVector<f64>,
    pub residuals: DVector<f64>,
    pub status: Termination,
    pub evaluations: usize,
}

impl HybridSolution {
    pub fn converged(&self) -> bool {
        self.status == Termination::Converged
    }
}

/// Solves `f(x) = 0` starting from `x0`.
pub fn hybrid<F>(mut f: F, x0: &DVector<f64>, settings: &HybridSettings) -> HybridSolution
where
    F: FnMut(&DVector<f64>) -> DVector<f64>,
{
    let n = x0.len();
    let max_evaluations = settings.evaluation_budget(n);

    let mut x = x0.clone();
    let mut fvec = f(&x);
    let mut evaluations = 1;
    let mut fnorm = fvec.norm();

    let finish = |x: DVector<f64>, residuals: DVector<f64>, status: Termination, evaluations: usize| {
        if status == Termination::Converged {
            debug!("hybrid: converged to {:?} after {} evaluations", x.as_slice(), evaluations);
        } else {
            warn!("hybrid: stopped at {:?} after {} evaluations ({})", x.as_slice(), evaluations, status);
        }
        HybridSolution { x, residuals, status, evaluations }
    };

    if n == 0 || fnorm == 0.0 {
        return finish(x, fvec, Termination::Converged, evaluations);
    }
    if !fnorm.is_finite() {
        return finish(x, fvec, Termination::NonFinite, evaluations);
    }

    let mut iter = 1;
    let (mut ncsuc, mut ncfail, mut nslow1, mut nslow2) = (0, 0, 0, 0);
    let mut diag = DVector::<f64>::zeros(n);
    let mut delta = 0.0;
    let mut xnorm = 0.0;

    loop {
        let mut jeval = true;

        let mut fjac = forward_difference_jacobian(&mut f, &x, &fvec, settings.epsfcn);
        evaluations += n;
        if fjac.iter().any(|v| !v.is_finite()) {
            return finish(x, fvec, Termination::NonFinite, evaluations);
        }
        let (rdiag, acnorm) = householder_qr(&mut fjac);

        // scale by the column norms of the initial jacobian
        if iter == 1 {
            for j in 0..n {
                diag[j] = if acnorm[j] == 0.0 { 1.0 } else { acnorm[j] };
            }
            xnorm = diag.component_mul(&x).norm();
            delta = settings.factor * xnorm;
            if delta == 0.0 {
                delta = settings.factor;
            }
        }

        // qtf = Q^T fvec
        let mut qtf = fvec.clone();
        for j in 0..n {
            if fjac[(j, j)] != 0.0 {
                let mut sum = 0.0;
                for i in j..n {
                    sum += fjac[(i, j)] * qtf[i];
                }
                let temp = -sum / fjac[(j, j)];
                for i in j..n {
                    qtf[i] += fjac[(i, j)] * temp;
                }
            }
        }

        let mut r = vec![0.0; n * (n + 1) / 2];
        for j in 0..n {
            let mut l = j;
            for i in 0..j {
                r[l] = fjac[(i, j)];
                l += n - i - 1;
            }
            r[l] = rdiag[j];
        }

        accumulate_q(&mut fjac);

        for j in 0..n {
            diag[j] = diag[j].max(acnorm[j]);
        }

        loop {
            let mut step = -dogleg(n, &r, &diag, &qtf, delta);
            let trial = &x + &step;
            let pnorm = diag.component_mul(&step).norm();

            if iter == 1 {
                delta = delta.min(pnorm);
            }

            let ftrial = f(&trial);
            evaluations += 1;
            let fnorm1 = ftrial.norm();

            let actred = if fnorm1 < fnorm { 1.0 - (fnorm1 / fnorm).powi(2) } else { -1.0 };

            // predicted residual R * step + qtf
            let mut predicted = DVector::<f64>::zeros(n);
            let mut l = 0;
            for i in 0..n {
                let mut sum = 0.0;
                for j in i..n {
                    sum += r[l] * step[j];
                    l += 1;
                }
                predicted[i] = qtf[i] + sum;
            }
            let temp = predicted.norm();
            let prered = if temp < fnorm { 1.0 - (temp / fnorm).powi(2) } else { 0.0 };
            let ratio = if prered > 0.0 { actred / prered } else { 0.0 };

            if ratio < P1 {
                ncsuc = 0;
                ncfail += 1;
                delta *= P5;
            } else {
                ncfail = 0;
                ncsuc += 1;
                if ratio >= P5 || ncsuc > 1 {
                    delta = delta.max(pnorm / P5);
                }
                if (ratio - 1.0).abs() <= P1 {
                    delta = pnorm / P5;
                }
            }

            if ratio >= P0001 {
                x = trial;
                fvec = ftrial.clone();
                xnorm = diag.component_mul(&x).norm();
                fnorm = fnorm1;
                iter += 1;
            }

            nslow1 += 1;
            if actred >= P001 {
                nslow1 = 0;
            }
            if jeval {
                nslow2 += 1;
            }
            if actred >= P1 {
                nslow2 = 0;
            }

            if delta <= settings.xtol * xnorm || fnorm == 0.0 {
                return finish(x, fvec, Termination::Converged, evaluations);
            }

            let stop = if nslow1 == 10 {
                Some(Termination::NoProgress)
            } else if nslow2 == 5 {
                Some(Termination::NoProgressJacobian)
            } else if P1 * (P1 * delta).max(pnorm) <= f64::EPSILON * xnorm {
                Some(Termination::ToleranceTooSmall)
            } else if evaluations >= max_evaluations {
                Some(Termination::EvaluationLimit)
            } else {
                None
            };
            if let Some(status) = stop {
                return finish(x, fvec, status, evaluations);
            }

            if ncfail == 2 {
                break;
            }

            // broyden rank-one update of the jacobian
            let mut v = DVector::<f64>::zeros(n);
            for j in 0..n {
                let mut sum = 0.0;
                for i in 0..n {
                    sum += fjac[(i, j)] * ftrial[i];
                }
                v[j] = (sum - predicted[j]) / pnorm;
                step[j] = diag[j] * ((diag[j] * step[j]) / pnorm);
                if ratio >= P0001 {
                    qtf[j] = sum;
                }
            }

            let mut w = predicted;
            rank_one_update(n, &mut r, &step, &mut v, &mut w);
            apply_rotations(&mut fjac, &v, &w);
            let mut qtf_row = DMatrix::from_row_slice(1, n, qtf.as_slice());
            apply_rotations(&mut qtf_row, &v, &w);
            qtf.copy_from_slice(qtf_row.as_slice());

            jeval = false;
        }
    }
}

fn forward_difference_jacobian<F>(f: &mut F, x: &DVector<f64>, fvec: &DVector<f64>, epsfcn: f64) -> DMatrix<f64>
where
    F: FnMut(&DVector<f64>) -> DVector<f64>,
{
    let n = x.len();
    let eps = epsfcn.max(f64::EPSILON).sqrt();
    let mut jac = DMatrix::<f64>::zeros(fvec.len(), n);
    let mut probe = x.clone();
    for j in 0..n {
        let xj = x[j];
        let mut h = eps * xj.abs();
        if h == 0.0 {
            h = eps;
        }
        probe[j] = xj + h;
        let shifted = f(&probe);
        probe[j] = xj;
        for i in 0..fvec.len() {
            jac[(i, j)] = (shifted[i] - fvec[i]) / h;
        }
    }
    jac
}

fn column_norm(a: &DMatrix<f64>, j: usize, from: usize) -> f64 {
    (from..a.nrows()).map(|i| a[(i, j)] * a[(i, j)]).sum::<f64>().sqrt()
}

/// Householder QR without pivoting. On return the lower trapezoid of `a`
/// holds the Householder vectors; returns the diagonal of `R` and the
/// column norms of the input matrix.
fn householder_qr(a: &mut DMatrix<f64>) -> (Vec<f64>, Vec<f64>) {
    let (m, n) = a.shape();
    let acnorm: Vec<f64> = (0..n).map(|j| column_norm(a, j, 0)).collect();
    let mut rdiag = acnorm.clone();

    for j in 0..m.min(n) {
        let mut ajnorm = column_norm(a, j, j);
        if ajnorm != 0.0 {
            if a[(j, j)] < 0.0 {
                ajnorm = -ajnorm;
            }
            for i in j..m {
                a[(i, j)] /= ajnorm;
            }
            a[(j, j)] += 1.0;
            for k in (j + 1)..n {
                let mut sum = 0.0;
                for i in j..m {
                    sum += a[(i, j)] * a[(i, k)];
                }
                let temp = sum / a[(j, j)];
                for i in j..m {
                    a[(i, k)] -= temp * a[(i, j)];
                }
            }
        }
        rdiag[j] = -ajnorm;
    }
    (rdiag, acnorm)
}

/// Expands the Householder vectors left by [`householder_qr`] into `Q`.
fn accumulate_q(q: &mut DMatrix<f64>) {
    let (m, n) = q.shape();
    let minmn = m.min(n);
    for j in 1..minmn {
        for i in 0..j {
            q[(i, j)] = 0.0;
        }
    }
    let mut wa = vec![0.0; m];
    for k in (0..minmn).rev() {
        for i in k..m {
            wa[i] = q[(i, k)];
            q[(i, k)] = 0.0;
        }
        q[(k, k)] = 1.0;
        if wa[k] != 0.0 {
            for j in k..m {
                let mut sum = 0.0;
                for i in k..m {
                    sum += q[(i, j)] * wa[i];
                }
                let temp = sum / wa[k];
                for i in k..m {
                    q[(i, j)] -= temp * wa[i];
                }
            }
        }
    }
}

/// Convex combination of the Gauss-Newton and scaled gradient directions
/// minimising `|| R x - qtb ||` within `|| diag x || <= delta`.
fn dogleg(n: usize, r: &[f64], diag: &DVector<f64>, qtb: &DVector<f64>, delta: f64) -> DVector<f64> {
    let mut x = DVector::<f64>::zeros(n);

    // gauss-newton direction by back substitution
    for j in (0..n).rev() {
        let jj = j * n - j * j.saturating_sub(1) / 2;
        let mut l = jj + 1;
        let mut sum = 0.0;
        for i in (j + 1)..n {
            sum += r[l] * x[i];
            l += 1;
        }
        let mut temp = r[jj];
        if temp == 0.0 {
            let mut l = j;
            for i in 0..=j {
                temp = temp.max(r[l].abs());
                l += n - i - 1;
            }
            temp *= f64::EPSILON;
            if temp == 0.0 {
                temp = f64::EPSILON;
            }
        }
        x[j] = (qtb[j] - sum) / temp;
    }

    let qnorm = diag.component_mul(&x).norm();
    if qnorm <= delta {
        return x;
    }

    // scaled gradient direction
    let mut grad = DVector::<f64>::zeros(n);
    let mut l = 0;
    for j in 0..n {
        let temp = qtb[j];
        for i in j..n {
            grad[i] += r[l] * temp;
            l += 1;
        }
        grad[j] /= diag[j];
    }

    let gnorm = grad.norm();
    let mut sgnorm = 0.0;
    let mut alpha = delta / qnorm;
    if gnorm != 0.0 {
        for j in 0..n {
            grad[j] = (grad[j] / gnorm) / diag[j];
        }
        let mut rg = DVector::<f64>::zeros(n);
        let mut l = 0;
        for j in 0..n {
            let mut sum = 0.0;
            for i in j..n {
                sum += r[l] * grad[i];
                l += 1;
            }
            rg[j] = sum;
        }
        let temp = rg.norm();
        sgnorm = (gnorm / temp) / temp;

        alpha = 0.0;
        if sgnorm < delta {
            let bnorm = qtb.norm();
            let dq = delta / qnorm;
            let sd = sgnorm / delta;
            let mut temp = (bnorm / gnorm) * (bnorm / qnorm) * sd;
            temp = temp - dq * sd.powi(2) + ((temp - dq).powi(2) + (1.0 - dq.powi(2)) * (1.0 - sd.powi(2))).sqrt();
            alpha = (dq * (1.0 - sd.powi(2))) / temp;
        }
    }

    let temp = (1.0 - alpha) * sgnorm.min(delta);
    grad * temp + x * alpha
}

fn givens(a: f64, b: f64) -> (f64, f64, f64) {
    if a.abs() >= b.abs() {
        let tan = b / a;
        let cos = P5 / (0.25 + 0.25 * tan * tan).sqrt();
        let sin = cos * tan;
        (cos, sin, sin)
    } else {
        let cotan = a / b;
        let sin = P5 / (0.25 + 0.25 * cotan * cotan).sqrt();
        let cos = sin * cotan;
        let tau = if cos.abs() * f64::MAX > 1.0 { 1.0 / cos } else { 1.0 };
        (cos, sin, tau)
    }
}

/// Updates the packed triangular factor so that `(R + v u^T)` stays
/// triangular after the rotations recorded in `v` and `w`. Returns `true`
/// when the updated factor is singular.
fn rank_one_update(n: usize, s: &mut [f64], u: &DVector<f64>, v: &mut DVector<f64>, w: &mut DVector<f64>) -> bool {
    let last = n - 1;
    let mut jj = n * (n + 1) / 2 - 1;
    w[last] = s[jj];

    // rotate v into a multiple of the last unit vector, spiking w
    for j in (0..last).rev() {
        jj -= n - j;
        w[j] = 0.0;
        if v[j] != 0.0 {
            let (cos, sin, tau) = givens(v[last], v[j]);
            v[last] = sin * v[j] + cos * v[last];
            v[j] = tau;
            let mut l = jj;
            for i in j..n {
                let temp = cos * s[l] - sin * w[i];
                w[i] = sin * s[l] + cos * w[i];
                s[l] = temp;
                l += 1;
            }
        }
    }

    for i in 0..n {
        w[i] += v[last] * u[i];
    }

    // eliminate the spike
    let mut singular = false;
    for j in 0..last {
        if w[j] != 0.0 {
            let (cos, sin, tau) = givens(s[jj], w[j]);
            let mut l = jj;
            for i in j..n {
                let temp = cos * s[l] + sin * w[i];
                w[i] = -sin * s[l] + cos * w[i];
                s[l] = temp;
                l += 1;
            }
            w[j] = tau;
        }
        if s[jj] == 0.0 {
            singular = true;
        }
        jj += n - j;
    }

    s[jj] = w[last];
    if s[jj] == 0.0 {
        singular = true;
    }
    singular
}

fn rotation(tau: f64) -> (f64, f64) {
    if tau.abs() > 1.0 {
        let cos = 1.0 / tau;
        (cos, (1.0 - cos * cos).sqrt())
    } else {
        ((1.0 - tau * tau).sqrt(), tau)
    }
}

/// Applies the rotations recorded by [`rank_one_update`] to the columns of `a`.
fn apply_rotations(a: &mut DMatrix<f64>, v: &DVector<f64>, w: &DVector<f64>) {
    let (m, n) = a.shape();
    if n < 2 {
        return;
    }
    let last = n - 1;
    for j in (0..last).rev() {
        let (cos, sin) = rotation(v[j]);
        for i in 0..m {
            let temp = cos * a[(i, j)] - sin * a[(i, last)];
            a[(i, last)] = sin * a[(i, j)] + cos * a[(i, last)];
            a[(i, j)] = temp;
        }
    }
    for j in 0..last {
        let (cos, sin) = rotation(w[j]);
        for i in 0..m {
            let temp = cos * a[(i, j)] + sin * a[(i, last)];
            a[(i, last)] = -sin * a[(i, j)] + cos * a[(i, last)];
            a[(i, j)] = temp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn solves_linear_system() {
        let f = |x: &DVector<f64>| DVector::from_vec(vec![3.0 * x[0] + x[1] - 9.0, x[0] + 2.0 * x[1] - 8.0]);
        let sol = hybrid(f, &DVector::from_vec(vec![0.0, 0.0]), &HybridSettings::default());
        assert!(sol.converged());
        assert_abs_diff_eq!(sol.x[0], 2.0, epsilon = 1e-8);
        assert_abs_diff_eq!(sol.x[1], 3.0, epsilon = 1e-8);
    }

    #[test]
    fn solves_rosenbrock_root() {
        let f = |x: &DVector<f64>| DVector::from_vec(vec![10.0 * (x[1] - x[0] * x[0]), 1.0 - x[0]]);
        let sol = hybrid(f, &DVector::from_vec(vec![-1.2, 1.0]), &HybridSettings::default());
        assert_eq!(sol.status, Termination::Converged);
        assert_abs_diff_eq!(sol.x[0], 1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(sol.x[1], 1.0, epsilon = 1e-8);
        assert!(sol.evaluations < 100);
    }

    #[test]
    fn solves_three_unknowns() {
        let f = |x: &DVector<f64>| {
            DVector::from_vec(vec![
                x[0] * x[0] + x[1] * x[1] + x[2] * x[2] - 3.0,
                x[0] * x[1] - x[2],
                x[0] + x[1] - 2.0 * x[2],
            ])
        };
        let sol = hybrid(f, &DVector::from_vec(vec![1.5, 0.5, 0.7]), &HybridSettings::default());
        assert!(sol.converged());
        assert!(sol.residuals.norm() < 1e-8);
    }

    #[test]
    fn stops_at_evaluation_budget() {
        let f = |x: &DVector<f64>| DVector::from_vec(vec![10.0 * (x[1] - x[0] * x[0]), 1.0 - x[0]]);
        let settings = HybridSettings::default().with_max_evaluations(4);
        let sol = hybrid(f, &DVector::from_vec(vec![-1.2, 1.0]), &settings);
        assert_eq!(sol.status, Termination::EvaluationLimit);
        assert_eq!(sol.evaluations, 4);
    }

    #[test]
    fn non_finite_start_is_reported() {
        let f = |x: &DVector<f64>| DVector::from_vec(vec![1.0 / x[0]]);
        let sol = hybrid(f, &DVector::from_vec(vec![0.0]), &HybridSettings::default());
        assert_eq!(sol.status, Termination::NonFinite);
    }

    #[test]
    fn rank_one_update_keeps_triangular_product() {
        // packed R for [[2, 1, 0], [0, 3, 1], [0, 0, 4]]
        let mut r = vec![2.0, 1.0, 0.0, 3.0, 1.0, 4.0];
        let u = DVector::from_vec(vec![0.5, -1.0, 2.0]);
        let v0 = DVector::from_vec(vec![1.0, 2.0, -1.0]);
        let mut v = v0.clone();
        let mut w = DVector::<f64>::zeros(3);
        rank_one_update(3, &mut r, &u, &mut v, &mut w);

        // (R^T + u v^T) Q is the updated factor; Q drops out of S S^T
        let dense = |p: &[f64]| {
            let mut m = DMatrix::<f64>::zeros(3, 3);
            let mut l = 0;
            for i in 0..3 {
                for j in i..3 {
                    m[(i, j)] = p[l];
                    l += 1;
                }
            }
            m
        };
        let before = dense(&[2.0, 1.0, 0.0, 3.0, 1.0, 4.0]).transpose() + &u * v0.transpose();
        let after = dense(&r).transpose();
        let g0 = &before * before.transpose();
        let g1 = &after * after.transpose();
        for (a, b) in g0.iter().zip(g1.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }
}
