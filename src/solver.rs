use tracing::{debug, warn};

use crate::error::{PvError, Result};

pub const DEFAULT_NEWTON_TOL: f64 = 1.48e-8;
pub const DEFAULT_NEWTON_MAX_ITER: usize = 50;

/// Settings of the scalar Newton iteration. `max_iter: None` uses
/// [`DEFAULT_NEWTON_MAX_ITER`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewtonSettings {
    pub max_iter: Option<usize>,
    pub tol: f64, // absolute step tolerance
}

impl Default for NewtonSettings {
    fn default() -> Self {
        NewtonSettings { max_iter: None, tol: DEFAULT_NEWTON_TOL }
    }
}

impl NewtonSettings {
    pub fn with_max_iter(mut self, max_iter: usize) -> Self { self.max_iter = Some(max_iter); self }

    pub fn iterations(&self) -> usize {
        self.max_iter.unwrap_or(DEFAULT_NEWTON_MAX_ITER)
    }
}

/// Newton-Raphson for `f(x) = 0`. `f` returns the residual and its
/// derivative, or an error when `x` leaves the domain of the equation.
pub fn newton<F>(mut f: F, x0: f64, settings: &NewtonSettings) -> Result<f64>
where
    F: FnMut(f64) -> Result<(f64, f64)>,
{
    let max_iter = settings.iterations();
    let mut x = x0;
    for iter in 0..max_iter {
        let (fx, dfx) = f(x)?;
        if dfx == 0.0 {
            warn!("newton: derivative vanished at x={:e} (iter={})", x, iter);
            return Err(PvError::ZeroDerivative { x });
        }
        let next = x - fx / dfx;
        if !next.is_finite() {
            return Err(PvError::NewtonNotConverged { iterations: iter + 1, estimate: next });
        }
        if (next - x).abs() <= settings.tol {
            debug!("newton: x0={:e} -> x={:e} in {} iterations", x0, next, iter + 1);
            return Ok(next);
        }
        x = next;
    }

    warn!("newton: no convergence (tol={:e}, max_iter={}) -> (x={})", settings.tol, max_iter, x);
    Err(PvError::NewtonNotConverged { iterations: max_iter, estimate: x })
}
