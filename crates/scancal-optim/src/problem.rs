//! Problem abstraction and solve options.

use nalgebra::{DMatrix, DVector};
use scancal_core::Real;

/// Dense nonlinear least-squares problem.
///
/// Implementations provide residuals; the Jacobian defaults to central
/// finite differences, which is accurate enough for the smooth reprojection
/// problems solved here.
pub trait NllsProblem {
    /// Number of parameters in the optimization vector.
    fn num_params(&self) -> usize;
    /// Number of residual rows in the problem.
    fn num_residuals(&self) -> usize;

    /// Residuals for the current parameters.
    fn residuals(&self, x: &DVector<Real>) -> DVector<Real>;

    /// Jacobian for the current parameters.
    fn jacobian(&self, x: &DVector<Real>) -> DMatrix<Real>
    where
        Self: Sized,
    {
        numeric_jacobian(self, x)
    }
}

/// Central finite-difference Jacobian of `problem` at `x`.
pub fn numeric_jacobian<P: NllsProblem + ?Sized>(problem: &P, x: &DVector<Real>) -> DMatrix<Real> {
    let m = problem.num_residuals();
    let n = problem.num_params();
    let mut jac = DMatrix::<Real>::zeros(m, n);
    let mut probe = x.clone();

    for col in 0..n {
        let step = 1e-6 * x[col].abs().max(1.0);
        probe[col] = x[col] + step;
        let plus = problem.residuals(&probe);
        probe[col] = x[col] - step;
        let minus = problem.residuals(&probe);
        probe[col] = x[col];

        let scale = 0.5 / step;
        for row in 0..m {
            jac[(row, col)] = (plus[row] - minus[row]) * scale;
        }
    }
    jac
}

#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    /// Maximum number of solver iterations before termination.
    ///
    /// The LM backend follows the MINPACK convention and treats this as a
    /// function-evaluation patience.
    pub max_iters: usize,
    /// Relative tolerance on the objective (cost) reduction.
    pub ftol: Real,
    /// Orthogonality/gradient tolerance.
    pub gtol: Real,
    /// Relative tolerance on parameter updates.
    pub xtol: Real,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            max_iters: 200,
            ftol: 1e-10,
            gtol: 1e-10,
            xtol: 1e-10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SolveReport {
    pub iterations: usize,
    pub final_cost: Real,
    pub converged: bool,
}

pub trait NllsSolverBackend {
    fn solve<P: NllsProblem>(
        &self,
        problem: &P,
        x0: DVector<Real>,
        opts: &SolveOptions,
    ) -> (DVector<Real>, SolveReport);
}
