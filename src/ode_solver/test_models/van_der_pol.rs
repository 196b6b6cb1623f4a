use nalgebra::{DMatrix, DVector};

use crate::errors::RhsResult;
use crate::ode_solver::problem::{JacFn, OdeProblem, Tolerance};

/// Stiff Van der Pol oscillator
/// `y1' = y2`, `y2' = mu (1 - y1^2) y2 - y1` with `mu = 1000`,
/// `y(0) = (2, 0)`.
pub fn van_der_pol_problem() -> (OdeProblem<DVector<f64>>, JacFn<DVector<f64>, DMatrix<f64>>) {
    const MU: f64 = 1000.0;
    let problem = OdeProblem::new(
        Box::new(
            |_t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>, _p: &[f64]| {
                ydot[0] = y[1];
                ydot[1] = MU * (1.0 - y[0] * y[0]) * y[1] - y[0];
                RhsResult::Ok
            },
        ),
        0.0,
        DVector::from_vec(vec![2.0, 0.0]),
        1.0e-6,
        Tolerance::Scalar(1.0e-8),
    );
    let jac: JacFn<DVector<f64>, DMatrix<f64>> = Box::new(
        |_t: f64, y: &DVector<f64>, _fy: &DVector<f64>, j: &mut DMatrix<f64>| {
            j[(0, 0)] = 0.0;
            j[(0, 1)] = 1.0;
            j[(1, 0)] = -2.0 * MU * y[0] * y[1] - 1.0;
            j[(1, 1)] = MU * (1.0 - y[0] * y[0]);
            RhsResult::Ok
        },
    );
    (problem, jac)
}
