use nalgebra::DVector;

use crate::errors::RhsResult;
use crate::ode_solver::problem::{OdeProblem, Tolerance};

/// `y' = -p y`, `y(0) = 1`, `p = 1`; the sensitivity `s = dy/dp` satisfies
/// `s' = -p s - y`, `s(0) = 0`, so `s(t) = -t e^{-p t}`.
pub fn decay_sensitivity_problem() -> (OdeProblem<DVector<f64>>, Vec<DVector<f64>>) {
    let problem = OdeProblem::new(
        Box::new(
            |_t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>, p: &[f64]| {
                ydot[0] = -p[0] * y[0];
                RhsResult::Ok
            },
        ),
        0.0,
        DVector::from_element(1, 1.0),
        1.0e-8,
        Tolerance::Scalar(1.0e-10),
    )
    .with_params(vec![1.0]);
    let ys0 = vec![DVector::from_element(1, 0.0)];
    (problem, ys0)
}
