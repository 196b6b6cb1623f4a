use nalgebra::DVector;

use crate::errors::RhsResult;
use crate::ode_solver::problem::{OdeProblem, QuadRhsFn, Tolerance};

/// Trivial state `y' = 0` carrying a pure quadrature `yq' = cos(t)`,
/// `yq(0) = 0`, so `yq(t) = sin(t)`.
pub fn cosine_quadrature_problem() -> (
    OdeProblem<DVector<f64>>,
    QuadRhsFn<DVector<f64>>,
    DVector<f64>,
) {
    let problem = OdeProblem::new(
        Box::new(
            |_t: f64, _y: &DVector<f64>, ydot: &mut DVector<f64>, _p: &[f64]| {
                ydot[0] = 0.0;
                RhsResult::Ok
            },
        ),
        0.0,
        DVector::from_element(1, 0.0),
        1.0e-6,
        Tolerance::Scalar(1.0e-8),
    );
    let fq: QuadRhsFn<DVector<f64>> = Box::new(
        |t: f64, _y: &DVector<f64>, yqdot: &mut DVector<f64>, _p: &[f64]| {
            yqdot[0] = t.cos();
            RhsResult::Ok
        },
    );
    (problem, fq, DVector::from_element(1, 0.0))
}
