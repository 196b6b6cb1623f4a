use std::f64::consts::PI;

use nalgebra::DVector;

use crate::errors::RhsResult;
use crate::ode_solver::problem::{OdeProblem, Tolerance};

use super::OdeSolverSolution;

/// `y1' = y2`, `y2' = -y1`, `y(0) = (1, 0)`: energy-conserving rotation,
/// solution `(cos t, -sin t)`.
pub fn harmonic_oscillator_problem(
) -> (OdeProblem<DVector<f64>>, OdeSolverSolution<DVector<f64>>) {
    let problem = OdeProblem::new(
        Box::new(
            |_t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>, _p: &[f64]| {
                ydot[0] = y[1];
                ydot[1] = -y[0];
                RhsResult::Ok
            },
        ),
        0.0,
        DVector::from_vec(vec![1.0, 0.0]),
        1.0e-10,
        Tolerance::Scalar(1.0e-12),
    );
    let mut soln = OdeSolverSolution::default();
    for k in 1..=4 {
        let t = k as f64 * PI / 2.0;
        soln.push(DVector::from_vec(vec![t.cos(), -t.sin()]), t);
    }
    (problem, soln)
}
