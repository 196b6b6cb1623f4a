use nalgebra::DVector;

use crate::errors::RhsResult;
use crate::ode_solver::problem::{OdeProblem, Tolerance};

use super::OdeSolverSolution;

/// `y' = -y`, `y(0) = 1`: the canonical smooth non-stiff problem.
pub fn exponential_decay_problem() -> (OdeProblem<DVector<f64>>, OdeSolverSolution<DVector<f64>>)
{
    let problem = OdeProblem::new(
        Box::new(
            |_t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>, _p: &[f64]| {
                ydot[0] = -y[0];
                RhsResult::Ok
            },
        ),
        0.0,
        DVector::from_element(1, 1.0),
        1.0e-8,
        Tolerance::Scalar(1.0e-10),
    );
    let mut soln = OdeSolverSolution::default();
    for &t in &[0.25, 0.5, 0.75, 1.0] {
        soln.push(DVector::from_element(1, f64::exp(-t)), t);
    }
    (problem, soln)
}
