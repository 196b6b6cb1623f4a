//! Small reference problems used by the integration tests and benchmarks.

pub mod cosine_quadrature;
pub mod decay_sensitivity;
pub mod exponential_decay;
pub mod harmonic_oscillator;
pub mod van_der_pol;

use crate::vector::Vector;

/// A reference trajectory: states at increasing times, with the tolerance
/// the solver output is expected to meet at each of them.
pub struct OdeSolverSolution<V: Vector> {
    pub solution_points: Vec<SolutionPoint<V>>,
}

pub struct SolutionPoint<V: Vector> {
    pub state: V,
    pub t: V::T,
}

impl<V: Vector> Default for OdeSolverSolution<V> {
    fn default() -> Self {
        Self {
            solution_points: Vec::new(),
        }
    }
}

impl<V: Vector> OdeSolverSolution<V> {
    pub fn push(&mut self, state: V, t: V::T) {
        self.solution_points.push(SolutionPoint { state, t });
    }
}
