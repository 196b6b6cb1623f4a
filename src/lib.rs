//! A variable-order, variable-step linear-multistep integrator for initial
//! value problems `y' = f(t, y)`, supporting both the Adams-Moulton family
//! (orders 1-12, non-stiff) and backward differentiation formulas
//! (orders 1-5, stiff) on a Nordsieck history representation.
//!
//! Optional subsystems ride along with the state integration:
//! - pure quadratures `q' = f_Q(t, y)`, integrated without entering the
//!   nonlinear system;
//! - forward sensitivities `s_i = dy/dp_i`, coupled to the state corrector in
//!   simultaneous or staggered fashion, with a difference-quotient fallback
//!   for the sensitivity right-hand side.
//!
//! The nonlinear corrector is either fixed-point iteration or a Newton
//! iteration backed by a pluggable [`LinearSolver`]; a dense direct solver
//! over [`nalgebra`] is bundled.
//!
//! ```no_run
//! use nordsieck::{Method, OdeSolver, RhsResult, Task, Tolerance};
//! use nalgebra::DVector;
//!
//! let mut solver = OdeSolver::new(Method::Adams);
//! solver
//!     .init(
//!         Box::new(|_t, y: &DVector<f64>, ydot: &mut DVector<f64>, _p: &[f64]| {
//!             ydot[0] = -y[0];
//!             RhsResult::Ok
//!         }),
//!         0.0,
//!         &DVector::from_element(1, 1.0),
//!         1e-8,
//!         Tolerance::Scalar(1e-10),
//!     )
//!     .unwrap();
//! let mut yout = DVector::zeros(1);
//! let (t, _) = solver.solve(1.0, &mut yout, Task::Normal).unwrap();
//! assert!((t - 1.0).abs() < 1e-12);
//! ```

pub mod errors;
pub mod linear_solver;
pub mod matrix;
pub mod ode_solver;
pub mod scalar;
pub mod vector;

pub use errors::{LinearSolverFailure, OdeError, RhsResult};
pub use linear_solver::dense::DenseDirect;
pub use linear_solver::{ConvFail, LinearSolver, SetupContext, SolveContext};
pub use matrix::{Matrix, MatrixFactor};
pub use ode_solver::problem::{
    JacFn, QuadRhsFn, RhsFn, SensRhs, SensRhs1Fn, SensRhsAllFn, Tolerance,
};
pub use ode_solver::sensitivity::SensMethod;
pub use ode_solver::solver::{IterKind, Method, OdeSolver, SolverStatus, Statistics, Task};
pub use scalar::{IndexType, Scalar};
pub use vector::Vector;
