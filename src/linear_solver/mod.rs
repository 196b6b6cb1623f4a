use crate::errors::{LinearSolverFailure, OdeError, RhsResult};
use crate::vector::Vector;

pub mod dense;

/// Reason the integrator is asking for a fresh iteration-matrix setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvFail {
    /// First call, or the previous step succeeded: no failure forced this
    /// setup.
    NoFailures,
    /// The corrector failed to converge with what looked like stale Jacobian
    /// data.
    BadJacobian,
    /// The corrector or the error test failed for some other reason.
    Other,
}

/// Everything a linear solver may consult while (re)building the iteration
/// matrix `M = I - gamma * J`.
///
/// The integrator hands itself over piecewise on every call instead of being
/// stored inside the solver, so the solver context stays acyclic and
/// exclusively owned.
pub struct SetupContext<'a, V: Vector> {
    pub t: V::T,
    pub gamma: V::T,
    pub gamrat: V::T,
    pub h: V::T,
    pub uround: V::T,
    /// Number of steps taken so far; lets the solver age its saved Jacobian.
    pub nst: u64,
    pub convfail: ConvFail,
    /// Predicted state the matrix should be evaluated at.
    pub ypred: &'a V,
    /// `f(t, ypred)`, already evaluated by the integrator.
    pub fpred: &'a V,
    pub ewt: &'a V,
    /// Right-hand-side evaluation hook for difference-quotient Jacobians;
    /// the solver reports such calls through
    /// [`LinearSolver::rhs_evals`].
    pub rhs: &'a mut dyn FnMut(V::T, &V, &mut V) -> RhsResult,
}

/// Read-only context for a back-solve against the current iteration matrix.
pub struct SolveContext<'a, V: Vector> {
    pub ewt: &'a V,
    pub ycur: &'a V,
    pub fcur: &'a V,
    pub gamma: V::T,
    pub gamrat: V::T,
    /// True for BDF, where a stale `gamma` is compensated by scaling the
    /// solution with `2 / (1 + gamrat)`.
    pub apply_gamma_correction: bool,
}

/// Protocol between the Newton corrector and a linear solver for
/// `M x = b`, `M = I - gamma * J`, `J = df/dy`.
///
/// The integrator decides *when* to set up; the solver decides *how*, and
/// reports through the return value whether its Jacobian data was actually
/// regenerated (`Ok(true)`) or reused (`Ok(false)`).
pub trait LinearSolver<V: Vector> {
    /// One-time, per-problem preparation.
    fn init(&mut self, n: usize) -> Result<(), OdeError>;

    /// Build and factor the iteration matrix.
    fn setup(&mut self, ctx: &mut SetupContext<'_, V>) -> Result<bool, LinearSolverFailure>;

    /// Solve `M x = b`, overwriting `b` with `x`.
    fn solve(&mut self, b: &mut V, ctx: &SolveContext<'_, V>) -> Result<(), LinearSolverFailure>;

    /// Number of Jacobian constructions performed.
    fn jacobian_evals(&self) -> u64 {
        0
    }

    /// Number of right-hand-side calls made for difference-quotient Jacobian
    /// approximation.
    fn rhs_evals(&self) -> u64 {
        0
    }
}
