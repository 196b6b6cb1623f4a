use num_traits::{Float, One, Zero};

use crate::errors::{LinearSolverFailure, OdeError, RhsResult};
use crate::matrix::{Matrix, MatrixFactor};
use crate::ode_solver::problem::JacFn;
use crate::scalar::Scalar;
use crate::vector::Vector;

use super::{ConvFail, LinearSolver, SetupContext, SolveContext};

/// Steps a saved Jacobian may age before it is rebuilt regardless of
/// convergence history.
const MSBJ: u64 = 50;
/// `|gamma / gamma_saved - 1|` below which a convergence failure is blamed on
/// the Jacobian rather than on the step size.
const DGMAX: f64 = 0.2;
/// Scale factor on the minimum difference-quotient increment.
const MIN_INC_MULT: f64 = 1000.0;

/// Direct dense linear solver for the Newton iteration matrix.
///
/// The Jacobian is either user-supplied or approximated column by column with
/// one-sided difference quotients; it is saved across setups and reused until
/// it ages out or a convergence failure implicates it. Each setup forms
/// `M = I - gamma * J` and LU-factors it.
pub struct DenseDirect<M: Matrix> {
    n: usize,
    jac_fn: Option<JacFn<M::V, M>>,
    saved_j: M,
    m: M,
    factor: Option<M::Factor>,
    /// Step count at last Jacobian evaluation.
    nstlj: u64,
    nje: u64,
    nfe_dq: u64,
    ytemp: M::V,
    ftemp: M::V,
}

impl<M: Matrix> DenseDirect<M> {
    pub fn new() -> Self {
        Self {
            n: 0,
            jac_fn: None,
            saved_j: M::zeros(0, 0),
            m: M::zeros(0, 0),
            factor: None,
            nstlj: 0,
            nje: 0,
            nfe_dq: 0,
            ytemp: M::V::zeros(0),
            ftemp: M::V::zeros(0),
        }
    }

    /// Use an analytic Jacobian instead of difference quotients.
    pub fn with_jacobian(mut self, jac: JacFn<M::V, M>) -> Self {
        self.jac_fn = Some(jac);
        self
    }

    /// Approximate `J` column by column: perturb one component of `y` at a
    /// time and difference the right-hand side against `fpred`.
    fn dq_jacobian(
        &mut self,
        ctx: &mut SetupContext<'_, M::V>,
    ) -> Result<(), LinearSolverFailure> {
        let uround = ctx.uround;
        let srur = uround.sqrt();
        let fnorm = ctx.fpred.wrms_norm(ctx.ewt);
        let min_inc = if fnorm != M::T::zero() {
            M::T::from_f64(MIN_INC_MULT)
                * ctx.h.abs()
                * uround
                * M::T::from_f64(self.n as f64)
                * fnorm
        } else {
            M::T::one()
        };

        self.ytemp.copy_from(ctx.ypred);
        for j in 0..self.n {
            let yj_saved = self.ytemp[j];
            let inc = (srur * yj_saved.abs()).max(min_inc / ctx.ewt[j]);
            self.ytemp[j] = yj_saved + inc;
            let retval = (ctx.rhs)(ctx.t, &self.ytemp, &mut self.ftemp);
            self.nfe_dq += 1;
            self.ytemp[j] = yj_saved;
            match retval {
                RhsResult::Ok => {}
                RhsResult::RecoverableError => return Err(LinearSolverFailure::Recoverable),
                RhsResult::NonRecoverableError => return Err(LinearSolverFailure::Unrecoverable),
            }
            let inc_inv = M::T::one() / inc;
            self.ftemp.axpy(-M::T::one(), ctx.fpred);
            self.ftemp.scale_mut(inc_inv);
            self.saved_j.set_column(j, &self.ftemp);
        }
        Ok(())
    }
}

impl<M: Matrix> Default for DenseDirect<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Matrix> LinearSolver<M::V> for DenseDirect<M> {
    fn init(&mut self, n: usize) -> Result<(), OdeError> {
        self.n = n;
        self.saved_j = M::zeros(n, n);
        self.m = M::zeros(n, n);
        self.factor = None;
        self.nstlj = 0;
        self.nje = 0;
        self.nfe_dq = 0;
        self.ytemp = M::V::zeros(n);
        self.ftemp = M::V::zeros(n);
        Ok(())
    }

    fn setup(&mut self, ctx: &mut SetupContext<'_, M::V>) -> Result<bool, LinearSolverFailure> {
        // Reuse the saved Jacobian unless it has aged out or a convergence
        // failure points at it.
        let jbad = ctx.nst == 0
            || ctx.nst > self.nstlj + MSBJ
            || (ctx.convfail == ConvFail::BadJacobian
                && (ctx.gamrat - M::T::one()).abs() < M::T::from_f64(DGMAX))
            || ctx.convfail == ConvFail::Other;

        let jcur = if jbad {
            self.nje += 1;
            self.nstlj = ctx.nst;
            if let Some(jac) = self.jac_fn.as_mut() {
                match jac(ctx.t, ctx.ypred, ctx.fpred, &mut self.saved_j) {
                    RhsResult::Ok => {}
                    RhsResult::RecoverableError => return Err(LinearSolverFailure::Recoverable),
                    RhsResult::NonRecoverableError => {
                        return Err(LinearSolverFailure::Unrecoverable)
                    }
                }
            } else {
                self.dq_jacobian(ctx)?;
            }
            true
        } else {
            false
        };

        // M = I - gamma * J
        self.m = self.saved_j.clone();
        self.m.scale_mut(-ctx.gamma);
        self.m.add_scaled_identity(M::T::one());

        match self.m.factorize() {
            Some(factor) => {
                self.factor = Some(factor);
                Ok(jcur)
            }
            // Singular iteration matrix: a smaller step changes gamma and may
            // render it regular again.
            None => Err(LinearSolverFailure::Recoverable),
        }
    }

    fn solve(&mut self, b: &mut M::V, ctx: &SolveContext<'_, M::V>) -> Result<(), LinearSolverFailure> {
        let factor = self
            .factor
            .as_ref()
            .ok_or(LinearSolverFailure::Unrecoverable)?;
        if !factor.solve_in_place(b) {
            return Err(LinearSolverFailure::Recoverable);
        }
        if ctx.apply_gamma_correction && ctx.gamrat != M::T::one() {
            b.scale_mut(M::T::from_f64(2.0) / (M::T::one() + ctx.gamrat));
        }
        Ok(())
    }

    fn jacobian_evals(&self) -> u64 {
        self.nje
    }

    fn rhs_evals(&self) -> u64 {
        self.nfe_dq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};

    fn setup_ctx<'a>(
        ypred: &'a DVector<f64>,
        fpred: &'a DVector<f64>,
        ewt: &'a DVector<f64>,
        gamma: f64,
        rhs: &'a mut dyn FnMut(f64, &DVector<f64>, &mut DVector<f64>) -> RhsResult,
    ) -> SetupContext<'a, DVector<f64>> {
        SetupContext {
            t: 0.0,
            gamma,
            gamrat: 1.0,
            h: 0.1,
            uround: f64::EPSILON,
            nst: 0,
            convfail: ConvFail::NoFailures,
            ypred,
            fpred,
            ewt,
            rhs,
        }
    }

    #[test]
    fn dq_jacobian_of_linear_system() {
        // f(y) = A y with A = [[-2, 1], [0, -3]]; the DQ Jacobian should
        // recover A and the solve should apply (I - gamma A)^{-1}.
        let a = DMatrix::from_row_slice(2, 2, &[-2.0, 1.0, 0.0, -3.0]);
        let mut rhs = {
            let a = a.clone();
            move |_t: f64, y: &DVector<f64>, out: &mut DVector<f64>| {
                let ay = &a * y;
                out.copy_from(&ay);
                RhsResult::Ok
            }
        };
        let ypred = DVector::from_vec(vec![1.0, 2.0]);
        let mut fpred = DVector::zeros(2);
        rhs(0.0, &ypred, &mut fpred);
        let ewt = DVector::from_element(2, 1.0);

        let mut solver: DenseDirect<DMatrix<f64>> = DenseDirect::new();
        solver.init(2).unwrap();
        let gamma = 0.5;
        let mut ctx = setup_ctx(&ypred, &fpred, &ewt, gamma, &mut rhs);
        let jcur = solver.setup(&mut ctx).unwrap();
        assert!(jcur);
        assert_eq!(solver.jacobian_evals(), 1);

        // Solve (I - gamma A) x = b against a dense reference solve.
        let m = DMatrix::identity(2, 2) - gamma * &a;
        let b = DVector::from_vec(vec![1.0, 1.0]);
        let expect = m.lu().solve(&b).unwrap();
        let mut x = b.clone();
        let sctx = SolveContext {
            ewt: &ewt,
            ycur: &ypred,
            fcur: &fpred,
            gamma,
            gamrat: 1.0,
            apply_gamma_correction: false,
        };
        solver.solve(&mut x, &sctx).unwrap();
        x.assert_eq(&expect, 1e-6);
    }

    #[test]
    fn saved_jacobian_is_reused() {
        let mut rhs = move |_t: f64, y: &DVector<f64>, out: &mut DVector<f64>| {
            out[0] = -y[0];
            RhsResult::Ok
        };
        let ypred = DVector::from_vec(vec![1.0]);
        let fpred = DVector::from_vec(vec![-1.0]);
        let ewt = DVector::from_element(1, 1.0);

        let mut solver: DenseDirect<DMatrix<f64>> = DenseDirect::new();
        solver.init(1).unwrap();
        {
            let mut ctx = setup_ctx(&ypred, &fpred, &ewt, 0.1, &mut rhs);
            assert!(solver.setup(&mut ctx).unwrap());
        }
        {
            // A later setup with no failures and a young Jacobian reuses it.
            let mut ctx = setup_ctx(&ypred, &fpred, &ewt, 0.2, &mut rhs);
            ctx.nst = 3;
            assert!(!solver.setup(&mut ctx).unwrap());
        }
        assert_eq!(solver.jacobian_evals(), 1);
    }
}
