//! Nonlinear correctors for the implicit step equation.
//!
//! With the predictor loaded into the history, the corrected solution solves
//! `y - zhat[0] - rl1 * (h f(t, y) - zhat[1]) = 0` in the correction
//! `Delta = y - zhat[0]`. Fixed-point iteration applies the right-hand side
//! directly; Newton iteration solves against `M = I - gamma J` through the
//! attached linear solver. Both estimate a linear convergence rate from the
//! last two increments and weight the convergence test with it.

use num_traits::{Float, One, Zero};

use crate::errors::{LinearSolverFailure, OdeError, RhsResult};
use crate::linear_solver::{ConvFail, SetupContext, SolveContext};
use crate::scalar::Scalar;
use crate::vector::Vector;

use super::sensitivity::{self, SensMethod};
use super::solver::{IterKind, Method, OdeSolver, CRDOWN, DGMAX, MSBP, RDIV};

/// What happened on the previous attempt at this step; feeds the Jacobian
/// setup decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PrevFlag {
    FirstCall,
    PrevConvFail,
    PrevErrFail,
}

/// Recoverable corrector failure kinds; each maps to its own repeated-failure
/// error and counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NlsFail {
    Conv,
    Rhs,
    QuadRhs,
    SensRhs,
    SensConv,
}

/// `Ok(())` converged; `Err` is a recoverable failure the step loop absorbs.
pub(crate) type NlsResult = Result<(), NlsFail>;

enum IterOutcome {
    Converged,
    /// Retry the whole solve after a fresh Jacobian setup.
    TryAgain,
    Fail(NlsFail),
}

impl<V: Vector> OdeSolver<V> {
    /// Solve the nonlinear step equation at the current prediction.
    pub(crate) fn nonlinear_solve(&mut self, prev: PrevFlag) -> Result<NlsResult, OdeError> {
        match self.iter {
            IterKind::Functional => self.nls_functional(),
            IterKind::Newton => self.nls_newton(prev),
        }
    }

    fn simultaneous_sens(&self) -> bool {
        self.sens
            .as_ref()
            .map(|s| s.ism == SensMethod::Simultaneous)
            .unwrap_or(false)
    }

    /// Evaluate the state right-hand side at (`t`, `ycur`) into `self.tempv`
    /// (functional) keeping the failure recoverable.
    fn eval_f_into_tempv(&mut self, use_predicted: bool) -> Result<Result<(), NlsFail>, OdeError> {
        let f = self.f.as_mut().expect("initialized");
        self.nfe += 1;
        let ycur = if use_predicted { &self.zn[0] } else { &self.y };
        match f(self.tn, ycur, &mut self.tempv, &self.params) {
            RhsResult::Ok => Ok(Ok(())),
            RhsResult::RecoverableError => Ok(Err(NlsFail::Rhs)),
            RhsResult::NonRecoverableError => Err(OdeError::RhsFailed {
                t: self.tn.as_f64(),
            }),
        }
    }

    /// Fixed-point iteration on `y := zhat[0] + rl1 (h f(t, y) - zhat[1])`,
    /// with the sensitivities folded in for the simultaneous method.
    fn nls_functional(&mut self) -> Result<NlsResult, OdeError> {
        let one = V::T::one();
        let zero = V::T::zero();
        let do_sens = self.simultaneous_sens();

        self.conv_rate = one;
        self.acor.fill(zero);
        self.y.copy_from(&self.zn[0]);
        if do_sens {
            let sens = self.sens.as_mut().expect("simultaneous");
            for i in 0..sens.ns {
                sens.acors[i].fill(zero);
                sens.ys[i].copy_from(&sens.zns[i][0]);
            }
        }
        if let Err(fail) = self.eval_f_into_tempv(true)? {
            return Ok(Err(fail));
        }
        if do_sens {
            if let Err(fail) = self.sens_rhs_current()? {
                return Ok(Err(fail));
            }
        }

        let mut m: usize = 0;
        let mut delp = zero;
        loop {
            // Correct y directly from the last f value.
            self.tempv.scale_mut(self.h);
            self.tempv.axpy(-one, &self.zn[1]);
            self.tempv.scale_mut(self.rl1);
            self.y.linear_sum(one, &self.zn[0], one, &self.tempv);

            // The norm of the increment between successive corrections
            // drives the convergence test.
            self.acor.scale_mut(-one);
            self.acor.axpy(one, &self.tempv);
            let del = self.acor.wrms_norm(&self.ewt);
            self.acor.copy_from(&self.tempv);

            let mut del_all = del;
            if do_sens {
                let (rl1, h) = (self.rl1, self.h);
                let sens = self.sens.as_mut().expect("simultaneous");
                for i in 0..sens.ns {
                    let tv = &mut sens.tempvs[i];
                    tv.scale_mut(h);
                    tv.axpy(-one, &sens.zns[i][1]);
                    tv.scale_mut(rl1);
                    sens.ys[i].linear_sum(one, &sens.zns[i][0], one, &sens.tempvs[i]);
                    sens.acors[i].scale_mut(-one);
                    sens.acors[i].axpy(one, &sens.tempvs[i]);
                    let ds = sens.acors[i].wrms_norm(&sens.ewts[i]);
                    if ds > del_all {
                        del_all = ds;
                    }
                    sens.acors[i].copy_from(&sens.tempvs[i]);
                }
            }

            if m > 0 {
                self.conv_rate = (V::T::from_f64(CRDOWN) * self.conv_rate).max(del_all / delp);
            }
            let dcon = del_all * one.min(self.conv_rate) / self.tq[4];
            if dcon <= one {
                self.acnrm = if m == 0 {
                    del
                } else {
                    self.acor.wrms_norm(&self.ewt)
                };
                self.fold_sens_acnrm(do_sens, m == 0, del_all);
                return Ok(Ok(()));
            }

            m += 1;
            if m == self.maxcor || (m >= 2 && del_all > V::T::from_f64(RDIV) * delp) {
                return Ok(Err(NlsFail::Conv));
            }
            delp = del_all;

            if let Err(fail) = self.eval_f_into_tempv(false)? {
                return Ok(Err(fail));
            }
            if do_sens {
                if let Err(fail) = self.sens_rhs_current()? {
                    return Ok(Err(fail));
                }
            }
        }
    }

    /// Newton iteration: decide whether to refresh the iteration matrix,
    /// then run the inner solve, retrying once with a forced setup when the
    /// Jacobian data was stale.
    fn nls_newton(&mut self, prev: PrevFlag) -> Result<NlsResult, OdeError> {
        let one = V::T::one();
        let zero = V::T::zero();
        let do_sens = self.simultaneous_sens();

        let mut convfail = match prev {
            PrevFlag::FirstCall | PrevFlag::PrevErrFail => ConvFail::NoFailures,
            PrevFlag::PrevConvFail => ConvFail::Other,
        };
        let mut call_setup = matches!(prev, PrevFlag::PrevConvFail | PrevFlag::PrevErrFail)
            || self.nst == 0
            || self.nst >= self.nstlp + MSBP
            || (self.gamrat - one).abs() > V::T::from_f64(DGMAX)
            || self.force_setup;

        loop {
            self.acor.fill(zero);
            self.y.copy_from(&self.zn[0]);
            if do_sens {
                let sens = self.sens.as_mut().expect("simultaneous");
                for i in 0..sens.ns {
                    sens.acors[i].fill(zero);
                    sens.ys[i].copy_from(&sens.zns[i][0]);
                }
            }

            // f at the predicted state, into ftemp.
            {
                let f = self.f.as_mut().expect("initialized");
                self.nfe += 1;
                match f(self.tn, &self.zn[0], &mut self.ftemp, &self.params) {
                    RhsResult::Ok => {}
                    RhsResult::RecoverableError => return Ok(Err(NlsFail::Rhs)),
                    RhsResult::NonRecoverableError => {
                        return Err(OdeError::RhsFailed {
                            t: self.tn.as_f64(),
                        })
                    }
                }
            }
            if do_sens {
                if let Err(fail) = self.sens_rhs_current()? {
                    return Ok(Err(fail));
                }
            }

            if call_setup {
                let setup_result = {
                    let tn = self.tn;
                    let gamma = self.gamma;
                    let gamrat = self.gamrat;
                    let h = self.h;
                    let uround = self.uround;
                    let nst = self.nst;
                    let Self {
                        f,
                        params,
                        lsolver,
                        zn,
                        ftemp,
                        ewt,
                        ..
                    } = self;
                    let f = f.as_mut().expect("initialized");
                    let mut rhs =
                        |t: V::T, y: &V, out: &mut V| -> RhsResult { f(t, y, out, params) };
                    let mut ctx = SetupContext {
                        t: tn,
                        gamma,
                        gamrat,
                        h,
                        uround,
                        nst,
                        convfail,
                        ypred: &zn[0],
                        fpred: ftemp,
                        ewt,
                        rhs: &mut rhs,
                    };
                    lsolver
                        .as_mut()
                        .expect("Newton iteration requires a linear solver")
                        .setup(&mut ctx)
                };
                self.nsetups += 1;
                call_setup = false;
                self.force_setup = false;
                self.gamrat = one;
                self.conv_rate = one;
                self.gammap = self.gamma;
                self.nstlp = self.nst;
                match setup_result {
                    Ok(jcur) => self.jcur = jcur,
                    Err(LinearSolverFailure::Recoverable) => return Ok(Err(NlsFail::Conv)),
                    Err(LinearSolverFailure::Unrecoverable) => {
                        return Err(OdeError::SetupFailure {
                            t: self.tn.as_f64(),
                        })
                    }
                }
            }

            match self.newton_iteration(do_sens)? {
                IterOutcome::Converged => return Ok(Ok(())),
                IterOutcome::TryAgain => {
                    call_setup = true;
                    convfail = ConvFail::BadJacobian;
                    continue;
                }
                IterOutcome::Fail(fail) => return Ok(Err(fail)),
            }
        }
    }

    /// The inner Newton loop: residual, back-solve, update, convergence test.
    fn newton_iteration(&mut self, do_sens: bool) -> Result<IterOutcome, OdeError> {
        let one = V::T::one();
        let zero = V::T::zero();
        let mut m: usize = 0;
        let mut delp = zero;

        loop {
            // b = gamma f(t, y) - (rl1 zhat[1] + Delta)
            self.tempv.linear_sum(self.rl1, &self.zn[1], one, &self.acor);
            self.tempv.scale_mut(-one);
            self.tempv.axpy(self.gamma, &self.ftemp);

            self.nni += 1;
            let solve_result = {
                let ctx = SolveContext {
                    ewt: &self.ewt,
                    ycur: &self.y,
                    fcur: &self.ftemp,
                    gamma: self.gamma,
                    gamrat: self.gamrat,
                    apply_gamma_correction: self.method == Method::Bdf,
                };
                self.lsolver
                    .as_mut()
                    .expect("Newton iteration requires a linear solver")
                    .solve(&mut self.tempv, &ctx)
            };
            match solve_result {
                Ok(()) => {}
                Err(LinearSolverFailure::Recoverable) => {
                    if !self.jcur {
                        return Ok(IterOutcome::TryAgain);
                    }
                    return Ok(IterOutcome::Fail(NlsFail::Conv));
                }
                Err(LinearSolverFailure::Unrecoverable) => {
                    return Err(OdeError::SolveFailure {
                        t: self.tn.as_f64(),
                    })
                }
            }

            let del = self.tempv.wrms_norm(&self.ewt);
            self.acor.axpy(one, &self.tempv);
            self.y.linear_sum(one, &self.zn[0], one, &self.acor);

            let mut del_all = del;
            if do_sens {
                match self.sens_newton_update()? {
                    Ok(ds) => {
                        if ds > del_all {
                            del_all = ds;
                        }
                    }
                    Err(out) => return Ok(out),
                }
            }

            if m > 0 {
                self.conv_rate = (V::T::from_f64(CRDOWN) * self.conv_rate).max(del_all / delp);
            }
            let dcon = del_all * one.min(self.conv_rate) / self.tq[4];
            if dcon <= one {
                self.acnrm = if m == 0 {
                    del
                } else {
                    self.acor.wrms_norm(&self.ewt)
                };
                self.fold_sens_acnrm(do_sens, m == 0, del_all);
                self.jcur = false;
                return Ok(IterOutcome::Converged);
            }

            m += 1;
            if m == self.maxcor || (m >= 2 && del_all > V::T::from_f64(RDIV) * delp) {
                if !self.jcur {
                    return Ok(IterOutcome::TryAgain);
                }
                return Ok(IterOutcome::Fail(NlsFail::Conv));
            }
            delp = del_all;

            {
                let f = self.f.as_mut().expect("initialized");
                self.nfe += 1;
                match f(self.tn, &self.y, &mut self.ftemp, &self.params) {
                    RhsResult::Ok => {}
                    RhsResult::RecoverableError => {
                        if !self.jcur {
                            return Ok(IterOutcome::TryAgain);
                        }
                        return Ok(IterOutcome::Fail(NlsFail::Rhs));
                    }
                    RhsResult::NonRecoverableError => {
                        return Err(OdeError::RhsFailed {
                            t: self.tn.as_f64(),
                        })
                    }
                }
            }
            if do_sens {
                if let Err(fail) = self.sens_rhs_current()? {
                    return Ok(IterOutcome::Fail(fail));
                }
            }
        }
    }

    /// Per-sensitivity Newton update for the simultaneous method: solve with
    /// the state iteration matrix, accumulate corrections, return the max
    /// increment norm.
    fn sens_newton_update(&mut self) -> Result<Result<V::T, IterOutcome>, OdeError> {
        let one = V::T::one();
        let (rl1, gamma, gamrat) = (self.rl1, self.gamma, self.gamrat);
        let bdf = self.method == Method::Bdf;
        let jcur = self.jcur;
        let tn = self.tn;
        let Self {
            lsolver,
            sens,
            ewt,
            y,
            ftemp,
            ..
        } = self;
        let sens = sens.as_mut().expect("simultaneous");
        let lsolver = lsolver
            .as_mut()
            .expect("Newton iteration requires a linear solver");
        let mut del_max = V::T::zero();
        for i in 0..sens.ns {
            let b = &mut sens.tempvs[i];
            // b currently holds fS_i; turn it into the sensitivity residual.
            b.scale_mut(gamma);
            b.axpy(-rl1, &sens.zns[i][1]);
            b.axpy(-one, &sens.acors[i]);
            let ctx = SolveContext {
                ewt,
                ycur: y,
                fcur: ftemp,
                gamma,
                gamrat,
                apply_gamma_correction: bdf,
            };
            match lsolver.solve(b, &ctx) {
                Ok(()) => {}
                Err(LinearSolverFailure::Recoverable) => {
                    if !jcur {
                        return Ok(Err(IterOutcome::TryAgain));
                    }
                    return Ok(Err(IterOutcome::Fail(NlsFail::SensConv)));
                }
                Err(LinearSolverFailure::Unrecoverable) => {
                    return Err(OdeError::SolveFailure { t: tn.as_f64() })
                }
            }
            let ds = b.wrms_norm(&sens.ewts[i]);
            if ds > del_max {
                del_max = ds;
            }
            sens.acors[i].axpy(one, &sens.tempvs[i]);
            sens.ys[i].linear_sum(one, &sens.zns[i][0], one, &sens.acors[i]);
        }
        Ok(Ok(del_max))
    }

    /// Fold the sensitivity corrections into `acnrm` when they participate
    /// in the error test.
    fn fold_sens_acnrm(&mut self, do_sens: bool, first_iter: bool, del_all: V::T) {
        if !do_sens {
            return;
        }
        let err_con = self.sens.as_ref().map(|s| s.err_con).unwrap_or(false);
        if !err_con {
            return;
        }
        if first_iter {
            self.acnrm = del_all.max(self.acnrm);
            return;
        }
        let sens = self.sens.as_ref().expect("simultaneous");
        let mut acnrm = self.acnrm;
        for i in 0..sens.ns {
            let ns = sens.acors[i].wrms_norm(&sens.ewts[i]);
            if ns > acnrm {
                acnrm = ns;
            }
        }
        self.acnrm = acnrm;
    }

    /// Sensitivity right-hand sides at the current iterate (`self.y`,
    /// `self.ys`), with the state derivative taken from `tempv` (functional)
    /// or `ftemp` (Newton). Results land in `sens.tempvs`.
    pub(crate) fn sens_rhs_current(&mut self) -> Result<NlsResult, OdeError> {
        let ydot_is_tempv = self.iter == IterKind::Functional;
        let tn = self.tn;
        let rtol = self.rtol;
        let uround = self.uround;
        let Self {
            f,
            params,
            sens,
            y,
            tempv,
            ftemp,
            ewt,
            ..
        } = self;
        let sens = sens.as_mut().expect("sensitivities active");
        let f = f.as_mut().expect("initialized");
        let ydot = if ydot_is_tempv { &*tempv } else { &*ftemp };
        match sensitivity::eval_sens_rhs(sens, f, params, tn, y, ydot, ewt, rtol, uround) {
            RhsResult::Ok => Ok(Ok(())),
            RhsResult::RecoverableError => Ok(Err(NlsFail::SensRhs)),
            RhsResult::NonRecoverableError => Err(OdeError::SensRhsFailed { t: tn.as_f64() }),
        }
    }
}
