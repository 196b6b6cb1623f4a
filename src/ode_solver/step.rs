//! One internal integration step: predict, correct, test, and choose the
//! next step size and order.

use num_traits::{Float, One, Zero};

use crate::errors::{OdeError, RhsResult};
use crate::scalar::Scalar;
use crate::vector::Vector;

use super::coeffs;
use super::history;
use super::nonlinear::{NlsFail, PrevFlag};
use super::sensitivity::SensMethod;
use super::solver::{
    Method, OdeSolver, ADDON, BIAS1, BIAS2, BIAS3, ETACF, ETAMIN, ETAMX2, ETAMX3, ETAMXF,
    LONG_WAIT, MXNEF1, ONEPSM, SMALL_NEF, SMALL_NST, THRESH,
};

/// Outcome of a failed local error test.
pub(crate) enum TestFail {
    /// The step was rolled back and rescaled; predict again.
    TryAgain,
    Fatal(OdeError),
}

/// Which subsystem's error test failed; selects the failure counter.
enum ErrTarget {
    State,
    Quad,
    Sens,
}

impl<V: Vector> OdeSolver<V> {
    /// Take one internal step from `tn` with step size `h`.
    ///
    /// On return the step has been accepted, the history advanced, counters
    /// updated, and the next step size and order chosen. All recoverable
    /// failures are retried internally; errors returned here are final.
    pub(crate) fn step_once(&mut self) -> Result<(), OdeError> {
        let one = V::T::one();
        let saved_t = self.tn;
        let mut ncf: u32 = 0;
        let mut nef: u32 = 0;
        let mut nefq: u32 = 0;
        let mut nefs: u32 = 0;
        let mut prev = PrevFlag::FirstCall;

        if self.nst > 0 && self.hprime != self.h {
            self.adjust_params();
        }

        let dsm = loop {
            self.predict_all();
            self.set_coefficients();

            if let Err(fail) = self.nonlinear_solve(prev)? {
                prev = self.corrector_failed(saved_t, &mut ncf, fail)?;
                continue;
            }

            // Local error test on the state (plus simultaneous sensitivities,
            // whose norm the corrector already folded into acnrm).
            let mut dsm = self.acnrm / self.tq[2];
            if dsm > one {
                match self.error_test_failed(saved_t, &mut nef, dsm, ErrTarget::State) {
                    TestFail::TryAgain => {
                        prev = PrevFlag::PrevErrFail;
                        continue;
                    }
                    TestFail::Fatal(e) => return Err(e),
                }
            }

            // Quadrature correction and optional error test.
            if self.quad.is_some() {
                match self.quad_correct() {
                    RhsResult::Ok => {}
                    RhsResult::RecoverableError => {
                        prev = self.corrector_failed(saved_t, &mut ncf, NlsFail::QuadRhs)?;
                        continue;
                    }
                    RhsResult::NonRecoverableError => {
                        return Err(OdeError::QuadRhsFailed {
                            t: self.tn.as_f64(),
                        })
                    }
                }
                if self.quad.as_ref().map(|q| q.err_con).unwrap_or(false) {
                    let acnrmq = {
                        let quad = self.quad.as_ref().expect("checked above");
                        quad.acorq.wrms_norm(&quad.ewtq)
                    };
                    let dsmq = acnrmq / self.tq[2];
                    if dsmq > one {
                        match self.error_test_failed(saved_t, &mut nefq, dsmq, ErrTarget::Quad) {
                            TestFail::TryAgain => {
                                prev = PrevFlag::PrevErrFail;
                                continue;
                            }
                            TestFail::Fatal(e) => return Err(e),
                        }
                    }
                    if dsmq > dsm {
                        dsm = dsmq;
                    }
                }
            }

            // Staggered sensitivity correction and optional error test.
            let staggered = self
                .sens
                .as_ref()
                .map(|s| s.ism != SensMethod::Simultaneous)
                .unwrap_or(false);
            if staggered {
                // The corrector needs f at the corrected state.
                let fres = {
                    let f = self.f.as_mut().expect("initialized");
                    self.nfe += 1;
                    f(self.tn, &self.y, &mut self.ftemp, &self.params)
                };
                match fres {
                    RhsResult::Ok => {}
                    RhsResult::RecoverableError => {
                        prev = self.corrector_failed(saved_t, &mut ncf, NlsFail::Rhs)?;
                        continue;
                    }
                    RhsResult::NonRecoverableError => {
                        return Err(OdeError::RhsFailed {
                            t: self.tn.as_f64(),
                        })
                    }
                }
                if let Err(fail) = self.sens_staggered_solve()? {
                    prev = self.corrector_failed(saved_t, &mut ncf, fail)?;
                    continue;
                }
                if self.sens.as_ref().map(|s| s.err_con).unwrap_or(false) {
                    let acnrms = self.sens.as_ref().expect("checked").acnrms;
                    let dsms = acnrms / self.tq[2];
                    if dsms > one {
                        match self.error_test_failed(saved_t, &mut nefs, dsms, ErrTarget::Sens) {
                            TestFail::TryAgain => {
                                prev = PrevFlag::PrevErrFail;
                                continue;
                            }
                            TestFail::Fatal(e) => return Err(e),
                        }
                    }
                    if dsms > dsm {
                        dsm = dsms;
                    }
                }
            }

            break dsm;
        };

        self.complete_step();
        self.prepare_next_step(dsm);
        if self.sldet_on && self.method == Method::Bdf {
            self.bdf_stability();
        }

        self.etamax = if self.nst <= SMALL_NST {
            V::T::from_f64(ETAMX2)
        } else {
            V::T::from_f64(ETAMX3)
        };

        // The corrections become the estimated local errors. This is the
        // only place they are scaled.
        let tq2_inv = one / self.tq[2];
        self.acor.scale_mut(tq2_inv);
        if let Some(quad) = self.quad.as_mut() {
            quad.acorq.scale_mut(tq2_inv);
        }
        if let Some(sens) = self.sens.as_mut() {
            for acors in sens.acors.iter_mut() {
                acors.scale_mut(tq2_inv);
            }
        }
        Ok(())
    }

    /// Recoverable corrector failure: roll back, shrink the step, and hand
    /// back the flag to retry with — or give up after too many attempts.
    fn corrector_failed(
        &mut self,
        saved_t: V::T,
        ncf: &mut u32,
        fail: NlsFail,
    ) -> Result<PrevFlag, OdeError> {
        self.restore_all(saved_t);
        self.ncfn += 1;
        if matches!(fail, NlsFail::SensConv | NlsFail::SensRhs) {
            if let Some(sens) = self.sens.as_mut() {
                sens.ncfns += 1;
            }
            // A failure in the sensitivity corrector leaves the iteration
            // matrix suspect for the next state solve.
            self.force_setup = true;
        }
        self.etamax = V::T::one();
        *ncf += 1;
        if self.h.abs() <= self.hmin * V::T::from_f64(ONEPSM) || *ncf == self.maxncf {
            return Err(match fail {
                NlsFail::Conv | NlsFail::SensConv => OdeError::ConvFailure {
                    t: self.tn.as_f64(),
                    h: self.h.as_f64(),
                },
                NlsFail::Rhs | NlsFail::QuadRhs | NlsFail::SensRhs => {
                    OdeError::RepeatedRhsFailure {
                        t: self.tn.as_f64(),
                    }
                }
            });
        }
        self.eta = V::T::from_f64(ETACF).max(self.hmin / self.h.abs());
        self.rescale_all();
        Ok(PrevFlag::PrevConvFail)
    }

    /// Failed local error test: roll back and shrink the step, drop the
    /// order once the step alone stops helping, and restart from scratch at
    /// first order as the last resort.
    fn error_test_failed(
        &mut self,
        saved_t: V::T,
        nef: &mut u32,
        dsm: V::T,
        target: ErrTarget,
    ) -> TestFail {
        let one = V::T::one();

        *nef += 1;
        match target {
            ErrTarget::State => self.netf += 1,
            ErrTarget::Quad => {
                if let Some(quad) = self.quad.as_mut() {
                    quad.netfq += 1;
                }
            }
            ErrTarget::Sens => {
                if let Some(sens) = self.sens.as_mut() {
                    sens.netfs += 1;
                }
            }
        }
        self.etamax = one;
        self.restore_all(saved_t);

        if self.h.abs() <= self.hmin * V::T::from_f64(ONEPSM) || *nef == self.maxnef {
            return TestFail::Fatal(OdeError::ErrFailure {
                t: self.tn.as_f64(),
                h: self.h.as_f64(),
            });
        }

        if *nef <= MXNEF1 {
            let l = (self.q + 1) as f64;
            let mut eta = one
                / ((V::T::from_f64(BIAS2) * dsm).powf(one / V::T::from_f64(l))
                    + V::T::from_f64(ADDON));
            eta = V::T::from_f64(ETAMIN).max(eta.max(self.hmin / self.h.abs()));
            if *nef >= SMALL_NEF {
                eta = eta.min(V::T::from_f64(ETAMXF));
            }
            self.eta = eta;
            self.rescale_all();
            return TestFail::TryAgain;
        }

        if self.q > 1 {
            self.eta = V::T::from_f64(ETAMIN).max(self.hmin / self.h.abs());
            self.adjust_order(-1);
            self.q -= 1;
            self.qwait = (self.q + 1) as i32;
            self.rescale_all();
            return TestFail::TryAgain;
        }

        // Already at first order: restart the machine on a much smaller step,
        // with a fresh derivative column.
        self.eta = V::T::from_f64(ETAMIN).max(self.hmin / self.h.abs());
        self.h = self.h * self.eta;
        self.next_h = self.h;
        self.hscale = self.h;
        self.qwait = LONG_WAIT;
        self.nscon = 0;

        let fres = {
            let f = self.f.as_mut().expect("initialized");
            self.nfe += 1;
            f(self.tn, &self.zn[0], &mut self.ftemp, &self.params)
        };
        match fres {
            RhsResult::Ok => {}
            RhsResult::RecoverableError => {
                return TestFail::Fatal(OdeError::RepeatedRhsFailure {
                    t: self.tn.as_f64(),
                })
            }
            RhsResult::NonRecoverableError => {
                return TestFail::Fatal(OdeError::RhsFailed {
                    t: self.tn.as_f64(),
                })
            }
        }
        let h = self.h;
        self.zn[1].scale_from(h, &self.ftemp);
        if let Some(e) = self.quad_restart_first_order(h) {
            return TestFail::Fatal(e);
        }
        if let Some(e) = self.sens_restart_first_order(h) {
            return TestFail::Fatal(e);
        }
        TestFail::TryAgain
    }

    // ---- predictor / history management --------------------------------

    /// Advance `tn` and all history arrays to the predicted values.
    pub(crate) fn predict_all(&mut self) {
        self.tn = self.tn + self.h;
        if let Some(tstop) = self.tstop {
            if (self.tn - tstop) * self.h > V::T::zero() {
                self.tn = tstop;
            }
        }
        history::predict(&mut self.zn, self.q);
        if let Some(quad) = self.quad.as_mut() {
            history::predict(&mut quad.znq, self.q);
        }
        if let Some(sens) = self.sens.as_mut() {
            for cols in sens.zns.iter_mut() {
                history::predict(cols, self.q);
            }
        }
    }

    /// Roll `tn` and all history arrays back to their pre-prediction values.
    pub(crate) fn restore_all(&mut self, saved_t: V::T) {
        self.tn = saved_t;
        history::restore(&mut self.zn, self.q);
        if let Some(quad) = self.quad.as_mut() {
            history::restore(&mut quad.znq, self.q);
        }
        if let Some(sens) = self.sens.as_mut() {
            for cols in sens.zns.iter_mut() {
                history::restore(cols, self.q);
            }
        }
    }

    /// Apply the pending step-size ratio `eta` to every history array and to
    /// the step size itself.
    pub(crate) fn rescale_all(&mut self) {
        history::rescale(&mut self.zn, self.q, self.eta);
        if let Some(quad) = self.quad.as_mut() {
            history::rescale(&mut quad.znq, self.q, self.eta);
        }
        if let Some(sens) = self.sens.as_mut() {
            for cols in sens.zns.iter_mut() {
                history::rescale(cols, self.q, self.eta);
            }
        }
        self.h = self.hscale * self.eta;
        self.next_h = self.h;
        self.hscale = self.h;
        self.nscon = 0;
    }

    /// Change of order and/or step size decided at the end of the previous
    /// step.
    fn adjust_params(&mut self) {
        if self.qprime != self.q {
            let deltaq = self.qprime as i32 - self.q as i32;
            self.adjust_order(deltaq);
            self.q = self.qprime;
            self.qwait = (self.q + 1) as i32;
        }
        self.rescale_all();
    }

    /// Adjust the history for an order change of `deltaq` (+1 or -1) at
    /// fixed step size. A decrease at order 2 needs no column adjustment.
    fn adjust_order(&mut self, deltaq: i32) {
        if self.q == 2 && deltaq != 1 {
            return;
        }
        match (self.method, deltaq) {
            (Method::Adams, 1) => {
                let lnew = self.q + 1;
                self.zn[lnew].fill(V::T::zero());
                if let Some(quad) = self.quad.as_mut() {
                    quad.znq[lnew].fill(V::T::zero());
                }
                if let Some(sens) = self.sens.as_mut() {
                    for cols in sens.zns.iter_mut() {
                        cols[lnew].fill(V::T::zero());
                    }
                }
            }
            (Method::Adams, _) => {
                let l = history::adams_decrease_coeffs(self.q, &self.tau, self.hscale);
                history::apply_decrease(&mut self.zn, &l, self.q);
                if let Some(quad) = self.quad.as_mut() {
                    history::apply_decrease(&mut quad.znq, &l, self.q);
                }
                if let Some(sens) = self.sens.as_mut() {
                    for cols in sens.zns.iter_mut() {
                        history::apply_decrease(cols, &l, self.q);
                    }
                }
            }
            (Method::Bdf, 1) => {
                let (l, a1) = history::bdf_increase_coeffs(self.q, &self.tau, self.hscale);
                history::apply_bdf_increase(&mut self.zn, &l, a1, self.q, self.qmax);
                if let Some(quad) = self.quad.as_mut() {
                    history::apply_bdf_increase(&mut quad.znq, &l, a1, self.q, self.qmax);
                }
                if let Some(sens) = self.sens.as_mut() {
                    for cols in sens.zns.iter_mut() {
                        history::apply_bdf_increase(cols, &l, a1, self.q, self.qmax);
                    }
                }
            }
            (Method::Bdf, _) => {
                let l = history::bdf_decrease_coeffs(self.q, &self.tau, self.hscale);
                history::apply_decrease(&mut self.zn, &l, self.q);
                if let Some(quad) = self.quad.as_mut() {
                    history::apply_decrease(&mut quad.znq, &l, self.q);
                }
                if let Some(sens) = self.sens.as_mut() {
                    for cols in sens.zns.iter_mut() {
                        history::apply_decrease(cols, &l, self.q);
                    }
                }
            }
        }
    }

    /// Method coefficients for the current order, step size and history,
    /// plus the derived `gamma` quantities.
    pub(crate) fn set_coefficients(&mut self) {
        let order_change_due = self.qwait == 1;
        let c = match self.method {
            Method::Adams => {
                coeffs::adams_coeffs(self.q, &self.tau, self.h, order_change_due, self.nlscoef)
            }
            Method::Bdf => {
                coeffs::bdf_coeffs(self.q, &self.tau, self.h, order_change_due, self.nlscoef)
            }
        };
        self.l = c.l;
        self.tq = c.tq;
        self.rl1 = V::T::one() / self.l[1];
        self.gamma = self.h * self.rl1;
        if self.nst == 0 {
            self.gammap = self.gamma;
        }
        self.gamrat = if self.nst > 0 {
            self.gamma / self.gammap
        } else {
            V::T::one()
        };
    }

    // ---- step completion ----------------------------------------------

    /// The step passed every test: shift the step history, fold the
    /// correction into the Nordsieck arrays, and update the counters.
    fn complete_step(&mut self) {
        self.nst += 1;
        self.nscon += 1;
        self.hu = self.h;
        self.qu = self.q;

        for i in (2..=self.q).rev() {
            self.tau[i] = self.tau[i - 1];
        }
        if self.q == 1 && self.nst > 1 {
            self.tau[2] = self.tau[1];
        }
        self.tau[1] = self.h;

        history::apply_correction(&mut self.zn, &self.l, self.q, &self.acor);
        if let Some(quad) = self.quad.as_mut() {
            history::apply_correction(&mut quad.znq, &self.l, self.q, &quad.acorq);
        }
        if let Some(sens) = self.sens.as_mut() {
            for (cols, acors) in sens.zns.iter_mut().zip(sens.acors.iter()) {
                history::apply_correction(cols, &self.l, self.q, acors);
            }
        }

        self.qwait -= 1;
        if self.qwait == 1 && self.q != self.qmax {
            // Save the correction for a possible order increase; consumed by
            // the BDF increase path and the order-selection heuristic.
            self.zn[self.qmax].copy_from(&self.acor);
            if let Some(quad) = self.quad.as_mut() {
                quad.znq[self.qmax].copy_from(&quad.acorq);
            }
            if let Some(sens) = self.sens.as_mut() {
                for (cols, acors) in sens.zns.iter_mut().zip(sens.acors.iter()) {
                    cols[self.qmax].copy_from(acors);
                }
            }
            self.saved_tq5 = self.tq[5];
        }
    }

    /// Choose the order and step-size ratio for the next step from the
    /// local error estimates at orders q-1, q, q+1.
    fn prepare_next_step(&mut self, dsm: V::T) {
        let one = V::T::one();

        // A failure earlier in this step forbids growth.
        if self.etamax == one {
            self.qwait = self.qwait.max(2);
            self.qprime = self.q;
            self.hprime = self.h;
            self.eta = one;
            return;
        }

        let l = (self.q + 1) as f64;
        self.etaq = one
            / ((V::T::from_f64(BIAS2) * dsm).powf(one / V::T::from_f64(l))
                + V::T::from_f64(ADDON));
        if self.qwait != 0 {
            self.eta = self.etaq;
            self.qprime = self.q;
            self.set_eta();
            return;
        }

        self.qwait = 2;
        self.etaqm1 = self.compute_eta_qm1();
        self.etaqp1 = self.compute_eta_qp1();
        self.choose_eta();
        self.set_eta();
    }

    /// Step ratio that order q-1 would allow.
    fn compute_eta_qm1(&mut self) -> V::T {
        let one = V::T::one();
        if self.q == 1 {
            return V::T::zero();
        }
        let mut ddn = self.zn[self.q].wrms_norm(&self.ewt);
        ddn = self.quad_update_err_norm(ddn, self.q);
        ddn = self.sens_update_err_norm(ddn, self.q);
        ddn = ddn / self.tq[1];
        one / ((V::T::from_f64(BIAS1) * ddn).powf(one / V::T::from_f64(self.q as f64))
            + V::T::from_f64(ADDON))
    }

    /// Step ratio that order q+1 would allow, from the difference between
    /// the current correction and the one saved when `qwait` hit 1.
    fn compute_eta_qp1(&mut self) -> V::T {
        let one = V::T::one();
        let zero = V::T::zero();
        if self.q == self.qmax || self.saved_tq5 == zero {
            return zero;
        }
        let l = (self.q + 1) as i32;
        let cquot = (self.tq[5] / self.saved_tq5) * (self.h / self.tau[2]).powi(l);
        self.tempv
            .linear_sum(-cquot, &self.zn[self.qmax], one, &self.acor);
        let mut dup = self.tempv.wrms_norm(&self.ewt);
        dup = self.quad_update_acor_diff_norm(dup, cquot);
        dup = self.sens_update_acor_diff_norm(dup, cquot);
        dup = dup / self.tq[3];
        one / ((V::T::from_f64(BIAS3) * dup).powf(one / V::T::from_f64((l + 1) as f64))
            + V::T::from_f64(ADDON))
    }

    /// Pick the order whose ratio is largest; below the change threshold
    /// keep everything as is.
    fn choose_eta(&mut self) {
        let etam = self.etaqm1.max(self.etaq.max(self.etaqp1));
        if etam < V::T::from_f64(THRESH) {
            self.eta = V::T::one();
            self.qprime = self.q;
            return;
        }
        if etam == self.etaq {
            self.eta = self.etaq;
            self.qprime = self.q;
        } else if etam == self.etaqm1 {
            self.eta = self.etaqm1;
            self.qprime = self.q - 1;
        } else {
            self.eta = self.etaqp1;
            self.qprime = self.q + 1;
            if self.method == Method::Bdf {
                // The BDF order increase consumes the saved correction
                // column; refresh it with the newest correction.
                self.zn[self.qmax].copy_from(&self.acor);
                if let Some(quad) = self.quad.as_mut() {
                    quad.znq[self.qmax].copy_from(&quad.acorq);
                }
                if let Some(sens) = self.sens.as_mut() {
                    for (cols, acors) in sens.zns.iter_mut().zip(sens.acors.iter()) {
                        cols[self.qmax].copy_from(acors);
                    }
                }
            }
        }
    }

    /// Finalize `eta` against the threshold, the growth ceiling and the
    /// maximum step size, and derive `hprime`.
    pub(crate) fn set_eta(&mut self) {
        let one = V::T::one();
        if self.eta < V::T::from_f64(THRESH) {
            self.eta = one;
            self.hprime = self.h;
        } else {
            self.eta = self.eta.min(self.etamax);
            self.eta = self.eta / one.max(self.h.abs() * self.hmax_inv * self.eta);
            self.hprime = self.h * self.eta;
            if self.qprime < self.q {
                self.nscon = 0;
            }
        }
    }
}
