//! Forward sensitivity analysis: `s_i' = (df/dy) s_i + df/dp_i`.
//!
//! The sensitivities share the state's Nordsieck machinery; what varies is
//! how their corrector couples to the state corrector:
//!
//! - `Simultaneous`: one extended nonlinear system for `(y, s_1, ..)`,
//!   solved with a block-diagonal approximation (the state iteration matrix
//!   is reused for every block);
//! - `Staggered`: the sensitivities are corrected together in a second solve
//!   after the state step passed its error test;
//! - `Staggered1`: like `Staggered` but one sensitivity at a time, with
//!   per-sensitivity counters.
//!
//! When no user function is supplied the right-hand side falls back on
//! difference quotients of `f`, choosing between forward and centered
//! schemes and between one combined or two separate perturbations.

use num_traits::{Float, One, Zero};

use crate::errors::{LinearSolverFailure, OdeError, RhsResult};
use crate::linear_solver::{ConvFail, SetupContext, SolveContext};
use crate::scalar::Scalar;
use crate::vector::Vector;

use super::history;
use super::nonlinear::{NlsFail, NlsResult};
use super::problem::{RhsFn, SensRhs, Tolerance};
use super::solver::{IterKind, Method, OdeSolver, CRDOWN, HUB_YSCALE, RDIV};

/// How the sensitivity corrector couples to the state corrector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensMethod {
    Simultaneous,
    Staggered,
    Staggered1,
}

/// Sensitivity absolute tolerances: supplied per sensitivity, or derived
/// from the state tolerances scaled by `1 / |pbar_i|`.
pub(crate) enum SensTol<V: Vector> {
    Supplied { rtol: V::T, atols: Vec<Tolerance<V>> },
    Derived,
}

pub(crate) struct SensState<V: Vector> {
    pub ns: usize,
    pub ism: SensMethod,
    pub rhs: SensRhs<V>,
    pub pbar: Vec<V::T>,
    pub plist: Option<Vec<usize>>,
    pub err_con: bool,
    pub tol: SensTol<V>,
    pub dq_rhomax: V::T,
    pub maxcor: usize,
    /// One Nordsieck array per sensitivity: `zns[i][j]`.
    pub zns: Vec<Vec<V>>,
    pub ewts: Vec<V>,
    pub ys: Vec<V>,
    pub acors: Vec<V>,
    pub tempvs: Vec<V>,
    pub ytemp: V,
    pub ftemp: V,
    pub acnrms: V::T,
    pub conv_rate: V::T,
    pub conv_rates1: Vec<V::T>,
    pub nfse: u64,
    pub nfes: u64,
    pub nnis: u64,
    pub ncfns: u64,
    pub netfs: u64,
    pub nnis1: Vec<u64>,
    pub ncfns1: Vec<u64>,
}

impl<V: Vector> OdeSolver<V> {
    /// Activate forward sensitivity analysis for `ns` parameters with
    /// initial sensitivities `ys0`.
    ///
    /// The right-hand side defaults to difference quotients of `f`, which
    /// perturb the problem parameters set with
    /// [`set_params`](Self::set_params) (see
    /// [`set_sens_params`](Self::set_sens_params) for scaling and index
    /// selection).
    pub fn sens_init(
        &mut self,
        ns: usize,
        ism: SensMethod,
        ys0: &[V],
    ) -> Result<(), OdeError> {
        if self.f.is_none() {
            return Err(OdeError::NoMemory);
        }
        if ns == 0 {
            return Err(OdeError::IllInput("ns must be positive"));
        }
        if ys0.len() != ns {
            return Err(OdeError::IllInput("ys0 must hold ns vectors"));
        }
        if ys0.iter().any(|v| v.len() != self.n) {
            return Err(OdeError::IllInput(
                "each sensitivity must match the state length",
            ));
        }
        let n = self.n;
        let mut zns: Vec<Vec<V>> = (0..ns)
            .map(|_| (0..=self.qmax).map(|_| V::zeros(n)).collect())
            .collect();
        for (cols, y0) in zns.iter_mut().zip(ys0.iter()) {
            cols[0].copy_from(y0);
        }
        self.sens = Some(SensState {
            ns,
            ism,
            rhs: SensRhs::DiffQuotient,
            pbar: vec![V::T::one(); ns],
            plist: None,
            err_con: false,
            tol: SensTol::Derived,
            dq_rhomax: V::T::zero(),
            maxcor: 3,
            zns,
            ewts: (0..ns).map(|_| V::zeros(n)).collect(),
            ys: (0..ns).map(|_| V::zeros(n)).collect(),
            acors: (0..ns).map(|_| V::zeros(n)).collect(),
            tempvs: (0..ns).map(|_| V::zeros(n)).collect(),
            ytemp: V::zeros(n),
            ftemp: V::zeros(n),
            acnrms: V::T::zero(),
            conv_rate: V::T::one(),
            conv_rates1: vec![V::T::one(); ns],
            nfse: 0,
            nfes: 0,
            nnis: 0,
            ncfns: 0,
            netfs: 0,
            nnis1: vec![0; ns],
            ncfns1: vec![0; ns],
        });
        Ok(())
    }

    /// Reset the sensitivity values (and possibly the coupling method) for a
    /// restarted integration.
    pub fn sens_reinit(&mut self, ism: SensMethod, ys0: &[V]) -> Result<(), OdeError> {
        let sens = self.sens.as_mut().ok_or(OdeError::NoSens)?;
        if ys0.len() != sens.ns {
            return Err(OdeError::IllInput("ys0 must hold ns vectors"));
        }
        if ism == SensMethod::Staggered1 && matches!(sens.rhs, SensRhs::All(_)) {
            return Err(OdeError::IllInput(
                "the one-at-a-time staggered method requires a one-at-a-time right-hand side",
            ));
        }
        sens.ism = ism;
        for (cols, y0) in sens.zns.iter_mut().zip(ys0.iter()) {
            for col in cols.iter_mut() {
                col.fill(V::T::zero());
            }
            cols[0].copy_from(y0);
        }
        sens.conv_rate = V::T::one();
        sens.nfse = 0;
        sens.nfes = 0;
        sens.nnis = 0;
        sens.ncfns = 0;
        sens.netfs = 0;
        for v in sens.conv_rates1.iter_mut() {
            *v = V::T::one();
        }
        for v in sens.nnis1.iter_mut() {
            *v = 0;
        }
        for v in sens.ncfns1.iter_mut() {
            *v = 0;
        }
        Ok(())
    }

    /// Supply the sensitivity right-hand side, or restore the
    /// difference-quotient default.
    pub fn set_sens_rhs(&mut self, rhs: SensRhs<V>) -> Result<(), OdeError> {
        let sens = self.sens.as_mut().ok_or(OdeError::NoSens)?;
        if sens.ism == SensMethod::Staggered1 && matches!(rhs, SensRhs::All(_)) {
            return Err(OdeError::IllInput(
                "the one-at-a-time staggered method requires a one-at-a-time right-hand side",
            ));
        }
        sens.rhs = rhs;
        Ok(())
    }

    /// Parameter metadata for the difference-quotient right-hand side and
    /// the derived tolerances: the parameter values themselves, their order
    ///-of-magnitude scales `pbar`, and which entries of the parameter
    /// vector the sensitivities refer to.
    pub fn set_sens_params(
        &mut self,
        p: Option<Vec<V::T>>,
        pbar: Option<Vec<V::T>>,
        plist: Option<Vec<usize>>,
    ) -> Result<(), OdeError> {
        let nparams = p
            .as_ref()
            .map(|p| p.len())
            .unwrap_or_else(|| self.params.len());
        let sens = self.sens.as_mut().ok_or(OdeError::NoSens)?;
        if let Some(pbar) = &pbar {
            if pbar.len() != sens.ns {
                return Err(OdeError::IllInput("pbar must hold ns scales"));
            }
            if pbar.iter().any(|&b| b == V::T::zero()) {
                return Err(OdeError::IllInput("pbar components must be non-zero"));
            }
        }
        if let Some(plist) = &plist {
            if plist.len() != sens.ns {
                return Err(OdeError::IllInput("plist must hold ns indices"));
            }
            if plist.iter().any(|&j| j >= nparams) {
                return Err(OdeError::IllInput("plist index out of parameter range"));
            }
        }
        if let Some(pbar) = pbar {
            sens.pbar = pbar;
        }
        if let Some(plist) = plist {
            sens.plist = Some(plist);
        }
        if let Some(p) = p {
            self.params = p;
        }
        Ok(())
    }

    /// Include or exclude the sensitivities from the local error test.
    pub fn set_sens_err_con(&mut self, err_con: bool) -> Result<(), OdeError> {
        let sens = self.sens.as_mut().ok_or(OdeError::NoSens)?;
        sens.err_con = err_con;
        Ok(())
    }

    /// Explicit sensitivity tolerances; without this call they are derived
    /// from the state tolerances and `pbar`.
    pub fn set_sens_tolerances(
        &mut self,
        rtols: V::T,
        atols: Vec<Tolerance<V>>,
    ) -> Result<(), OdeError> {
        let n = self.n;
        let sens = self.sens.as_mut().ok_or(OdeError::NoSens)?;
        if !(rtols >= V::T::zero()) {
            return Err(OdeError::IllInput(
                "sensitivity reltol must be non-negative",
            ));
        }
        if atols.len() != sens.ns {
            return Err(OdeError::IllInput("expected one abstol per sensitivity"));
        }
        for atol in &atols {
            atol.validate(n)?;
        }
        sens.tol = SensTol::Supplied { rtol: rtols, atols };
        Ok(())
    }

    /// Bound on the perturbation-ratio used to switch the difference
    /// quotients between one combined and two separate evaluations; the sign
    /// selects centered (`>= 0`) or forward (`< 0`) differences.
    pub fn set_sens_dq_method(&mut self, rhomax: V::T) -> Result<(), OdeError> {
        let sens = self.sens.as_mut().ok_or(OdeError::NoSens)?;
        sens.dq_rhomax = rhomax;
        Ok(())
    }

    pub fn set_sens_max_nonlin_iters(&mut self, maxcor: usize) -> Result<(), OdeError> {
        let sens = self.sens.as_mut().ok_or(OdeError::NoSens)?;
        if maxcor == 0 {
            return Err(OdeError::IllInput("maxcor must be positive"));
        }
        sens.maxcor = maxcor;
        Ok(())
    }

    /// Interpolate the `k`-th derivative of sensitivity `is` at `t`.
    pub fn get_dky_sens(
        &self,
        t: V::T,
        k: usize,
        is: usize,
        dkys: &mut V,
    ) -> Result<(), OdeError> {
        let sens = self.sens.as_ref().ok_or(OdeError::NoSens)?;
        if is >= sens.ns {
            return Err(OdeError::IllInput("sensitivity index out of range"));
        }
        if k > self.q {
            return Err(OdeError::BadK);
        }
        if dkys.len() != self.n {
            return Err(OdeError::BadDky);
        }
        self.check_dky_t(t)?;
        let h = if self.h == V::T::zero() {
            V::T::one()
        } else {
            self.h
        };
        let s = (t - self.tn) / h;
        history::interpolate(&sens.zns[is], self.q, k, s, h, dkys);
        Ok(())
    }

    /// Interpolate all sensitivities at once.
    pub fn get_dky_sens_all(&self, t: V::T, k: usize, dkys: &mut [V]) -> Result<(), OdeError> {
        let ns = self.sens.as_ref().ok_or(OdeError::NoSens)?.ns;
        if dkys.len() != ns {
            return Err(OdeError::BadDky);
        }
        for (is, dky) in dkys.iter_mut().enumerate() {
            self.get_dky_sens(t, k, is, dky)?;
        }
        Ok(())
    }

    /// The sensitivity values at `t`.
    pub fn get_sens(&self, t: V::T, ys: &mut [V]) -> Result<(), OdeError> {
        self.get_dky_sens_all(t, 0, ys)
    }

    // ---- engine hooks --------------------------------------------------

    /// First-call evaluation of the sensitivity derivative columns
    /// (unscaled); `zn[1]` still holds the unscaled `f(t0, y0)`.
    pub(crate) fn sens_begin(&mut self) -> Result<(), OdeError> {
        if self.sens.is_none() {
            return Ok(());
        }
        let tn = self.tn;
        let rtol = self.rtol;
        let uround = self.uround;
        {
            let Self {
                f, params, sens, zn, ewt, ..
            } = self;
            let sens = sens.as_mut().expect("checked above");
            let f = f.as_mut().expect("initialized");
            for i in 0..sens.ns {
                let (ys, zns) = (&mut sens.ys, &sens.zns);
                ys[i].copy_from(&zns[i][0]);
            }
            let (z0, z1) = zn.split_at(1);
            match eval_sens_rhs(sens, f, params, tn, &z0[0], &z1[0], ewt, rtol, uround) {
                RhsResult::Ok => {}
                RhsResult::RecoverableError => {
                    return Err(OdeError::FirstRhsFailed { t: tn.as_f64() })
                }
                RhsResult::NonRecoverableError => {
                    return Err(OdeError::SensRhsFailed { t: tn.as_f64() })
                }
            }
        }
        let sens = self.sens.as_mut().expect("checked above");
        for i in 0..sens.ns {
            let (zns, tempvs) = (&mut sens.zns, &sens.tempvs);
            zns[i][1].copy_from(&tempvs[i]);
        }
        Ok(())
    }

    pub(crate) fn sens_scale_zn1(&mut self, h: V::T) {
        if let Some(sens) = self.sens.as_mut() {
            for cols in sens.zns.iter_mut() {
                cols[1].scale_mut(h);
            }
        }
    }

    /// Refresh the sensitivity error weights; these back the corrector
    /// convergence test as well, so they are kept current whenever
    /// sensitivities are active.
    pub(crate) fn sens_refresh_weights(&mut self) -> Result<(), OdeError> {
        let tn = self.tn;
        let state_rtol = self.rtol;
        let Self { sens, atol, .. } = self;
        let sens = match sens.as_mut() {
            Some(sens) => sens,
            None => return Ok(()),
        };
        for i in 0..sens.ns {
            let (rtol, atol_i, scale): (V::T, &Tolerance<V>, V::T) = match &sens.tol {
                SensTol::Supplied { rtol, atols } => (*rtol, &atols[i], V::T::one()),
                SensTol::Derived => (
                    state_rtol,
                    atol.as_ref().expect("initialized"),
                    V::T::one() / sens.pbar[i].abs(),
                ),
            };
            // w = 1 / (rtol |s| + scale * atol)
            sens.ytemp.abs_from(&sens.zns[i][0]);
            sens.ytemp.scale_mut(rtol);
            match atol_i {
                Tolerance::Scalar(a) => sens.ytemp.add_scalar_mut(*a * scale),
                Tolerance::Vector(a) => sens.ytemp.axpy(scale, a),
            }
            if Vector::min(&sens.ytemp) <= V::T::zero() {
                return Err(OdeError::EwtNowBad { t: tn.as_f64() });
            }
            let (ewts, ytemp) = (&mut sens.ewts, &sens.ytemp);
            if !ewts[i].inv_from(ytemp) {
                return Err(OdeError::EwtNowBad { t: tn.as_f64() });
            }
        }
        Ok(())
    }

    pub(crate) fn sens_update_solution_norm(&self, nrm: V::T) -> V::T {
        match self.sens.as_ref() {
            Some(sens) if sens.err_con => {
                let mut nrm = nrm;
                for i in 0..sens.ns {
                    nrm = nrm.max(sens.zns[i][0].wrms_norm(&sens.ewts[i]));
                }
                nrm
            }
            _ => nrm,
        }
    }

    pub(crate) fn sens_update_hub_inv(&mut self, hub_inv: V::T) -> V::T {
        let sens = match self.sens.as_mut() {
            Some(sens) if sens.err_con => sens,
            _ => return hub_inv,
        };
        let mut hub_inv = hub_inv;
        for i in 0..sens.ns {
            sens.ftemp.inv_from(&sens.ewts[i]);
            sens.ytemp.abs_from(&sens.zns[i][0]);
            sens.ytemp.scale_mut(V::T::from_f64(HUB_YSCALE));
            sens.ytemp.axpy(V::T::one(), &sens.ftemp);
            sens.ftemp.abs_from(&sens.zns[i][1]);
            let (tempvs, ftemp, ytemp) = (&mut sens.tempvs, &sens.ftemp, &sens.ytemp);
            tempvs[i].div_from(ftemp, ytemp);
            hub_inv = hub_inv.max(sens.tempvs[i].max_norm());
        }
        hub_inv
    }

    /// Sensitivity contribution to the second-derivative estimate behind
    /// the initial step size; `self.tempv` holds `f(t + hg, y + hg y')`.
    pub(crate) fn sens_update_ydd_norm(&mut self, hg: V::T, nrm: V::T) -> Result<V::T, OdeError> {
        let one = V::T::one();
        if !self.sens.as_ref().map(|s| s.err_con).unwrap_or(false) {
            return Ok(nrm);
        }
        let tn = self.tn;
        let rtol = self.rtol;
        let uround = self.uround;
        {
            let Self {
                f, params, sens, y, tempv, ewt, ..
            } = self;
            let sens = sens.as_mut().expect("checked above");
            let f = f.as_mut().expect("initialized");
            for i in 0..sens.ns {
                let (ys, zns) = (&mut sens.ys, &sens.zns);
                ys[i].linear_sum(hg, &zns[i][1], one, &zns[i][0]);
            }
            match eval_sens_rhs(sens, f, params, tn + hg, y, tempv, ewt, rtol, uround) {
                RhsResult::Ok => {}
                RhsResult::RecoverableError | RhsResult::NonRecoverableError => {
                    return Err(OdeError::SensRhsFailed { t: tn.as_f64() })
                }
            }
        }
        let sens = self.sens.as_mut().expect("checked above");
        let mut nrm = nrm;
        for i in 0..sens.ns {
            let (tempvs, zns) = (&mut sens.tempvs, &sens.zns);
            tempvs[i].axpy(-one, &zns[i][1]);
            tempvs[i].scale_mut(one / hg);
            nrm = nrm.max(sens.tempvs[i].wrms_norm(&sens.ewts[i]));
        }
        Ok(nrm)
    }

    /// Rebuild the sensitivity derivative columns during a first-order
    /// restart; `self.ftemp` holds the fresh `f(tn, zn[0])`.
    pub(crate) fn sens_restart_first_order(&mut self, h: V::T) -> Option<OdeError> {
        if self.sens.is_none() {
            return None;
        }
        let tn = self.tn;
        let rtol = self.rtol;
        let uround = self.uround;
        {
            let Self {
                f, params, sens, zn, ftemp, ewt, ..
            } = self;
            let sens = sens.as_mut().expect("checked above");
            let f = f.as_mut().expect("initialized");
            for i in 0..sens.ns {
                let (ys, zns) = (&mut sens.ys, &sens.zns);
                ys[i].copy_from(&zns[i][0]);
            }
            match eval_sens_rhs(sens, f, params, tn, &zn[0], ftemp, ewt, rtol, uround) {
                RhsResult::Ok => {}
                RhsResult::RecoverableError => {
                    return Some(OdeError::RepeatedRhsFailure { t: tn.as_f64() })
                }
                RhsResult::NonRecoverableError => {
                    return Some(OdeError::SensRhsFailed { t: tn.as_f64() })
                }
            }
        }
        let sens = self.sens.as_mut().expect("checked above");
        for i in 0..sens.ns {
            let (zns, tempvs) = (&mut sens.zns, &sens.tempvs);
            zns[i][1].scale_from(h, &tempvs[i]);
        }
        None
    }

    /// Fold the sensitivity history column `col` into an order-change error
    /// norm.
    pub(crate) fn sens_update_err_norm(&self, nrm: V::T, col: usize) -> V::T {
        match self.sens.as_ref() {
            Some(sens) if sens.err_con => {
                let mut nrm = nrm;
                for i in 0..sens.ns {
                    nrm = nrm.max(sens.zns[i][col].wrms_norm(&sens.ewts[i]));
                }
                nrm
            }
            _ => nrm,
        }
    }

    /// Fold `acors_i - cquot zns_i[qmax]` into the order-increase error
    /// norm.
    pub(crate) fn sens_update_acor_diff_norm(&mut self, nrm: V::T, cquot: V::T) -> V::T {
        let one = V::T::one();
        let qmax = self.qmax;
        let sens = match self.sens.as_mut() {
            Some(sens) if sens.err_con => sens,
            _ => return nrm,
        };
        let mut nrm = nrm;
        for i in 0..sens.ns {
            {
                let (tempvs, zns, acors) = (&mut sens.tempvs, &sens.zns, &sens.acors);
                tempvs[i].linear_sum(-cquot, &zns[i][qmax], one, &acors[i]);
            }
            nrm = nrm.max(sens.tempvs[i].wrms_norm(&sens.ewts[i]));
        }
        nrm
    }

    // ---- staggered correctors ------------------------------------------

    /// Run the sensitivity corrector for the staggered methods; the state
    /// corrector has already converged and `self.ftemp` holds `f(tn, y)`.
    pub(crate) fn sens_staggered_solve(&mut self) -> Result<NlsResult, OdeError> {
        match self.sens.as_ref().map(|s| s.ism) {
            Some(SensMethod::Staggered) => self.sens_stgr_solve(),
            Some(SensMethod::Staggered1) => self.sens_stgr1_solve(),
            _ => Ok(Ok(())),
        }
    }

    fn sens_stgr_solve(&mut self) -> Result<NlsResult, OdeError> {
        {
            let sens = self.sens.as_mut().expect("staggered");
            sens.conv_rate = V::T::one();
            for i in 0..sens.ns {
                sens.acors[i].fill(V::T::zero());
                let (ys, zns) = (&mut sens.ys, &sens.zns);
                ys[i].copy_from(&zns[i][0]);
            }
        }
        match self.iter {
            IterKind::Functional => self.sens_stgr_functional(),
            IterKind::Newton => self.sens_stgr_newton(),
        }
    }

    fn sens_stgr_functional(&mut self) -> Result<NlsResult, OdeError> {
        let one = V::T::one();
        if let Err(fail) = self.sens_rhs_from_ftemp()? {
            return Ok(Err(fail));
        }
        let mut m: usize = 0;
        let mut delp = V::T::zero();
        loop {
            let (h, rl1, tq4) = (self.h, self.rl1, self.tq[4]);
            let (del, dcon) = {
                let sens = self.sens.as_mut().expect("staggered");
                let mut del = V::T::zero();
                for i in 0..sens.ns {
                    let tv = &mut sens.tempvs[i];
                    tv.scale_mut(h);
                    tv.axpy(-one, &sens.zns[i][1]);
                    tv.scale_mut(rl1);
                    sens.ys[i].linear_sum(one, &sens.zns[i][0], one, &sens.tempvs[i]);
                    sens.acors[i].scale_mut(-one);
                    sens.acors[i].axpy(one, &sens.tempvs[i]);
                    del = del.max(sens.acors[i].wrms_norm(&sens.ewts[i]));
                    sens.acors[i].copy_from(&sens.tempvs[i]);
                }
                sens.nnis += 1;
                if m > 0 {
                    sens.conv_rate = (V::T::from_f64(CRDOWN) * sens.conv_rate).max(del / delp);
                }
                (del, del * one.min(sens.conv_rate) / tq4)
            };
            if dcon <= one {
                let sens = self.sens.as_mut().expect("staggered");
                sens.acnrms = if m == 0 {
                    del
                } else {
                    let mut nrm = V::T::zero();
                    for i in 0..sens.ns {
                        nrm = nrm.max(sens.acors[i].wrms_norm(&sens.ewts[i]));
                    }
                    nrm
                };
                return Ok(Ok(()));
            }
            m += 1;
            let maxcor = self.sens.as_ref().expect("staggered").maxcor;
            if m == maxcor || (m >= 2 && del > V::T::from_f64(RDIV) * delp) {
                return Ok(Err(NlsFail::SensConv));
            }
            delp = del;
            if let Err(fail) = self.sens_rhs_from_ftemp()? {
                return Ok(Err(fail));
            }
        }
    }

    fn sens_stgr_newton(&mut self) -> Result<NlsResult, OdeError> {
        let mut call_setup = false;
        loop {
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
                        y,
                        ftemp,
                        ewt,
                        ..
                    } = self;
                    let f = f.as_mut().expect("initialized");
                    let mut rhs =
                        |t: V::T, yv: &V, out: &mut V| -> RhsResult { f(t, yv, out, params) };
                    let mut ctx = SetupContext {
                        t: tn,
                        gamma,
                        gamrat,
                        h,
                        uround,
                        nst,
                        convfail: ConvFail::BadJacobian,
                        ypred: y,
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
                self.gamrat = V::T::one();
                self.gammap = self.gamma;
                self.nstlp = self.nst;
                {
                    let sens = self.sens.as_mut().expect("staggered");
                    sens.conv_rate = V::T::one();
                }
                match setup_result {
                    Ok(jcur) => self.jcur = jcur,
                    Err(LinearSolverFailure::Recoverable) => return Ok(Err(NlsFail::SensConv)),
                    Err(LinearSolverFailure::Unrecoverable) => {
                        return Err(OdeError::SetupFailure {
                            t: self.tn.as_f64(),
                        })
                    }
                }
                let sens = self.sens.as_mut().expect("staggered");
                for i in 0..sens.ns {
                    sens.acors[i].fill(V::T::zero());
                    let (ys, zns) = (&mut sens.ys, &sens.zns);
                    ys[i].copy_from(&zns[i][0]);
                }
            }

            if let Err(fail) = self.sens_rhs_from_ftemp()? {
                return Ok(Err(fail));
            }
            match self.sens_stgr_newton_iteration()? {
                StgrOutcome::Converged => return Ok(Ok(())),
                StgrOutcome::TryAgain => {
                    call_setup = true;
                    continue;
                }
                StgrOutcome::Fail(fail) => return Ok(Err(fail)),
            }
        }
    }

    fn sens_stgr_newton_iteration(&mut self) -> Result<StgrOutcome, OdeError> {
        let one = V::T::one();
        let mut m: usize = 0;
        let mut delp = V::T::zero();
        loop {
            let (del, dcon) = {
                let (rl1, gamma, gamrat, tq4) = (self.rl1, self.gamma, self.gamrat, self.tq[4]);
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
                let sens = sens.as_mut().expect("staggered");
                let lsolver = lsolver
                    .as_mut()
                    .expect("Newton iteration requires a linear solver");
                let mut del = V::T::zero();
                for i in 0..sens.ns {
                    let b = &mut sens.tempvs[i];
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
                                return Ok(StgrOutcome::TryAgain);
                            }
                            return Ok(StgrOutcome::Fail(NlsFail::SensConv));
                        }
                        Err(LinearSolverFailure::Unrecoverable) => {
                            return Err(OdeError::SolveFailure { t: tn.as_f64() })
                        }
                    }
                    del = del.max(b.wrms_norm(&sens.ewts[i]));
                    sens.acors[i].axpy(one, &sens.tempvs[i]);
                    sens.ys[i].linear_sum(one, &sens.zns[i][0], one, &sens.acors[i]);
                }
                sens.nnis += 1;
                if m > 0 {
                    sens.conv_rate = (V::T::from_f64(CRDOWN) * sens.conv_rate).max(del / delp);
                }
                (del, del * one.min(sens.conv_rate) / tq4)
            };

            if dcon <= one {
                let sens = self.sens.as_mut().expect("staggered");
                sens.acnrms = if m == 0 {
                    del
                } else {
                    let mut nrm = V::T::zero();
                    for i in 0..sens.ns {
                        nrm = nrm.max(sens.acors[i].wrms_norm(&sens.ewts[i]));
                    }
                    nrm
                };
                self.jcur = false;
                return Ok(StgrOutcome::Converged);
            }

            m += 1;
            let maxcor = self.sens.as_ref().expect("staggered").maxcor;
            if m == maxcor || (m >= 2 && del > V::T::from_f64(RDIV) * delp) {
                if !self.jcur {
                    return Ok(StgrOutcome::TryAgain);
                }
                return Ok(StgrOutcome::Fail(NlsFail::SensConv));
            }
            delp = del;
            match self.sens_rhs_from_ftemp()? {
                Ok(()) => {}
                Err(fail) => {
                    if !self.jcur {
                        return Ok(StgrOutcome::TryAgain);
                    }
                    return Ok(StgrOutcome::Fail(fail));
                }
            }
        }
    }

    /// One-at-a-time staggered corrector: each sensitivity runs its own
    /// iteration with its own convergence rate and counters.
    fn sens_stgr1_solve(&mut self) -> Result<NlsResult, OdeError> {
        let ns = self.sens.as_ref().expect("staggered1").ns;
        for is in 0..ns {
            {
                let sens = self.sens.as_mut().expect("staggered1");
                sens.conv_rates1[is] = V::T::one();
                sens.acors[is].fill(V::T::zero());
                let (ys, zns) = (&mut sens.ys, &sens.zns);
                ys[is].copy_from(&zns[is][0]);
            }
            if let Err(fail) = self.sens_stgr1_one(is)? {
                let sens = self.sens.as_mut().expect("staggered1");
                sens.ncfns1[is] += 1;
                return Ok(Err(fail));
            }
        }
        // Combined norm over all sensitivities, for the error test.
        let sens = self.sens.as_mut().expect("staggered1");
        let mut nrm = V::T::zero();
        for i in 0..sens.ns {
            nrm = nrm.max(sens.acors[i].wrms_norm(&sens.ewts[i]));
        }
        sens.acnrms = nrm;
        Ok(Ok(()))
    }

    fn sens_stgr1_one(&mut self, is: usize) -> Result<NlsResult, OdeError> {
        let one = V::T::one();
        let newton = self.iter == IterKind::Newton;
        if let Err(fail) = self.sens_rhs1_from_ftemp(is)? {
            return Ok(Err(fail));
        }
        let mut m: usize = 0;
        let mut delp = V::T::zero();
        loop {
            let (del, dcon) = {
                let (h, rl1, gamma, gamrat, tq4) =
                    (self.h, self.rl1, self.gamma, self.gamrat, self.tq[4]);
                let bdf = self.method == Method::Bdf;
                let tn = self.tn;
                let Self {
                    lsolver,
                    sens,
                    ewt,
                    y,
                    ftemp,
                    ..
                } = self;
                let sens = sens.as_mut().expect("staggered1");
                let del = if newton {
                    let b = &mut sens.tempvs[is];
                    b.scale_mut(gamma);
                    b.axpy(-rl1, &sens.zns[is][1]);
                    b.axpy(-one, &sens.acors[is]);
                    let ctx = SolveContext {
                        ewt,
                        ycur: y,
                        fcur: ftemp,
                        gamma,
                        gamrat,
                        apply_gamma_correction: bdf,
                    };
                    match lsolver
                        .as_mut()
                        .expect("Newton iteration requires a linear solver")
                        .solve(b, &ctx)
                    {
                        Ok(()) => {}
                        Err(LinearSolverFailure::Recoverable) => {
                            return Ok(Err(NlsFail::SensConv))
                        }
                        Err(LinearSolverFailure::Unrecoverable) => {
                            return Err(OdeError::SolveFailure { t: tn.as_f64() })
                        }
                    }
                    let del = b.wrms_norm(&sens.ewts[is]);
                    sens.acors[is].axpy(one, &sens.tempvs[is]);
                    sens.ys[is].linear_sum(one, &sens.zns[is][0], one, &sens.acors[is]);
                    del
                } else {
                    let tv = &mut sens.tempvs[is];
                    tv.scale_mut(h);
                    tv.axpy(-one, &sens.zns[is][1]);
                    tv.scale_mut(rl1);
                    sens.ys[is].linear_sum(one, &sens.zns[is][0], one, &sens.tempvs[is]);
                    sens.acors[is].scale_mut(-one);
                    sens.acors[is].axpy(one, &sens.tempvs[is]);
                    let del = sens.acors[is].wrms_norm(&sens.ewts[is]);
                    sens.acors[is].copy_from(&sens.tempvs[is]);
                    del
                };
                sens.nnis1[is] += 1;
                sens.nnis += 1;
                if m > 0 {
                    sens.conv_rates1[is] =
                        (V::T::from_f64(CRDOWN) * sens.conv_rates1[is]).max(del / delp);
                }
                (del, del * one.min(sens.conv_rates1[is]) / tq4)
            };
            if dcon <= one {
                return Ok(Ok(()));
            }
            m += 1;
            let maxcor = self.sens.as_ref().expect("staggered1").maxcor;
            if m == maxcor || (m >= 2 && del > V::T::from_f64(RDIV) * delp) {
                return Ok(Err(NlsFail::SensConv));
            }
            delp = del;
            if let Err(fail) = self.sens_rhs1_from_ftemp(is)? {
                return Ok(Err(fail));
            }
        }
    }

    /// All sensitivity right-hand sides at the current iterate, with the
    /// state derivative from `ftemp`.
    fn sens_rhs_from_ftemp(&mut self) -> Result<NlsResult, OdeError> {
        let tn = self.tn;
        let rtol = self.rtol;
        let uround = self.uround;
        let Self {
            f, params, sens, y, ftemp, ewt, ..
        } = self;
        let sens = sens.as_mut().expect("sensitivities active");
        let f = f.as_mut().expect("initialized");
        match eval_sens_rhs(sens, f, params, tn, y, ftemp, ewt, rtol, uround) {
            RhsResult::Ok => Ok(Ok(())),
            RhsResult::RecoverableError => Ok(Err(NlsFail::SensRhs)),
            RhsResult::NonRecoverableError => Err(OdeError::SensRhsFailed { t: tn.as_f64() }),
        }
    }

    /// Right-hand side of sensitivity `is` only.
    fn sens_rhs1_from_ftemp(&mut self, is: usize) -> Result<NlsResult, OdeError> {
        let tn = self.tn;
        let rtol = self.rtol;
        let uround = self.uround;
        let Self {
            f, params, sens, y, ftemp, ewt, ..
        } = self;
        let sens = sens.as_mut().expect("sensitivities active");
        let f = f.as_mut().expect("initialized");
        match eval_sens_rhs1(sens, f, params, tn, y, ftemp, is, ewt, rtol, uround) {
            RhsResult::Ok => Ok(Ok(())),
            RhsResult::RecoverableError => Ok(Err(NlsFail::SensRhs)),
            RhsResult::NonRecoverableError => Err(OdeError::SensRhsFailed { t: tn.as_f64() }),
        }
    }
}

enum StgrOutcome {
    Converged,
    TryAgain,
    Fail(NlsFail),
}

/// Evaluate all sensitivity right-hand sides at (`t`, `y`, `ydot`) with the
/// current iterates in `sens.ys`, writing into `sens.tempvs`.
pub(crate) fn eval_sens_rhs<V: Vector>(
    sens: &mut SensState<V>,
    f: &mut RhsFn<V>,
    params: &mut Vec<V::T>,
    t: V::T,
    y: &V,
    ydot: &V,
    ewt: &V,
    rtol: V::T,
    uround: V::T,
) -> RhsResult {
    let SensState {
        ns,
        rhs,
        pbar,
        plist,
        dq_rhomax,
        ys,
        tempvs,
        ytemp,
        ftemp,
        nfse,
        nfes,
        ..
    } = sens;
    match rhs {
        SensRhs::All(fs) => {
            *nfse += 1;
            fs(t, y, ydot, ys, tempvs, params)
        }
        SensRhs::One(fs1) => {
            for i in 0..*ns {
                *nfse += 1;
                let res = fs1(t, y, ydot, i, &ys[i], &mut tempvs[i], params);
                if res != RhsResult::Ok {
                    return res;
                }
            }
            RhsResult::Ok
        }
        SensRhs::DiffQuotient => {
            for i in 0..*ns {
                *nfse += 1;
                let which = plist.as_ref().map(|p| p[i]).unwrap_or(i);
                let res = dq_sens_rhs1(
                    f,
                    params,
                    t,
                    y,
                    ydot,
                    &ys[i],
                    &mut tempvs[i],
                    ytemp,
                    ftemp,
                    which,
                    pbar[i],
                    *dq_rhomax,
                    ewt,
                    rtol,
                    uround,
                    nfes,
                );
                if res != RhsResult::Ok {
                    return res;
                }
            }
            RhsResult::Ok
        }
    }
}

/// Evaluate the right-hand side of sensitivity `is` only; requires a
/// one-at-a-time supplier or the difference-quotient fallback.
pub(crate) fn eval_sens_rhs1<V: Vector>(
    sens: &mut SensState<V>,
    f: &mut RhsFn<V>,
    params: &mut Vec<V::T>,
    t: V::T,
    y: &V,
    ydot: &V,
    is: usize,
    ewt: &V,
    rtol: V::T,
    uround: V::T,
) -> RhsResult {
    let SensState {
        rhs,
        pbar,
        plist,
        dq_rhomax,
        ys,
        tempvs,
        ytemp,
        ftemp,
        nfse,
        nfes,
        ..
    } = sens;
    match rhs {
        SensRhs::One(fs1) => {
            *nfse += 1;
            fs1(t, y, ydot, is, &ys[is], &mut tempvs[is], params)
        }
        SensRhs::DiffQuotient => {
            *nfse += 1;
            let which = plist.as_ref().map(|p| p[is]).unwrap_or(is);
            dq_sens_rhs1(
                f,
                params,
                t,
                y,
                ydot,
                &ys[is],
                &mut tempvs[is],
                ytemp,
                ftemp,
                which,
                pbar[is],
                *dq_rhomax,
                ewt,
                rtol,
                uround,
                nfes,
            )
        }
        // Construction rejects the all-at-once supplier for the
        // one-at-a-time method.
        SensRhs::All(_) => RhsResult::NonRecoverableError,
    }
}

/// Difference-quotient approximation of one sensitivity right-hand side.
///
/// The scheme adapts to the relative sizes of a state-direction perturbation
/// `delta_y` and a parameter perturbation `delta_p`: when they are within
/// `|rhomax|` of each other one combined perturbation serves both
/// derivatives, otherwise they are estimated separately. The sign of
/// `rhomax` chooses centered (`>= 0`) or forward differences. The perturbed
/// parameter is always restored on exit.
#[allow(clippy::too_many_arguments)]
fn dq_sens_rhs1<V: Vector>(
    f: &mut RhsFn<V>,
    params: &mut Vec<V::T>,
    t: V::T,
    y: &V,
    ydot: &V,
    ys: &V,
    ysdot: &mut V,
    ytemp: &mut V,
    ftemp: &mut V,
    which: usize,
    pbar: V::T,
    rhomax: V::T,
    ewt: &V,
    rtol: V::T,
    uround: V::T,
    nfes: &mut u64,
) -> RhsResult {
    let psave = params[which];
    let res = dq_sens_rhs1_inner(
        f, params, t, y, ydot, ys, ysdot, ytemp, ftemp, which, psave, pbar, rhomax, ewt, rtol,
        uround, nfes,
    );
    params[which] = psave;
    res
}

#[allow(clippy::too_many_arguments)]
fn dq_sens_rhs1_inner<V: Vector>(
    f: &mut RhsFn<V>,
    params: &mut Vec<V::T>,
    t: V::T,
    y: &V,
    ydot: &V,
    ys: &V,
    ysdot: &mut V,
    ytemp: &mut V,
    ftemp: &mut V,
    which: usize,
    psave: V::T,
    pbar: V::T,
    rhomax: V::T,
    ewt: &V,
    rtol: V::T,
    uround: V::T,
    nfes: &mut u64,
) -> RhsResult {
    let one = V::T::one();
    let half = V::T::from_f64(0.5);
    let pbari = pbar.abs();
    let mut feval = |t: V::T, yv: &V, out: &mut V, p: &[V::T]| -> RhsResult {
        *nfes += 1;
        f(t, yv, out, p)
    };

    let delta = rtol.max(uround).sqrt();
    let rdelta = one / delta;
    let delta_p = pbari * delta;
    let r_delta_p = one / delta_p;
    let norms = ys.wrms_norm(ewt) * pbari;
    let r_delta_y = norms.max(rdelta) / pbari;
    let delta_y = one / r_delta_y;

    // max(ratio, 1/ratio) >= 1 always, so the default rhomax = 0 (and any
    // |rhomax| < 1) keeps the perturbations separate.
    let centered = rhomax >= V::T::zero();
    let ratio = delta_y * r_delta_p;
    let combined = (one / ratio).max(ratio) <= rhomax.abs();

    if combined {
        // One perturbation serves both df/dy s and df/dp.
        let delta = delta_y.min(delta_p);
        if centered {
            let r2delta = half / delta;
            ytemp.linear_sum(delta, ys, one, y);
            params[which] = psave + delta;
            match feval(t, ytemp, ysdot, params) {
                RhsResult::Ok => {}
                other => return other,
            }
            ytemp.linear_sum(-delta, ys, one, y);
            params[which] = psave - delta;
            match feval(t, ytemp, ftemp, params) {
                RhsResult::Ok => {}
                other => return other,
            }
            ysdot.scale_mut(r2delta);
            ysdot.axpy(-r2delta, ftemp);
        } else {
            let rdelta = one / delta;
            ytemp.linear_sum(delta, ys, one, y);
            params[which] = psave + delta;
            match feval(t, ytemp, ysdot, params) {
                RhsResult::Ok => {}
                other => return other,
            }
            ysdot.scale_mut(rdelta);
            ysdot.axpy(-rdelta, ydot);
        }
    } else if centered {
        // Separate centered quotients in the state direction and in the
        // parameter.
        let r2delta_y = half / delta_y;
        let r2delta_p = half / delta_p;
        ytemp.linear_sum(delta_y, ys, one, y);
        match feval(t, ytemp, ysdot, params) {
            RhsResult::Ok => {}
            other => return other,
        }
        ytemp.linear_sum(-delta_y, ys, one, y);
        match feval(t, ytemp, ftemp, params) {
            RhsResult::Ok => {}
            other => return other,
        }
        ysdot.scale_mut(r2delta_y);
        ysdot.axpy(-r2delta_y, ftemp);
        params[which] = psave + delta_p;
        match feval(t, y, ytemp, params) {
            RhsResult::Ok => {}
            other => return other,
        }
        params[which] = psave - delta_p;
        match feval(t, y, ftemp, params) {
            RhsResult::Ok => {}
            other => return other,
        }
        ysdot.axpy(r2delta_p, ytemp);
        ysdot.axpy(-r2delta_p, ftemp);
    } else {
        // Separate forward quotients.
        let r_delta_y = one / delta_y;
        ytemp.linear_sum(delta_y, ys, one, y);
        match feval(t, ytemp, ysdot, params) {
            RhsResult::Ok => {}
            other => return other,
        }
        ysdot.scale_mut(r_delta_y);
        ysdot.axpy(-r_delta_y, ydot);
        params[which] = psave + delta_p;
        match feval(t, y, ytemp, params) {
            RhsResult::Ok => {}
            other => return other,
        }
        ysdot.axpy(r_delta_p, ytemp);
        ysdot.axpy(-r_delta_p, ydot);
    }
    RhsResult::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn make_rhs() -> RhsFn<DVector<f64>> {
        // y' = -p0 y; df/dy s + df/dp = -p0 s - y.
        Box::new(
            |_t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>, p: &[f64]| {
                ydot[0] = -p[0] * y[0];
                RhsResult::Ok
            },
        )
    }

    #[test]
    fn dq_matches_analytic_sensitivity_rhs() {
        let mut f = make_rhs();
        let mut params = vec![2.0];
        let y = DVector::from_vec(vec![3.0]);
        let mut ydot = DVector::zeros(1);
        f(0.0, &y, &mut ydot, &params);
        let ys = DVector::from_vec(vec![0.5]);
        let mut ysdot = DVector::zeros(1);
        let mut ytemp = DVector::zeros(1);
        let mut ftemp = DVector::zeros(1);
        let ewt = DVector::from_element(1, 1.0);

        let res = dq_sens_rhs1(
            &mut f,
            &mut params,
            0.0,
            &y,
            &ydot,
            &ys,
            &mut ysdot,
            &mut ytemp,
            &mut ftemp,
            0,
            1.0,
            0.0,
            &ewt,
            1e-8,
            f64::EPSILON,
            &mut 0,
        );
        assert_eq!(res, RhsResult::Ok);
        // s' = -p s - y = -2*0.5 - 3 = -4
        assert!((ysdot[0] - (-4.0)).abs() < 1e-4);
        // The perturbed parameter is restored.
        assert_eq!(params[0], 2.0);
    }

    #[test]
    fn dq_forward_scheme_selected_by_negative_rhomax() {
        let mut f = make_rhs();
        let mut params = vec![1.0];
        let y = DVector::from_vec(vec![1.0]);
        let mut ydot = DVector::zeros(1);
        f(0.0, &y, &mut ydot, &params);
        let ys = DVector::from_vec(vec![1.0]);
        let mut ysdot = DVector::zeros(1);
        let mut ytemp = DVector::zeros(1);
        let mut ftemp = DVector::zeros(1);
        let ewt = DVector::from_element(1, 1.0);

        let res = dq_sens_rhs1(
            &mut f,
            &mut params,
            0.0,
            &y,
            &ydot,
            &ys,
            &mut ysdot,
            &mut ytemp,
            &mut ftemp,
            0,
            1.0,
            -1.0,
            &ewt,
            1e-6,
            f64::EPSILON,
            &mut 0,
        );
        assert_eq!(res, RhsResult::Ok);
        // s' = -p s - y = -2, to forward-difference accuracy.
        assert!((ysdot[0] - (-2.0)).abs() < 1e-2);
        assert_eq!(params[0], 1.0);
    }

    #[test]
    fn dq_default_rhomax_keeps_perturbations_separate() {
        // The centered schemes are told apart by their evaluation counts:
        // separate state and parameter quotients cost four right-hand-side
        // calls, the combined perturbation only two.
        let run = |rhomax: f64| -> u64 {
            let mut f = make_rhs();
            let mut params = vec![2.0];
            let y = DVector::from_vec(vec![3.0]);
            let mut ydot = DVector::zeros(1);
            f(0.0, &y, &mut ydot, &params);
            let ys = DVector::from_vec(vec![0.5]);
            let mut ysdot = DVector::zeros(1);
            let mut ytemp = DVector::zeros(1);
            let mut ftemp = DVector::zeros(1);
            let ewt = DVector::from_element(1, 1.0);
            let mut nfes = 0;
            let res = dq_sens_rhs1(
                &mut f,
                &mut params,
                0.0,
                &y,
                &ydot,
                &ys,
                &mut ysdot,
                &mut ytemp,
                &mut ftemp,
                0,
                1.0,
                rhomax,
                &ewt,
                1e-8,
                f64::EPSILON,
                &mut nfes,
            );
            assert_eq!(res, RhsResult::Ok);
            assert_eq!(params[0], 2.0);
            nfes
        };
        // rhomax = 0 never satisfies max(ratio, 1/ratio) <= |rhomax|.
        assert_eq!(run(0.0), 4);
        // A permissive bound lets the combined perturbation through.
        assert_eq!(run(2.0), 2);
    }
}
