use log::warn;
use num_traits::{Float, One, Zero};
use serde::Serialize;

use crate::errors::{OdeError, RhsResult};
use crate::linear_solver::LinearSolver;
use crate::scalar::Scalar;
use crate::vector::Vector;

use super::history;
use super::problem::{ewt_set, RhsFn, Tolerance};
use super::quadrature::QuadState;
use super::sensitivity::SensState;

pub(crate) const ADAMS_Q_MAX: usize = 12;
pub(crate) const BDF_Q_MAX: usize = 5;
pub(crate) const Q_MAX: usize = ADAMS_Q_MAX;
pub(crate) const L_MAX: usize = Q_MAX + 1;

const MXSTEP_DEFAULT: usize = 500;
const MXHNIL_DEFAULT: u32 = 10;
const MAXCOR_DEFAULT: usize = 3;
const MAXNEF_DEFAULT: u32 = 7;
const MAXNCF_DEFAULT: u32 = 10;
const NLSCOEF_DEFAULT: f64 = 0.1;

/// Step-size ratio ceilings: first step, early steps, steady state.
pub(crate) const ETAMX1: f64 = 1.0e4;
pub(crate) const ETAMX2: f64 = 10.0;
pub(crate) const ETAMX3: f64 = 10.0;
/// Ceiling after an error-test failure, floor anywhere.
pub(crate) const ETAMXF: f64 = 0.2;
pub(crate) const ETAMIN: f64 = 0.1;
/// Ratio applied after a corrector convergence failure.
pub(crate) const ETACF: f64 = 0.25;
pub(crate) const ADDON: f64 = 1.0e-6;
pub(crate) const BIAS1: f64 = 6.0;
pub(crate) const BIAS2: f64 = 6.0;
pub(crate) const BIAS3: f64 = 10.0;
pub(crate) const ONEPSM: f64 = 1.000001;
/// Steps during which the early-phase eta ceiling applies.
pub(crate) const SMALL_NST: u64 = 10;
pub(crate) const SMALL_NEF: u32 = 2;
pub(crate) const MXNEF1: u32 = 3;
pub(crate) const LONG_WAIT: i32 = 10;
/// Step ratios below this are not worth a rescale.
pub(crate) const THRESH: f64 = 1.5;
pub(crate) const FUZZ_FACTOR: f64 = 100.0;

/// Convergence-rate decay and divergence thresholds of the correctors.
pub(crate) const CRDOWN: f64 = 0.3;
pub(crate) const RDIV: f64 = 2.0;
/// Steps between mandatory iteration-matrix setups, and the gamma drift that
/// forces one.
pub(crate) const MSBP: u64 = 20;
pub(crate) const DGMAX: f64 = 0.3;

const HLB_FACTOR: f64 = 100.0;
const HUB_FACTOR: f64 = 0.1;
/// Per-component magnitude scale in the initial-step upper bound.
pub(crate) const HUB_YSCALE: f64 = 100.0;
const H_BIAS: f64 = 0.5;
const MAX_H0_ITERS: usize = 4;

/// Linear multistep family. Fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    /// Adams-Moulton, orders 1-12, for non-stiff problems.
    Adams,
    /// Backward differentiation formulas, orders 1-5, for stiff problems.
    Bdf,
}

impl Method {
    pub(crate) fn max_order(self) -> usize {
        match self {
            Method::Adams => ADAMS_Q_MAX,
            Method::Bdf => BDF_Q_MAX,
        }
    }
}

/// Nonlinear corrector family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterKind {
    /// Fixed-point iteration; no linear solver involved.
    Functional,
    /// Modified Newton iteration against `M = I - gamma J`; requires an
    /// attached [`LinearSolver`].
    Newton,
}

/// What `solve` should do with the requested output time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Task {
    /// Step until `tout` is passed, then interpolate there.
    Normal,
    /// Take a single internal step and return.
    OneStep,
    /// As `Normal`, but never step past the configured stop time.
    NormalTstop,
    /// As `OneStep`, but never step past the configured stop time.
    OneStepTstop,
}

impl Task {
    fn normal_mode(self) -> bool {
        matches!(self, Task::Normal | Task::NormalTstop)
    }

    fn with_tstop(self) -> bool {
        matches!(self, Task::NormalTstop | Task::OneStepTstop)
    }
}

/// Successful return kind of [`OdeSolver::solve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverStatus {
    Success,
    /// The integration stopped exactly at the configured stop time.
    TstopReturn,
}

/// Integrator counters and step data, in one serializable snapshot.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Statistics {
    pub number_of_steps: u64,
    pub number_of_rhs_evals: u64,
    pub number_of_linear_solver_setups: u64,
    pub number_of_error_test_failures: u64,
    pub number_of_nonlinear_solver_iterations: u64,
    pub number_of_nonlinear_solver_fails: u64,
    pub number_of_step_size_warnings: u32,
    pub number_of_stability_order_reductions: u64,
    pub last_order: usize,
    pub current_order: usize,
    pub initial_step_size: f64,
    pub last_step_size: f64,
    pub current_step_size: f64,
    pub current_time: f64,
    pub tolerance_scale_factor: f64,
    pub number_of_quad_rhs_evals: u64,
    pub number_of_quad_error_test_failures: u64,
    pub number_of_sens_rhs_evals: u64,
    pub number_of_rhs_evals_for_sens: u64,
    pub number_of_sens_nonlinear_solver_iterations: u64,
    pub number_of_sens_nonlinear_solver_fails: u64,
    pub number_of_sens_error_test_failures: u64,
    /// Per-sensitivity corrector iteration counts (one-at-a-time staggered
    /// corrector only).
    pub number_of_staggered1_nonlinear_iterations: Vec<u64>,
    /// Per-sensitivity corrector failure counts (one-at-a-time staggered
    /// corrector only).
    pub number_of_staggered1_nonlinear_fails: Vec<u64>,
}

/// Variable-order, variable-step Adams/BDF integrator on a Nordsieck history.
///
/// Created with a [`Method`], configured through the `set_*` options,
/// initialized with [`init`](Self::init) and driven by
/// [`solve`](Self::solve). Quadrature and forward-sensitivity subsystems are
/// switched on with [`quad_init`](Self::quad_init) and
/// [`sens_init`](Self::sens_init).
pub struct OdeSolver<V: Vector> {
    pub(crate) method: Method,
    pub(crate) iter: IterKind,
    pub(crate) lsolver: Option<Box<dyn LinearSolver<V>>>,
    pub(crate) uround: V::T,

    // Problem data; `f` is `None` until `init`.
    pub(crate) f: Option<RhsFn<V>>,
    pub(crate) params: Vec<V::T>,
    pub(crate) rtol: V::T,
    pub(crate) atol: Option<Tolerance<V>>,
    pub(crate) n: usize,

    // Nordsieck history and work vectors. `zn[qmax]` doubles as the saved
    // correction column: written by `complete_step` when `qwait == 1` and
    // `q < qmax`, consumed by the BDF order increase.
    pub(crate) zn: Vec<V>,
    pub(crate) ewt: V,
    pub(crate) y: V,
    pub(crate) acor: V,
    pub(crate) tempv: V,
    pub(crate) ftemp: V,

    // Method coefficients at the current order and history.
    pub(crate) l: [V::T; L_MAX],
    pub(crate) tq: [V::T; 6],
    pub(crate) tau: [V::T; L_MAX + 1],

    pub(crate) q: usize,
    pub(crate) qprime: usize,
    pub(crate) next_q: usize,
    pub(crate) qwait: i32,
    pub(crate) qmax: usize,

    pub(crate) h: V::T,
    pub(crate) hprime: V::T,
    pub(crate) next_h: V::T,
    pub(crate) eta: V::T,
    pub(crate) etaqm1: V::T,
    pub(crate) etaq: V::T,
    pub(crate) etaqp1: V::T,
    pub(crate) hscale: V::T,
    pub(crate) tn: V::T,
    pub(crate) tretlast: V::T,

    pub(crate) rl1: V::T,
    pub(crate) gamma: V::T,
    pub(crate) gammap: V::T,
    pub(crate) gamrat: V::T,
    pub(crate) conv_rate: V::T,
    pub(crate) acnrm: V::T,
    pub(crate) nlscoef: V::T,

    pub(crate) mxstep: usize,
    pub(crate) mxhnil: u32,
    pub(crate) maxcor: usize,
    pub(crate) maxnef: u32,
    pub(crate) maxncf: u32,
    pub(crate) hmin: V::T,
    pub(crate) hmax_inv: V::T,
    pub(crate) hin: V::T,
    pub(crate) etamax: V::T,
    pub(crate) tstop: Option<V::T>,
    pub(crate) sldet_on: bool,

    pub(crate) h0u: V::T,
    pub(crate) hu: V::T,
    pub(crate) qu: usize,
    pub(crate) saved_tq5: V::T,
    pub(crate) tolsf: V::T,
    pub(crate) jcur: bool,
    pub(crate) force_setup: bool,

    // Stability-limit detection window: squared scaled derivative norms at
    // orders q-2, q-1, q over the last five steps. 1-based in both indices.
    pub(crate) ssdat: [[V::T; 4]; 6],
    pub(crate) nscon: u32,
    pub(crate) nor: u64,

    pub(crate) nst: u64,
    pub(crate) nfe: u64,
    pub(crate) nsetups: u64,
    pub(crate) nni: u64,
    pub(crate) ncfn: u64,
    pub(crate) netf: u64,
    pub(crate) nhnil: u32,
    pub(crate) nstlp: u64,

    pub(crate) quad: Option<QuadState<V>>,
    pub(crate) sens: Option<SensState<V>>,
}

impl<V: Vector> OdeSolver<V> {
    /// Create an integrator of the given multistep family. The corrector
    /// defaults to functional iteration; attach a linear solver to use
    /// Newton.
    pub fn new(method: Method) -> Self {
        Self {
            method,
            iter: IterKind::Functional,
            lsolver: None,
            uround: V::T::unit_roundoff(),
            f: None,
            params: Vec::new(),
            rtol: V::T::zero(),
            atol: None,
            n: 0,
            zn: Vec::new(),
            ewt: V::zeros(0),
            y: V::zeros(0),
            acor: V::zeros(0),
            tempv: V::zeros(0),
            ftemp: V::zeros(0),
            l: [V::T::zero(); L_MAX],
            tq: [V::T::zero(); 6],
            tau: [V::T::zero(); L_MAX + 1],
            q: 1,
            qprime: 1,
            next_q: 1,
            qwait: 2,
            qmax: method.max_order(),
            h: V::T::zero(),
            hprime: V::T::zero(),
            next_h: V::T::zero(),
            eta: V::T::one(),
            etaqm1: V::T::zero(),
            etaq: V::T::zero(),
            etaqp1: V::T::zero(),
            hscale: V::T::zero(),
            tn: V::T::zero(),
            tretlast: V::T::zero(),
            rl1: V::T::one(),
            gamma: V::T::zero(),
            gammap: V::T::zero(),
            gamrat: V::T::one(),
            conv_rate: V::T::one(),
            acnrm: V::T::zero(),
            nlscoef: V::T::from_f64(NLSCOEF_DEFAULT),
            mxstep: MXSTEP_DEFAULT,
            mxhnil: MXHNIL_DEFAULT,
            maxcor: MAXCOR_DEFAULT,
            maxnef: MAXNEF_DEFAULT,
            maxncf: MAXNCF_DEFAULT,
            hmin: V::T::zero(),
            hmax_inv: V::T::zero(),
            hin: V::T::zero(),
            etamax: V::T::from_f64(ETAMX1),
            tstop: None,
            sldet_on: false,
            h0u: V::T::zero(),
            hu: V::T::zero(),
            qu: 0,
            saved_tq5: V::T::zero(),
            tolsf: V::T::one(),
            jcur: false,
            force_setup: false,
            ssdat: [[V::T::zero(); 4]; 6],
            nscon: 0,
            nor: 0,
            nst: 0,
            nfe: 0,
            nsetups: 0,
            nni: 0,
            ncfn: 0,
            netf: 0,
            nhnil: 0,
            nstlp: 0,
            quad: None,
            sens: None,
        }
    }

    /// Attach a linear solver and switch the corrector to Newton iteration.
    pub fn attach_linear_solver(
        &mut self,
        mut lsolver: Box<dyn LinearSolver<V>>,
    ) -> Result<(), OdeError> {
        if self.n > 0 {
            lsolver.init(self.n)?;
        }
        self.lsolver = Some(lsolver);
        self.iter = IterKind::Newton;
        Ok(())
    }

    /// Switch between functional and Newton iteration. Newton requires a
    /// previously attached linear solver.
    pub fn set_iter_type(&mut self, iter: IterKind) -> Result<(), OdeError> {
        if iter == IterKind::Newton && self.lsolver.is_none() {
            return Err(OdeError::IllInput(
                "Newton iteration requires an attached linear solver",
            ));
        }
        self.iter = iter;
        Ok(())
    }

    /// Provide or replace the problem and start a fresh integration.
    pub fn init(
        &mut self,
        f: RhsFn<V>,
        t0: V::T,
        y0: &V,
        rtol: V::T,
        atol: Tolerance<V>,
    ) -> Result<(), OdeError> {
        if y0.is_empty() {
            return Err(OdeError::IllInput("y0 must be non-empty"));
        }
        if !(rtol >= V::T::zero()) {
            return Err(OdeError::IllInput("reltol must be non-negative"));
        }
        atol.validate(y0.len())?;

        let n = y0.len();
        if n != self.n || self.zn.len() != self.qmax + 1 {
            self.n = n;
            self.zn = (0..=self.qmax).map(|_| V::zeros(n)).collect();
            self.ewt = V::zeros(n);
            self.y = V::zeros(n);
            self.acor = V::zeros(n);
            self.tempv = V::zeros(n);
            self.ftemp = V::zeros(n);
        }
        self.f = Some(f);
        self.rtol = rtol;
        self.atol = Some(atol);
        self.reset_integration(t0, y0)?;
        if let Some(ls) = self.lsolver.as_mut() {
            ls.init(n)?;
        }
        Ok(())
    }

    /// Restart the integration from new initial data, preserving the
    /// problem functions, options and allocations.
    pub fn reinit(&mut self, t0: V::T, y0: &V) -> Result<(), OdeError> {
        if self.f.is_none() {
            return Err(OdeError::NoMemory);
        }
        if y0.len() != self.n {
            return Err(OdeError::IllInput("y0 length changed between inits"));
        }
        self.reset_integration(t0, y0)
    }

    /// Restart with new tolerances as well.
    pub fn reinit_with_tolerances(
        &mut self,
        t0: V::T,
        y0: &V,
        rtol: V::T,
        atol: Tolerance<V>,
    ) -> Result<(), OdeError> {
        if self.f.is_none() {
            return Err(OdeError::NoMemory);
        }
        if !(rtol >= V::T::zero()) {
            return Err(OdeError::IllInput("reltol must be non-negative"));
        }
        atol.validate(self.n)?;
        self.rtol = rtol;
        self.atol = Some(atol);
        self.reinit(t0, y0)
    }

    fn reset_integration(&mut self, t0: V::T, y0: &V) -> Result<(), OdeError> {
        for col in self.zn.iter_mut() {
            col.fill(V::T::zero());
        }
        self.zn[0].copy_from(y0);
        self.q = 1;
        self.qprime = 1;
        self.next_q = 1;
        self.qwait = 2;
        self.h = V::T::zero();
        self.hprime = V::T::zero();
        self.next_h = V::T::zero();
        self.eta = V::T::one();
        self.hscale = V::T::zero();
        self.tn = t0;
        self.tretlast = t0;
        self.rl1 = V::T::one();
        self.gamma = V::T::zero();
        self.gammap = V::T::zero();
        self.gamrat = V::T::one();
        self.conv_rate = V::T::one();
        self.etamax = V::T::from_f64(ETAMX1);
        self.h0u = V::T::zero();
        self.hu = V::T::zero();
        self.qu = 0;
        self.saved_tq5 = V::T::zero();
        self.tolsf = V::T::one();
        self.jcur = false;
        self.force_setup = false;
        self.tau = [V::T::zero(); L_MAX + 1];
        self.l = [V::T::zero(); L_MAX];
        self.tq = [V::T::zero(); 6];
        self.ssdat = [[V::T::zero(); 4]; 6];
        self.nscon = 0;
        self.nor = 0;
        self.nst = 0;
        self.nfe = 0;
        self.nsetups = 0;
        self.nni = 0;
        self.ncfn = 0;
        self.netf = 0;
        self.nhnil = 0;
        self.nstlp = 0;

        // Initial weights must be computable at y0.
        let rtol = self.rtol;
        let atol = self.atol.as_ref().expect("tolerances set above");
        ewt_set(&self.zn[0], rtol, atol, &mut self.tempv, &mut self.ewt)
            .map_err(|_| OdeError::EwtInvalid)?;
        Ok(())
    }

    // ---- options -------------------------------------------------------

    /// Cap the method order. Cannot exceed the family maximum, nor be raised
    /// above the value the history was allocated with.
    pub fn set_max_order(&mut self, maxord: usize) -> Result<(), OdeError> {
        if maxord < 1 || maxord > self.method.max_order() {
            return Err(OdeError::IllInput("maxord out of range for the method"));
        }
        if self.f.is_some() && maxord > self.qmax {
            return Err(OdeError::IllInput(
                "maxord cannot be raised after initialization",
            ));
        }
        if self.nst > 0 && maxord < self.q {
            return Err(OdeError::IllInput(
                "maxord cannot drop below the current order mid-run",
            ));
        }
        self.qmax = maxord;
        Ok(())
    }

    /// Internal step limit per `solve` call; 0 restores the default.
    pub fn set_max_num_steps(&mut self, mxstep: usize) {
        self.mxstep = if mxstep == 0 { MXSTEP_DEFAULT } else { mxstep };
    }

    /// How many `t + h == t` warnings to emit before going quiet.
    pub fn set_max_hnil_warns(&mut self, mxhnil: u32) {
        self.mxhnil = mxhnil;
    }

    /// Enable BDF stability-limit detection.
    pub fn set_stab_lim_det(&mut self, on: bool) -> Result<(), OdeError> {
        if self.method != Method::Bdf {
            return Err(OdeError::IllInput(
                "stability limit detection applies to BDF only",
            ));
        }
        self.sldet_on = on;
        Ok(())
    }

    /// Initial step size; 0 selects it automatically.
    pub fn set_init_step(&mut self, hin: V::T) {
        self.hin = hin;
    }

    pub fn set_min_step(&mut self, hmin: V::T) -> Result<(), OdeError> {
        if hmin < V::T::zero() {
            return Err(OdeError::IllInput("hmin must be non-negative"));
        }
        if hmin * self.hmax_inv > V::T::one() {
            return Err(OdeError::IllInput("hmin must not exceed hmax"));
        }
        self.hmin = hmin;
        Ok(())
    }

    pub fn set_max_step(&mut self, hmax: V::T) -> Result<(), OdeError> {
        if hmax <= V::T::zero() {
            return Err(OdeError::IllInput("hmax must be positive"));
        }
        let hmax_inv = V::T::one() / hmax;
        if self.hmin * hmax_inv > V::T::one() {
            return Err(OdeError::IllInput("hmax must not drop below hmin"));
        }
        self.hmax_inv = hmax_inv;
        Ok(())
    }

    /// Set the time past which the integration never steps; honored by the
    /// `*Tstop` tasks.
    pub fn set_stop_time(&mut self, tstop: V::T) {
        self.tstop = Some(tstop);
    }

    pub fn clear_stop_time(&mut self) {
        self.tstop = None;
    }

    pub fn set_max_err_test_fails(&mut self, maxnef: u32) -> Result<(), OdeError> {
        if maxnef == 0 {
            return Err(OdeError::IllInput("maxnef must be positive"));
        }
        self.maxnef = maxnef;
        Ok(())
    }

    pub fn set_max_conv_fails(&mut self, maxncf: u32) -> Result<(), OdeError> {
        if maxncf == 0 {
            return Err(OdeError::IllInput("maxncf must be positive"));
        }
        self.maxncf = maxncf;
        Ok(())
    }

    pub fn set_max_nonlin_iters(&mut self, maxcor: usize) -> Result<(), OdeError> {
        if maxcor == 0 {
            return Err(OdeError::IllInput("maxcor must be positive"));
        }
        self.maxcor = maxcor;
        Ok(())
    }

    /// Safety coefficient in the corrector convergence test.
    pub fn set_nonlin_conv_coef(&mut self, nlscoef: V::T) -> Result<(), OdeError> {
        if nlscoef <= V::T::zero() {
            return Err(OdeError::IllInput("nonlin_conv_coef must be positive"));
        }
        self.nlscoef = nlscoef;
        Ok(())
    }

    /// Problem parameters visible to the right-hand-side functions (and
    /// perturbed by the sensitivity difference quotients).
    pub fn set_params(&mut self, params: Vec<V::T>) {
        self.params = params;
    }

    // ---- inspection ----------------------------------------------------

    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics {
            number_of_steps: self.nst,
            number_of_rhs_evals: self.nfe,
            number_of_linear_solver_setups: self.nsetups,
            number_of_error_test_failures: self.netf,
            number_of_nonlinear_solver_iterations: self.nni,
            number_of_nonlinear_solver_fails: self.ncfn,
            number_of_step_size_warnings: self.nhnil,
            number_of_stability_order_reductions: self.nor,
            last_order: self.qu,
            current_order: self.next_q,
            initial_step_size: self.h0u.as_f64(),
            last_step_size: self.hu.as_f64(),
            current_step_size: self.next_h.as_f64(),
            current_time: self.tn.as_f64(),
            tolerance_scale_factor: self.tolsf.as_f64(),
            ..Statistics::default()
        };
        if let Some(quad) = self.quad.as_ref() {
            stats.number_of_quad_rhs_evals = quad.nfqe;
            stats.number_of_quad_error_test_failures = quad.netfq;
        }
        if let Some(sens) = self.sens.as_ref() {
            stats.number_of_sens_rhs_evals = sens.nfse;
            stats.number_of_rhs_evals_for_sens = sens.nfes;
            stats.number_of_sens_nonlinear_solver_iterations = sens.nnis;
            stats.number_of_sens_nonlinear_solver_fails = sens.ncfns;
            stats.number_of_sens_error_test_failures = sens.netfs;
            stats.number_of_staggered1_nonlinear_iterations = sens.nnis1.clone();
            stats.number_of_staggered1_nonlinear_fails = sens.ncfns1.clone();
        }
        stats
    }

    /// The estimated local error vector of the last step.
    pub fn estimated_local_errors(&self, ele: &mut V) -> Result<(), OdeError> {
        if self.f.is_none() {
            return Err(OdeError::NoMemory);
        }
        if ele.len() != self.n {
            return Err(OdeError::BadDky);
        }
        ele.copy_from(&self.acor);
        Ok(())
    }

    /// Interpolate the `k`-th derivative of the solution polynomial at `t`,
    /// valid over the last step interval (with a little fuzz).
    pub fn get_dky(&self, t: V::T, k: usize, dky: &mut V) -> Result<(), OdeError> {
        if self.f.is_none() {
            return Err(OdeError::NoMemory);
        }
        if k > self.q {
            return Err(OdeError::BadK);
        }
        if dky.len() != self.n {
            return Err(OdeError::BadDky);
        }
        self.check_dky_t(t)?;
        let h = if self.h == V::T::zero() {
            V::T::one()
        } else {
            self.h
        };
        let s = (t - self.tn) / h;
        history::interpolate(&self.zn, self.q, k, s, h, dky);
        Ok(())
    }

    pub(crate) fn check_dky_t(&self, t: V::T) -> Result<(), OdeError> {
        let mut tfuzz =
            V::T::from_f64(FUZZ_FACTOR) * self.uround * (self.tn.abs() + self.hu.abs());
        if self.hu < V::T::zero() {
            tfuzz = -tfuzz;
        }
        let tp = self.tn - self.hu - tfuzz;
        let tn1 = self.tn + tfuzz;
        if (t - tp) * (t - tn1) > V::T::zero() {
            let (tmin, tmax) = if self.hu >= V::T::zero() {
                (self.tn - self.hu, self.tn)
            } else {
                (self.tn, self.tn - self.hu)
            };
            return Err(OdeError::BadT {
                t: t.as_f64(),
                tmin: tmin.as_f64(),
                tmax: tmax.as_f64(),
            });
        }
        Ok(())
    }

    // ---- driver --------------------------------------------------------

    /// Advance the integration toward `tout` according to `itask`. On
    /// success returns the reached time; on failure the last solution is
    /// left in `yout`.
    pub fn solve(
        &mut self,
        tout: V::T,
        yout: &mut V,
        itask: Task,
    ) -> Result<(V::T, SolverStatus), OdeError> {
        if self.f.is_none() {
            return Err(OdeError::NoMemory);
        }
        if yout.len() != self.n {
            return Err(OdeError::IllInput("yout has the wrong length"));
        }
        if itask.with_tstop() && self.tstop.is_none() {
            return Err(OdeError::IllInput("stop time has not been set"));
        }

        let result = self.solve_inner(tout, yout, itask);
        if result.is_err() {
            yout.copy_from(&self.zn[0]);
            self.tretlast = self.tn;
        }
        result
    }

    fn solve_inner(
        &mut self,
        tout: V::T,
        yout: &mut V,
        itask: Task,
    ) -> Result<(V::T, SolverStatus), OdeError> {
        let one = V::T::one();
        let zero = V::T::zero();

        if self.nst == 0 {
            self.begin_integration(tout, itask)?;
        } else if let Some(status) = self.entry_stop_tests(tout, yout, itask)? {
            return Ok(status);
        }

        let mut nstloc: usize = 0;
        loop {
            self.next_h = self.h;
            self.next_q = self.q;

            // Refresh the error weights at the current solution.
            if self.nst > 0 {
                self.refresh_weights()?;
            }

            if nstloc >= self.mxstep {
                warn!(
                    "maximum number of steps ({}) reached before tout at t = {}",
                    self.mxstep, self.tn
                );
                yout.copy_from(&self.zn[0]);
                self.tretlast = self.tn;
                return Err(OdeError::TooMuchWork {
                    t: self.tn.as_f64(),
                });
            }

            // Too-much-accuracy check.
            let nrm = self.solution_norm();
            self.tolsf = self.uround * nrm;
            if self.tolsf > one {
                self.tolsf = self.tolsf * V::T::from_f64(2.0);
                yout.copy_from(&self.zn[0]);
                self.tretlast = self.tn;
                return Err(OdeError::TooMuchAcc {
                    t: self.tn.as_f64(),
                    tolsf: self.tolsf.as_f64(),
                });
            }

            if self.tn + self.hprime == self.tn {
                self.nhnil += 1;
                if self.nhnil <= self.mxhnil {
                    warn!(
                        "internal t = {} and step size h = {} are such that t + h == t; \
                         the solver will continue anyway",
                        self.tn, self.hprime
                    );
                }
                if self.nhnil == self.mxhnil {
                    warn!("further t + h == t warnings will be suppressed");
                }
            }

            self.step_once()?;
            nstloc += 1;

            if itask.normal_mode() && (self.tn - tout) * self.h >= zero {
                self.get_dky(tout, 0, yout)?;
                self.tretlast = tout;
                self.next_q = self.qprime;
                self.next_h = self.hprime;
                return Ok((tout, SolverStatus::Success));
            }

            if itask.with_tstop() {
                if let Some(status) = self.tstop_tests(yout)? {
                    return Ok(status);
                }
            }

            if !itask.normal_mode() {
                yout.copy_from(&self.zn[0]);
                self.tretlast = self.tn;
                self.next_q = self.qprime;
                self.next_h = self.hprime;
                return Ok((self.tn, SolverStatus::Success));
            }
        }
    }

    /// First-call work: evaluate the derivative columns, pick the initial
    /// step and scale the history into Nordsieck form.
    fn begin_integration(&mut self, tout: V::T, itask: Task) -> Result<(), OdeError> {
        let one = V::T::one();
        let zero = V::T::zero();

        // zn[1] := f(t0, y0), unscaled for now.
        {
            let (z0, z1) = self.zn.split_at_mut(1);
            let f = self.f.as_mut().expect("checked by solve");
            self.nfe += 1;
            match f(self.tn, &z0[0], &mut z1[0], &self.params) {
                RhsResult::Ok => {}
                RhsResult::RecoverableError => {
                    return Err(OdeError::FirstRhsFailed {
                        t: self.tn.as_f64(),
                    })
                }
                RhsResult::NonRecoverableError => {
                    return Err(OdeError::RhsFailed {
                        t: self.tn.as_f64(),
                    })
                }
            }
        }
        self.quad_begin()?;
        self.sens_begin()?;
        // All weight vectors must exist before the step-size estimate.
        self.refresh_weights().map_err(|_| OdeError::EwtInvalid)?;

        let mut h = self.hin;
        if h != zero && (tout - self.tn) * h < zero {
            return Err(OdeError::IllInput("hin and tout - t0 have opposite signs"));
        }
        if h == zero {
            let mut tout_hin = tout;
            if itask.with_tstop() {
                let tstop = self.tstop.expect("checked by solve");
                if (tout - self.tn) * (tout - tstop) > zero {
                    tout_hin = tstop;
                }
            }
            h = self.estimate_initial_step(tout_hin)?;
        }

        let rh = h.abs() * self.hmax_inv;
        if rh > one {
            h = h / rh;
        }
        if h.abs() < self.hmin {
            h = h * (self.hmin / h.abs());
        }
        if itask.with_tstop() {
            let tstop = self.tstop.expect("checked by solve");
            if (tstop - self.tn) * h <= zero {
                return Err(OdeError::IllInput("tstop is behind the initial time"));
            }
            if (self.tn + h - tstop) * h > zero {
                h = (tstop - self.tn) * (one - V::T::from_f64(4.0) * self.uround);
            }
        }

        self.h = h;
        self.h0u = h;
        self.hprime = h;
        self.hscale = h;
        self.zn[1].scale_mut(h);
        self.quad_scale_zn1(h);
        self.sens_scale_zn1(h);
        Ok(())
    }

    /// Entry checks for a continuation call: output time already reached,
    /// pending one-step return, stop time hit by the previous step.
    fn entry_stop_tests(
        &mut self,
        tout: V::T,
        yout: &mut V,
        itask: Task,
    ) -> Result<Option<(V::T, SolverStatus)>, OdeError> {
        let zero = V::T::zero();

        if itask.normal_mode() && (self.tn - tout) * self.h >= zero {
            self.get_dky(tout, 0, yout).map_err(|_| {
                OdeError::IllInput("tout is behind the interval reachable from tn")
            })?;
            self.tretlast = tout;
            return Ok(Some((tout, SolverStatus::Success)));
        }

        if itask.with_tstop() {
            let tstop = self.tstop.expect("checked by solve");
            let troundoff =
                V::T::from_f64(FUZZ_FACTOR) * self.uround * (self.tn.abs() + self.h.abs());
            if (self.tn - tstop).abs() <= troundoff {
                self.get_dky(tstop, 0, yout)?;
                self.tretlast = tstop;
                self.tstop = None;
                return Ok(Some((tstop, SolverStatus::TstopReturn)));
            }
            if (tstop - self.tn) * self.h <= zero {
                return Err(OdeError::IllInput("tstop is behind the current time"));
            }
            if (self.tn + self.hprime - tstop) * self.h > zero {
                self.hprime = (tstop - self.tn) * (V::T::one() - V::T::from_f64(4.0) * self.uround);
                self.eta = self.hprime / self.h;
            }
        }

        if !itask.normal_mode() && self.tretlast != self.tn {
            yout.copy_from(&self.zn[0]);
            self.tretlast = self.tn;
            return Ok(Some((self.tn, SolverStatus::Success)));
        }

        Ok(None)
    }

    /// Post-step stop-time checks: exact hit within roundoff, and trimming
    /// of the next step so it cannot fly past.
    fn tstop_tests(&mut self, yout: &mut V) -> Result<Option<(V::T, SolverStatus)>, OdeError> {
        let tstop = match self.tstop {
            Some(tstop) => tstop,
            None => return Ok(None),
        };
        let troundoff =
            V::T::from_f64(FUZZ_FACTOR) * self.uround * (self.tn.abs() + self.h.abs());
        if (self.tn - tstop).abs() <= troundoff {
            self.get_dky(tstop, 0, yout)?;
            self.tretlast = tstop;
            self.tstop = None;
            return Ok(Some((tstop, SolverStatus::TstopReturn)));
        }
        if (self.tn + self.hprime - tstop) * self.h > V::T::zero() {
            self.hprime = (tstop - self.tn) * (V::T::one() - V::T::from_f64(4.0) * self.uround);
            self.eta = self.hprime / self.h;
        }
        Ok(None)
    }

    pub(crate) fn refresh_weights(&mut self) -> Result<(), OdeError> {
        let rtol = self.rtol;
        {
            let atol = self.atol.as_ref().expect("initialized");
            ewt_set(&self.zn[0], rtol, atol, &mut self.tempv, &mut self.ewt).map_err(|_| {
                OdeError::EwtNowBad {
                    t: self.tn.as_f64(),
                }
            })?;
        }
        self.quad_refresh_weights()?;
        self.sens_refresh_weights()?;
        Ok(())
    }

    /// Weighted norm of the full solution, folding in the subsystems that
    /// participate in error control.
    fn solution_norm(&self) -> V::T {
        let mut nrm = self.zn[0].wrms_norm(&self.ewt);
        nrm = self.quad_update_solution_norm(nrm);
        nrm = self.sens_update_solution_norm(nrm);
        nrm
    }

    // ---- initial step size --------------------------------------------

    /// Pick a first step size from the geometry of `y0`, `y0'` and the
    /// tolerances: bracket it by roundoff and travel-distance bounds, then
    /// refine against an estimated second derivative.
    fn estimate_initial_step(&mut self, tout: V::T) -> Result<V::T, OdeError> {
        let one = V::T::one();
        let zero = V::T::zero();
        let two = V::T::from_f64(2.0);
        let half = V::T::from_f64(0.5);

        let tdiff = tout - self.tn;
        if tdiff == zero {
            return Err(OdeError::TooClose);
        }
        let sign = if tdiff > zero { one } else { -one };
        let tdist = tdiff.abs();
        let tround = self.uround * self.tn.abs().max(tout.abs());
        if tdist < two * tround {
            return Err(OdeError::TooClose);
        }

        let hlb = V::T::from_f64(HLB_FACTOR) * tround;
        let hub = self.upper_bound_h0(tdist);

        let mut hg = (hlb * hub).sqrt();
        if hub < hlb {
            return Ok(sign * hg);
        }

        let mut hnew_ok = false;
        let mut hnew = hg;
        let mut hs = hg;
        let mut count1 = 0;
        loop {
            count1 += 1;
            // Probe with hg, backing off while the right-hand side keeps
            // failing recoverably.
            let mut hg_ok = false;
            let mut yddnrm = zero;
            for _ in 0..MAX_H0_ITERS {
                match self.ydd_norm(hg * sign)? {
                    Some(nrm) => {
                        yddnrm = nrm;
                        hg_ok = true;
                        break;
                    }
                    None => hg = V::T::from_f64(0.2) * hg,
                }
            }
            if !hg_ok {
                if count1 <= 2 {
                    return Err(OdeError::RepeatedRhsFailure {
                        t: self.tn.as_f64(),
                    });
                }
                hnew = hs;
                break;
            }
            hs = hg;
            if hnew_ok || count1 == MAX_H0_ITERS {
                hnew = hg;
                break;
            }

            hnew = if yddnrm * hub * hub > two {
                (two / yddnrm).sqrt()
            } else {
                (hg * hub).sqrt()
            };
            let hrat = hnew / hg;
            if hrat > half && hrat < two {
                hnew_ok = true;
            }
            // A growing proposal after the first pass indicates cancellation
            // error in the difference quotient: settle for the current value.
            if count1 > 1 && hrat >= two {
                hnew = hg;
                hnew_ok = true;
            }
            hg = hnew;
        }

        let mut h0 = V::T::from_f64(H_BIAS) * hnew;
        if h0 < hlb {
            h0 = hlb;
        }
        if h0 > hub {
            h0 = hub;
        }
        Ok(h0 * sign)
    }

    /// Upper bound on the initial step: a fraction of the travel distance,
    /// clipped so no solution component can change by more than about two
    /// orders of magnitude in one step.
    fn upper_bound_h0(&mut self, tdist: V::T) -> V::T {
        let one = V::T::one();
        self.tempv.abs_from(&self.zn[0]);
        self.tempv.scale_mut(V::T::from_f64(HUB_YSCALE));
        match self.atol.as_ref().expect("initialized") {
            Tolerance::Scalar(a) => self.tempv.add_scalar_mut(*a),
            Tolerance::Vector(a) => self.tempv.axpy(one, a),
        }
        self.ftemp.abs_from(&self.zn[1]);
        self.y.div_from(&self.ftemp, &self.tempv);
        let mut hub_inv = self.y.max_norm();
        hub_inv = self.quad_update_hub_inv(hub_inv);
        hub_inv = self.sens_update_hub_inv(hub_inv);

        let mut hub = V::T::from_f64(HUB_FACTOR) * tdist;
        if hub * hub_inv > one {
            hub = one / hub_inv;
        }
        hub
    }

    /// Weighted norm of an approximate second derivative at step size `hg`.
    /// `None` reports a recoverable right-hand-side failure.
    fn ydd_norm(&mut self, hg: V::T) -> Result<Option<V::T>, OdeError> {
        let one = V::T::one();

        self.y.linear_sum(hg, &self.zn[1], one, &self.zn[0]);
        {
            let f = self.f.as_mut().expect("initialized");
            self.nfe += 1;
            match f(self.tn + hg, &self.y, &mut self.tempv, &self.params) {
                RhsResult::Ok => {}
                RhsResult::RecoverableError => return Ok(None),
                RhsResult::NonRecoverableError => {
                    return Err(OdeError::RhsFailed {
                        t: self.tn.as_f64(),
                    })
                }
            }
        }
        // Subsystem folds read the fresh derivative still in tempv, so they
        // run before the state difference quotient overwrites it.
        let mut sub_nrm = V::T::zero();
        sub_nrm = self.quad_update_ydd_norm(hg, sub_nrm)?;
        sub_nrm = self.sens_update_ydd_norm(hg, sub_nrm)?;
        self.tempv.axpy(-one, &self.zn[1]);
        self.tempv.scale_mut(one / hg);
        let yddnrm = self.tempv.wrms_norm(&self.ewt).max(sub_nrm);
        Ok(Some(yddnrm))
    }
}
