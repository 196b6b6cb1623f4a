//! Pure quadrature integration `yq' = f_Q(t, y)` riding on the state steps.
//!
//! Quadratures never enter the nonlinear system: after the state corrector
//! converges, one quadrature right-hand-side evaluation produces the
//! correction directly. They optionally participate in the local error test.

use num_traits::{Float, One, Zero};

use crate::errors::{OdeError, RhsResult};
use crate::scalar::Scalar;
use crate::vector::Vector;

use super::history;
use super::problem::{ewt_set, QuadRhsFn, Tolerance};
use super::solver::OdeSolver;

pub(crate) struct QuadState<V: Vector> {
    pub fq: QuadRhsFn<V>,
    pub err_con: bool,
    pub rtol: V::T,
    pub atol: Option<Tolerance<V>>,
    pub nq: usize,
    pub znq: Vec<V>,
    pub ewtq: V,
    pub yq: V,
    pub acorq: V,
    pub tempvq: V,
    pub nfqe: u64,
    pub netfq: u64,
}

impl<V: Vector> OdeSolver<V> {
    /// Activate quadrature integration with initial values `yq0`.
    ///
    /// Quadratures are excluded from the error test until
    /// [`set_quad_err_con`](Self::set_quad_err_con) turns it on, which also
    /// requires quadrature tolerances.
    pub fn quad_init(&mut self, fq: QuadRhsFn<V>, yq0: &V) -> Result<(), OdeError> {
        if self.f.is_none() {
            return Err(OdeError::NoMemory);
        }
        if yq0.is_empty() {
            return Err(OdeError::IllInput("yq0 must be non-empty"));
        }
        let nq = yq0.len();
        let mut znq: Vec<V> = (0..=self.qmax).map(|_| V::zeros(nq)).collect();
        znq[0].copy_from(yq0);
        self.quad = Some(QuadState {
            fq,
            err_con: false,
            rtol: V::T::zero(),
            atol: None,
            nq,
            znq,
            ewtq: V::zeros(nq),
            yq: V::zeros(nq),
            acorq: V::zeros(nq),
            tempvq: V::zeros(nq),
            nfqe: 0,
            netfq: 0,
        });
        Ok(())
    }

    /// Reset the quadrature values for a restarted integration, keeping the
    /// function, tolerances and allocations.
    pub fn quad_reinit(&mut self, yq0: &V) -> Result<(), OdeError> {
        let quad = self.quad.as_mut().ok_or(OdeError::NoQuad)?;
        if yq0.len() != quad.nq {
            return Err(OdeError::IllInput("yq0 length changed between inits"));
        }
        for col in quad.znq.iter_mut() {
            col.fill(V::T::zero());
        }
        quad.znq[0].copy_from(yq0);
        quad.nfqe = 0;
        quad.netfq = 0;
        Ok(())
    }

    /// Include or exclude the quadratures from the local error test.
    /// Inclusion requires tolerances set via
    /// [`set_quad_tolerances`](Self::set_quad_tolerances).
    pub fn set_quad_err_con(&mut self, err_con: bool) -> Result<(), OdeError> {
        let quad = self.quad.as_mut().ok_or(OdeError::NoQuad)?;
        if err_con && quad.atol.is_none() {
            return Err(OdeError::IllInput(
                "quadrature error control requires quadrature tolerances",
            ));
        }
        quad.err_con = err_con;
        Ok(())
    }

    pub fn set_quad_tolerances(
        &mut self,
        rtolq: V::T,
        atolq: Tolerance<V>,
    ) -> Result<(), OdeError> {
        let quad = self.quad.as_mut().ok_or(OdeError::NoQuad)?;
        if !(rtolq >= V::T::zero()) {
            return Err(OdeError::IllInput("quadrature reltol must be non-negative"));
        }
        atolq.validate(quad.nq)?;
        quad.rtol = rtolq;
        quad.atol = Some(atolq);
        Ok(())
    }

    /// Interpolate the `k`-th quadrature derivative at `t`.
    pub fn get_dky_quad(&self, t: V::T, k: usize, dkyq: &mut V) -> Result<(), OdeError> {
        let quad = self.quad.as_ref().ok_or(OdeError::NoQuad)?;
        if k > self.q {
            return Err(OdeError::BadK);
        }
        if dkyq.len() != quad.nq {
            return Err(OdeError::BadDky);
        }
        self.check_dky_t(t)?;
        let h = if self.h == V::T::zero() {
            V::T::one()
        } else {
            self.h
        };
        let s = (t - self.tn) / h;
        history::interpolate(&quad.znq, self.q, k, s, h, dkyq);
        Ok(())
    }

    /// The quadrature values at `t` (usually the time returned by `solve`).
    pub fn get_quad(&self, t: V::T, yq: &mut V) -> Result<(), OdeError> {
        self.get_dky_quad(t, 0, yq)
    }

    // ---- engine hooks --------------------------------------------------

    /// First-call evaluation of `f_Q(t0, y0)` into the derivative column
    /// (still unscaled by `h`).
    pub(crate) fn quad_begin(&mut self) -> Result<(), OdeError> {
        let tn = self.tn;
        let Self {
            quad, zn, params, ..
        } = self;
        let quad = match quad.as_mut() {
            Some(quad) => quad,
            None => return Ok(()),
        };
        quad.nfqe += 1;
        let (_, q1) = quad.znq.split_at_mut(1);
        match (quad.fq)(tn, &zn[0], &mut q1[0], params) {
            RhsResult::Ok => Ok(()),
            RhsResult::RecoverableError => Err(OdeError::FirstRhsFailed { t: tn.as_f64() }),
            RhsResult::NonRecoverableError => Err(OdeError::QuadRhsFailed { t: tn.as_f64() }),
        }
    }

    pub(crate) fn quad_scale_zn1(&mut self, h: V::T) {
        if let Some(quad) = self.quad.as_mut() {
            quad.znq[1].scale_mut(h);
        }
    }

    /// Refresh the quadrature error weights; only needed while quadratures
    /// participate in error control.
    pub(crate) fn quad_refresh_weights(&mut self) -> Result<(), OdeError> {
        let tn = self.tn;
        let quad = match self.quad.as_mut() {
            Some(quad) if quad.err_con => quad,
            _ => return Ok(()),
        };
        let atol = quad
            .atol
            .as_ref()
            .expect("error control requires tolerances");
        ewt_set(&quad.znq[0], quad.rtol, atol, &mut quad.tempvq, &mut quad.ewtq)
            .map_err(|_| OdeError::EwtNowBad { t: tn.as_f64() })
    }

    pub(crate) fn quad_update_solution_norm(&self, nrm: V::T) -> V::T {
        match self.quad.as_ref() {
            Some(quad) if quad.err_con => nrm.max(quad.znq[0].wrms_norm(&quad.ewtq)),
            _ => nrm,
        }
    }

    pub(crate) fn quad_update_hub_inv(&mut self, hub_inv: V::T) -> V::T {
        let quad = match self.quad.as_mut() {
            Some(quad) if quad.err_con => quad,
            _ => return hub_inv,
        };
        quad.tempvq.abs_from(&quad.znq[0]);
        quad.tempvq.scale_mut(V::T::from_f64(super::solver::HUB_YSCALE));
        match quad.atol.as_ref().expect("error control requires tolerances") {
            Tolerance::Scalar(a) => quad.tempvq.add_scalar_mut(*a),
            Tolerance::Vector(a) => quad.tempvq.axpy(V::T::one(), a),
        }
        quad.yq.abs_from(&quad.znq[1]);
        quad.acorq.div_from(&quad.yq, &quad.tempvq);
        hub_inv.max(quad.acorq.max_norm())
    }

    /// Quadrature contribution to the second-derivative estimate behind the
    /// initial step size.
    pub(crate) fn quad_update_ydd_norm(&mut self, hg: V::T, nrm: V::T) -> Result<V::T, OdeError> {
        let one = V::T::one();
        let tn = self.tn;
        let Self {
            quad, y, params, ..
        } = self;
        let quad = match quad.as_mut() {
            Some(quad) if quad.err_con => quad,
            _ => return Ok(nrm),
        };
        quad.nfqe += 1;
        match (quad.fq)(tn + hg, y, &mut quad.tempvq, params) {
            RhsResult::Ok => {}
            RhsResult::RecoverableError | RhsResult::NonRecoverableError => {
                return Err(OdeError::QuadRhsFailed { t: tn.as_f64() })
            }
        }
        quad.tempvq.axpy(-one, &quad.znq[1]);
        quad.tempvq.scale_mut(one / hg);
        Ok(nrm.max(quad.tempvq.wrms_norm(&quad.ewtq)))
    }

    /// Apply the quadrature correction after a converged state step:
    /// `acorq = rl1 (h f_Q(t, y) - zhat_q[1])`, `yq = zhat_q[0] + acorq`.
    pub(crate) fn quad_correct(&mut self) -> RhsResult {
        let one = V::T::one();
        let (tn, h, rl1) = (self.tn, self.h, self.rl1);
        let Self {
            quad, y, params, ..
        } = self;
        let quad = quad.as_mut().expect("caller checked");
        quad.nfqe += 1;
        match (quad.fq)(tn, y, &mut quad.acorq, params) {
            RhsResult::Ok => {}
            other => return other,
        }
        quad.acorq.scale_mut(h);
        quad.acorq.axpy(-one, &quad.znq[1]);
        quad.acorq.scale_mut(rl1);
        quad.yq.linear_sum(one, &quad.znq[0], one, &quad.acorq);
        RhsResult::Ok
    }

    /// Rebuild the quadrature derivative column during a first-order restart.
    pub(crate) fn quad_restart_first_order(&mut self, h: V::T) -> Option<OdeError> {
        let tn = self.tn;
        let Self {
            quad, zn, params, ..
        } = self;
        let quad = match quad.as_mut() {
            Some(quad) => quad,
            None => return None,
        };
        quad.nfqe += 1;
        match (quad.fq)(tn, &zn[0], &mut quad.tempvq, params) {
            RhsResult::Ok => {}
            RhsResult::RecoverableError => {
                return Some(OdeError::RepeatedRhsFailure { t: tn.as_f64() })
            }
            RhsResult::NonRecoverableError => {
                return Some(OdeError::QuadRhsFailed { t: tn.as_f64() })
            }
        }
        let (_, z1) = quad.znq.split_at_mut(1);
        z1[0].scale_from(h, &quad.tempvq);
        None
    }

    /// Fold the quadrature history column `col` into an order-change error
    /// norm.
    pub(crate) fn quad_update_err_norm(&self, nrm: V::T, col: usize) -> V::T {
        match self.quad.as_ref() {
            Some(quad) if quad.err_con => nrm.max(quad.znq[col].wrms_norm(&quad.ewtq)),
            _ => nrm,
        }
    }

    /// Fold `acorq - cquot znq[qmax]` into the order-increase error norm.
    pub(crate) fn quad_update_acor_diff_norm(&mut self, nrm: V::T, cquot: V::T) -> V::T {
        let one = V::T::one();
        let qmax = self.qmax;
        let quad = match self.quad.as_mut() {
            Some(quad) if quad.err_con => quad,
            _ => return nrm,
        };
        let (znq, tempvq) = (&quad.znq, &mut quad.tempvq);
        tempvq.linear_sum(-cquot, &znq[qmax], one, &quad.acorq);
        nrm.max(quad.tempvq.wrms_norm(&quad.ewtq))
    }
}
