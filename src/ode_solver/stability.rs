//! Stability-limit detection for BDF.
//!
//! At orders 3 and above the BDF region of absolute stability has a finite
//! boundary; when the step size grows until a dominant characteristic root
//! of the method approaches magnitude one, the local error no longer forces
//! a reduction and the solution can go quietly unstable. The detector keeps
//! a five-step window of squared scaled-derivative norms at orders q-2, q-1
//! and q, estimates the dominant root `rr` from ratios or from eliminating
//! the quartic relations the window satisfies, and asks for an order
//! reduction when `rr` exceeds a cutoff just below one.

use num_traits::{Float, One, Zero};

use crate::scalar::Scalar;
use crate::vector::Vector;

use super::solver::OdeSolver;

/// Dominant-root cutoff asking for an order reduction.
const RRCUT: f64 = 0.98;
/// Variance bound for the nearly-normal (common-ratio) case.
const VRRTOL: f64 = 1.0e-4;
/// Agreement bound among the three averaged ratios.
const VRRT2: f64 = 5.0e-4;
/// Residual bound on the quartics at the candidate root.
const SQTOL: f64 = 1.0e-3;
/// Agreement bound between the root estimate and its verification.
const RRTOL: f64 = 1.0e-2;

const TINY: f64 = 1.0e-10;

impl<V: Vector> OdeSolver<V> {
    /// Update the detection window after a successful BDF step and, when
    /// enough constant-order history has accumulated, run the analysis and
    /// force an order reduction on a detected violation.
    pub(crate) fn bdf_stability(&mut self) {
        if self.q >= 3 {
            // Shift the window and push the newest scaled derivative norms.
            for k in 1..=3 {
                for i in (2..=5).rev() {
                    self.ssdat[i][k] = self.ssdat[i - 1][k];
                }
            }
            let mut factorial = 1.0;
            for i in 1..self.q {
                factorial *= i as f64;
            }
            let factorial = V::T::from_f64(factorial);
            let q = V::T::from_f64(self.q as f64);
            let qp1 = V::T::from_f64((self.q + 1) as f64);
            let sq = factorial * q * qp1 * self.acnrm / self.tq[5].max(V::T::from_f64(TINY));
            let sqm1 = factorial * q * self.zn[self.q].wrms_norm(&self.ewt);
            let sqm2 = factorial * self.zn[self.q - 1].wrms_norm(&self.ewt);
            self.ssdat[1][1] = sqm2 * sqm2;
            self.ssdat[1][2] = sqm1 * sqm1;
            self.ssdat[1][3] = sq * sq;
        }

        if self.qprime >= self.q {
            if self.q >= 3 && self.nscon >= (self.q + 5) as u32 {
                let flag = self.stability_detect();
                if flag > 3 {
                    // A violation: force q-1 next step with the ratio the
                    // lower order allows.
                    self.qprime = self.q - 1;
                    self.eta = self.etaqm1;
                    self.eta = self.eta.min(self.etamax);
                    self.eta = self.eta
                        / V::T::one().max(self.h.abs() * self.hmax_inv * self.eta);
                    self.hprime = self.h * self.eta;
                    self.nor += 1;
                    log::debug!(
                        "stability limit detected at t = {}, order reduced to {}",
                        self.tn,
                        self.qprime
                    );
                }
            }
        } else {
            // An order increase was chosen; the constant-order history is
            // broken.
            self.nscon = 0;
        }
    }

    /// Analyze the window and estimate the dominant characteristic root.
    ///
    /// Returns 1-3 for a stable estimate (direct ratios, quartic
    /// elimination, Newton-corrected), 4-6 for the corresponding estimates
    /// exceeding the cutoff, and negative values when the data does not
    /// support a conclusion.
    pub(crate) fn stability_detect(&mut self) -> i32 {
        let one = V::T::one();
        let zero = V::T::zero();
        let tiny = V::T::from_f64(TINY);
        let fourth = V::T::from_f64(0.25);

        let mut rat = [[zero; 4]; 6];
        let mut rav = [zero; 4];
        let mut qkr = [zero; 4];
        let mut sigsq = [zero; 4];
        let mut smax = [zero; 4];
        let mut ssmax = [zero; 4];
        let mut drr = [zero; 4];
        let mut rrc = [zero; 4];
        let mut sqmx = [zero; 4];
        let mut qjk = [[zero; 4]; 4];
        let mut vrat = [zero; 4];
        let mut qc = [[zero; 4]; 6];
        let mut qco = [[zero; 4]; 6];

        let mut rr = zero;
        let mut kflag = 0;

        // Index k spans the polynomial degrees q-2, q-1, q; index i runs
        // backward in time over the window.
        for k in 1..=3 {
            let mut smink = self.ssdat[1][k];
            let mut smaxk = zero;
            for i in 1..=5 {
                smink = smink.min(self.ssdat[i][k]);
                smaxk = smaxk.max(self.ssdat[i][k]);
            }
            if smink < tiny * smaxk {
                return -1;
            }
            smax[k] = smaxk;
            ssmax[k] = smaxk * smaxk;

            let mut sumrat = zero;
            let mut sumrsq = zero;
            for i in 1..=4 {
                rat[i][k] = self.ssdat[i][k] / self.ssdat[i + 1][k];
                sumrat += rat[i][k];
                sumrsq += rat[i][k] * rat[i][k];
            }
            rav[k] = fourth * sumrat;
            vrat[k] = (fourth * sumrsq - rav[k] * rav[k]).abs();

            qc[5][k] = self.ssdat[1][k] * self.ssdat[3][k] - self.ssdat[2][k] * self.ssdat[2][k];
            qc[4][k] = self.ssdat[2][k] * self.ssdat[3][k] - self.ssdat[1][k] * self.ssdat[4][k];
            qc[3][k] = zero;
            qc[2][k] = self.ssdat[2][k] * self.ssdat[5][k] - self.ssdat[3][k] * self.ssdat[4][k];
            qc[1][k] = self.ssdat[4][k] * self.ssdat[4][k] - self.ssdat[3][k] * self.ssdat[5][k];
            for i in 1..=5 {
                qco[i][k] = qc[i][k];
            }
        }

        // Nearly-normal case: the three rows share a common ratio.
        let vmin = vrat[1].min(vrat[2].min(vrat[3]));
        let vmax = vrat[1].max(vrat[2].max(vrat[3]));
        let vrrtol = V::T::from_f64(VRRTOL);
        let vrrt2 = V::T::from_f64(VRRT2);

        if vmin < vrrtol * vrrtol {
            if vmax > vrrt2 * vrrt2 {
                return -2;
            }
            rr = (rav[1] + rav[2] + rav[3]) / V::T::from_f64(3.0);
            let mut drrmax = zero;
            for k in 1..=3 {
                drrmax = drrmax.max((rav[k] - rr).abs());
            }
            if drrmax > vrrt2 {
                return -3;
            }
            kflag = 1;
        } else {
            // Eliminate between the three quartics to isolate the root.
            if qco[1][1].abs() < tiny * ssmax[1] {
                return -4;
            }
            let tem = qco[1][2] / qco[1][1];
            for i in 2..=5 {
                qco[i][2] = qco[i][2] - tem * qco[i][1];
            }
            qco[1][2] = zero;
            let tem = qco[1][3] / qco[1][1];
            for i in 2..=5 {
                qco[i][3] = qco[i][3] - tem * qco[i][1];
            }
            qco[1][3] = zero;
            if qco[2][2].abs() < tiny * ssmax[2] {
                return -4;
            }
            let tem = qco[2][3] / qco[2][2];
            for i in 3..=5 {
                qco[i][3] = qco[i][3] - tem * qco[i][2];
            }
            if qco[4][3].abs() < tiny * ssmax[3] {
                return -4;
            }
            rr = -qco[5][3] / qco[4][3];
            if rr < tiny || rr > V::T::from_f64(100.0) {
                return -5;
            }

            for k in 1..=3 {
                qkr[k] = qc[5][k] + rr * (qc[4][k] + rr * rr * (qc[2][k] + rr * qc[1][k]));
            }
            let mut sqmax = zero;
            for k in 1..=3 {
                sqmax = sqmax.max(qkr[k].abs() / ssmax[k]);
            }
            let sqtol = V::T::from_f64(SQTOL);

            if sqmax < sqtol {
                kflag = 2;
            } else {
                // Newton corrections on the root estimate, judged by the
                // worst quartic residual.
                let three = V::T::from_f64(3.0);
                let four = V::T::from_f64(4.0);
                let mut kmin = 1;
                for _ in 1..=3 {
                    for k in 1..=3 {
                        let qp = qc[4][k] + rr * rr * (three * qc[2][k] + rr * four * qc[1][k]);
                        drr[k] = zero;
                        if qp.abs() > tiny * ssmax[k] {
                            drr[k] = -qkr[k] / qp;
                        }
                        rrc[k] = rr + drr[k];
                    }
                    for k in 1..=3 {
                        let s = rrc[k];
                        let mut sqmaxk = zero;
                        for j in 1..=3 {
                            qjk[j][k] =
                                qc[5][j] + s * (qc[4][j] + s * s * (qc[2][j] + s * qc[1][j]));
                            sqmaxk = sqmaxk.max(qjk[j][k].abs() / ssmax[j]);
                        }
                        sqmx[k] = sqmaxk;
                    }
                    let mut sqmin = sqmx[1] + one;
                    for k in 1..=3 {
                        if sqmx[k] < sqmin {
                            kmin = k;
                            sqmin = sqmx[k];
                        }
                    }
                    rr = rrc[kmin];
                    if sqmin < sqtol {
                        kflag = 3;
                        break;
                    }
                    for j in 1..=3 {
                        qkr[j] = qjk[j][kmin];
                    }
                }
                if kflag != 3 {
                    return -6;
                }
            }
        }

        // Given rr, compute sigsq and verify the root against the order
        // relation between the three rows.
        for k in 1..=3 {
            let rsa = self.ssdat[1][k];
            let rsb = self.ssdat[2][k] * rr;
            let rsc = self.ssdat[3][k] * rr * rr;
            let rsd = self.ssdat[4][k] * rr * rr * rr;
            let rd1a = rsa - rsb;
            let rd1b = rsb - rsc;
            let rd1c = rsc - rsd;
            let rd2a = rd1a - rd1b;
            let rd2b = rd1b - rd1c;
            let rd3a = rd2a - rd2b;
            if rd1b.abs() < tiny * smax[k] {
                return -7;
            }
            let cest1 = -rd3a / rd1b;
            if cest1 < tiny || cest1 > V::T::from_f64(4.0) {
                return -8;
            }
            let corr1 = (rd2b / cest1) / (rr * rr);
            sigsq[k] = self.ssdat[3][k] + corr1;
        }
        if sigsq[2] < tiny {
            return -8;
        }
        let ratp = sigsq[3] / sigsq[2];
        let ratm = sigsq[1] / sigsq[2];
        let qq = V::T::from_f64(self.q as f64);
        let qfac1 = fourth * (qq * qq - one);
        let qfac2 = V::T::from_f64(2.0) / (qq - one);
        let bb = ratp * ratm - one - qfac1 * ratp;
        let tem = one - qfac2 * bb;
        if tem.abs() < tiny {
            return -8;
        }
        let rrb = one / tem;
        if (rrb - rr).abs() > V::T::from_f64(RRTOL) {
            return -9;
        }

        if rr > V::T::from_f64(RRCUT) {
            kflag += 3;
        }
        kflag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ode_solver::solver::{Method, OdeSolver};
    use nalgebra::DVector;

    fn solver_with_window(rho: f64, sig: [f64; 3], q: usize) -> OdeSolver<DVector<f64>> {
        let mut s: OdeSolver<DVector<f64>> = OdeSolver::new(Method::Bdf);
        s.q = q;
        // A geometric window ssdat[i][k] = sig[k] * rho^(i-1) going backward
        // in time models a single dominant root rho (norms grow by rho each
        // step, so earlier entries are smaller).
        for k in 1..=3 {
            let mut val = sig[k - 1];
            for i in (1..=5).rev() {
                s.ssdat[i][k] = val;
                val *= rho;
            }
        }
        s
    }

    #[test]
    fn common_ratio_window_is_detected_as_normal() {
        // sigma ladder consistent with the order relation at q = 3:
        // with rr = 1, sigsq ratios satisfy the verification identity when
        // sig chosen as the detector's model predicts. Use a modest root.
        let mut s = solver_with_window(0.81, [4.0, 4.0, 4.0], 3);
        let flag = s.stability_detect();
        // All rows share the ratio exactly, so the nearly-normal branch
        // runs; whether verification passes depends on the order relation,
        // so only failure codes from the ratio stage are excluded.
        assert!(flag != -1 && flag != -2 && flag != -3);
    }

    #[test]
    fn degenerate_window_is_rejected() {
        let mut s = solver_with_window(1.0, [1.0, 1.0, 0.0], 3);
        // A zero row trips the tiny-minimum guard.
        assert_eq!(s.stability_detect(), -1);
    }

    #[test]
    fn window_shift_discards_oldest() {
        let mut s: OdeSolver<DVector<f64>> = OdeSolver::new(Method::Bdf);
        s.q = 3;
        s.n = 1;
        s.zn = (0..=s.qmax).map(|_| DVector::from_element(1, 1.0)).collect();
        s.ewt = DVector::from_element(1, 1.0);
        s.acnrm = 1.0;
        s.tq[5] = 1.0;
        s.qprime = 3;
        for i in 1..=5 {
            for k in 1..=3 {
                s.ssdat[i][k] = (10 * i + k) as f64;
            }
        }
        s.sldet_on = true;
        s.bdf_stability();
        // Row 1 holds fresh data, old row i moved to i+1, old row 5 gone.
        assert_eq!(s.ssdat[2][1], 11.0);
        assert_eq!(s.ssdat[5][3], 43.0);
        assert!(s.ssdat[1][1] > 0.0);
    }
}
