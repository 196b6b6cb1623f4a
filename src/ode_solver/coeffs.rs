//! Method coefficients at the current order and step history.
//!
//! For either family this produces the polynomial coefficients `l[0..=q]`
//! (so that the corrected history is `zhat[j] + l[j] * Delta_n`) and the test
//! quantities `tq[1..=5]`:
//!
//! - `tq[1]`, `tq[3]`: divisors for the order-decrease / order-increase error
//!   estimates, only computed in the step before an order change is allowed;
//! - `tq[2]`: divisor for the local error test;
//! - `tq[4] = nlscoef * tq[2]`: corrector convergence tolerance;
//! - `tq[5]`: divisor relating the correction to the next-order derivative,
//!   used by the stability-limit detector and the order-increase estimate.

use num_traits::{Float, One, Zero};

use crate::scalar::Scalar;

use super::solver::L_MAX;

#[derive(Clone, Debug)]
pub(crate) struct MethodCoeffs<T> {
    pub l: [T; L_MAX],
    /// Test quantities, 1-based like the classical presentation; `tq[0]`
    /// is unused.
    pub tq: [T; 6],
}

/// `sum_{i=0..=iend} (-1)^i a[i] / (i + k)`, the alternating sums the Adams
/// moment integrals reduce to.
fn alt_sum<T: Scalar>(iend: usize, a: &[T], k: usize) -> T {
    let mut sign = T::one();
    let mut sum = T::zero();
    for (i, &ai) in a.iter().enumerate().take(iend + 1) {
        sum += sign * ai / T::from_f64((i + k) as f64);
        sign = -sign;
    }
    sum
}

/// Adams-Moulton coefficients at order `q` for the step history in `tau`.
///
/// `m[0..q-1]` are built as the coefficients of
/// `prod_{i=1..q-1} (1 + x / xi_i)` with `xi_i = hsum_i / h`; the `l` and
/// `tq` values follow from its moment integrals.
pub(crate) fn adams_coeffs<T: Scalar>(
    q: usize,
    tau: &[T; L_MAX + 1],
    h: T,
    order_change_due: bool,
    nlscoef: T,
) -> MethodCoeffs<T> {
    let mut c = MethodCoeffs {
        l: [T::zero(); L_MAX],
        tq: [T::zero(); 6],
    };
    if q == 1 {
        c.l[0] = T::one();
        c.l[1] = T::one();
        c.tq[1] = T::one();
        c.tq[2] = T::from_f64(2.0);
        c.tq[3] = T::from_f64(12.0);
        c.tq[5] = T::one();
        c.tq[4] = nlscoef * c.tq[2];
        return c;
    }

    let mut m = [T::zero(); L_MAX];
    m[0] = T::one();
    let mut hsum = h;
    let mut tq1 = T::one();
    for j in 1..q {
        if j == q - 1 && order_change_due {
            // Truncated moment sum for the order-decrease estimate.
            let sum = alt_sum(j - 1, &m, 2);
            tq1 = m[j - 1] / (T::from_f64(q as f64) * sum);
        }
        let xi_inv = h / hsum;
        for i in (1..=j).rev() {
            m[i] += m[i - 1] * xi_inv;
        }
        hsum += tau[j];
    }

    let m0 = alt_sum(q - 1, &m, 1);
    let m1 = alt_sum(q - 1, &m, 2);
    let m0_inv = T::one() / m0;
    c.l[0] = T::one();
    for i in 1..=q {
        c.l[i] = m0_inv * m[i - 1] / T::from_f64(i as f64);
    }
    let xi = hsum / h;
    c.tq[2] = xi * m0 / m1;
    c.tq[5] = xi / c.l[q];
    if order_change_due {
        c.tq[1] = tq1;
        let m2 = alt_sum(q, &m, 3);
        c.tq[3] = xi * xi * m0 / m2;
    }
    c.tq[4] = nlscoef * c.tq[2];
    c
}

/// Fixed-leading-coefficient BDF coefficients at order `q`.
pub(crate) fn bdf_coeffs<T: Scalar>(
    q: usize,
    tau: &[T; L_MAX + 1],
    h: T,
    order_change_due: bool,
    nlscoef: T,
) -> MethodCoeffs<T> {
    let mut c = MethodCoeffs {
        l: [T::zero(); L_MAX],
        tq: [T::zero(); 6],
    };
    c.l[0] = T::one();
    c.l[1] = T::one();
    let mut xi_inv = T::one();
    let mut xistar_inv = T::one();
    let mut alpha0 = -T::one();
    let mut alpha0_hat = -T::one();
    let mut hsum = h;
    if q > 1 {
        for j in 2..q {
            hsum += tau[j - 1];
            xi_inv = h / hsum;
            alpha0 -= T::one() / T::from_f64(j as f64);
            for i in (1..=j).rev() {
                c.l[i] += c.l[i - 1] * xi_inv;
            }
        }
        // Terms involving the yet-to-be-taken step enter through xi*, the
        // fixed-leading-coefficient surrogate for xi_q.
        alpha0 -= T::one() / T::from_f64(q as f64);
        xistar_inv = -c.l[1] - alpha0;
        hsum += tau[q - 1];
        xi_inv = h / hsum;
        alpha0_hat = -c.l[1] - xi_inv;
        for i in (1..=q).rev() {
            c.l[i] += c.l[i - 1] * xistar_inv;
        }
    }

    let a1 = T::one() - alpha0_hat + alpha0;
    let a2 = T::one() + T::from_f64(q as f64) * a1;
    c.tq[2] = (alpha0 * a2 / a1).abs();
    c.tq[5] = (a2 * xistar_inv / (c.l[q] * xi_inv)).abs();
    if order_change_due {
        if q > 1 {
            let cc = xistar_inv / c.l[q];
            let a3 = alpha0 + T::one() / T::from_f64(q as f64);
            let a4 = alpha0_hat + xi_inv;
            let cpinv = (T::one() - a4 + a3) / a3;
            c.tq[1] = T::one() / (cc * cpinv).abs();
        } else {
            c.tq[1] = T::one();
        }
        let hsum_p = hsum + tau[q];
        let xi_inv_p = h / hsum_p;
        let a5 = alpha0 - T::one() / T::from_f64((q + 1) as f64);
        let a6 = alpha0_hat - xi_inv_p;
        let cppinv = (T::one() - a6 + a5) / a2;
        c.tq[3] = (xi_inv_p * T::from_f64((q + 2) as f64) * a5 / cppinv).abs();
    }
    c.tq[4] = nlscoef * c.tq[2];
    c
}

#[cfg(test)]
mod tests {
    use super::*;

    const NLSCOEF: f64 = 0.1;

    fn constant_tau(h: f64) -> [f64; L_MAX + 1] {
        [h; L_MAX + 1]
    }

    #[test]
    fn adams_order_one_constants() {
        let tau = constant_tau(0.1);
        let c = adams_coeffs(1, &tau, 0.1, false, NLSCOEF);
        assert_eq!(c.l[0], 1.0);
        assert_eq!(c.l[1], 1.0);
        assert_eq!(c.tq[2], 2.0);
        assert_eq!(c.tq[3], 12.0);
        assert_eq!(c.tq[4], NLSCOEF * c.tq[2]);
    }

    #[test]
    fn adams_order_two_constant_history() {
        // With a constant step history the trapezoidal corrector appears:
        // l = [1, 2, 1], so gamma = h / l[1] = h/2.
        let h = 0.25;
        let tau = constant_tau(h);
        let c = adams_coeffs(2, &tau, h, true, NLSCOEF);
        assert!((c.l[1] - 2.0).abs() < 1e-14);
        assert!((c.l[2] - 1.0).abs() < 1e-14);
        assert!((c.tq[2] - 6.0).abs() < 1e-14);
        assert!((c.tq[5] - 2.0).abs() < 1e-14);
        assert!((c.tq[1] - 1.0).abs() < 1e-14);
        assert!((c.tq[4] - NLSCOEF * c.tq[2]).abs() < 1e-16);
    }

    #[test]
    fn bdf_order_one_is_backward_euler() {
        let tau = constant_tau(0.5);
        let c = bdf_coeffs(1, &tau, 0.5, false, NLSCOEF);
        assert_eq!(c.l[0], 1.0);
        assert_eq!(c.l[1], 1.0);
        // Local error divisor 2 at order 1.
        assert!((c.tq[2] - 2.0).abs() < 1e-14);
    }

    #[test]
    fn bdf_order_two_constant_history() {
        // Constant-step BDF2 has l = [1, 3/2, 1/2]: the leading coefficient
        // gives gamma = 2h/3.
        let h = 0.5;
        let tau = constant_tau(h);
        let c = bdf_coeffs(2, &tau, h, true, NLSCOEF);
        assert!((c.l[1] - 1.5).abs() < 1e-14);
        assert!((c.l[2] - 0.5).abs() < 1e-14);
        assert!((c.tq[2] - 4.5).abs() < 1e-14);
    }

    #[test]
    fn alt_sum_alternates() {
        let a = [1.0, 1.0, 1.0];
        // 1/1 - 1/2 + 1/3
        assert!((alt_sum(2, &a, 1) - (1.0 - 0.5 + 1.0 / 3.0)).abs() < 1e-15);
    }

    #[test]
    fn order_change_quantities_only_on_request() {
        let h = 0.1;
        let tau = constant_tau(h);
        let c = bdf_coeffs(3, &tau, h, false, NLSCOEF);
        assert_eq!(c.tq[1], 0.0);
        assert_eq!(c.tq[3], 0.0);
        let c = bdf_coeffs(3, &tau, h, true, NLSCOEF);
        assert!(c.tq[1] > 0.0);
        assert!(c.tq[3] > 0.0);
    }
}
