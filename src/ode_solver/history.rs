//! In-place operations on a Nordsieck history array.
//!
//! After a successful step at order `q` with step size `h`, column `j` of the
//! array holds `h^j y^(j)(t_n) / j!` for `j = 0..=q`. The same operations are
//! applied to the state history, the quadrature history and every
//! sensitivity history, so they are written over a bare column slice.

use num_traits::{Float, One, Zero};

use crate::scalar::Scalar;
use crate::vector::Vector;

use super::solver::L_MAX;

/// Advance the array to the predicted values at `t + h` by repeated Pascal
/// triangle updates.
pub(crate) fn predict<V: Vector>(cols: &mut [V], q: usize) {
    for k in 1..=q {
        for j in (k..=q).rev() {
            let (lo, hi) = cols.split_at_mut(j);
            lo[j - 1].axpy(V::T::one(), &hi[0]);
        }
    }
}

/// Exactly invert [`predict`].
pub(crate) fn restore<V: Vector>(cols: &mut [V], q: usize) {
    for k in 1..=q {
        for j in (k..=q).rev() {
            let (lo, hi) = cols.split_at_mut(j);
            lo[j - 1].axpy(-V::T::one(), &hi[0]);
        }
    }
}

/// Rescale the array for a step-size change `h := h * eta`: column `j` picks
/// up a factor `eta^j`.
pub(crate) fn rescale<V: Vector>(cols: &mut [V], q: usize, eta: V::T) {
    let mut factor = eta;
    for col in cols.iter_mut().take(q + 1).skip(1) {
        col.scale_mut(factor);
        factor *= eta;
    }
}

/// Fold the accepted correction into the history:
/// `cols[j] += l[j] * acor` for `j = 0..=q`.
pub(crate) fn apply_correction<V: Vector>(cols: &mut [V], l: &[V::T], q: usize, acor: &V) {
    for (col, &lj) in cols.iter_mut().zip(l.iter()).take(q + 1) {
        col.axpy(lj, acor);
    }
}

/// Coefficients for an Adams order decrease: the generating polynomial
/// `q u (u + xi_1) ... (u + xi_(q-2))` integrated against the history.
pub(crate) fn adams_decrease_coeffs<T: Scalar>(
    q: usize,
    tau: &[T; L_MAX + 1],
    hscale: T,
) -> [T; L_MAX] {
    let mut l = [T::zero(); L_MAX];
    l[1] = T::one();
    let mut hsum = T::zero();
    for j in 1..=q - 2 {
        hsum += tau[j];
        let xi = hsum / hscale;
        for i in (1..=j + 1).rev() {
            l[i] = l[i] * xi + l[i - 1];
        }
    }
    for j in 1..=q - 2 {
        l[j + 1] = T::from_f64(q as f64) * (l[j] / T::from_f64((j + 1) as f64));
    }
    l
}

/// Coefficients for a BDF order decrease: `x x (x + xi_1) ... (x + xi_(j-2))`.
pub(crate) fn bdf_decrease_coeffs<T: Scalar>(
    q: usize,
    tau: &[T; L_MAX + 1],
    hscale: T,
) -> [T; L_MAX] {
    let mut l = [T::zero(); L_MAX];
    l[2] = T::one();
    let mut hsum = T::zero();
    for j in 1..=q - 2 {
        hsum += tau[j];
        let xi = hsum / hscale;
        for i in (2..=j + 2).rev() {
            l[i] = l[i] * xi + l[i - 1];
        }
    }
    l
}

/// Coefficients for a BDF order increase. Returns the column-update
/// coefficients together with the multiplier `A1 = (-alpha0 - alpha1) / prod`
/// applied to the saved correction column.
pub(crate) fn bdf_increase_coeffs<T: Scalar>(
    q: usize,
    tau: &[T; L_MAX + 1],
    hscale: T,
) -> ([T; L_MAX], T) {
    let mut l = [T::zero(); L_MAX];
    l[2] = T::one();
    let mut alpha1 = T::one();
    let mut prod = T::one();
    let mut xiold = T::one();
    let mut alpha0 = -T::one();
    let mut hsum = hscale;
    if q > 1 {
        for j in 1..q {
            hsum += tau[j + 1];
            let xi = hsum / hscale;
            prod *= xi;
            alpha0 -= T::one() / T::from_f64((j + 1) as f64);
            alpha1 += T::one() / xi;
            for i in (2..=j + 2).rev() {
                l[i] = l[i] * xiold + l[i - 1];
            }
            xiold = xi;
        }
    }
    let a1 = (-alpha0 - alpha1) / prod;
    (l, a1)
}

/// Apply an order decrease: subtract multiples of column `q` from the middle
/// columns, then let the caller drop the order.
pub(crate) fn apply_decrease<V: Vector>(cols: &mut [V], l: &[V::T; L_MAX], q: usize) {
    for j in 2..q {
        let (lo, hi) = cols.split_at_mut(q);
        lo[j].axpy(-l[j], &hi[0]);
    }
}

/// Apply a BDF order increase: build the new column `q + 1` from the saved
/// correction in `cols[qmax]` and adjust the lower columns by its multiples.
pub(crate) fn apply_bdf_increase<V: Vector>(
    cols: &mut [V],
    l: &[V::T; L_MAX],
    a1: V::T,
    q: usize,
    qmax: usize,
) {
    let lnew = q + 1;
    if lnew == qmax {
        cols[lnew].scale_mut(a1);
    } else {
        let (lo, hi) = cols.split_at_mut(qmax);
        lo[lnew].scale_from(a1, &hi[0]);
    }
    for j in 2..=q {
        let (lo, hi) = cols.split_at_mut(lnew);
        lo[j].axpy(l[j], &hi[0]);
    }
}

/// Evaluate the `k`-th derivative of the interpolating polynomial at
/// `t = t_n + s * h`, writing `sum_j c(j,k) s^(j-k) h^(-k) cols[j]` for
/// `j = k..=q` into `dky`.
pub(crate) fn interpolate<V: Vector>(cols: &[V], q: usize, k: usize, s: V::T, h: V::T, dky: &mut V) {
    for j in (k..=q).rev() {
        let mut c = V::T::one();
        for i in (j - k + 1)..=j {
            c *= V::T::from_f64(i as f64);
        }
        if j == q {
            dky.scale_from(c, &cols[q]);
        } else {
            dky.scale_mut(s);
            dky.axpy(c, &cols[j]);
        }
    }
    if k > 0 {
        dky.scale_mut(h.powi(-(k as i32)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn columns(vals: &[&[f64]]) -> Vec<DVector<f64>> {
        vals.iter().map(|v| DVector::from_vec(v.to_vec())).collect()
    }

    #[test]
    fn predict_is_pascal_triangle() {
        // Single component, columns [y, hy', h^2 y''/2] = [1, 2, 3]:
        // one step of the triangle gives [6, 5, 3].
        let mut cols = columns(&[&[1.0], &[2.0], &[3.0]]);
        predict(&mut cols, 2);
        assert_eq!(cols[0][0], 6.0);
        assert_eq!(cols[1][0], 5.0);
        assert_eq!(cols[2][0], 3.0);
    }

    #[test]
    fn restore_inverts_predict_exactly() {
        // Integer-valued columns keep the arithmetic exact, so the round trip
        // must be bit-identical.
        let orig = columns(&[&[1.0, -4.0], &[2.0, 8.0], &[3.0, 16.0], &[-5.0, 32.0]]);
        let mut cols = orig.clone();
        predict(&mut cols, 3);
        restore(&mut cols, 3);
        for (c, o) in cols.iter().zip(orig.iter()) {
            assert_eq!(c, o);
        }
    }

    #[test]
    fn rescale_scales_by_eta_powers() {
        let mut cols = columns(&[&[1.0], &[1.0], &[1.0], &[1.0]]);
        rescale(&mut cols, 3, 0.5);
        assert_eq!(cols[0][0], 1.0);
        assert_eq!(cols[1][0], 0.5);
        assert_eq!(cols[2][0], 0.25);
        assert_eq!(cols[3][0], 0.125);
    }

    #[test]
    fn interpolate_at_tn_returns_leading_columns() {
        let cols = columns(&[&[7.0], &[3.0], &[2.0]]);
        let mut dky = DVector::zeros(1);
        // k = 0 at s = 0 is zn[0].
        interpolate(&cols, 2, 0, 0.0, 0.5, &mut dky);
        assert_eq!(dky[0], 7.0);
        // k = 1 at s = 0 is zn[1] / h.
        interpolate(&cols, 2, 1, 0.0, 0.5, &mut dky);
        assert_eq!(dky[0], 3.0 / 0.5);
        // k = 2 is 2 * zn[2] / h^2.
        interpolate(&cols, 2, 2, 0.0, 0.5, &mut dky);
        assert_eq!(dky[0], 2.0 * 2.0 / 0.25);
    }

    #[test]
    fn interpolate_matches_polynomial_evaluation() {
        // zn encodes p(t) = 1 + s + s^2 with s = (t - tn)/h.
        let cols = columns(&[&[1.0], &[1.0], &[1.0]]);
        let mut dky = DVector::zeros(1);
        let h = 0.1;
        let s = -0.5;
        interpolate(&cols, 2, 0, s, h, &mut dky);
        assert!((dky[0] - (1.0 + s + s * s)).abs() < 1e-15);
        interpolate(&cols, 2, 1, s, h, &mut dky);
        assert!((dky[0] - (1.0 + 2.0 * s) / h).abs() < 1e-12);
    }

    #[test]
    fn correction_uses_method_coefficients() {
        let mut cols = columns(&[&[0.0], &[0.0], &[0.0]]);
        let acor = DVector::from_vec(vec![2.0]);
        let l = [1.0, 0.5, 0.25];
        apply_correction(&mut cols, &l, 2, &acor);
        assert_eq!(cols[0][0], 2.0);
        assert_eq!(cols[1][0], 1.0);
        assert_eq!(cols[2][0], 0.5);
    }

    #[test]
    fn bdf_increase_at_constant_step() {
        // At q = 2 with constant history tau = h, xi = 2 and
        // A1 = (-alpha0 - alpha1) / prod = (3/2 - 3/2) / 2 = 0.
        let mut tau = [0.0; L_MAX + 1];
        tau[1] = 0.5;
        tau[2] = 0.5;
        tau[3] = 0.5;
        let (l, a1) = bdf_increase_coeffs(2, &tau, 0.5);
        assert!((a1 - 0.0).abs() < 1e-15);
        assert_eq!(l[2], 1.0);
    }
}
