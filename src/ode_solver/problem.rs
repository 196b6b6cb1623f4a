use num_traits::{One, Zero};

use crate::errors::{OdeError, RhsResult};
use crate::vector::Vector;

/// State right-hand side: `ydot = f(t, y)`, with the current problem
/// parameters exposed for closures that depend on them.
pub type RhsFn<V> =
    Box<dyn FnMut(<V as Vector>::T, &V, &mut V, &[<V as Vector>::T]) -> RhsResult>;

/// Quadrature right-hand side: `yqdot = f_Q(t, y)`.
pub type QuadRhsFn<V> =
    Box<dyn FnMut(<V as Vector>::T, &V, &mut V, &[<V as Vector>::T]) -> RhsResult>;

/// Sensitivity right-hand sides for all parameters at once:
/// `ysdot[i] = (df/dy) ys[i] + df/dp_i`.
pub type SensRhsAllFn<V> = Box<
    dyn FnMut(
        <V as Vector>::T,
        &V,
        &V,
        &[V],
        &mut [V],
        &[<V as Vector>::T],
    ) -> RhsResult,
>;

/// Sensitivity right-hand side for one parameter at a time; the index of the
/// sensitivity being evaluated is passed explicitly.
pub type SensRhs1Fn<V> = Box<
    dyn FnMut(
        <V as Vector>::T,
        &V,
        &V,
        usize,
        &V,
        &mut V,
        &[<V as Vector>::T],
    ) -> RhsResult,
>;

/// Analytic Jacobian hook for the dense linear solver:
/// `jac := df/dy (t, y)`, given `fy = f(t, y)`.
pub type JacFn<V, M> = Box<dyn FnMut(<V as Vector>::T, &V, &V, &mut M) -> RhsResult>;

/// How the sensitivity right-hand side is supplied.
///
/// `DiffQuotient` (the default) approximates it from `f` itself, perturbing
/// one parameter and the corresponding state direction.
pub enum SensRhs<V: Vector> {
    All(SensRhsAllFn<V>),
    One(SensRhs1Fn<V>),
    DiffQuotient,
}

/// Absolute-tolerance specification; the relative tolerance is always scalar.
#[derive(Clone, Debug)]
pub enum Tolerance<V: Vector> {
    Scalar(V::T),
    Vector(V),
}

impl<V: Vector> Tolerance<V> {
    /// Range/shape validation at (re)initialization time.
    pub(crate) fn validate(&self, n: usize) -> Result<(), OdeError> {
        match self {
            Tolerance::Scalar(atol) => {
                if *atol < V::T::zero() {
                    return Err(OdeError::IllInput("abstol must be non-negative"));
                }
            }
            Tolerance::Vector(atol) => {
                if atol.len() != n {
                    return Err(OdeError::IllInput(
                        "abstol vector must have the same length as the state vector",
                    ));
                }
                if Vector::min(atol) < V::T::zero() {
                    return Err(OdeError::IllInput("abstol components must be non-negative"));
                }
            }
        }
        Ok(())
    }
}

/// A bundled initial-value problem, as produced by the test-model
/// constructors and consumed by [`crate::OdeSolver::init`].
pub struct OdeProblem<V: Vector> {
    pub f: RhsFn<V>,
    pub t0: V::T,
    pub y0: V,
    pub rtol: V::T,
    pub atol: Tolerance<V>,
    /// Problem parameters made visible to the right-hand side; used by the
    /// sensitivity difference quotients.
    pub params: Vec<V::T>,
}

impl<V: Vector> OdeProblem<V> {
    pub fn new(f: RhsFn<V>, t0: V::T, y0: V, rtol: V::T, atol: Tolerance<V>) -> Self {
        Self {
            f,
            t0,
            y0,
            rtol,
            atol,
            params: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<V::T>) -> Self {
        self.params = params;
        self
    }
}

/// Build an error-weight vector `w = 1 / (rtol |y| + atol)` into `ewt`,
/// using `tmp` as scratch. Fails if any weight denominator is non-positive.
pub(crate) fn ewt_set<V: Vector>(
    y: &V,
    rtol: V::T,
    atol: &Tolerance<V>,
    tmp: &mut V,
    ewt: &mut V,
) -> Result<(), OdeError> {
    tmp.abs_from(y);
    tmp.scale_mut(rtol);
    match atol {
        Tolerance::Scalar(a) => tmp.add_scalar_mut(*a),
        Tolerance::Vector(a) => tmp.axpy(V::T::one(), a),
    }
    if Vector::min(tmp) <= V::T::zero() {
        return Err(OdeError::EwtInvalid);
    }
    if !ewt.inv_from(tmp) {
        return Err(OdeError::EwtInvalid);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    #[test]
    fn ewt_set_scalar_and_vector() {
        let y = DVector::from_vec(vec![2.0, -4.0]);
        let mut tmp = DVector::zeros(2);
        let mut ewt = DVector::zeros(2);
        ewt_set(&y, 0.5, &Tolerance::Scalar(1.0), &mut tmp, &mut ewt).unwrap();
        ewt.assert_eq(&DVector::from_vec(vec![0.5, 1.0 / 3.0]), 1e-15);

        let atol = Tolerance::Vector(DVector::from_vec(vec![1.0, 2.0]));
        ewt_set(&y, 0.5, &atol, &mut tmp, &mut ewt).unwrap();
        ewt.assert_eq(&DVector::from_vec(vec![0.5, 0.25]), 1e-15);
    }

    #[test]
    fn ewt_set_rejects_vanishing_weights() {
        // atol = 0 on a zero component makes that weight infinite.
        let y = DVector::from_vec(vec![0.0, 1.0]);
        let mut tmp = DVector::zeros(2);
        let mut ewt = DVector::zeros(2);
        let err = ewt_set(&y, 0.0, &Tolerance::Scalar(0.0), &mut tmp, &mut ewt);
        assert!(matches!(err, Err(OdeError::EwtInvalid)));
    }

    #[test]
    fn tolerance_validation() {
        let atol: Tolerance<DVector<f64>> = Tolerance::Scalar(-1.0);
        assert!(atol.validate(2).is_err());
        let atol = Tolerance::Vector(DVector::from_vec(vec![1.0]));
        assert!(atol.validate(2).is_err());
        let atol = Tolerance::Vector(DVector::from_vec(vec![1.0, 1.0]));
        assert!(atol.validate(2).is_ok());
    }
}
