use std::fmt::Debug;

use nalgebra::{DMatrix, DVector, Dyn};

use crate::scalar::Scalar;
use crate::vector::Vector;

/// A dense square matrix, as consumed by the bundled direct linear solver.
///
/// The iteration matrix `M = I - gamma * J` is assembled column by column
/// (`set_column`), shifted (`add_scaled_identity`) and factored; the
/// factorization lives in its own type so a factored matrix can outlive
/// later edits to the original.
pub trait Matrix: Clone + Debug + 'static {
    type T: Scalar;
    type V: Vector<T = Self::T>;
    type Factor: MatrixFactor<V = Self::V>;

    fn zeros(nrows: usize, ncols: usize) -> Self;
    fn nrows(&self) -> usize;
    fn ncols(&self) -> usize;

    /// Copy `v` into column `j`.
    fn set_column(&mut self, j: usize, v: &Self::V);

    /// `self := a * self`.
    fn scale_mut(&mut self, a: Self::T);

    /// `self := self + c * I`.
    fn add_scaled_identity(&mut self, c: Self::T);

    /// LU-factor a copy of the matrix. `None` if the matrix is singular.
    fn factorize(&self) -> Option<Self::Factor>;
}

/// A factored matrix that can back-solve linear systems in place.
pub trait MatrixFactor {
    type V: Vector;

    /// Solve `A * x = b`, overwriting `b` with `x`. Returns `false` if the
    /// factorization cannot produce a solution.
    fn solve_in_place(&self, b: &mut Self::V) -> bool;
}

impl Matrix for DMatrix<f64> {
    type T = f64;
    type V = DVector<f64>;
    type Factor = nalgebra::LU<f64, Dyn, Dyn>;

    fn zeros(nrows: usize, ncols: usize) -> Self {
        DMatrix::zeros(nrows, ncols)
    }

    fn nrows(&self) -> usize {
        nalgebra::Matrix::nrows(self)
    }

    fn ncols(&self) -> usize {
        nalgebra::Matrix::ncols(self)
    }

    fn set_column(&mut self, j: usize, v: &Self::V) {
        self.column_mut(j).copy_from(v);
    }

    fn scale_mut(&mut self, a: f64) {
        *self *= a;
    }

    fn add_scaled_identity(&mut self, c: f64) {
        let n = nalgebra::Matrix::nrows(self).min(nalgebra::Matrix::ncols(self));
        for i in 0..n {
            self[(i, i)] += c;
        }
    }

    fn factorize(&self) -> Option<Self::Factor> {
        let lu = self.clone().lu();
        // A vanished last pivot means the elimination broke down; reject
        // before solve time.
        if lu.determinant() == 0.0 {
            return None;
        }
        Some(lu)
    }
}

impl MatrixFactor for nalgebra::LU<f64, Dyn, Dyn> {
    type V = DVector<f64>;

    fn solve_in_place(&self, b: &mut Self::V) -> bool {
        nalgebra::LU::solve_mut(self, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factor_and_solve() {
        let mut m = DMatrix::<f64>::zeros(2, 2);
        m.set_column(0, &DVector::from_vec(vec![2.0, 0.0]));
        m.set_column(1, &DVector::from_vec(vec![0.0, 4.0]));
        let f = m.factorize().unwrap();
        let mut b = DVector::from_vec(vec![2.0, 4.0]);
        assert!(f.solve_in_place(&mut b));
        b.assert_eq(&DVector::from_vec(vec![1.0, 1.0]), 1e-14);
    }

    #[test]
    fn scaled_identity_shift() {
        let mut m = DMatrix::<f64>::zeros(2, 2);
        m.scale_mut(0.0);
        m.add_scaled_identity(1.0);
        assert_eq!(m[(0, 0)], 1.0);
        assert_eq!(m[(1, 1)], 1.0);
        assert_eq!(m[(0, 1)], 0.0);
    }

    #[test]
    fn singular_matrix_is_rejected() {
        let m = DMatrix::<f64>::zeros(2, 2);
        assert!(m.factorize().is_none());
    }
}
