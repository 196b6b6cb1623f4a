use std::fmt::{Debug, Display};
use std::ops::{AddAssign, DivAssign, MulAssign, SubAssign};

use num_traits::Float;

pub type IndexType = usize;

/// Real scalar type used by all components.
///
/// The integrator is written against this trait rather than `f64` so that the
/// state vectors, the coefficient arrays and all step-control arithmetic share
/// one scalar type.
pub trait Scalar:
    Float
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
    + Debug
    + Display
    + Send
    + Sync
    + 'static
{
    /// Lift an `f64` literal into the scalar type.
    fn from_f64(v: f64) -> Self;

    /// Lossy conversion back to `f64`, for diagnostics and error payloads.
    fn as_f64(self) -> f64;

    /// Unit roundoff of the scalar type.
    fn unit_roundoff() -> Self {
        Self::epsilon()
    }
}

impl Scalar for f64 {
    fn from_f64(v: f64) -> Self {
        v
    }

    fn as_f64(self) -> f64 {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_roundoff_matches_epsilon() {
        assert_eq!(<f64 as Scalar>::unit_roundoff(), f64::EPSILON);
        assert_eq!(<f64 as Scalar>::from_f64(0.5), 0.5);
    }
}
