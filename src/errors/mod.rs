use thiserror::Error;

/// Result of a user-supplied right-hand-side evaluation.
///
/// A recoverable error asks the integrator to retry the step with a smaller
/// step size; a non-recoverable error aborts the solve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RhsResult {
    Ok,
    RecoverableError,
    NonRecoverableError,
}

/// Outcome of a failed linear-solver setup or solve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinearSolverFailure {
    /// The operation failed in a way that a fresh Jacobian or a smaller step
    /// may fix.
    Recoverable,
    /// The operation failed permanently; the solve is aborted.
    Unrecoverable,
}

#[derive(Error, Debug)]
pub enum OdeError {
    #[error("illegal input: {0}")]
    IllInput(&'static str),
    #[error("integrator storage has not been initialized")]
    NoMemory,
    #[error("quadrature storage has not been initialized")]
    NoQuad,
    #[error("sensitivity storage has not been initialized")]
    NoSens,
    #[error("a component of the error weight vector is non-positive")]
    EwtInvalid,
    #[error("a component of the error weight vector became non-positive at t = {t}")]
    EwtNowBad { t: f64 },
    #[error("the output time is too close to the initial time to start the integration")]
    TooClose,
    #[error("maximum number of internal steps reached before the output time, at t = {t}")]
    TooMuchWork { t: f64 },
    #[error("the requested accuracy exceeds machine precision at t = {t}, suggested tolerance scale factor {tolsf}")]
    TooMuchAcc { t: f64, tolsf: f64 },
    #[error("repeated local error test failures at t = {t} with step size h = {h}")]
    ErrFailure { t: f64, h: f64 },
    #[error("the corrector repeatedly failed to converge at t = {t} with step size h = {h}")]
    ConvFailure { t: f64, h: f64 },
    #[error("the linear solver's setup routine failed unrecoverably at t = {t}")]
    SetupFailure { t: f64 },
    #[error("the linear solver's solve routine failed unrecoverably at t = {t}")]
    SolveFailure { t: f64 },
    #[error("the right-hand-side function failed unrecoverably at t = {t}")]
    RhsFailed { t: f64 },
    #[error("the right-hand-side function failed recoverably at the first call, at t = {t}")]
    FirstRhsFailed { t: f64 },
    #[error("the right-hand-side function kept failing recoverably at t = {t}")]
    RepeatedRhsFailure { t: f64 },
    #[error("the quadrature right-hand-side function failed unrecoverably at t = {t}")]
    QuadRhsFailed { t: f64 },
    #[error("the sensitivity right-hand-side function failed unrecoverably at t = {t}")]
    SensRhsFailed { t: f64 },
    #[error("illegal derivative order k for interpolation")]
    BadK,
    #[error("interpolation time t = {t} is outside the last step interval [{tmin}, {tmax}]")]
    BadT { t: f64, tmin: f64, tmax: f64 },
    #[error("interpolation output vector has the wrong length")]
    BadDky,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_carry_context() {
        let e = OdeError::BadT {
            t: 2.0,
            tmin: 0.0,
            tmax: 1.0,
        };
        let msg = format!("{e}");
        assert!(msg.contains("t = 2"));
        assert!(msg.contains("[0, 1]"));
    }
}
