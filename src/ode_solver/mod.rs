pub mod coeffs;
pub mod history;
pub mod nonlinear;
pub mod problem;
pub mod quadrature;
pub mod sensitivity;
pub mod solver;
pub mod stability;
pub mod step;
pub mod test_models;

#[cfg(test)]
mod tests {
    use nalgebra::{DMatrix, DVector};

    use crate::errors::{OdeError, RhsResult};
    use crate::linear_solver::dense::DenseDirect;
    use crate::ode_solver::problem::{OdeProblem, Tolerance};
    use crate::ode_solver::sensitivity::SensMethod;
    use crate::ode_solver::solver::{Method, OdeSolver, SolverStatus, Task};
    use crate::vector::Vector;

    use super::test_models::cosine_quadrature::cosine_quadrature_problem;
    use super::test_models::decay_sensitivity::decay_sensitivity_problem;
    use super::test_models::exponential_decay::exponential_decay_problem;
    use super::test_models::harmonic_oscillator::harmonic_oscillator_problem;
    use super::test_models::van_der_pol::van_der_pol_problem;
    use super::test_models::OdeSolverSolution;

    fn init_from_problem(
        solver: &mut OdeSolver<DVector<f64>>,
        problem: OdeProblem<DVector<f64>>,
    ) {
        let OdeProblem {
            f,
            t0,
            y0,
            rtol,
            atol,
            params,
        } = problem;
        solver.set_params(params);
        solver.init(f, t0, &y0, rtol, atol).unwrap();
    }

    fn run_to_solution(
        solver: &mut OdeSolver<DVector<f64>>,
        soln: &OdeSolverSolution<DVector<f64>>,
        tol: f64,
    ) {
        let mut yout = DVector::zeros(soln.solution_points[0].state.len());
        for point in &soln.solution_points {
            let (t, status) = solver.solve(point.t, &mut yout, Task::Normal).unwrap();
            assert_eq!(status, SolverStatus::Success);
            assert_eq!(t, point.t);
            yout.assert_eq(&point.state, tol);
        }
    }

    #[test]
    fn adams_functional_exponential_decay() {
        let (problem, soln) = exponential_decay_problem();
        let mut solver = OdeSolver::new(Method::Adams);
        init_from_problem(&mut solver, problem);
        run_to_solution(&mut solver, &soln, 1.0e-7);

        let stats = solver.statistics();
        assert!(stats.number_of_steps > 0);
        assert!(stats.number_of_rhs_evals > stats.number_of_steps);
        assert_eq!(stats.number_of_linear_solver_setups, 0);
    }

    #[test]
    fn bdf_newton_van_der_pol() {
        let (problem, jac) = van_der_pol_problem();
        let mut solver = OdeSolver::new(Method::Bdf);
        solver
            .attach_linear_solver(Box::new(
                DenseDirect::<DMatrix<f64>>::new().with_jacobian(jac),
            ))
            .unwrap();
        solver.set_max_num_steps(100_000);
        init_from_problem(&mut solver, problem);

        let mut yout = DVector::zeros(2);
        let (t, _) = solver.solve(3000.0, &mut yout, Task::Normal).unwrap();
        assert_eq!(t, 3000.0);
        assert!(
            yout[0] > -2.01 && yout[0] < -1.99,
            "y1 = {} outside the limit-cycle window",
            yout[0]
        );
        let stats = solver.statistics();
        assert!(
            stats.number_of_steps < 1200,
            "took {} steps",
            stats.number_of_steps
        );
    }

    #[test]
    fn bdf_stability_detection_runs_on_van_der_pol() {
        let (problem, jac) = van_der_pol_problem();
        let mut solver = OdeSolver::new(Method::Bdf);
        solver
            .attach_linear_solver(Box::new(
                DenseDirect::<DMatrix<f64>>::new().with_jacobian(jac),
            ))
            .unwrap();
        solver.set_stab_lim_det(true).unwrap();
        solver.set_max_num_steps(100_000);
        init_from_problem(&mut solver, problem);

        let mut yout = DVector::zeros(2);
        solver.solve(3000.0, &mut yout, Task::Normal).unwrap();
        assert!(yout[0] > -2.01 && yout[0] < -1.99);
    }

    #[test]
    fn adams_functional_harmonic_oscillator() {
        let (problem, soln) = harmonic_oscillator_problem();
        let mut solver = OdeSolver::new(Method::Adams);
        solver.set_max_num_steps(100_000);
        init_from_problem(&mut solver, problem);
        run_to_solution(&mut solver, &soln, 1.0e-8);
    }

    #[test]
    fn pure_quadrature_of_cosine() {
        let (problem, fq, yq0) = cosine_quadrature_problem();
        let mut solver = OdeSolver::new(Method::Adams);
        init_from_problem(&mut solver, problem);
        solver.quad_init(fq, &yq0).unwrap();
        solver
            .set_quad_tolerances(1.0e-6, Tolerance::Scalar(1.0e-8))
            .unwrap();
        solver.set_quad_err_con(true).unwrap();
        solver.set_max_num_steps(100_000);

        let mut yout = DVector::zeros(1);
        let tout = std::f64::consts::PI;
        let (t, _) = solver.solve(tout, &mut yout, Task::Normal).unwrap();
        assert_eq!(t, tout);
        let mut yq = DVector::zeros(1);
        solver.get_quad(t, &mut yq).unwrap();
        // sin(pi) = 0 up to the quadrature tolerances.
        assert!(yq[0].abs() < 1.0e-4, "quadrature value {}", yq[0]);
    }

    fn run_decay_sensitivity(ism: SensMethod) -> (f64, f64) {
        let (problem, ys0) = decay_sensitivity_problem();
        let mut solver = OdeSolver::new(Method::Adams);
        init_from_problem(&mut solver, problem);
        solver.sens_init(1, ism, &ys0).unwrap();
        solver
            .set_sens_params(None, Some(vec![1.0]), None)
            .unwrap();
        solver.set_sens_err_con(true).unwrap();
        solver.set_max_num_steps(100_000);

        let mut yout = DVector::zeros(1);
        let (t, _) = solver.solve(1.0, &mut yout, Task::Normal).unwrap();
        let mut ys = vec![DVector::zeros(1)];
        solver.get_sens(t, &mut ys).unwrap();
        (yout[0], ys[0][0])
    }

    #[test]
    fn simultaneous_sensitivity_of_decay_rate() {
        let (y, s) = run_decay_sensitivity(SensMethod::Simultaneous);
        let exact = f64::exp(-1.0);
        assert!((y - exact).abs() < 1.0e-6, "y = {y}");
        // s = dy/dp = -t e^{-pt} at t = 1.
        assert!((s + exact).abs() < 1.0e-4, "s = {s}");
    }

    #[test]
    fn staggered_methods_agree_with_simultaneous() {
        let (y_sim, s_sim) = run_decay_sensitivity(SensMethod::Simultaneous);
        let (y_stg, s_stg) = run_decay_sensitivity(SensMethod::Staggered);
        let (y_stg1, s_stg1) = run_decay_sensitivity(SensMethod::Staggered1);
        assert!((y_sim - y_stg).abs() < 1.0e-6);
        assert!((y_sim - y_stg1).abs() < 1.0e-6);
        assert!((s_sim - s_stg).abs() < 1.0e-6);
        assert!((s_sim - s_stg1).abs() < 1.0e-6);
    }

    #[test]
    fn tstop_is_honored_exactly() {
        let (problem, _) = exponential_decay_problem();
        let mut solver = OdeSolver::new(Method::Adams);
        init_from_problem(&mut solver, problem);
        solver.set_stop_time(5.0);
        solver.set_max_num_steps(100_000);

        let mut yout = DVector::zeros(1);
        let (t, status) = solver.solve(10.0, &mut yout, Task::NormalTstop).unwrap();
        assert_eq!(status, SolverStatus::TstopReturn);
        assert_eq!(t, 5.0);
        let mut yref = DVector::zeros(1);
        solver.get_dky(5.0, 0, &mut yref).unwrap();
        yout.assert_eq(&yref, 0.0);
    }

    #[test]
    fn one_step_mode_returns_after_each_internal_step() {
        let (problem, _) = exponential_decay_problem();
        let mut solver = OdeSolver::new(Method::Adams);
        init_from_problem(&mut solver, problem);

        let mut yout = DVector::zeros(1);
        let (t1, _) = solver.solve(1.0, &mut yout, Task::OneStep).unwrap();
        assert!(t1 > 0.0 && t1 < 1.0);
        assert_eq!(solver.statistics().number_of_steps, 1);
        let (t2, _) = solver.solve(1.0, &mut yout, Task::OneStep).unwrap();
        assert!(t2 > t1);
        assert_eq!(solver.statistics().number_of_steps, 2);
        // The interpolant at the step end must reproduce the returned state.
        let mut yref = DVector::zeros(1);
        solver.get_dky(t2, 0, &mut yref).unwrap();
        yout.assert_eq(&yref, 0.0);
    }

    #[test]
    fn tout_equal_to_t0_is_too_close() {
        let (problem, _) = exponential_decay_problem();
        let mut solver = OdeSolver::new(Method::Adams);
        init_from_problem(&mut solver, problem);
        let mut yout = DVector::zeros(1);
        let err = solver.solve(0.0, &mut yout, Task::Normal);
        assert!(matches!(err, Err(OdeError::TooClose)));
    }

    #[test]
    fn zero_weight_component_rejected_at_init() {
        let mut solver: OdeSolver<DVector<f64>> = OdeSolver::new(Method::Adams);
        let err = solver.init(
            Box::new(
                |_t: f64, _y: &DVector<f64>, ydot: &mut DVector<f64>, _p: &[f64]| {
                    ydot[0] = 0.0;
                    RhsResult::Ok
                },
            ),
            0.0,
            &DVector::from_element(1, 0.0),
            0.0,
            Tolerance::Scalar(0.0),
        );
        assert!(matches!(err, Err(OdeError::EwtInvalid)));
    }

    #[test]
    fn max_num_steps_is_enforced() {
        let (problem, _) = exponential_decay_problem();
        let mut solver = OdeSolver::new(Method::Adams);
        init_from_problem(&mut solver, problem);
        solver.set_max_num_steps(5);
        let mut yout = DVector::zeros(1);
        let err = solver.solve(1.0e6, &mut yout, Task::Normal);
        assert!(matches!(err, Err(OdeError::TooMuchWork { .. })));
        assert_eq!(solver.statistics().number_of_steps, 5);
        // The last reached solution is left in yout.
        assert!(yout[0] > 0.0 && yout[0] <= 1.0);
    }

    #[test]
    fn reinit_reproduces_a_fresh_integration() {
        let (problem, _) = exponential_decay_problem();
        let mut solver = OdeSolver::new(Method::Adams);
        init_from_problem(&mut solver, problem);
        let mut y1 = DVector::zeros(1);
        solver.solve(0.5, &mut y1, Task::Normal).unwrap();

        solver.reinit(0.0, &DVector::from_element(1, 1.0)).unwrap();
        let mut y2 = DVector::zeros(1);
        solver.solve(0.5, &mut y2, Task::Normal).unwrap();
        // Same arithmetic path, bit-identical result.
        assert_eq!(y1, y2);
    }

    #[test]
    fn solve_before_init_reports_no_memory() {
        let mut solver: OdeSolver<DVector<f64>> = OdeSolver::new(Method::Bdf);
        let mut yout = DVector::zeros(1);
        let err = solver.solve(1.0, &mut yout, Task::Normal);
        assert!(matches!(err, Err(OdeError::NoMemory)));
    }

    #[test]
    fn tstop_task_requires_stop_time() {
        let (problem, _) = exponential_decay_problem();
        let mut solver = OdeSolver::new(Method::Adams);
        init_from_problem(&mut solver, problem);
        let mut yout = DVector::zeros(1);
        let err = solver.solve(1.0, &mut yout, Task::NormalTstop);
        assert!(matches!(err, Err(OdeError::IllInput(_))));
    }

    #[test]
    fn interpolation_outside_last_step_is_rejected() {
        let (problem, _) = exponential_decay_problem();
        let mut solver = OdeSolver::new(Method::Adams);
        init_from_problem(&mut solver, problem);
        let mut yout = DVector::zeros(1);
        solver.solve(1.0, &mut yout, Task::Normal).unwrap();
        let mut dky = DVector::zeros(1);
        assert!(matches!(
            solver.get_dky(-1.0, 0, &mut dky),
            Err(OdeError::BadT { .. })
        ));
        assert!(matches!(
            solver.get_dky(0.9, 99, &mut dky),
            Err(OdeError::BadK)
        ));
    }

    #[test]
    fn stability_limit_detection_is_bdf_only() {
        let mut solver: OdeSolver<DVector<f64>> = OdeSolver::new(Method::Adams);
        assert!(solver.set_stab_lim_det(true).is_err());
        let mut solver: OdeSolver<DVector<f64>> = OdeSolver::new(Method::Bdf);
        assert!(solver.set_stab_lim_det(true).is_ok());
    }
}
