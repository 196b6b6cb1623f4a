use criterion::{criterion_group, criterion_main, Criterion};
use nalgebra::{DMatrix, DVector};

use nordsieck::ode_solver::test_models::exponential_decay::exponential_decay_problem;
use nordsieck::ode_solver::test_models::van_der_pol::van_der_pol_problem;
use nordsieck::{DenseDirect, Method, OdeSolver, Task};

fn bench_adams_exponential_decay(c: &mut Criterion) {
    c.bench_function("adams_exponential_decay", |b| {
        b.iter(|| {
            let (problem, _) = exponential_decay_problem();
            let mut solver = OdeSolver::new(Method::Adams);
            solver
                .init(problem.f, problem.t0, &problem.y0, problem.rtol, problem.atol)
                .unwrap();
            let mut yout = DVector::zeros(1);
            solver.solve(1.0, &mut yout, Task::Normal).unwrap();
            yout[0]
        })
    });
}

fn bench_bdf_van_der_pol(c: &mut Criterion) {
    c.bench_function("bdf_van_der_pol", |b| {
        b.iter(|| {
            let (problem, jac) = van_der_pol_problem();
            let mut solver = OdeSolver::new(Method::Bdf);
            solver
                .attach_linear_solver(Box::new(
                    DenseDirect::<DMatrix<f64>>::new().with_jacobian(jac),
                ))
                .unwrap();
            solver.set_max_num_steps(100_000);
            solver
                .init(problem.f, problem.t0, &problem.y0, problem.rtol, problem.atol)
                .unwrap();
            let mut yout = DVector::zeros(2);
            solver.solve(3000.0, &mut yout, Task::Normal).unwrap();
            yout[0]
        })
    });
}

criterion_group!(
    benches,
    bench_adams_exponential_decay,
    bench_bdf_van_der_pol
);
criterion_main!(benches);
