// Connector discipline tests — run the cross-stream forward/backward
// contracts against real worker-thread streams.

use okapi_core::{Connector, Context, DType, Matrix};
use okapi_cpu::{CpuBackend, CpuDevice};

type Conn = Connector<CpuBackend>;
type Ctx = Context<CpuBackend>;
type Mat = Matrix<CpuBackend>;

fn ctx() -> Ctx {
    Context::new(&CpuDevice::new()).unwrap()
}

fn mat(nrows: usize, ncols: usize) -> Mat {
    Matrix::empty(nrows, ncols, DType::F32, &CpuDevice::new()).unwrap()
}

fn read(m: &Mat, ctx: &Ctx) -> Vec<f32> {
    m.to_host(ctx).unwrap().data().as_f32().unwrap().to_vec()
}

#[test]
fn value_before_first_fprop_fails() {
    let prod = ctx();
    let conn = Conn::new(mat(2, 2), prod);
    let cons = conn.register(&ctx(), false).unwrap();
    assert!(cons.value().is_err());
}

#[test]
fn duplicate_registration_rejected() {
    let prod = ctx();
    let conn = Conn::new(mat(2, 2), prod);
    let reader = ctx();
    conn.register(&reader, true).unwrap();
    assert!(conn.register(&reader, true).is_err());
    // Same context with the other flag is distinct accounting.
    conn.register(&reader, false).unwrap();
}

#[test]
fn registration_after_fprop_rejected() {
    let prod = ctx();
    let value = mat(2, 2);
    value.fill(&prod, 0.0).unwrap();
    let conn = Conn::new(value, prod);
    conn.fprop().unwrap();
    assert!(conn.register(&ctx(), false).is_err());
}

#[test]
fn backward_consumer_on_forward_only_rejected() {
    let prod = ctx();
    let conn = Conn::forward_only(mat(2, 2), prod);
    assert!(conn.register(&ctx(), true).is_err());
    conn.register(&ctx(), false).unwrap();
}

#[test]
fn value_is_visible_on_another_stream() {
    let prod = ctx();
    let value = mat(3, 2);
    let conn = Conn::new(value.clone(), prod.clone());
    let reader = ctx();
    let cons = conn.register(&reader, false).unwrap();

    value.fill(&prod, 4.25).unwrap();
    conn.fprop().unwrap();

    // The copy is queued on the reader's stream after the fprop event.
    let seen = cons.value().unwrap();
    let snapshot = mat(3, 2);
    snapshot.copy_from(&reader, &seen).unwrap();
    assert_eq!(read(&snapshot, &reader), vec![4.25; 6]);
}

#[test]
fn gradient_accumulates_exact_sum_across_streams() {
    let prod = ctx();
    let value = mat(2, 2);
    let conn = Conn::new(value.clone(), prod.clone());

    let consumers: Vec<_> = (0..3)
        .map(|_| conn.register(&ctx(), true).unwrap())
        .collect();

    value.fill(&prod, 1.0).unwrap();
    conn.fprop().unwrap();

    // Each consumer adds k+1 times the (all-ones) value on its own stream.
    for (k, cons) in consumers.iter().enumerate() {
        let v = cons.value().unwrap();
        let g = cons.grad().unwrap();
        g.add_scaled(cons.context(), (k + 1) as f32, &v).unwrap();
        cons.grad_commit().unwrap();
    }

    let grad = conn.backward_matrix().unwrap();
    assert_eq!(read(&grad, &prod), vec![6.0; 4]);
}

#[test]
fn backward_matrix_fails_while_a_consumer_owes() {
    let prod = ctx();
    let value = mat(2, 1);
    let conn = Conn::new(value.clone(), prod.clone());
    let c1 = conn.register(&ctx(), true).unwrap();
    let c2 = conn.register(&ctx(), true).unwrap();

    value.fill(&prod, 1.0).unwrap();
    conn.fprop().unwrap();

    let g = c1.grad().unwrap();
    g.add(c1.context(), &c1.value().unwrap()).unwrap();
    c1.grad_commit().unwrap();
    assert!(conn.backward_matrix().is_err());

    let g = c2.grad().unwrap();
    g.add(c2.context(), &c2.value().unwrap()).unwrap();
    c2.grad_commit().unwrap();
    assert_eq!(read(&conn.backward_matrix().unwrap(), &prod), vec![2.0; 2]);
}

#[test]
fn second_acquisition_without_commit_fails() {
    let prod = ctx();
    let value = mat(2, 1);
    let conn = Conn::new(value.clone(), prod);
    let c1 = conn.register(&ctx(), true).unwrap();
    let c2 = conn.register(&ctx(), true).unwrap();

    conn.fprop().unwrap();
    let _g = c1.grad().unwrap();
    assert!(c2.grad().is_err());
    c1.grad_commit().unwrap();
    let _g = c2.grad().unwrap();
    c2.grad_commit().unwrap();
}

#[test]
fn consumer_cannot_contribute_twice_per_generation() {
    let prod = ctx();
    let conn = Conn::new(mat(1, 1), prod);
    let cons = conn.register(&ctx(), true).unwrap();

    conn.fprop().unwrap();
    let _g = cons.grad().unwrap();
    cons.grad_commit().unwrap();
    assert!(cons.grad().is_err());

    // The next generation re-arms it.
    conn.fprop().unwrap();
    let _g = cons.grad().unwrap();
    cons.grad_commit().unwrap();
}

#[test]
fn only_one_deferral_per_generation() {
    let prod = ctx();
    let conn = Conn::new(mat(2, 1), prod);
    let c1 = conn.register(&ctx(), true).unwrap();
    let c2 = conn.register(&ctx(), true).unwrap();

    conn.fprop().unwrap();
    conn.defer_grad(&c1).unwrap();
    assert!(conn.defer_grad(&c2).is_err());

    // Releasing the deferral makes room for the other consumer.
    conn.restore_grad(&c1).unwrap();
    conn.defer_grad(&c2).unwrap();
}

#[test]
fn deferred_consumer_does_not_block_the_owner() {
    let prod = ctx();
    let value = mat(2, 1);
    let conn = Conn::new(value.clone(), prod.clone());
    let active = conn.register(&ctx(), true).unwrap();
    let skipped = conn.register(&ctx(), true).unwrap();

    value.fill(&prod, 1.0).unwrap();
    conn.fprop().unwrap();
    conn.defer_grad(&skipped).unwrap();

    let g = active.grad().unwrap();
    g.add(active.context(), &active.value().unwrap()).unwrap();
    active.grad_commit().unwrap();

    assert_eq!(read(&conn.backward_matrix().unwrap(), &prod), vec![1.0; 2]);
}

#[test]
fn owner_reads_zeros_when_nothing_contributed() {
    let prod = ctx();
    let value = mat(2, 2);
    // Pre-allocated accumulation buffer, no consumers at all.
    let conn = Conn::with_grad(value.clone(), prod.clone()).unwrap();

    value.fill(&prod, 7.0).unwrap();
    conn.fprop().unwrap();
    assert_eq!(read(&conn.backward_matrix().unwrap(), &prod), vec![0.0; 4]);
}

#[test]
fn generation_counts_productions() {
    let prod = ctx();
    let conn = Conn::forward_only(mat(1, 1), prod);
    assert_eq!(conn.generation(), 0);
    conn.fprop().unwrap();
    conn.fprop().unwrap();
    assert_eq!(conn.generation(), 2);
}
