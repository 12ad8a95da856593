// Block tests on the CPU backend: forward values against hand-computed
// references, backward flow through the shared gradient buffers, and the
// recurrent block's variable-length window handling.

use okapi_core::{Block, Connector, Context, DType, Error, HostMatrix, Matrix};
use okapi_cpu::{CpuBackend, CpuDevice};
use okapi_nn::{
    Activation, DenseBlock, HStackBlock, LstmBlock, MetricTracker, Observer, SeqLen,
    SigmoidCeBlock, TrackedMetric,
};
use std::sync::{Arc, Mutex};

type Conn = Connector<CpuBackend>;
type Ctx = Context<CpuBackend>;
type Mat = Matrix<CpuBackend>;

fn device() -> CpuDevice {
    CpuDevice::new()
}

fn ctx() -> Ctx {
    Context::new(&device()).unwrap()
}

fn read(m: &Mat, ctx: &Ctx) -> Vec<f32> {
    m.to_host(ctx).unwrap().data().as_f32().unwrap().to_vec()
}

/// A value uploaded once and produced on a fresh context, gradient-taking.
fn produced(nrows: usize, ncols: usize, data: Vec<f32>) -> (Conn, Ctx) {
    let host = HostMatrix::from_f32(nrows, ncols, data).unwrap();
    let value = Matrix::from_host(&host, &device()).unwrap();
    let ctx = ctx();
    (Conn::new(value, ctx.clone()), ctx)
}

/// Same, but forward-only (a data/label source).
fn source(nrows: usize, ncols: usize, data: Vec<f32>) -> (Conn, Ctx) {
    let host = HostMatrix::from_f32(nrows, ncols, data).unwrap();
    let value = Matrix::from_host(&host, &device()).unwrap();
    let ctx = ctx();
    (Conn::forward_only(value, ctx.clone()), ctx)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

//  HStack

#[test]
fn hstack_concatenates_column_blocks() {
    let (a, _) = source(4, 3, vec![1.0; 12]);
    let (b, _) = source(4, 2, vec![2.0; 8]);
    let mut block = HStackBlock::new(&[&a, &b], &device()).unwrap();
    a.fprop().unwrap();
    b.fprop().unwrap();
    block.fprop().unwrap();

    let out = block.output();
    assert_eq!(out.value().nrows(), 4);
    assert_eq!(out.value().ncols(), 5);
    let host = read(out.value(), out.producer());
    assert_eq!(&host[..12], &[1.0; 12][..]);
    assert_eq!(&host[12..], &[2.0; 8][..]);
}

#[test]
fn hstack_backward_splits_gradient_by_input() {
    let (a, a_ctx) = produced(2, 1, vec![1.0, 1.0]);
    let (b, b_ctx) = produced(2, 1, vec![2.0, 2.0]);
    let mut block = HStackBlock::new(&[&a, &b], &device()).unwrap();

    let down = ctx();
    let cons = block.output().register(&down, true).unwrap();

    a.fprop().unwrap();
    b.fprop().unwrap();
    block.fprop().unwrap();

    // Feed the stacked value back as its own gradient.
    let g = cons.grad().unwrap();
    g.add(&down, &cons.value().unwrap()).unwrap();
    cons.grad_commit().unwrap();
    block.bprop().unwrap();

    assert_eq!(read(&a.backward_matrix().unwrap(), &a_ctx), vec![1.0, 1.0]);
    assert_eq!(read(&b.backward_matrix().unwrap(), &b_ctx), vec![2.0, 2.0]);
}

//  Dense

#[test]
fn dense_identity_forward_is_a_gemm() {
    let (x, _) = source(1, 2, vec![1.0, 2.0]);
    let w = HostMatrix::from_f32(2, 1, vec![0.5, -1.0]).unwrap();
    let mut block = DenseBlock::new(&w, &x, Activation::Identity, &device()).unwrap();
    x.fprop().unwrap();
    block.fprop().unwrap();

    let out = block.output();
    assert_eq!(read(out.value(), out.producer()), vec![-1.5]);
}

#[test]
fn dense_rejects_mismatched_weight_shape() {
    let (x, _) = source(1, 2, vec![1.0, 2.0]);
    let w = HostMatrix::from_f32(3, 1, vec![0.0; 3]).unwrap();
    assert!(DenseBlock::new(&w, &x, Activation::Identity, &device()).is_err());
}

#[test]
fn dense_and_loss_gradients_match_manual_derivation() {
    // Scalar chain: pre = x·w, probs = sigmoid(pre), label 1.
    // dpre = probs - 1, dw = x·dpre, dx = dpre·w.
    let (x, x_ctx) = produced(1, 1, vec![1.0]);
    let (labels, _) = source(1, 1, vec![1.0]);
    let w = HostMatrix::from_f32(1, 1, vec![2.0]).unwrap();

    let mut dense = DenseBlock::new(&w, &x, Activation::Identity, &device()).unwrap();
    let mut loss = SigmoidCeBlock::new(dense.output(), &labels, &device()).unwrap();

    x.fprop().unwrap();
    labels.fprop().unwrap();
    dense.fprop().unwrap();
    loss.fprop().unwrap();
    loss.bprop().unwrap();
    dense.bprop().unwrap();

    let dpre = sigmoid(2.0) - 1.0;
    let (dw_ctx, dw) = &dense.grads()[0];
    let got_dw = read(dw, dw_ctx)[0];
    assert!((got_dw - dpre).abs() < 1e-5, "dw = {got_dw}");

    let dx = read(&x.backward_matrix().unwrap(), &x_ctx)[0];
    assert!((dx - dpre * 2.0).abs() < 1e-5, "dx = {dx}");
}

//  LSTM

#[test]
fn lstm_zero_weights_produce_zero_states() {
    let w = HostMatrix::zeros(1, 4);
    let r = HostMatrix::zeros(1, 4);
    let (x0, _) = source(1, 1, vec![0.7]);
    let (x1, _) = source(1, 1, vec![-0.3]);
    let seq_len = SeqLen::new(2);
    let mut lstm = LstmBlock::new(
        &w,
        &r,
        &[x0.clone(), x1.clone()],
        seq_len,
        None,
        false,
        &device(),
    )
    .unwrap();

    x0.fprop().unwrap();
    x1.fprop().unwrap();
    lstm.fprop().unwrap();

    // All gate pre-activations are zero, so c = sigmoid(0)·tanh(0) = 0 and
    // h = sigmoid(0)·tanh(0) = 0 at every step.
    for out in lstm.outputs() {
        assert_eq!(read(out.value(), out.producer()), vec![0.0]);
    }
}

#[test]
fn lstm_single_step_matches_manual_cell() {
    // Gate order in the stacked weights is z, i, f, o.
    let (wz, wi, wf, wo) = (0.5f32, 0.25, -0.5, 1.0);
    let w = HostMatrix::from_f32(1, 4, vec![wz, wi, wf, wo]).unwrap();
    let r = HostMatrix::from_f32(1, 4, vec![0.3, -0.2, 0.1, 0.4]).unwrap();
    let (x, _) = source(1, 1, vec![1.0]);
    let mut lstm =
        LstmBlock::new(&w, &r, &[x.clone()], SeqLen::new(1), None, false, &device()).unwrap();

    x.fprop().unwrap();
    lstm.fprop().unwrap();

    // Boundary step: previous c and h are zero, so R contributes nothing.
    let z = wz.tanh();
    let i = sigmoid(wi);
    let o = sigmoid(wo);
    let c = i * z;
    let expected_h = o * c.tanh();

    let out = &lstm.outputs()[0];
    let got = read(out.value(), out.producer())[0];
    assert!((got - expected_h).abs() < 1e-5, "h = {got}, want {expected_h}");
}

#[test]
fn lstm_rejects_empty_and_overlong_windows() {
    let w = HostMatrix::zeros(1, 4);
    let r = HostMatrix::zeros(1, 4);
    let (x0, _) = source(1, 1, vec![0.0]);
    let (x1, _) = source(1, 1, vec![0.0]);
    let seq_len = SeqLen::new(1);
    let mut lstm = LstmBlock::new(
        &w,
        &r,
        &[x0.clone(), x1.clone()],
        seq_len.clone(),
        None,
        false,
        &device(),
    )
    .unwrap();
    x0.fprop().unwrap();
    x1.fprop().unwrap();

    seq_len.set(0);
    assert!(lstm.fprop().is_err());

    seq_len.set(3);
    match lstm.fprop() {
        Err(Error::SequenceTooLong { len, max }) => {
            assert_eq!((len, max), (3, 2));
        }
        other => panic!("expected SequenceTooLong, got {other:?}"),
    }

    seq_len.set(2);
    lstm.fprop().unwrap();
}

#[test]
fn lstm_handles_shrinking_and_regrowing_windows() {
    let mut rng_state = 0x2545f491u32;
    let mut noise = || {
        // xorshift, deterministic input wiggle
        rng_state ^= rng_state << 13;
        rng_state ^= rng_state >> 17;
        rng_state ^= rng_state << 5;
        (rng_state % 1000) as f32 / 1000.0 - 0.5
    };

    let batch = 2;
    let hidden = 2;
    let max_len = 3;
    let w = HostMatrix::full(1, 4 * hidden, 0.1);
    let r = HostMatrix::full(hidden, 4 * hidden, -0.05);

    let src = ctx();
    let steps: Vec<(Mat, Conn)> = (0..max_len)
        .map(|_| {
            let value = Matrix::empty(batch, 1, DType::F32, &device()).unwrap();
            let conn = Conn::forward_only(value.clone(), src.clone());
            (value, conn)
        })
        .collect();
    let inputs: Vec<Conn> = steps.iter().map(|(_, c)| c.clone()).collect();

    let seq_len = SeqLen::new(max_len);
    let mut lstm = LstmBlock::new(&w, &r, &inputs, seq_len.clone(), None, false, &device()).unwrap();

    // One external gradient-taking consumer per unrolled output.
    let down = ctx();
    let taps: Vec<_> = lstm
        .outputs()
        .iter()
        .map(|out| out.register(&down, true).unwrap())
        .collect();

    for &len in &[3usize, 2, 1, 3] {
        for (value, conn) in &steps {
            let host = HostMatrix::from_f32(batch, 1, (0..batch).map(|_| noise()).collect()).unwrap();
            value.to_device_async(&src, &host).unwrap();
            conn.fprop().unwrap();
        }
        seq_len.set(len);
        lstm.fprop().unwrap();

        // Active outputs feed their own value back as the loss gradient.
        for tap in taps.iter().take(len) {
            let v = tap.value().unwrap();
            let g = tap.grad().unwrap();
            g.add(&down, &v).unwrap();
            tap.grad_commit().unwrap();
        }
        lstm.bprop().unwrap();
    }

    for (g_ctx, g) in lstm.grads() {
        for v in read(&g, &g_ctx) {
            assert!(v.is_finite());
        }
    }
}

//  Observers

#[test]
fn tracker_report_covers_every_queued_sample() {
    // The cadence notify may land while metric callbacks are still queued
    // behind device work; the report must include all of them anyway.
    let device = device();
    let ctx: Ctx = Context::new(&device).unwrap();
    let probs = Matrix::from_host(
        &HostMatrix::from_f32(2, 1, vec![0.9, 0.1]).unwrap(),
        &device,
    )
    .unwrap();
    let labels = Matrix::from_host(
        &HostMatrix::from_f32(2, 1, vec![1.0, 0.0]).unwrap(),
        &device,
    )
    .unwrap();

    let period = 4u64;
    let mut tracker = MetricTracker::from_parts(
        ctx.clone(),
        probs.alias(),
        labels.alias(),
        TrackedMetric::Accuracy,
        period,
    )
    .unwrap();
    let reports: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    tracker.add_downstream(move |v| sink.lock().unwrap().push(v));

    for iteration in 1..=2 * period {
        tracker.notify_about_fprop().unwrap();
        tracker.notify(iteration).unwrap();
    }

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 2, "one report per full cadence window");
    for &v in reports.iter() {
        assert_eq!(v, 1.0, "every sample predicts both rows correctly");
    }
}

#[test]
fn lstm_mask_freezes_padded_rows() {
    let w = HostMatrix::full(1, 4, 1.0);
    let r = HostMatrix::zeros(1, 4);
    let (x, _) = source(2, 1, vec![1.0, 1.0]);
    // Column 0 of the mask keeps row 0 and freezes row 1.
    let (mask, _) = source(2, 1, vec![1.0, 0.0]);
    let mut lstm = LstmBlock::new(
        &w,
        &r,
        &[x.clone()],
        SeqLen::new(1),
        Some(&mask),
        false,
        &device(),
    )
    .unwrap();

    x.fprop().unwrap();
    mask.fprop().unwrap();
    lstm.fprop().unwrap();

    let out = &lstm.outputs()[0];
    let host = read(out.value(), out.producer());
    assert!(host[0].abs() > 1e-3, "live row should carry state");
    assert_eq!(host[1], 0.0, "masked row must stay zero");
}
