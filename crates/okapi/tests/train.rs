// End-to-end tests: a declaratively defined model trained by the SGD driver
// on a linearly separable toy problem, plus the parameter container round
// trip.

use okapi::prelude::*;
use okapi::{load_params, restore_params, save_params, Saver};
use okapi_cpu::{CpuBackend, CpuDevice};
use okapi_nn::TrackedMetric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};

/// Random 2-d points; label 1 when the first coordinate beats the second.
struct ToySource {
    ctx: Context<CpuBackend>,
    x_value: Matrix<CpuBackend>,
    x: Connector<CpuBackend>,
    y_value: Matrix<CpuBackend>,
    y: Connector<CpuBackend>,
    batch: usize,
    batches_per_epoch: usize,
    produced: usize,
    rng: StdRng,
}

impl ToySource {
    fn new(device: &CpuDevice, batch: usize, batches_per_epoch: usize, seed: u64) -> Result<Self> {
        let ctx = Context::new(device)?;
        let x_value = Matrix::empty(batch, 2, DType::F32, device)?;
        let x = Connector::forward_only(x_value.clone(), ctx.clone());
        let y_value = Matrix::empty(batch, 1, DType::F32, device)?;
        let y = Connector::forward_only(y_value.clone(), ctx.clone());
        Ok(ToySource {
            ctx,
            x_value,
            x,
            y_value,
            y,
            batch,
            batches_per_epoch,
            produced: 0,
            rng: StdRng::seed_from_u64(seed),
        })
    }
}

impl DataSource<CpuBackend> for ToySource {
    fn fprop(&mut self) -> Result<()> {
        if self.produced == self.batches_per_epoch {
            return Err(Error::EndOfEpoch);
        }
        let n = self.batch;
        let mut cols = vec![0.0f32; 2 * n];
        let mut labels = vec![0.0f32; n];
        for i in 0..n {
            let a: f32 = self.rng.gen();
            let b: f32 = self.rng.gen();
            // Column-major: first column then second.
            cols[i] = a;
            cols[n + i] = b;
            labels[i] = if a > b { 1.0 } else { 0.0 };
        }
        self.x_value
            .to_device_async(&self.ctx, &HostMatrix::from_f32(n, 2, cols)?)?;
        self.x.fprop()?;
        self.y_value
            .to_device_async(&self.ctx, &HostMatrix::from_f32(n, 1, labels)?)?;
        self.y.fprop()?;
        self.produced += 1;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.produced = 0;
        Ok(())
    }

    fn context(&self) -> &Context<CpuBackend> {
        &self.ctx
    }

    fn connector(&self, name: &str) -> Option<&Connector<CpuBackend>> {
        match name {
            "x" => Some(&self.x),
            "y" => Some(&self.y),
            _ => None,
        }
    }
}

/// Random scalar sequences with one forward-only connector per step and a
/// shared length handle, for recurrent definitions.
struct SeqSource {
    ctx: Context<CpuBackend>,
    steps: Vec<(Matrix<CpuBackend>, Connector<CpuBackend>)>,
    y_value: Matrix<CpuBackend>,
    y: Connector<CpuBackend>,
    len: SeqLen,
    batch: usize,
    batches_per_epoch: usize,
    produced: usize,
    rng: StdRng,
}

impl SeqSource {
    fn new(
        device: &CpuDevice,
        batch: usize,
        max_len: usize,
        batches_per_epoch: usize,
        seed: u64,
    ) -> Result<Self> {
        let ctx = Context::new(device)?;
        let mut steps = Vec::with_capacity(max_len);
        for _ in 0..max_len {
            let value = Matrix::empty(batch, 1, DType::F32, device)?;
            let conn = Connector::forward_only(value.clone(), ctx.clone());
            steps.push((value, conn));
        }
        let y_value = Matrix::empty(batch, 1, DType::F32, device)?;
        let y = Connector::forward_only(y_value.clone(), ctx.clone());
        Ok(SeqSource {
            ctx,
            steps,
            y_value,
            y,
            len: SeqLen::new(max_len),
            batch,
            batches_per_epoch,
            produced: 0,
            rng: StdRng::seed_from_u64(seed),
        })
    }
}

impl DataSource<CpuBackend> for SeqSource {
    fn fprop(&mut self) -> Result<()> {
        if self.produced == self.batches_per_epoch {
            return Err(Error::EndOfEpoch);
        }
        let n = self.batch;
        let mut sums = vec![0.0f32; n];
        let rng = &mut self.rng;
        for (value, conn) in &self.steps {
            let vals: Vec<f32> = (0..n).map(|_| rng.gen::<f32>()).collect();
            for (s, v) in sums.iter_mut().zip(&vals) {
                *s += v;
            }
            value.to_device_async(&self.ctx, &HostMatrix::from_f32(n, 1, vals)?)?;
            conn.fprop()?;
        }
        let half = self.steps.len() as f32 / 2.0;
        let labels: Vec<f32> = sums
            .iter()
            .map(|&s| if s > half { 1.0 } else { 0.0 })
            .collect();
        self.y_value
            .to_device_async(&self.ctx, &HostMatrix::from_f32(n, 1, labels)?)?;
        self.y.fprop()?;
        self.len.set(self.steps.len());
        self.produced += 1;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.produced = 0;
        Ok(())
    }

    fn context(&self) -> &Context<CpuBackend> {
        &self.ctx
    }

    fn connector(&self, name: &str) -> Option<&Connector<CpuBackend>> {
        if name == "y" {
            return Some(&self.y);
        }
        let idx: usize = name.strip_prefix('x')?.parse().ok()?;
        self.steps.get(idx).map(|(_, c)| c)
    }

    fn seq_len(&self, name: &str) -> Option<SeqLen> {
        (name == "len").then(|| self.len.clone())
    }
}

fn toy_definition() -> ModelDefinition {
    ModelDefinition::from_json(
        r#"{"blocks": [
            {"type": "dense", "name": "fc", "input": "x", "output_dim": 1},
            {"type": "sigmoid_ce", "name": "loss", "pre": "fc", "labels": "y"}
        ]}"#,
    )
    .unwrap()
}

#[test]
fn definition_with_unknown_connector_fails_to_build() {
    let device = CpuDevice::new();
    let data = ToySource::new(&device, 4, 10, 0).unwrap();
    let def = ModelDefinition::from_json(
        r#"{"blocks": [
            {"type": "dense", "name": "fc", "input": "nope", "output_dim": 1}
        ]}"#,
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    assert!(Model::<CpuBackend>::from_definition(&def, &data, &device, &mut rng).is_err());
}

#[test]
fn lstm_definition_builds_and_trains() {
    let device = CpuDevice::new();
    let mut data = SeqSource::new(&device, 8, 3, 50, 21).unwrap();
    let def = ModelDefinition::from_json(
        r#"{"blocks": [
            {"type": "lstm", "name": "enc", "inputs": ["x0", "x1", "x2"],
             "hidden": 4, "seq_len": "len"},
            {"type": "dense", "name": "head", "input": "enc", "output_dim": 1},
            {"type": "sigmoid_ce", "name": "loss", "pre": "head", "labels": "y"}
        ]}"#,
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(9);
    let mut model = Model::from_definition(&def, &data, &device, &mut rng).unwrap();

    // Per-step hidden states are exposed, plus the last one under the
    // block's own name.
    assert!(model.connector("enc.0").is_some());
    assert!(model.connector("enc.2").is_some());
    assert!(model.connector("enc").is_some());
    // W, R, and the head weight.
    assert_eq!(model.params().len(), 3);

    let mut optimizer = SgdOptimizer::new(
        MaxIterCriterion::new(30),
        FixedLearningRatePolicy::new(0.1),
        &device,
    )
    .unwrap();
    optimizer.optimize(&mut model, &mut data).unwrap();
}

#[test]
fn lstm_definition_requires_a_length_handle() {
    let device = CpuDevice::new();
    let data = ToySource::new(&device, 4, 10, 0).unwrap();
    let def = ModelDefinition::from_json(
        r#"{"blocks": [
            {"type": "lstm", "name": "enc", "inputs": ["x"],
             "hidden": 2, "seq_len": "len"}
        ]}"#,
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    assert!(Model::<CpuBackend>::from_definition(&def, &data, &device, &mut rng).is_err());
}

#[test]
fn sgd_reduces_cross_entropy_on_separable_data() {
    let device = CpuDevice::new();
    // 97 batches per epoch forces the end-of-epoch reset path mid-run.
    let mut data = ToySource::new(&device, 16, 97, 11).unwrap();
    let mut rng = StdRng::seed_from_u64(5);
    let mut model = Model::from_definition(&toy_definition(), &data, &device, &mut rng).unwrap();

    let probe = model.loss_probe("loss").unwrap().clone();
    let mut tracker = MetricTracker::from_parts(
        probe.ctx.clone(),
        probe.probs.alias(),
        probe.labels.alias(),
        TrackedMetric::CrossEntropy,
        50,
    )
    .unwrap();
    let history: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = history.clone();
    tracker.add_downstream(move |v| sink.lock().unwrap().push(v));

    let dir = tempfile::tempdir().unwrap();
    let ckpt = dir.path().join("ckpt.params");

    let mut optimizer = SgdOptimizer::new(
        MaxIterCriterion::new(400),
        FixedLearningRatePolicy::new(0.5),
        &device,
    )
    .unwrap();
    let saver = Saver::new(&model, optimizer.context().clone(), 200, &ckpt).unwrap();
    optimizer.add_observer(Box::new(tracker));
    optimizer.add_observer(Box::new(saver));

    optimizer.optimize(&mut model, &mut data).unwrap();

    let history = history.lock().unwrap();
    assert!(history.len() >= 2, "tracker reported {} windows", history.len());
    let first = history[0];
    let last = *history.last().unwrap();
    assert!(
        last < first,
        "cross-entropy did not fall: first {first}, last {last}"
    );
    assert!(ckpt.exists(), "checkpoint observer never wrote the file");
}

#[test]
fn parameters_round_trip_through_the_container() {
    let device = CpuDevice::new();
    let def = toy_definition();
    let ctx: Context<CpuBackend> = Context::new(&device).unwrap();

    let data = ToySource::new(&device, 8, 10, 1).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let model = Model::from_definition(&def, &data, &device, &mut rng).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.params");
    save_params(&path, &model.named_params(), &ctx).unwrap();

    let loaded = load_params(&path).unwrap();
    assert_eq!(loaded.len(), 1);
    let fc = &loaded["fc.0"];
    assert_eq!((fc.nrows(), fc.ncols()), (2, 1));

    // A second model, differently initialized, converges to the saved
    // weights bit for bit after restore.
    let data2 = ToySource::new(&device, 8, 10, 2).unwrap();
    let mut rng2 = StdRng::seed_from_u64(99);
    let model2 = Model::from_definition(&def, &data2, &device, &mut rng2).unwrap();
    restore_params(&model2, &path, &ctx).unwrap();

    for ((n1, p1), (n2, p2)) in model.named_params().iter().zip(model2.named_params().iter()) {
        assert_eq!(n1, n2);
        let h1 = p1.to_host(&ctx).unwrap();
        let h2 = p2.to_host(&ctx).unwrap();
        assert_eq!(h1.data().as_f32().unwrap(), h2.data().as_f32().unwrap());
    }
}

#[test]
fn restore_fails_on_missing_parameter() {
    let device = CpuDevice::new();
    let ctx: Context<CpuBackend> = Context::new(&device).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.params");
    save_params::<CpuBackend>(&path, &[], &ctx).unwrap();

    let data = ToySource::new(&device, 8, 10, 1).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let model = Model::from_definition(&toy_definition(), &data, &device, &mut rng).unwrap();
    assert!(restore_params(&model, &path, &ctx).is_err());
}
