//! Trains a small LSTM to decide whether the mean of a random sequence
//! exceeds 0.5, end to end on the CPU backend: synthetic data source, a
//! declaratively defined graph (recurrent encoder, linear head, sigmoid
//! cross-entropy loss), SGD with metric trackers, and a final parameter
//! checkpoint.

use okapi::prelude::*;
use okapi::{save_params, ActivationDef, BlockDef, InitDef};
use okapi_cpu::{CpuBackend, CpuDevice};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

/// Generates batches of uniform [0, 1) scalar sequences; the label is 1 when
/// the sequence mean is above 0.5. One forward-only connector per time step
/// plus one for the labels, all produced on the source's own context.
struct MeanSource {
    ctx: Context<CpuBackend>,
    steps: Vec<(Matrix<CpuBackend>, Connector<CpuBackend>)>,
    labels_value: Matrix<CpuBackend>,
    labels: Connector<CpuBackend>,
    seq_len: SeqLen,
    batch: usize,
    batches_per_epoch: usize,
    produced: usize,
    rng: StdRng,
}

impl MeanSource {
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
        let labels_value = Matrix::empty(batch, 1, DType::F32, device)?;
        let labels = Connector::forward_only(labels_value.clone(), ctx.clone());
        Ok(MeanSource {
            ctx,
            steps,
            labels_value,
            labels,
            seq_len: SeqLen::new(max_len),
            batch,
            batches_per_epoch,
            produced: 0,
            rng: StdRng::seed_from_u64(seed),
        })
    }

}

impl DataSource<CpuBackend> for MeanSource {
    fn fprop(&mut self) -> Result<()> {
        if self.produced == self.batches_per_epoch {
            return Err(Error::EndOfEpoch);
        }
        let mut sums = vec![0.0f32; self.batch];
        let rng = &mut self.rng;
        for (value, conn) in &self.steps {
            let vals: Vec<f32> = (0..self.batch).map(|_| rng.gen::<f32>()).collect();
            for (s, v) in sums.iter_mut().zip(&vals) {
                *s += v;
            }
            value.to_device_async(&self.ctx, &HostMatrix::from_f32(self.batch, 1, vals)?)?;
            conn.fprop()?;
        }
        let n = self.steps.len() as f32;
        let labels: Vec<f32> = sums
            .iter()
            .map(|&s| if s / n > 0.5 { 1.0 } else { 0.0 })
            .collect();
        self.labels_value
            .to_device_async(&self.ctx, &HostMatrix::from_f32(self.batch, 1, labels)?)?;
        self.labels.fprop()?;
        self.seq_len.set(self.steps.len());
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
        if name == "labels" {
            return Some(&self.labels);
        }
        let idx: usize = name.strip_prefix('x')?.parse().ok()?;
        self.steps.get(idx).map(|(_, c)| c)
    }

    fn seq_len(&self, name: &str) -> Option<SeqLen> {
        (name == "len").then(|| self.seq_len.clone())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let device = CpuDevice::new();
    let batch = 32;
    let hidden = 16;
    let max_len = 8;
    let mut rng = StdRng::seed_from_u64(1);

    let mut data = MeanSource::new(&device, batch, max_len, 200, 7)?;

    // The whole graph is declared: an LSTM encoder over the per-step inputs,
    // its last hidden state through a linear head into sigmoid-CE.
    let def = ModelDefinition {
        blocks: vec![
            BlockDef::Lstm {
                name: "encoder".into(),
                inputs: (0..max_len).map(|i| format!("x{i}")).collect(),
                hidden,
                seq_len: "len".into(),
                mask: None,
                reverse: false,
                init: InitDef::ScaledUniform,
            },
            BlockDef::Dense {
                name: "head".into(),
                input: "encoder".into(),
                output_dim: 1,
                activation: ActivationDef::Identity,
                init: InitDef::ScaledUniform,
            },
            BlockDef::SigmoidCe {
                name: "loss".into(),
                pre: "head".into(),
                labels: "labels".into(),
            },
        ],
    };
    let mut model = Model::from_definition(&def, &data, &device, &mut rng)?;

    let probe = model
        .loss_probe("loss")
        .ok_or_else(|| Error::msg("definition produced no loss"))?
        .clone();
    let ce = MetricTracker::from_parts(
        probe.ctx.clone(),
        probe.probs.alias(),
        probe.labels.alias(),
        TrackedMetric::CrossEntropy,
        100,
    )?;
    let acc = MetricTracker::from_parts(
        probe.ctx,
        probe.probs,
        probe.labels,
        TrackedMetric::Accuracy,
        100,
    )?;

    let mut optimizer = SgdOptimizer::new(
        MaxIterCriterion::new(2000),
        FixedLearningRatePolicy::new(0.3),
        &device,
    )?;
    optimizer.add_observer(Box::new(ce));
    optimizer.add_observer(Box::new(acc));

    optimizer.optimize(&mut model, &mut data)?;

    let path = Path::new("seq_mean.params");
    save_params(path, &model.named_params(), optimizer.context())?;
    tracing::info!(path = %path.display(), "saved trained parameters");
    Ok(())
}
