use crate::loss::SigmoidCeBlock;
use okapi_core::{bail, Backend, Context, HostMatrix, Matrix, Result};
use std::sync::{Arc, Mutex};

// Observers watch a loss block from the host side without ever blocking
// device work: after each forward pass they queue asynchronous transfers of
// the probabilities and labels plus a host callback that computes the metric
// once the loss block's stream reaches that point. At a fixed iteration
// cadence the aggregated window is reported and fanned out downstream.
//
// A failing metric callback is contained by the backend's callback isolation
// and at worst drops one sample; it can never corrupt Connector bookkeeping.

/// Host-side training observer.
pub trait Observer: Send {
    /// Invoked after every forward pass, while device work may still be in
    /// flight.
    fn notify_about_fprop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Invoked once per iteration with the iteration number.
    fn notify(&mut self, _iteration: u64) -> Result<()> {
        Ok(())
    }
}

/// Which scalar a [`MetricTracker`] computes from (probs, labels).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedMetric {
    CrossEntropy,
    Accuracy,
}

impl TrackedMetric {
    fn name(&self) -> &'static str {
        match self {
            TrackedMetric::CrossEntropy => "loss",
            TrackedMetric::Accuracy => "accuracy",
        }
    }

    fn compute(&self, probs: &HostMatrix, labels: &HostMatrix) -> Option<f64> {
        match self {
            TrackedMetric::CrossEntropy => cross_entropy(probs, labels),
            TrackedMetric::Accuracy => accuracy(probs, labels),
        }
    }
}

struct Window {
    probs: Option<HostMatrix>,
    labels: Option<HostMatrix>,
    values: Vec<f64>,
}

/// Tracks one scalar metric of a loss block at a fixed iteration cadence.
pub struct MetricTracker<B: Backend> {
    ctx: Context<B>,
    probs: Matrix<B>,
    labels: Matrix<B>,
    metric: TrackedMetric,
    period: u64,
    window: Arc<Mutex<Window>>,
    downstream: Vec<Box<dyn FnMut(f64) + Send>>,
}

impl<B: Backend> MetricTracker<B> {
    /// Mean sigmoid cross-entropy, reported every `period` iterations.
    pub fn cross_entropy(loss: &SigmoidCeBlock<B>, period: u64) -> Result<Self> {
        Self::new(loss, TrackedMetric::CrossEntropy, period)
    }

    /// Classification accuracy, reported every `period` iterations.
    pub fn accuracy(loss: &SigmoidCeBlock<B>, period: u64) -> Result<Self> {
        Self::new(loss, TrackedMetric::Accuracy, period)
    }

    pub fn new(loss: &SigmoidCeBlock<B>, metric: TrackedMetric, period: u64) -> Result<Self> {
        // The loss block's own context is the only stream where both probs
        // and labels are known to be current.
        Self::from_parts(
            loss.context().clone(),
            loss.probs(),
            loss.labels(),
            metric,
            period,
        )
    }

    /// Build from the raw pieces of a loss block (its context and the probs
    /// and labels matrices valid on it).
    pub fn from_parts(
        ctx: Context<B>,
        probs: Matrix<B>,
        labels: Matrix<B>,
        metric: TrackedMetric,
        period: u64,
    ) -> Result<Self> {
        if period == 0 {
            bail!("tracker period must be at least 1");
        }
        Ok(MetricTracker {
            ctx,
            probs,
            labels,
            metric,
            period,
            window: Arc::new(Mutex::new(Window {
                probs: None,
                labels: None,
                values: Vec::new(),
            })),
            downstream: Vec::new(),
        })
    }

    /// Fan the aggregated value out to another host-side consumer (a
    /// stopping-criterion feed, a best-checkpoint hook, ...).
    pub fn add_downstream(&mut self, f: impl FnMut(f64) + Send + 'static) {
        self.downstream.push(Box::new(f));
    }
}

impl<B: Backend> Observer for MetricTracker<B> {
    fn notify_about_fprop(&mut self) -> Result<()> {
        let w = self.window.clone();
        self.probs.to_host_async(&self.ctx, move |h| {
            w.lock().unwrap_or_else(|e| e.into_inner()).probs = Some(h);
        })?;
        let w = self.window.clone();
        self.labels.to_host_async(&self.ctx, move |h| {
            w.lock().unwrap_or_else(|e| e.into_inner()).labels = Some(h);
        })?;
        let w = self.window.clone();
        let metric = self.metric;
        self.ctx.add_callback(Box::new(move || {
            let mut win = w.lock().unwrap_or_else(|e| e.into_inner());
            if let (Some(p), Some(l)) = (win.probs.take(), win.labels.take()) {
                if let Some(v) = metric.compute(&p, &l) {
                    win.values.push(v);
                }
            }
        }))
    }

    fn notify(&mut self, iteration: u64) -> Result<()> {
        if iteration == 0 || iteration % self.period != 0 {
            return Ok(());
        }
        // Metric callbacks for this window may still sit behind device work
        // on the loss stream; drain it so the report covers every sample
        // queued up to the cadence point. Observers run host-side and may
        // block; other streams keep going.
        self.ctx.synchronize()?;
        let values = {
            let mut win = self.window.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut win.values)
        };
        if values.is_empty() {
            return Ok(());
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        tracing::info!(iteration, metric = self.metric.name(), value = mean);
        for f in &mut self.downstream {
            f(mean);
        }
        Ok(())
    }
}

fn cross_entropy(probs: &HostMatrix, labels: &HostMatrix) -> Option<f64> {
    let p = probs.data().as_f32().ok()?;
    let y = labels.data().as_f32().ok()?;
    if p.len() != y.len() || p.is_empty() {
        return None;
    }
    let mut total = 0.0f64;
    for (&p, &y) in p.iter().zip(y.iter()) {
        let p = p.clamp(1e-7, 1.0 - 1e-7) as f64;
        let y = y as f64;
        total -= y * p.ln() + (1.0 - y) * (1.0 - p).ln();
    }
    Some(total / p.len() as f64)
}

fn accuracy(probs: &HostMatrix, labels: &HostMatrix) -> Option<f64> {
    let p = probs.data().as_f32().ok()?;
    let y = labels.data().as_f32().ok()?;
    let (nrows, ncols) = (probs.nrows(), probs.ncols());
    if nrows == 0 || p.len() != y.len() {
        return None;
    }
    let mut correct = 0usize;
    if ncols == 1 {
        for (&p, &y) in p.iter().zip(y.iter()) {
            if (p > 0.5) == (y > 0.5) {
                correct += 1;
            }
        }
    } else {
        // One-hot labels: compare per-row argmax. Column-major, so a row is
        // strided.
        for row in 0..nrows {
            let argmax = |m: &[f32]| {
                (0..ncols)
                    .map(|col| (col, m[col * nrows + row]))
                    .fold((0, f32::MIN), |best, cur| {
                        if cur.1 > best.1 {
                            cur
                        } else {
                            best
                        }
                    })
                    .0
            };
            if argmax(p) == argmax(y) {
                correct += 1;
            }
        }
    }
    Some(correct as f64 / nrows as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_entropy_of_perfect_prediction_is_near_zero() {
        let p = HostMatrix::from_f32(2, 1, vec![1.0, 0.0]).unwrap();
        let y = HostMatrix::from_f32(2, 1, vec![1.0, 0.0]).unwrap();
        let v = cross_entropy(&p, &y).unwrap();
        assert!(v < 1e-5);
    }

    #[test]
    fn accuracy_thresholds_single_column() {
        let p = HostMatrix::from_f32(4, 1, vec![0.9, 0.2, 0.6, 0.4]).unwrap();
        let y = HostMatrix::from_f32(4, 1, vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        assert_eq!(accuracy(&p, &y).unwrap(), 0.75);
    }

    #[test]
    fn accuracy_argmax_multi_column() {
        // 2 rows, 2 cols col-major: row 0 = [0.1, 0.9] -> argmax 1,
        // row 1 = [0.8, 0.2] -> argmax 0
        let p = HostMatrix::from_f32(2, 2, vec![0.1, 0.8, 0.9, 0.2]).unwrap();
        let y = HostMatrix::from_f32(2, 2, vec![0.0, 1.0, 1.0, 0.0]).unwrap();
        assert_eq!(accuracy(&p, &y).unwrap(), 1.0);
    }
}
