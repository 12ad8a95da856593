use crate::model::{DataSource, Model};
use okapi_core::{bail, Backend, Context, Error, Result};
use okapi_nn::Observer;

// SGD driver over the block graph.
//
// One iteration: data fprop → model fprop → observer notifications →
// model bprop → parameter updates. All updates are queued on the
// optimizer's own context after waiting on each gradient's final
// accumulation stream; the data source's next batch then waits on the
// optimizer context, so consecutive iterations are serialized through the
// dataflow chain without any host-side blocking.

/// Supplies the step size per iteration.
pub trait LearningRatePolicy: Send {
    fn learning_rate(&mut self, iteration: u64) -> f32;
}

pub struct FixedLearningRatePolicy {
    lr: f32,
}

impl FixedLearningRatePolicy {
    pub fn new(lr: f32) -> Self {
        FixedLearningRatePolicy { lr }
    }
}

impl LearningRatePolicy for FixedLearningRatePolicy {
    fn learning_rate(&mut self, _iteration: u64) -> f32 {
        self.lr
    }
}

/// Decides when training stops.
pub trait StoppingCriterion: Send {
    fn is_reached(&mut self, iteration: u64) -> bool;
}

pub struct MaxIterCriterion {
    max_iter: u64,
}

impl MaxIterCriterion {
    pub fn new(max_iter: u64) -> Self {
        MaxIterCriterion { max_iter }
    }
}

impl StoppingCriterion for MaxIterCriterion {
    fn is_reached(&mut self, iteration: u64) -> bool {
        iteration >= self.max_iter
    }
}

pub struct SgdOptimizer<B: Backend> {
    ctx: Context<B>,
    criterion: Box<dyn StoppingCriterion>,
    policy: Box<dyn LearningRatePolicy>,
    observers: Vec<Box<dyn Observer>>,
}

impl<B: Backend> SgdOptimizer<B> {
    pub fn new(
        criterion: impl StoppingCriterion + 'static,
        policy: impl LearningRatePolicy + 'static,
        device: &B::Device,
    ) -> Result<Self> {
        Ok(SgdOptimizer {
            ctx: Context::new(device)?,
            criterion: Box::new(criterion),
            policy: Box::new(policy),
            observers: Vec::new(),
        })
    }

    /// The stream parameter updates are queued on. A host read of the
    /// parameters is valid after synchronizing it.
    pub fn context(&self) -> &Context<B> {
        &self.ctx
    }

    pub fn add_observer(&mut self, observer: Box<dyn Observer>) {
        self.observers.push(observer);
    }

    /// Run the training loop until the stopping criterion is reached.
    pub fn optimize(
        &mut self,
        model: &mut Model<B>,
        data: &mut impl DataSource<B>,
    ) -> Result<()> {
        let mut iteration = 0u64;
        while !self.criterion.is_reached(iteration) {
            // The next batch must not overwrite inputs while the previous
            // update still reads from the chain hanging off them.
            data.context().wait(&self.ctx)?;
            match data.fprop() {
                Ok(()) => {}
                Err(Error::EndOfEpoch) => {
                    tracing::info!(iteration, "epoch finished, resetting data source");
                    data.reset()?;
                    continue;
                }
                Err(e) => return Err(e),
            }

            match model.fprop() {
                Ok(()) => {}
                Err(e @ Error::SequenceTooLong { .. }) => {
                    // Recoverable usage error: skip the batch.
                    tracing::warn!(error = %e, iteration, "skipping batch");
                    continue;
                }
                Err(e) => return Err(e),
            }

            for observer in self.observers.iter_mut() {
                if let Err(e) = observer.notify_about_fprop() {
                    tracing::warn!(error = %e, "observer failed after forward pass");
                }
            }

            model.bprop()?;
            self.apply_updates(model, iteration)?;

            iteration += 1;
            for observer in self.observers.iter_mut() {
                if let Err(e) = observer.notify(iteration) {
                    tracing::warn!(error = %e, iteration, "observer failed");
                }
            }
        }
        // Drain pending updates so callers can read parameters.
        self.ctx.synchronize()
    }

    fn apply_updates(&mut self, model: &Model<B>, iteration: u64) -> Result<()> {
        let lr = self.policy.learning_rate(iteration);
        let params = model.params();
        let grads = model.grads();
        if params.len() != grads.len() {
            bail!(
                "model exposes {} parameters but {} gradients",
                params.len(),
                grads.len()
            );
        }
        for (param, (grad_ctx, grad)) in params.iter().zip(grads.iter()) {
            self.ctx.wait(grad_ctx)?;
            param.add_scaled(&self.ctx, -lr, grad)?;
        }
        Ok(())
    }
}
