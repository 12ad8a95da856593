use okapi_core::{Backend, Block, Connector, Consumer, Context, Error, Matrix, Result};

/// Sigmoid cross-entropy loss block.
///
/// Reads the pre-activation predictions and the labels (forward-only),
/// keeps `probs = sigmoid(pre)` on the device, and contributes
/// `dL/dpre = probs - labels` on backward. The scalar loss itself is a
/// host-side concern, computed by observers from the `probs`/`labels`
/// matrices this block exposes.
pub struct SigmoidCeBlock<B: Backend> {
    ctx: Context<B>,
    pre: Consumer<B>,
    pre_bprop: bool,
    labels: Consumer<B>,
    labels_value: Matrix<B>,
    probs: Matrix<B>,
}

impl<B: Backend> SigmoidCeBlock<B> {
    pub fn new(pre: &Connector<B>, labels: &Connector<B>, device: &B::Device) -> Result<Self> {
        if !pre.value().same_shape(labels.value()) {
            return Err(Error::ShapeMismatch {
                expected_rows: pre.value().nrows(),
                expected_cols: pre.value().ncols(),
                got_rows: labels.value().nrows(),
                got_cols: labels.value().ncols(),
            });
        }
        let ctx = Context::new(device)?;
        let pre_bprop = pre.bpropagable();
        let probs = Matrix::empty_like(pre.value())?;
        let labels_value = labels.value().alias();
        Ok(SigmoidCeBlock {
            pre: pre.register(&ctx, pre_bprop)?,
            labels: labels.register(&ctx, false)?,
            labels_value,
            pre_bprop,
            probs,
            ctx,
        })
    }

    /// The predicted probabilities, valid on this block's context after
    /// `fprop`.
    pub fn probs(&self) -> Matrix<B> {
        self.probs.alias()
    }

    /// The labels matrix, synchronized to this block's context by `fprop`.
    pub fn labels(&self) -> Matrix<B> {
        self.labels_value.alias()
    }

    pub fn context(&self) -> &Context<B> {
        &self.ctx
    }
}

impl<B: Backend> Block<B> for SigmoidCeBlock<B> {
    fn fprop(&mut self) -> Result<()> {
        let pre = self.pre.value()?;
        // Pull the labels onto this context too, for backward and for
        // observers reading them here.
        self.labels.value()?;
        pre.sigmoid(&self.ctx, &self.probs, None)
    }

    fn bprop(&mut self) -> Result<()> {
        if !self.pre_bprop {
            return Ok(());
        }
        let labels = self.labels.value()?;
        let g = self.pre.grad()?;
        g.add(&self.ctx, &self.probs)?;
        g.add_scaled(&self.ctx, -1.0, &labels)?;
        self.pre.grad_commit()
    }

    fn params(&self) -> Vec<Matrix<B>> {
        Vec::new()
    }

    fn grads(&self) -> Vec<(Context<B>, Matrix<B>)> {
        Vec::new()
    }
}
