use okapi_core::{
    bail, Backend, Block, Connector, Consumer, Context, DType, Error, Matrix, Result,
};

struct StackInput<B: Backend> {
    consumer: Consumer<B>,
    bprop: bool,
}

/// Concatenates its inputs horizontally into one output matrix.
///
/// Backward splits the output's accumulated gradient back into the
/// gradient-requiring inputs only; column ranges are recomputed from the
/// inputs' current widths on every pass.
pub struct HStackBlock<B: Backend> {
    ctx: Context<B>,
    inputs: Vec<StackInput<B>>,
    out_value: Matrix<B>,
    output: Connector<B>,
}

impl<B: Backend> HStackBlock<B> {
    pub fn new(inputs: &[&Connector<B>], device: &B::Device) -> Result<Self> {
        if inputs.is_empty() {
            bail!("hstack block needs at least one input");
        }
        let nrows = inputs[0].value().nrows();
        let mut ncols = 0;
        for conn in inputs {
            let v = conn.value();
            if v.dtype() != DType::F32 {
                return Err(Error::DTypeMismatch {
                    expected: DType::F32,
                    got: v.dtype(),
                });
            }
            if v.nrows() != nrows {
                return Err(Error::ShapeMismatch {
                    expected_rows: nrows,
                    expected_cols: v.ncols(),
                    got_rows: v.nrows(),
                    got_cols: v.ncols(),
                });
            }
            ncols += v.ncols();
        }
        let ctx = Context::new(device)?;
        let inputs = inputs
            .iter()
            .map(|conn| {
                let bprop = conn.bpropagable();
                Ok(StackInput {
                    consumer: conn.register(&ctx, bprop)?,
                    bprop,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let out_value = Matrix::empty(nrows, ncols, DType::F32, device)?;
        let output = Connector::new(out_value.clone(), ctx.clone());
        Ok(HStackBlock {
            ctx,
            inputs,
            out_value,
            output,
        })
    }

    pub fn output(&self) -> &Connector<B> {
        &self.output
    }
}

impl<B: Backend> Block<B> for HStackBlock<B> {
    fn fprop(&mut self) -> Result<()> {
        let values = self
            .inputs
            .iter()
            .map(|i| i.consumer.value())
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&Matrix<B>> = values.iter().collect();
        self.out_value.assign_hstack(&self.ctx, &refs)?;
        self.output.fprop()
    }

    fn bprop(&mut self) -> Result<()> {
        if !self.inputs.iter().any(|i| i.bprop) {
            return Ok(());
        }
        let grad = self.output.backward_matrix()?;
        let mut col = 0;
        for input in &self.inputs {
            let width = input.consumer.value()?.ncols();
            if input.bprop {
                let slice = grad.columns(col..col + width)?;
                let g = input.consumer.grad()?;
                g.add(&self.ctx, &slice)?;
                input.consumer.grad_commit()?;
            }
            col += width;
        }
        Ok(())
    }

    fn params(&self) -> Vec<Matrix<B>> {
        Vec::new()
    }

    fn grads(&self) -> Vec<(Context<B>, Matrix<B>)> {
        Vec::new()
    }
}
