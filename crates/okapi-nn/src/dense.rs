use okapi_core::{
    Backend, Block, Connector, Consumer, Context, DType, Error, HostMatrix, Matrix, Result, Trans,
};

/// Elementwise output nonlinearity of a [`DenseBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Sigmoid,
    Tanh,
}

/// Fully connected layer: `y = act(x · W)`.
///
/// Owns its weight and weight-gradient buffers and a single context. The
/// derivative of the nonlinearity is captured during forward so backward
/// needs no recomputation.
pub struct DenseBlock<B: Backend> {
    ctx: Context<B>,
    w: Matrix<B>,
    dw: Matrix<B>,
    x: Consumer<B>,
    x_bprop: bool,
    activation: Activation,
    /// Pre-activation and captured derivative; absent for identity, where
    /// the gemm writes the output directly.
    pre: Option<Matrix<B>>,
    der: Option<Matrix<B>>,
    dpre: Option<Matrix<B>>,
    out_value: Matrix<B>,
    output: Connector<B>,
}

impl<B: Backend> DenseBlock<B> {
    pub fn new(
        w_init: &HostMatrix,
        x: &Connector<B>,
        activation: Activation,
        device: &B::Device,
    ) -> Result<Self> {
        let batch = x.value().nrows();
        let in_dim = x.value().ncols();
        if w_init.nrows() != in_dim {
            return Err(Error::GemmShapeMismatch {
                m: batch,
                k1: in_dim,
                k2: w_init.nrows(),
                n: w_init.ncols(),
            });
        }
        let ctx = Context::new(device)?;
        let w = Matrix::from_host(w_init, device)?;
        let dw = Matrix::empty_like(&w)?;
        let x_bprop = x.bpropagable();
        let x = x.register(&ctx, x_bprop)?;
        let out_dim = w.ncols();
        let out_value = Matrix::empty(batch, out_dim, DType::F32, device)?;
        let output = Connector::new(out_value.clone(), ctx.clone());

        let (pre, der, dpre) = if activation == Activation::Identity {
            (None, None, None)
        } else {
            (
                Some(Matrix::empty(batch, out_dim, DType::F32, device)?),
                Some(Matrix::empty(batch, out_dim, DType::F32, device)?),
                Some(Matrix::empty(batch, out_dim, DType::F32, device)?),
            )
        };

        Ok(DenseBlock {
            ctx,
            w,
            dw,
            x,
            x_bprop,
            activation,
            pre,
            der,
            dpre,
            out_value,
            output,
        })
    }

    pub fn output(&self) -> &Connector<B> {
        &self.output
    }

    pub fn context(&self) -> &Context<B> {
        &self.ctx
    }
}

impl<B: Backend> Block<B> for DenseBlock<B> {
    fn fprop(&mut self) -> Result<()> {
        let x = self.x.value()?;
        match self.activation {
            Activation::Identity => {
                self.out_value
                    .assign_dot(&self.ctx, &x, &self.w, Trans::N, Trans::N)?;
            }
            Activation::Sigmoid | Activation::Tanh => {
                let pre = self.pre.as_ref().ok_or_else(missing_scratch)?;
                pre.assign_dot(&self.ctx, &x, &self.w, Trans::N, Trans::N)?;
                if self.activation == Activation::Sigmoid {
                    pre.sigmoid(&self.ctx, &self.out_value, self.der.as_ref())?;
                } else {
                    pre.tanh(&self.ctx, &self.out_value, self.der.as_ref())?;
                }
            }
        }
        self.output.fprop()
    }

    fn bprop(&mut self) -> Result<()> {
        let dy = self.output.backward_matrix()?;
        let dpre = match self.activation {
            Activation::Identity => dy,
            _ => {
                let der = self.der.as_ref().ok_or_else(missing_scratch)?;
                let dpre = self.dpre.as_ref().ok_or_else(missing_scratch)?;
                dpre.assign_hprod(&self.ctx, &dy, der)?;
                dpre.alias()
            }
        };
        let x = self.x.value()?;
        // Single contributor, so the weight gradient is an assignment rather
        // than a zero-then-add.
        self.dw
            .assign_dot(&self.ctx, &x, &dpre, Trans::T, Trans::N)?;
        if self.x_bprop {
            let g = self.x.grad()?;
            g.add_dot(&self.ctx, &dpre, &self.w, Trans::N, Trans::T)?;
            self.x.grad_commit()?;
        }
        Ok(())
    }

    fn params(&self) -> Vec<Matrix<B>> {
        vec![self.w.alias()]
    }

    fn grads(&self) -> Vec<(Context<B>, Matrix<B>)> {
        vec![(self.ctx.clone(), self.dw.alias())]
    }
}

fn missing_scratch() -> Error {
    Error::msg("dense block scratch buffers missing for its activation")
}
