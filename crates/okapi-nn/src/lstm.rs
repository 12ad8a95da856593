use okapi_core::{
    bail, Backend, Block, Connector, Consumer, Context, DType, Error, HostMatrix, Matrix, Result,
    Trans,
};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// LSTM over an unrolled sequence of input connectors.
//
// All four gates live in one stacked weight pair: W is input_dim x 4*hidden
// and R is hidden x 4*hidden, with the gate order z (candidate), i, f, o
// concatenated column-wise. One fused gemm per step computes every gate
// pre-activation; the combined tanh/sigmoid nonlinearity then applies tanh
// to the z quarter and sigmoid to the rest, capturing derivatives for
// backward.
//
// Each unrolled cell owns its own context so independent time steps of
// stacked layers can overlap across streams. The per-step state connectors
// chain the cells together: cell k's first read of cell k-1's c/h inserts
// the only cross-stream edges the forward pass needs, and the backward
// gradient commits chain the reverse direction.
//
// The boundary (first active) cell is tagged explicitly per pass and reads a
// constant zero state instead of its predecessor; when the active window is
// shorter than the unroll, the would-be next cell's gradient obligations on
// the last active step are deferred for that generation and restored
// afterwards.

/// Shared, mutable sequence-length handle. The data source sets it each
/// iteration; the recurrent block reads it at `fprop`.
#[derive(Clone, Debug)]
pub struct SeqLen(Arc<AtomicUsize>);

impl SeqLen {
    pub fn new(len: usize) -> Self {
        SeqLen(Arc::new(AtomicUsize::new(len)))
    }

    pub fn set(&self, len: usize) {
        self.0.store(len, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

struct PrevState<B: Backend> {
    c: Consumer<B>,
    h: Consumer<B>,
}

struct LstmCell<B: Backend> {
    ctx: Context<B>,
    w: Matrix<B>,
    r: Matrix<B>,
    dw: Matrix<B>,
    dr: Matrix<B>,
    x: Consumer<B>,
    x_bprop: bool,
    /// Mask consumer plus the time column this cell applies.
    mask: Option<(Consumer<B>, usize)>,
    prev: Option<PrevState<B>>,
    zeros: Matrix<B>,
    zifo: Matrix<B>,
    z: Matrix<B>,
    i: Matrix<B>,
    f: Matrix<B>,
    o: Matrix<B>,
    dzifo: Matrix<B>,
    dz: Matrix<B>,
    di: Matrix<B>,
    df: Matrix<B>,
    do_: Matrix<B>,
    c: Connector<B>,
    c_value: Matrix<B>,
    tanh_c: Matrix<B>,
    dtanh_c: Matrix<B>,
    h: Connector<B>,
    h_value: Matrix<B>,
    was_boundary: bool,
}

impl<B: Backend> LstmCell<B> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        w: Matrix<B>,
        r: Matrix<B>,
        dw: Matrix<B>,
        dr: Matrix<B>,
        x: &Connector<B>,
        mask: Option<(&Connector<B>, usize)>,
        prev: Option<(&Connector<B>, &Connector<B>)>,
        zeros: &Matrix<B>,
        device: &B::Device,
    ) -> Result<Self> {
        let ctx = Context::new(device)?;
        let batch = zeros.nrows();
        let hidden = zeros.ncols();

        let x_bprop = x.bpropagable();
        let x = x.register(&ctx, x_bprop)?;
        let mask = mask
            .map(|(m, col)| Ok::<_, Error>((m.register(&ctx, false)?, col)))
            .transpose()?;
        let prev = prev
            .map(|(c, h)| {
                Ok::<_, Error>(PrevState {
                    c: c.register(&ctx, true)?,
                    h: h.register(&ctx, true)?,
                })
            })
            .transpose()?;

        let zifo = Matrix::empty(batch, 4 * hidden, DType::F32, device)?;
        let z = zifo.columns(0..hidden)?;
        let i = zifo.columns(hidden..2 * hidden)?;
        let f = zifo.columns(2 * hidden..3 * hidden)?;
        let o = zifo.columns(3 * hidden..4 * hidden)?;
        let dzifo = Matrix::empty_like(&zifo)?;
        let dz = dzifo.columns(0..hidden)?;
        let di = dzifo.columns(hidden..2 * hidden)?;
        let df = dzifo.columns(2 * hidden..3 * hidden)?;
        let do_ = dzifo.columns(3 * hidden..4 * hidden)?;

        let c_value = Matrix::empty(batch, hidden, DType::F32, device)?;
        // Pre-allocated accumulation buffers: the producing cell reads the
        // state gradient even in a generation where nothing downstream
        // contributed (the last active step).
        let c = Connector::with_grad(c_value.clone(), ctx.clone())?;
        let h_value = Matrix::empty(batch, hidden, DType::F32, device)?;
        let h = Connector::with_grad(h_value.clone(), ctx.clone())?;
        let tanh_c = Matrix::empty(batch, hidden, DType::F32, device)?;
        let dtanh_c = Matrix::empty(batch, hidden, DType::F32, device)?;

        Ok(LstmCell {
            ctx,
            w,
            r,
            dw,
            dr,
            x,
            x_bprop,
            mask,
            prev,
            zeros: zeros.alias(),
            zifo,
            z,
            i,
            f,
            o,
            dzifo,
            dz,
            di,
            df,
            do_,
            c,
            c_value,
            tanh_c,
            dtanh_c,
            h,
            h_value,
            was_boundary: false,
        })
    }

    fn prev_state(&self) -> Result<(Matrix<B>, Matrix<B>)> {
        match (&self.prev, self.was_boundary) {
            (Some(p), false) => Ok((p.c.value()?, p.h.value()?)),
            _ => Ok((self.zeros.alias(), self.zeros.alias())),
        }
    }

    fn fprop(&mut self, is_boundary: bool) -> Result<()> {
        self.was_boundary = is_boundary;
        let x = self.x.value()?;
        let (prev_c, prev_h) = self.prev_state()?;

        // zifo = tanh_sigm(x · W + h[t-1] · R)
        self.zifo
            .assign_dot(&self.ctx, &x, &self.w, Trans::N, Trans::N)?;
        self.zifo
            .add_dot(&self.ctx, &prev_h, &self.r, Trans::N, Trans::N)?;
        let hidden = self.z.ncols();
        self.zifo
            .tanh_sigm(&self.ctx, &self.zifo, Some(&self.dzifo), hidden)?;

        // c[t] = i ⊙ z + f ⊙ c[t-1];  h[t] = o ⊙ tanh(c[t])
        self.c_value
            .assign_sum_hprod(&self.ctx, &self.i, &self.z, &self.f, &prev_c)?;
        self.c_value
            .tanh(&self.ctx, &self.tanh_c, Some(&self.dtanh_c))?;
        self.h_value.assign_hprod(&self.ctx, &self.o, &self.tanh_c)?;

        if let Some((mask, col)) = &self.mask {
            let m = mask.value()?.column(*col)?;
            self.c_value.hprod_col(&self.ctx, &m)?;
            self.h_value.hprod_col(&self.ctx, &m)?;
        }

        self.c.fprop()?;
        self.h.fprop()
    }

    fn bprop(&mut self) -> Result<()> {
        let dc = self.c.backward_matrix()?;
        let dh = self.h.backward_matrix()?;
        if let Some((mask, col)) = &self.mask {
            let m = mask.value()?.column(*col)?;
            dc.hprod_col(&self.ctx, &m)?;
            dh.hprod_col(&self.ctx, &m)?;
        }

        // dL/dc[t] += dL/dh[t] ⊙ o ⊙ dtanh(c[t])/dc[t]
        dc.add_hprod3(&self.ctx, &dh, &self.o, &self.dtanh_c)?;

        let (prev_c, prev_h) = self.prev_state()?;

        // Gate pre-activation errors, written in place over the captured
        // derivatives quarter by quarter.
        self.do_
            .assign_hprod3(&self.ctx, &dh, &self.tanh_c, &self.do_)?;
        self.df
            .assign_hprod3(&self.ctx, &dc, &prev_c, &self.df)?;
        self.di.assign_hprod3(&self.ctx, &dc, &self.z, &self.di)?;
        self.dz.assign_hprod3(&self.ctx, &dc, &self.i, &self.dz)?;

        // dL/dW += xᵀ · dL/dpre;  dL/dR += h[t-1]ᵀ · dL/dpre
        let x = self.x.value()?;
        self.dw
            .add_dot(&self.ctx, &x, &self.dzifo, Trans::T, Trans::N)?;
        if !self.was_boundary {
            self.dr
                .add_dot(&self.ctx, &prev_h, &self.dzifo, Trans::T, Trans::N)?;
        }

        if self.x_bprop {
            let g = self.x.grad()?;
            g.add_dot(&self.ctx, &self.dzifo, &self.w, Trans::N, Trans::T)?;
            self.x.grad_commit()?;
        }

        // State gradient to the previous step, except at the boundary.
        if !self.was_boundary {
            if let Some(p) = &self.prev {
                let g = p.c.grad()?;
                g.add_hprod(&self.ctx, &self.f, &dc)?;
                p.c.grad_commit()?;
                let g = p.h.grad()?;
                g.add_dot(&self.ctx, &self.dzifo, &self.r, Trans::N, Trans::T)?;
                p.h.grad_commit()?;
            }
        }
        Ok(())
    }
}

/// Unrolled LSTM block with a fused stacked-gate weight pair.
pub struct LstmBlock<B: Backend> {
    ctx: Context<B>,
    w: Matrix<B>,
    r: Matrix<B>,
    dw: Matrix<B>,
    dr: Matrix<B>,
    cells: Vec<LstmCell<B>>,
    /// Hidden-state connectors in time order (reversed traversal included).
    outputs: Vec<Connector<B>>,
    seq_len: SeqLen,
    reverse: bool,
    max_len: usize,
    /// Cell-index range of the last forward pass.
    active: Option<Range<usize>>,
    /// Cell whose stream holds the final dW/dR accumulation.
    grad_slot: usize,
}

impl<B: Backend> LstmBlock<B> {
    /// Build an unrolled LSTM over `x` (one connector per time step, all
    /// batch x input_dim). `w_init` is input_dim x 4*hidden, `r_init` is
    /// hidden x 4*hidden, gate order z, i, f, o. `mask`, if given, is a
    /// batch x max_len column mask freezing padded positions per step.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        w_init: &HostMatrix,
        r_init: &HostMatrix,
        x: &[Connector<B>],
        seq_len: SeqLen,
        mask: Option<&Connector<B>>,
        reverse: bool,
        device: &B::Device,
    ) -> Result<Self> {
        if x.is_empty() {
            bail!("recurrent block needs at least one input step");
        }
        let hidden = r_init.nrows();
        if r_init.ncols() != 4 * hidden {
            // Per-gate R must be square.
            return Err(Error::NotSquare {
                rows: hidden,
                cols: r_init.ncols() / 4,
            });
        }
        if w_init.ncols() != r_init.ncols() {
            return Err(Error::ShapeMismatch {
                expected_rows: w_init.nrows(),
                expected_cols: r_init.ncols(),
                got_rows: w_init.nrows(),
                got_cols: w_init.ncols(),
            });
        }
        let max_len = x.len();
        let batch = x[0].value().nrows();
        let input_dim = w_init.nrows();
        for conn in x {
            let v = conn.value();
            if v.nrows() != batch || v.ncols() != input_dim {
                return Err(Error::ShapeMismatch {
                    expected_rows: batch,
                    expected_cols: input_dim,
                    got_rows: v.nrows(),
                    got_cols: v.ncols(),
                });
            }
        }
        if let Some(m) = mask {
            let v = m.value();
            if v.nrows() != batch || v.ncols() != max_len {
                return Err(Error::ShapeMismatch {
                    expected_rows: batch,
                    expected_cols: max_len,
                    got_rows: v.nrows(),
                    got_cols: v.ncols(),
                });
            }
        }

        let ctx = Context::new(device)?;
        let w = Matrix::from_host(w_init, device)?;
        let r = Matrix::from_host(r_init, device)?;
        let dw = Matrix::empty_like(&w)?;
        let dr = Matrix::empty_like(&r)?;

        let zeros = Matrix::empty(batch, hidden, DType::F32, device)?;
        zeros.sync_fill(&ctx, 0.0)?;

        let mut cells: Vec<LstmCell<B>> = Vec::with_capacity(max_len);
        for step in 0..max_len {
            let t = if reverse { max_len - 1 - step } else { step };
            let prev = cells.last().map(|p| (p.c.clone(), p.h.clone()));
            let cell = LstmCell::new(
                w.alias(),
                r.alias(),
                dw.alias(),
                dr.alias(),
                &x[t],
                mask.map(|m| (m, t)),
                prev.as_ref().map(|(c, h)| (c, h)),
                &zeros,
                device,
            )?;
            cells.push(cell);
        }

        let outputs: Vec<Connector<B>> = if reverse {
            cells.iter().rev().map(|cell| cell.h.clone()).collect()
        } else {
            cells.iter().map(|cell| cell.h.clone()).collect()
        };

        Ok(LstmBlock {
            ctx,
            w,
            r,
            dw,
            dr,
            cells,
            outputs,
            seq_len,
            reverse,
            max_len,
            active: None,
            grad_slot: 0,
        })
    }

    /// Hidden-state connectors in time order, one per unrolled step.
    pub fn outputs(&self) -> &[Connector<B>] {
        &self.outputs
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn hidden_size(&self) -> usize {
        self.r.nrows()
    }

    fn active_range(&self, n: usize) -> Range<usize> {
        if self.reverse {
            self.max_len - n..self.max_len
        } else {
            0..n
        }
    }
}

impl<B: Backend> Block<B> for LstmBlock<B> {
    fn fprop(&mut self) -> Result<()> {
        let n = self.seq_len.get();
        if n == 0 {
            bail!("recurrent forward pass over a sequence of length zero");
        }
        if n > self.max_len {
            return Err(Error::SequenceTooLong {
                len: n,
                max: self.max_len,
            });
        }
        let range = self.active_range(n);
        for k in range.clone() {
            self.cells[k].fprop(k == range.start)?;
        }
        self.active = Some(range);
        Ok(())
    }

    fn bprop(&mut self) -> Result<()> {
        let range = self
            .active
            .clone()
            .ok_or_else(|| Error::msg("recurrent backward pass before any forward"))?;
        let n = range.len();

        // The zero-fill of the shared gradients must land after the previous
        // iteration's parameter update read them; the active cells' forward
        // work is already chained behind that update, so waiting on the last
        // active cell here is sufficient.
        let last = range.end - 1;
        self.ctx.wait(&self.cells[last].ctx)?;
        self.dw.fill(&self.ctx, 0.0)?;
        self.dr.fill(&self.ctx, 0.0)?;
        // The first cell to run backward carries the fills for the chain.
        self.cells[last].ctx.wait(&self.ctx)?;

        // Shrunken forward window: the would-be next cell never ran, so its
        // gradient obligations on the last active step's state are waived
        // for this generation.
        let deferred = !self.reverse && n < self.max_len;
        if deferred {
            let next_prev = self.cells[n]
                .prev
                .as_ref()
                .ok_or_else(|| Error::msg("unrolled cell missing its predecessor link"))?;
            self.cells[n - 1].c.defer_grad(&next_prev.c)?;
            self.cells[n - 1].h.defer_grad(&next_prev.h)?;
        }

        for k in range.clone().rev() {
            self.cells[k].bprop()?;
        }

        if deferred {
            let next_prev = self.cells[n]
                .prev
                .as_ref()
                .ok_or_else(|| Error::msg("unrolled cell missing its predecessor link"))?;
            self.cells[n - 1].c.restore_grad(&next_prev.c)?;
            self.cells[n - 1].h.restore_grad(&next_prev.h)?;
        }

        self.grad_slot = range.start;
        Ok(())
    }

    fn params(&self) -> Vec<Matrix<B>> {
        vec![self.w.alias(), self.r.alias()]
    }

    fn grads(&self) -> Vec<(Context<B>, Matrix<B>)> {
        // The boundary cell is the last to run backward; its stream sees the
        // completed accumulation.
        let ctx = self.cells[self.grad_slot].ctx.clone();
        vec![(ctx.clone(), self.dw.alias()), (ctx, self.dr.alias())]
    }
}
