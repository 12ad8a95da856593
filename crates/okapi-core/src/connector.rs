use crate::backend::Backend;
use crate::bail;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::matrix::Matrix;
use std::sync::{Arc, Mutex};

// Connector — makes a produced matrix consumable by multiple blocks
//
// A Connector wraps the matrix a block produces and mediates every
// cross-stream interaction around it:
//
//   forward:  the producer queues its kernels, then calls `fprop()`, which
//             bumps the generation counter and records the producer-stream
//             event. A consumer's first `value()` per generation makes its
//             own stream wait on that event — the one hard cross-stream
//             ordering contract of the engine.
//
//   backward: all gradient-requiring consumers share ONE accumulation
//             matrix. It is zeroed exactly once per generation (by the first
//             contributor, after waiting on the forward event, which orders
//             the zero after the owner's previous-generation reads), and
//             every contribution is add-only. Contributors are serialized by
//             an event chain: each `grad()` acquisition waits on the
//             previous contributor's commit event, so the final content is
//             the exact elementwise sum regardless of stream timing.
//
// A consumer that will not run in the current generation (the first inactive
// cell of a recurrent block after the sequence got shorter) can have its
// obligation deferred — at most one deferral per Connector per generation.

struct SlotState<B: Backend> {
    ctx: Context<B>,
    needs_backward: bool,
    /// Last forward generation this consumer's stream was synchronized to.
    synced_gen: u64,
    /// Last generation this consumer committed a gradient contribution for.
    contributed_gen: u64,
}

struct State<B: Backend> {
    fwd_gen: u64,
    fwd_event: Option<B::Event>,
    consumers: Vec<SlotState<B>>,
    /// The shared accumulation matrix; allocated when the first backward
    /// consumer registers.
    grad: Option<Matrix<B>>,
    /// Generation for which `grad` has been zeroed.
    grad_zeroed_gen: u64,
    /// Event recorded at the most recent contributor commit.
    last_contrib: Option<B::Event>,
    /// Slot currently holding the accumulation matrix between `grad()` and
    /// `grad_commit()`. Two uncommitted acquisitions are a contract
    /// violation and fail loudly.
    acquired: Option<usize>,
    /// Slot whose obligation is waived this generation, if any.
    deferred: Option<usize>,
}

struct Shared<B: Backend> {
    value: Matrix<B>,
    producer: Context<B>,
    /// Whether this value participates in the backward pass at all. Data
    /// sources produce forward-only connectors; consumers check this before
    /// registering a gradient-contributing slot.
    bpropagable: bool,
    state: Mutex<State<B>>,
}

/// Wrapper making a produced [`Matrix`] safely consumable (and optionally
/// gradient-accumulating) across multiple downstream blocks and streams.
pub struct Connector<B: Backend> {
    shared: Arc<Shared<B>>,
}

impl<B: Backend> Clone for Connector<B> {
    fn clone(&self) -> Self {
        Connector {
            shared: self.shared.clone(),
        }
    }
}

/// One registered consumer of a Connector. Obtained from
/// [`Connector::register`]; holds the consumer's context and its slot in the
/// backward accounting.
pub struct Consumer<B: Backend> {
    shared: Arc<Shared<B>>,
    slot: usize,
    ctx: Context<B>,
    needs_backward: bool,
}

impl<B: Backend> Connector<B> {
    /// Wrap `value`, produced on `producer`'s stream. The producing block
    /// calls [`Connector::fprop`] once per value production, immediately
    /// after queuing the producing kernels.
    pub fn new(value: Matrix<B>, producer: Context<B>) -> Self {
        Self::build(value, producer, true, None)
    }

    /// A connector whose value never takes gradients (data sources, labels).
    /// Registering a backward consumer on it is an error.
    pub fn forward_only(value: Matrix<B>, producer: Context<B>) -> Self {
        Self::build(value, producer, false, None)
    }

    /// A connector with its accumulation buffer allocated up front, so the
    /// producing block can read [`Connector::backward_matrix`] even in a
    /// generation where no consumer contributed (the buffer is then zeroed
    /// on the producer's stream). Recurrent cell state works this way: the
    /// last unrolled step's cell state has no downstream gradient source.
    pub fn with_grad(value: Matrix<B>, producer: Context<B>) -> Result<Self> {
        let grad = Matrix::empty_like(&value)?;
        Ok(Self::build(value, producer, true, Some(grad)))
    }

    fn build(
        value: Matrix<B>,
        producer: Context<B>,
        bpropagable: bool,
        grad: Option<Matrix<B>>,
    ) -> Self {
        Connector {
            shared: Arc::new(Shared {
                value,
                producer,
                bpropagable,
                state: Mutex::new(State {
                    fwd_gen: 0,
                    fwd_event: None,
                    consumers: Vec::new(),
                    grad,
                    grad_zeroed_gen: 0,
                    last_contrib: None,
                    acquired: None,
                    deferred: None,
                }),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State<B>> {
        // The engine is host-single-threaded; a poisoned lock means a caller
        // panicked mid-update and nothing downstream can be trusted.
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The wrapped value, for the producing block's own use. Consumers must
    /// go through [`Consumer::value`] to get the ordering edge.
    pub fn value(&self) -> &Matrix<B> {
        &self.shared.value
    }

    /// The producing context.
    pub fn producer(&self) -> &Context<B> {
        &self.shared.producer
    }

    /// Current forward generation (0 before the first `fprop`).
    pub fn generation(&self) -> u64 {
        self.state().fwd_gen
    }

    /// Whether any registered consumer accumulates gradients here.
    pub fn has_grad(&self) -> bool {
        self.state().grad.is_some()
    }

    /// Whether this value participates in the backward pass.
    pub fn bpropagable(&self) -> bool {
        self.shared.bpropagable
    }

    /// Register a consumer. Must happen before the first `fprop()`.
    ///
    /// Each registration gets independent backward accounting. Registering
    /// the same context with the same `needs_backward` flag twice is
    /// rejected — a silent duplicate would double-count the obligation.
    pub fn register(&self, ctx: &Context<B>, needs_backward: bool) -> Result<Consumer<B>> {
        if needs_backward && !self.shared.bpropagable {
            bail!("cannot register a backward consumer on a forward-only connector");
        }
        let mut st = self.state();
        if st.fwd_gen > 0 {
            bail!("consumers must register before the connector's first fprop");
        }
        if st
            .consumers
            .iter()
            .any(|c| c.ctx.id() == ctx.id() && c.needs_backward == needs_backward)
        {
            bail!(
                "context {} is already registered on this connector (needs_backward={})",
                ctx.id(),
                needs_backward
            );
        }
        if needs_backward && st.grad.is_none() {
            st.grad = Some(Matrix::empty_like(&self.shared.value)?);
        }
        let slot = st.consumers.len();
        st.consumers.push(SlotState {
            ctx: ctx.clone(),
            needs_backward,
            synced_gen: 0,
            contributed_gen: 0,
        });
        Ok(Consumer {
            shared: self.shared.clone(),
            slot,
            ctx: ctx.clone(),
            needs_backward,
        })
    }

    /// Advance the forward generation. Called by the producer exactly once
    /// per value production, after enqueuing the producing kernels — the
    /// ordering point is stream-relative, not wall-clock.
    pub fn fprop(&self) -> Result<()> {
        let event = self.shared.producer.record_event()?;
        let mut st = self.state();
        st.fwd_gen += 1;
        st.fwd_event = Some(event);
        // A new generation carries no stale deferral, half-open acquisition,
        // or previous-generation contribution event.
        st.deferred = None;
        st.acquired = None;
        st.last_contrib = None;
        Ok(())
    }

    /// The accumulated gradient, for the producing block.
    ///
    /// Fails if any non-deferred backward consumer has not committed its
    /// contribution for the current generation. Inserts a wait on the last
    /// contributor's event so everything the producer queues afterwards is
    /// ordered after the full sum.
    pub fn backward_matrix(&self) -> Result<Matrix<B>> {
        let mut st = self.state();
        let grad = match &st.grad {
            Some(g) => g.alias(),
            None => bail!("connector has no backward consumers"),
        };
        for (i, c) in st.consumers.iter().enumerate() {
            if c.needs_backward && c.contributed_gen < st.fwd_gen && st.deferred != Some(i) {
                bail!(
                    "consumer context {} still owes a gradient contribution for generation {}",
                    c.ctx.id(),
                    st.fwd_gen
                );
            }
        }
        if st.grad_zeroed_gen < st.fwd_gen {
            // No consumer contributed this generation (every one deferred or
            // absent); the producer reads an all-zero gradient.
            grad.fill(&self.shared.producer, 0.0)?;
            st.grad_zeroed_gen = st.fwd_gen;
        } else if let Some(ev) = &st.last_contrib {
            self.shared.producer.wait_event(ev)?;
        }
        Ok(grad)
    }

    /// Waive `consumer`'s backward obligation for the current generation and
    /// mark its forward view as already synchronized (the boundary hand-off
    /// of a recurrent block whose active length shrank).
    ///
    /// At most one deferral may be active per Connector per generation; a
    /// second request is an error and a sign the caller needs a different
    /// design.
    pub fn defer_grad(&self, consumer: &Consumer<B>) -> Result<()> {
        if !Arc::ptr_eq(&self.shared, &consumer.shared) {
            bail!("consumer does not belong to this connector");
        }
        if !consumer.needs_backward {
            bail!("cannot defer a forward-only consumer");
        }
        let mut st = self.state();
        match st.deferred {
            Some(slot) if slot != consumer.slot => {
                bail!("connector already has a deferred backward completion this generation")
            }
            _ => {}
        }
        st.deferred = Some(consumer.slot);
        let gen = st.fwd_gen;
        st.consumers[consumer.slot].synced_gen = gen;
        Ok(())
    }

    /// Re-arm a previously deferred consumer.
    pub fn restore_grad(&self, consumer: &Consumer<B>) -> Result<()> {
        let mut st = self.state();
        if st.deferred != Some(consumer.slot) {
            bail!("consumer is not the deferred one on this connector");
        }
        st.deferred = None;
        Ok(())
    }
}

impl<B: Backend> Consumer<B> {
    /// The consumer's own context.
    pub fn context(&self) -> &Context<B> {
        &self.ctx
    }

    pub fn needs_backward(&self) -> bool {
        self.needs_backward
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State<B>> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The forward value, as a read view bound to this consumer's context.
    ///
    /// On first access per generation, inserts a wait on the producer's
    /// `fprop` event so every subsequent op on this consumer's stream sees
    /// the completed value.
    pub fn value(&self) -> Result<Matrix<B>> {
        let mut st = self.state();
        if st.fwd_gen == 0 {
            bail!("connector value read before its first fprop");
        }
        if st.consumers[self.slot].synced_gen < st.fwd_gen {
            let ev = st
                .fwd_event
                .clone()
                .ok_or_else(|| Error::msg("connector fprop event missing"))?;
            self.ctx.wait_event(&ev)?;
            let gen = st.fwd_gen;
            st.consumers[self.slot].synced_gen = gen;
        }
        Ok(self.shared.value.alias())
    }

    /// Acquire the shared accumulation matrix for this consumer's add-only
    /// contribution.
    ///
    /// The first acquirer of a generation zeroes the buffer (ordered after
    /// the forward event); later acquirers wait on the previous contributor's
    /// commit event. The consumer queues its add-ops, then calls
    /// [`Consumer::grad_commit`].
    pub fn grad(&self) -> Result<Matrix<B>> {
        if !self.needs_backward {
            bail!("consumer registered forward-only; no gradient view");
        }
        let mut st = self.state();
        if st.fwd_gen == 0 {
            bail!("gradient requested before the connector's first fprop");
        }
        if st.consumers[self.slot].contributed_gen == st.fwd_gen {
            bail!("consumer already contributed its gradient this generation");
        }
        if let Some(holder) = st.acquired {
            bail!(
                "gradient buffer already acquired by slot {holder} and not committed; \
                 contributions must be acquire/commit bracketed"
            );
        }
        let grad = st
            .grad
            .as_ref()
            .ok_or_else(|| Error::msg("connector has no accumulation buffer"))?
            .alias();
        if st.grad_zeroed_gen < st.fwd_gen {
            let ev = st
                .fwd_event
                .clone()
                .ok_or_else(|| Error::msg("connector fprop event missing"))?;
            self.ctx.wait_event(&ev)?;
            grad.fill(&self.ctx, 0.0)?;
            st.grad_zeroed_gen = st.fwd_gen;
        } else if let Some(ev) = st.last_contrib.clone() {
            self.ctx.wait_event(&ev)?;
        }
        st.acquired = Some(self.slot);
        Ok(grad)
    }

    /// Mark this consumer's contribution complete: records the event the
    /// next contributor (or the owner's read) will wait on.
    pub fn grad_commit(&self) -> Result<()> {
        let event = self.ctx.record_event()?;
        let mut st = self.state();
        if st.acquired != Some(self.slot) {
            bail!("grad_commit without a matching grad acquisition");
        }
        st.acquired = None;
        st.last_contrib = Some(event);
        let gen = st.fwd_gen;
        st.consumers[self.slot].contributed_gen = gen;
        Ok(())
    }
}

impl<B: Backend> std::fmt::Debug for Connector<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state();
        write!(
            f,
            "Connector(gen={}, consumers={}, grad={})",
            st.fwd_gen,
            st.consumers.len(),
            st.grad.is_some()
        )
    }
}
