use crate::backend::Backend;
use crate::context::Context;
use crate::error::Result;
use crate::matrix::Matrix;

// Block — the closed polymorphic graph-node interface
//
// A block is one node of the computation graph: it consumes zero or more
// Connectors, owns its parameters and their gradient buffers, and owns the
// Context(s) its kernels are queued on. The graph driver holds blocks as
// trait objects in topological order and runs `fprop` forward and `bprop`
// in reverse.
//
// The interface is deliberately closed: every variant (dense, stack,
// recurrent, loss) implements exactly these four methods, so an optimizer
// can apply updates without knowing concrete types.

/// A computation-graph node with forward and backward passes plus
/// parameter/gradient exposure.
pub trait Block<B: Backend> {
    /// Queue this block's forward kernels and `fprop()` its output
    /// Connectors. Inputs must have been produced (their Connectors
    /// `fprop`'d) for the current iteration.
    fn fprop(&mut self) -> Result<()>;

    /// Queue this block's backward kernels: read accumulated output
    /// gradients, contribute gradients to input Connectors, and accumulate
    /// parameter gradients.
    fn bprop(&mut self) -> Result<()>;

    /// Trainable parameters, paired index-wise with [`Block::grads`].
    fn params(&self) -> Vec<Matrix<B>>;

    /// Parameter gradients with the context whose stream holds the final
    /// accumulation for each — an update must be ordered after that stream.
    fn grads(&self) -> Vec<(Context<B>, Matrix<B>)>;
}
