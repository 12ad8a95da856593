use crate::definition::{BlockDef, ModelDefinition};
use okapi_core::{bail, Backend, Block, Connector, Context, Matrix, Result};
use okapi_nn::{DenseBlock, HStackBlock, LstmBlock, SeqLen, SigmoidCeBlock};
use rand::Rng;
use std::collections::HashMap;

/// Supplies input batches to the graph. Implementations own forward-only
/// Connectors (inputs, labels) and call `fprop` on them once per batch.
pub trait DataSource<B: Backend> {
    /// Produce the next batch on this source's context. Returns
    /// [`okapi_core::Error::EndOfEpoch`] when the epoch is exhausted; the
    /// caller must [`DataSource::reset`] and try again.
    fn fprop(&mut self) -> Result<()>;

    /// Reset/reshuffle after an epoch ends.
    fn reset(&mut self) -> Result<()>;

    /// The context batches are produced on. The optimizer inserts a wait on
    /// its own context here before each batch, which serializes iterations
    /// through the dataflow chain.
    fn context(&self) -> &Context<B>;

    /// Look up a named output connector.
    fn connector(&self, name: &str) -> Option<&Connector<B>>;

    /// Look up a named sequence-length handle, for recurrent blocks declared
    /// in a definition. Sources with fixed-shape outputs keep the default.
    fn seq_len(&self, _name: &str) -> Option<SeqLen> {
        None
    }
}

/// The pieces of a loss block an observer needs: its context plus the probs
/// and labels matrices valid on it.
pub struct LossProbe<B: Backend> {
    pub ctx: Context<B>,
    pub probs: Matrix<B>,
    pub labels: Matrix<B>,
}

impl<B: Backend> Clone for LossProbe<B> {
    fn clone(&self) -> Self {
        LossProbe {
            ctx: self.ctx.clone(),
            probs: self.probs.alias(),
            labels: self.labels.alias(),
        }
    }
}

/// The block graph: named blocks in topological order plus the connector
/// registry wiring them together.
pub struct Model<B: Backend> {
    blocks: Vec<(String, Box<dyn Block<B>>)>,
    connectors: HashMap<String, Connector<B>>,
    losses: Vec<(String, LossProbe<B>)>,
}

impl<B: Backend> Default for Model<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Model<B> {
    pub fn new() -> Self {
        Model {
            blocks: Vec::new(),
            connectors: HashMap::new(),
            losses: Vec::new(),
        }
    }

    /// Instantiate a declarative definition against `data`'s named outputs.
    /// Blocks must appear in dependency order; each block may reference the
    /// outputs of earlier blocks or of the data source.
    pub fn from_definition(
        def: &ModelDefinition,
        data: &dyn DataSource<B>,
        device: &B::Device,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let mut model = Model::new();
        for block_def in &def.blocks {
            let name = block_def.name().to_string();
            match block_def {
                BlockDef::Dense {
                    input,
                    output_dim,
                    activation,
                    init,
                    ..
                } => {
                    let x = model.resolve(data, input)?;
                    let in_dim = x.value().ncols();
                    let w = init.to_init(in_dim).build(in_dim, *output_dim, rng)?;
                    let block = DenseBlock::new(&w, &x, (*activation).into(), device)?;
                    let output = block.output().clone();
                    model.add_block(&name, Box::new(block))?;
                    model.register_connector(&name, output)?;
                }
                BlockDef::HStack { inputs, .. } => {
                    let resolved = inputs
                        .iter()
                        .map(|n| model.resolve(data, n))
                        .collect::<Result<Vec<_>>>()?;
                    let refs: Vec<&Connector<B>> = resolved.iter().collect();
                    let block = HStackBlock::new(&refs, device)?;
                    let output = block.output().clone();
                    model.add_block(&name, Box::new(block))?;
                    model.register_connector(&name, output)?;
                }
                BlockDef::Lstm {
                    inputs,
                    hidden,
                    seq_len,
                    mask,
                    reverse,
                    init,
                    ..
                } => {
                    let resolved = inputs
                        .iter()
                        .map(|n| model.resolve(data, n))
                        .collect::<Result<Vec<_>>>()?;
                    let in_dim = match resolved.first() {
                        Some(c) => c.value().ncols(),
                        None => bail!("recurrent block '{name}' lists no inputs"),
                    };
                    let w = init.to_init(in_dim).build(in_dim, 4 * hidden, rng)?;
                    let r = init.to_init(*hidden).build(*hidden, 4 * hidden, rng)?;
                    let len = data.seq_len(seq_len).ok_or_else(|| {
                        okapi_core::Error::msg(format!(
                            "data source has no sequence-length handle '{seq_len}'"
                        ))
                    })?;
                    let mask = match mask {
                        Some(n) => Some(model.resolve(data, n)?),
                        None => None,
                    };
                    let block =
                        LstmBlock::new(&w, &r, &resolved, len, mask.as_ref(), *reverse, device)?;
                    let outputs = block.outputs().to_vec();
                    model.add_block(&name, Box::new(block))?;
                    for (i, out) in outputs.iter().enumerate() {
                        model.register_connector(&format!("{name}.{i}"), out.clone())?;
                    }
                    if let Some(last) = outputs.last() {
                        model.register_connector(&name, last.clone())?;
                    }
                }
                BlockDef::SigmoidCe { pre, labels, .. } => {
                    let pre = model.resolve(data, pre)?;
                    let labels = model.resolve(data, labels)?;
                    let block = SigmoidCeBlock::new(&pre, &labels, device)?;
                    let probe = LossProbe {
                        ctx: block.context().clone(),
                        probs: block.probs(),
                        labels: block.labels(),
                    };
                    model.add_block(&name, Box::new(block))?;
                    model.losses.push((name, probe));
                }
            }
        }
        Ok(model)
    }

    fn resolve(&self, data: &dyn DataSource<B>, name: &str) -> Result<Connector<B>> {
        if let Some(conn) = self.connectors.get(name) {
            return Ok(conn.clone());
        }
        if let Some(conn) = data.connector(name) {
            return Ok(conn.clone());
        }
        bail!("no connector named '{name}' among earlier blocks or data outputs");
    }

    /// Append a block. Blocks run forward in insertion order, backward in
    /// reverse.
    pub fn add_block(&mut self, name: &str, block: Box<dyn Block<B>>) -> Result<()> {
        if self.blocks.iter().any(|(n, _)| n == name) {
            bail!("duplicate block name '{name}'");
        }
        self.blocks.push((name.to_string(), block));
        Ok(())
    }

    /// Expose a connector under a name for later blocks (or callers) to
    /// reference.
    pub fn register_connector(&mut self, name: &str, conn: Connector<B>) -> Result<()> {
        if self.connectors.contains_key(name) {
            bail!("duplicate connector name '{name}'");
        }
        self.connectors.insert(name.to_string(), conn);
        Ok(())
    }

    /// Register a loss probe for observers (done automatically by
    /// [`Model::from_definition`]).
    pub fn add_loss(&mut self, name: &str, probe: LossProbe<B>) {
        self.losses.push((name.to_string(), probe));
    }

    pub fn connector(&self, name: &str) -> Option<&Connector<B>> {
        self.connectors.get(name)
    }

    pub fn loss_probe(&self, name: &str) -> Option<&LossProbe<B>> {
        self.losses
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p)
    }

    pub fn fprop(&mut self) -> Result<()> {
        for (_, block) in self.blocks.iter_mut() {
            block.fprop()?;
        }
        Ok(())
    }

    pub fn bprop(&mut self) -> Result<()> {
        for (_, block) in self.blocks.iter_mut().rev() {
            block.bprop()?;
        }
        Ok(())
    }

    /// All trainable parameters, index-aligned with [`Model::grads`].
    pub fn params(&self) -> Vec<Matrix<B>> {
        self.blocks
            .iter()
            .flat_map(|(_, b)| b.params())
            .collect()
    }

    pub fn grads(&self) -> Vec<(Context<B>, Matrix<B>)> {
        self.blocks.iter().flat_map(|(_, b)| b.grads()).collect()
    }

    /// Parameters keyed `{block}.{index}` for persistence.
    pub fn named_params(&self) -> Vec<(String, Matrix<B>)> {
        let mut out = Vec::new();
        for (name, block) in &self.blocks {
            for (i, p) in block.params().into_iter().enumerate() {
                out.push((format!("{name}.{i}"), p));
            }
        }
        out
    }
}
