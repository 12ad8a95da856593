use okapi_core::{Error, Result};
use okapi_nn::{Activation, Init};
use serde::{Deserialize, Serialize};

// Declarative model definition: an ordered list of named blocks, each naming
// the connectors it consumes. Consumed once at build time to instantiate the
// block graph in dependency order; saved alongside the parameters so a
// trained model can be reconstructed.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub blocks: Vec<BlockDef>,
}

impl ModelDefinition {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::msg(format!("model definition: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::msg(format!("model definition: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDef {
    Dense {
        name: String,
        input: String,
        output_dim: usize,
        #[serde(default)]
        activation: ActivationDef,
        #[serde(default)]
        init: InitDef,
    },
    HStack {
        name: String,
        inputs: Vec<String>,
    },
    /// Unrolled recurrent block over one connector per time step. `seq_len`
    /// names the data source's length handle; the per-step hidden states are
    /// registered as `{name}.{step}` and the last unrolled one as `{name}`.
    Lstm {
        name: String,
        inputs: Vec<String>,
        hidden: usize,
        seq_len: String,
        #[serde(default)]
        mask: Option<String>,
        #[serde(default)]
        reverse: bool,
        #[serde(default)]
        init: InitDef,
    },
    SigmoidCe {
        name: String,
        pre: String,
        labels: String,
    },
}

impl BlockDef {
    pub fn name(&self) -> &str {
        match self {
            BlockDef::Dense { name, .. } => name,
            BlockDef::HStack { name, .. } => name,
            BlockDef::Lstm { name, .. } => name,
            BlockDef::SigmoidCe { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationDef {
    #[default]
    Identity,
    Sigmoid,
    Tanh,
}

impl From<ActivationDef> for Activation {
    fn from(a: ActivationDef) -> Self {
        match a {
            ActivationDef::Identity => Activation::Identity,
            ActivationDef::Sigmoid => Activation::Sigmoid,
            ActivationDef::Tanh => Activation::Tanh,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitDef {
    /// Uniform on ±1/sqrt(fan_in).
    #[default]
    ScaledUniform,
    Uniform {
        low: f32,
        high: f32,
    },
    Normal {
        mean: f32,
        std: f32,
    },
    Const {
        value: f32,
    },
}

impl InitDef {
    pub fn to_init(self, fan_in: usize) -> Init {
        match self {
            InitDef::ScaledUniform => Init::scaled_uniform(fan_in),
            InitDef::Uniform { low, high } => Init::Uniform { low, high },
            InitDef::Normal { mean, std } => Init::Normal { mean, std },
            InitDef::Const { value } => Init::Const(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_round_trips_through_json() -> Result<()> {
        let def = ModelDefinition {
            blocks: vec![
                BlockDef::Dense {
                    name: "hidden".into(),
                    input: "x".into(),
                    output_dim: 16,
                    activation: ActivationDef::Tanh,
                    init: InitDef::ScaledUniform,
                },
                BlockDef::Dense {
                    name: "logits".into(),
                    input: "hidden".into(),
                    output_dim: 1,
                    activation: ActivationDef::Identity,
                    init: InitDef::Normal { mean: 0.0, std: 0.1 },
                },
                BlockDef::SigmoidCe {
                    name: "loss".into(),
                    pre: "logits".into(),
                    labels: "y".into(),
                },
            ],
        };
        let json = def.to_json()?;
        assert_eq!(ModelDefinition::from_json(&json)?, def);
        Ok(())
    }

    #[test]
    fn lstm_block_parses_with_defaults() -> Result<()> {
        let json = r#"{"blocks": [
            {"type": "lstm", "name": "enc", "inputs": ["x0", "x1"],
             "hidden": 8, "seq_len": "len"}
        ]}"#;
        let def = ModelDefinition::from_json(json)?;
        match &def.blocks[0] {
            BlockDef::Lstm {
                hidden,
                mask,
                reverse,
                init,
                ..
            } => {
                assert_eq!(*hidden, 8);
                assert!(mask.is_none());
                assert!(!reverse);
                assert_eq!(*init, InitDef::ScaledUniform);
            }
            other => panic!("unexpected block: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn defaults_apply_when_fields_are_omitted() -> Result<()> {
        let json = r#"{"blocks": [
            {"type": "dense", "name": "out", "input": "x", "output_dim": 4}
        ]}"#;
        let def = ModelDefinition::from_json(json)?;
        match &def.blocks[0] {
            BlockDef::Dense {
                activation, init, ..
            } => {
                assert_eq!(*activation, ActivationDef::Identity);
                assert_eq!(*init, InitDef::ScaledUniform);
            }
            other => panic!("unexpected block: {other:?}"),
        }
        Ok(())
    }
}
