//! # okapi
//!
//! Top-level crate of the okapi workspace: declarative model definitions,
//! the graph driver, the SGD training loop, and parameter persistence, all
//! built on [`okapi_core`]'s stream-ordered Connector/Block engine and
//! [`okapi_nn`]'s block variants.

pub mod definition;
pub mod model;
pub mod optim;
pub mod store;

pub use definition::{ActivationDef, BlockDef, InitDef, ModelDefinition};
pub use model::{DataSource, LossProbe, Model};
pub use optim::{
    FixedLearningRatePolicy, LearningRatePolicy, MaxIterCriterion, SgdOptimizer,
    StoppingCriterion,
};
pub use store::{load_params, restore_params, save_params, Saver};

pub mod prelude {
    pub use crate::definition::ModelDefinition;
    pub use crate::model::{DataSource, Model};
    pub use crate::optim::{FixedLearningRatePolicy, MaxIterCriterion, SgdOptimizer};
    pub use okapi_core::{
        Backend, Block, Connector, Consumer, Context, DType, Error, HostMatrix, Matrix, Result,
        Trans,
    };
    pub use okapi_nn::{
        Activation, DenseBlock, HStackBlock, Init, LstmBlock, MetricTracker, Observer, SeqLen,
        SigmoidCeBlock, TrackedMetric,
    };
}
