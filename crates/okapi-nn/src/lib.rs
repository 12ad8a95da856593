//! # okapi-nn
//!
//! Computation-graph blocks built on okapi-core's Connector/Block plumbing:
//! dense and concatenation layers, an unrolled LSTM, a sigmoid cross-entropy
//! loss, plus the host-side training observers (loss/accuracy trackers).

pub mod dense;
pub mod init;
pub mod loss;
pub mod lstm;
pub mod observer;
pub mod stack;

pub use dense::{Activation, DenseBlock};
pub use init::Init;
pub use loss::SigmoidCeBlock;
pub use lstm::{LstmBlock, SeqLen};
pub use observer::{MetricTracker, Observer, TrackedMetric};
pub use stack::HStackBlock;
