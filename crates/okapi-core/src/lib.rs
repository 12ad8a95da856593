//! # okapi-core
//!
//! Core primitives for okapi's stream-ordered matrix dataflow engine.
//!
//! This crate provides:
//! - [`Matrix`] — a 2-D, column-major device buffer with column views
//! - [`Context`] — one asynchronous command stream plus deferred host callbacks
//! - [`Connector`] — makes a produced matrix consumable (and gradient-
//!   accumulating) by multiple downstream blocks across streams
//! - [`Block`] trait — the closed polymorphic graph-node interface
//! - [`Backend`] trait — abstraction over the device/stream/kernel layer
//! - [`DType`] — element types (F32, I32)

pub mod backend;
pub mod block;
pub mod connector;
pub mod context;
pub mod dtype;
pub mod error;
pub mod matrix;

pub use backend::{Backend, BackendDevice, BackendStorage, Trans, View};
pub use block::Block;
pub use connector::{Connector, Consumer};
pub use context::Context;
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use matrix::{HostData, HostMatrix, Matrix};
