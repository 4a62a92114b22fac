//! Lowering of Paddle PIR operator graphs into TensorRT-style layer networks.
//!
//! The crate walks a [`source::SourceGraph`] in topological order, looks up a
//! converter for every operator in the [`lowering::ConverterRegistry`], and
//! emits layers through a [`target::NetworkBuilder`]. Shapes that are only
//! known at execution time are computed by shape-arithmetic subgraphs built
//! in the target network itself.

extern crate self as pir_lower;

pub use linkme;

pub mod config;
mod env;
pub mod error;
pub mod lowering;
pub mod ops;
pub mod pipeline;
pub mod source;
pub mod target;
pub mod tensor;

pub use config::LowerOptions;
pub use error::{LoweringError, LoweringResult};
pub use lowering::{
    builtin_registry, translate, ConverterRegistry, LoweredValue, TargetVersion, Translation,
    VersionReq,
};
pub use source::{SourceGraph, SourceGraphBuilder, SourceNode, ValueRef};
pub use target::{Network, NetworkBuilder};
pub use tensor::{DType, Dimension, Shape, TensorLiteral, TensorSpec};
