//! The TensorRT-style network that converters emit into.

pub(crate) mod infer;
pub mod interp;
mod layer;
mod network;

pub use layer::{
    ActivationKind, ElementwiseOp, GatherMode, Layer, LayerKind, LayerParam, ReduceOp,
    SampleMode, TensorId, TensorRef, UnaryOp,
};
pub use network::{Network, NetworkBuilder, RecordedLayer};
