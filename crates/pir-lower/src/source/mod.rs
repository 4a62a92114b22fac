//! Read-only model of the Paddle PIR graph being lowered.

mod constant;
mod graph;
pub mod kinds;
mod node;

pub use constant::constant_payload;
pub(crate) use constant::node_dtype;
pub use graph::{SourceGraph, SourceGraphBuilder};
pub use node::{AttrValue, NodeId, SourceNode, ValueRef};
