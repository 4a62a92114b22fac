//! Element types, shapes and literal payloads shared by the source and target models.

mod dtype;
mod literal;
mod shape;

pub use dtype::DType;
pub use literal::TensorLiteral;
pub use shape::{Dimension, Shape, TensorSpec};
