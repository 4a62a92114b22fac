use crate::error::{LoweringError, LoweringResult};
use crate::target::{Layer, NetworkBuilder, TensorRef};
use crate::tensor::{DType, Dimension, Shape, TensorLiteral, TensorSpec};

/// A lowered source value: either a payload known now or a tensor in the target network.
///
/// All constant-versus-tensor branching goes through this type. Routines read
/// literals with [`LoweredValue::as_constant`] and fall back to the dynamic
/// path on [`LoweringError::NotConstant`]; anything that needs a live tensor
/// calls [`LoweredValue::materialize`].
#[derive(Debug, Clone, PartialEq)]
pub enum LoweredValue {
    Constant(TensorLiteral),
    Tensor(TensorRef),
}

impl LoweredValue {
    pub fn spec(&self) -> &TensorSpec {
        match self {
            LoweredValue::Constant(literal) => &literal.spec,
            LoweredValue::Tensor(tensor) => &tensor.spec,
        }
    }

    pub fn dtype(&self) -> DType {
        self.spec().dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.spec().shape
    }

    pub fn rank(&self) -> usize {
        self.spec().rank()
    }

    pub fn dim(&self, axis: usize) -> Option<Dimension> {
        self.shape().dim(axis)
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, LoweredValue::Constant(_))
    }

    pub fn as_constant(&self) -> LoweringResult<&TensorLiteral> {
        match self {
            LoweredValue::Constant(literal) => Ok(literal),
            LoweredValue::Tensor(_) => Err(LoweringError::NotConstant),
        }
    }

    /// Integer payload of a constant; `NotConstant` for tensors.
    pub fn as_ints(&self) -> LoweringResult<Vec<i64>> {
        self.as_constant()?.to_i64s()
    }

    /// Single integer of a one-element constant.
    pub fn as_scalar_int(&self) -> LoweringResult<i64> {
        match self.as_ints()?.as_slice() {
            [value] => Ok(*value),
            other => Err(LoweringError::invalid(format!(
                "expected a single integer, found {} values",
                other.len()
            ))),
        }
    }

    /// Promotes a constant into a constant layer; tensors pass through unchanged.
    pub fn materialize(&self, net: &mut dyn NetworkBuilder) -> LoweringResult<TensorRef> {
        match self {
            LoweredValue::Tensor(tensor) => Ok(tensor.clone()),
            LoweredValue::Constant(literal) => {
                let mut outputs = net.add_layer(Layer::Constant {
                    literal: literal.clone(),
                })?;
                outputs
                    .pop()
                    .ok_or_else(|| LoweringError::target("constant layer produced no output"))
            }
        }
    }

    pub fn into_tensor(self, net: &mut dyn NetworkBuilder) -> LoweringResult<LoweredValue> {
        Ok(LoweredValue::Tensor(self.materialize(net)?))
    }
}

impl From<TensorLiteral> for LoweredValue {
    fn from(literal: TensorLiteral) -> Self {
        LoweredValue::Constant(literal)
    }
}

impl From<TensorRef> for LoweredValue {
    fn from(tensor: TensorRef) -> Self {
        LoweredValue::Tensor(tensor)
    }
}
