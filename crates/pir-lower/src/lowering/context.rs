use tracing::{debug, trace};

use super::value::LoweredValue;
use crate::config::LowerOptions;
use crate::env::trace_layers_enabled;
use crate::error::{LoweringError, LoweringResult};
use crate::source::SourceGraph;
use crate::target::{Layer, LayerParam, NetworkBuilder, TensorRef};
use crate::tensor::{DType, Shape, TensorLiteral};

/// Everything a lowering routine may touch while converting one node.
pub struct LowerCtx<'a> {
    pub net: &'a mut dyn NetworkBuilder,
    pub graph: &'a SourceGraph,
    pub options: &'a LowerOptions,
}

impl<'a> LowerCtx<'a> {
    pub fn new(
        net: &'a mut dyn NetworkBuilder,
        graph: &'a SourceGraph,
        options: &'a LowerOptions,
    ) -> Self {
        Self {
            net,
            graph,
            options,
        }
    }

    pub fn implicit_batch(&self) -> bool {
        self.options.implicit_batch || self.net.has_implicit_batch_dimension()
    }

    /// Adds a single-output layer.
    pub fn add_layer(&mut self, layer: Layer) -> LoweringResult<TensorRef> {
        let kind = layer.kind();
        let mut outputs = self.net.add_layer(layer)?;
        let output = outputs
            .pop()
            .ok_or_else(|| LoweringError::target(format!("{kind:?} layer produced no output")))?;
        if trace_layers_enabled() {
            debug!(?kind, tensor = %output.id, spec = %output.spec, "emitted layer");
        }
        Ok(output)
    }

    pub fn materialize(&mut self, value: &LoweredValue) -> LoweringResult<TensorRef> {
        value.materialize(&mut *self.net)
    }

    pub fn constant(&mut self, literal: TensorLiteral) -> LoweringResult<TensorRef> {
        self.add_layer(Layer::Constant { literal })
    }

    /// Converts `value` to `dtype`; constants convert at lowering time.
    pub fn cast(&mut self, value: &LoweredValue, dtype: DType) -> LoweringResult<LoweredValue> {
        if value.dtype() == dtype {
            return Ok(value.clone());
        }
        match value {
            LoweredValue::Constant(literal) => Ok(LoweredValue::Constant(literal.cast(dtype)?)),
            LoweredValue::Tensor(tensor) => {
                let out = self.add_layer(Layer::Cast {
                    input: tensor.id,
                    dtype,
                })?;
                Ok(out.into())
            }
        }
    }

    /// A 1-D `int32` view of an integer operand, as shape tensors require.
    pub fn shape_vector(&mut self, value: &LoweredValue) -> LoweringResult<LoweredValue> {
        if let Ok(literal) = value.as_constant() {
            return Ok(TensorLiteral::int_vector(&literal.to_i64s()?)?.into());
        }
        let value = self.cast(value, DType::Si32)?;
        match value.rank() {
            1 => Ok(value),
            0 => self.reshape_static(&value, &[1]),
            rank => Err(LoweringError::invalid(format!(
                "shape operand must be a scalar or vector, found rank {rank}"
            ))),
        }
    }

    /// Reshapes `value` to literal dims; a single `-1` is inferred.
    pub fn reshape_static(
        &mut self,
        value: &LoweredValue,
        dims: &[i64],
    ) -> LoweringResult<LoweredValue> {
        if let (Ok(literal), Some(fixed)) = (
            value.as_constant(),
            dims.iter()
                .map(|&dim| usize::try_from(dim).ok().filter(|&d| d > 0))
                .collect::<Option<Vec<usize>>>(),
        ) {
            if Shape::from_static(&fixed).element_count() == Some(literal.element_count()) {
                return Ok(literal.reshaped(&fixed)?.into());
            }
        }
        let input = self.materialize(value)?;
        if input.spec.shape.dims().len() == dims.len()
            && input
                .spec
                .shape
                .dims()
                .iter()
                .zip(dims)
                .all(|(dim, &target)| dim.as_static() == usize::try_from(target).ok())
        {
            return Ok(input.into());
        }
        let out = self.add_layer(Layer::Shuffle {
            input: input.id,
            first_transpose: None,
            reshape: Some(LayerParam::Static(dims.to_vec())),
            zero_is_placeholder: false,
        })?;
        Ok(out.into())
    }

    /// Reshapes `value` to the dims held by `shape`, which may be a runtime tensor.
    ///
    /// The data operand is always promoted to a tensor, so weights are accepted.
    pub fn reshape(
        &mut self,
        value: &LoweredValue,
        shape: &LoweredValue,
    ) -> LoweringResult<LoweredValue> {
        match shape.as_ints() {
            Ok(dims) => {
                trace!(?dims, "static reshape");
                let input = self.materialize(value)?;
                self.reshape_static(&input.into(), &dims)
            }
            Err(LoweringError::NotConstant) => {
                trace!("dynamic reshape");
                let input = self.materialize(value)?;
                let dims = self.shape_vector(shape)?;
                let dims = self.materialize(&dims)?;
                let out = self.add_layer(Layer::Shuffle {
                    input: input.id,
                    first_transpose: None,
                    reshape: Some(LayerParam::Runtime(dims.id)),
                    zero_is_placeholder: false,
                })?;
                Ok(out.into())
            }
            Err(err) => Err(err),
        }
    }

    pub fn transpose(
        &mut self,
        value: &LoweredValue,
        perm: Vec<usize>,
    ) -> LoweringResult<LoweredValue> {
        let input = self.materialize(value)?;
        let out = self.add_layer(Layer::Shuffle {
            input: input.id,
            first_transpose: Some(perm),
            reshape: None,
            zero_is_placeholder: false,
        })?;
        Ok(out.into())
    }
}
