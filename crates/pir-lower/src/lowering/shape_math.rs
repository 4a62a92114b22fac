//! Shape arithmetic over values that may be literals or runtime tensors.
//!
//! Every primitive returns a literal when all of its operands are literals
//! and a tensor otherwise, so routines run one code path for static and
//! dynamic shapes. Shape quantities are 1-D `int32` vectors.

use tracing::trace;

use super::context::LowerCtx;
use super::value::LoweredValue;
use crate::error::{LoweringError, LoweringResult};
use crate::target::infer::{floor_div, fold_binary};
use crate::target::{ElementwiseOp, Layer, LayerParam, ReduceOp, SampleMode, TensorId};
use crate::tensor::{DType, Dimension, TensorLiteral};

/// `axis + rank` for negative axes, `axis` otherwise.
pub fn normalize_axis(axis: i64, rank: usize) -> i64 {
    if axis < 0 {
        axis + rank as i64
    } else {
        axis
    }
}

/// Normalizes `axis` and checks it against `rank`.
pub fn checked_axis(axis: i64, rank: usize) -> LoweringResult<usize> {
    let normalized = normalize_axis(axis, rank);
    if (0..rank as i64).contains(&normalized) {
        Ok(normalized as usize)
    } else {
        Err(LoweringError::invalid(format!(
            "axis {axis} out of range for rank {rank}"
        )))
    }
}

/// Integer division rounding toward negative infinity; `None` on division by zero.
pub fn floor_div_i64(lhs: i64, rhs: i64) -> Option<i64> {
    floor_div(lhs, rhs)
}

fn broadcast_len(lhs: usize, rhs: usize) -> LoweringResult<usize> {
    match (lhs, rhs) {
        (a, b) if a == b => Ok(a),
        (1, b) => Ok(b),
        (a, 1) => Ok(a),
        (a, b) => Err(LoweringError::invalid(format!(
            "shape vectors of length {a} and {b} do not broadcast"
        ))),
    }
}

fn pick<T: Copy>(values: &[T], idx: usize) -> T {
    if values.len() == 1 {
        values[0]
    } else {
        values[idx]
    }
}

impl LowerCtx<'_> {
    pub fn int_const(&self, values: &[i64]) -> LoweringResult<LoweredValue> {
        Ok(TensorLiteral::int_vector(values)?.into())
    }

    /// Shape of `value` as a vector; literal whenever every extent is static.
    pub fn shape_of(&mut self, value: &LoweredValue) -> LoweringResult<LoweredValue> {
        if let Some(dims) = value.shape().static_dims() {
            let dims: Vec<i64> = dims.iter().map(|&dim| dim as i64).collect();
            return self.int_const(&dims);
        }
        let input = self.materialize(value)?;
        Ok(self.add_layer(Layer::Shape { input: input.id })?.into())
    }

    /// Extent of `axis` as a one-element vector.
    pub fn dim_size(&mut self, value: &LoweredValue, axis: usize) -> LoweringResult<LoweredValue> {
        match value.dim(axis) {
            Some(Dimension::Static(extent)) => self.int_const(&[extent as i64]),
            Some(Dimension::Dynamic) => {
                let shape = self.shape_of(value)?;
                self.gather_element(&shape, axis)
            }
            None => Err(LoweringError::invalid(format!(
                "axis {axis} out of range for rank {}",
                value.rank()
            ))),
        }
    }

    /// Per-axis extents, `None` where dynamic.
    pub fn dims_of(&self, value: &LoweredValue) -> Vec<Option<i64>> {
        value
            .shape()
            .dims()
            .iter()
            .map(|dim| dim.as_static().map(|extent| extent as i64))
            .collect()
    }

    fn int_operand(&mut self, value: &LoweredValue) -> LoweringResult<TensorId> {
        let vector = if value.dtype() == DType::I1 {
            value.clone()
        } else {
            self.shape_vector(value)?
        };
        Ok(self.materialize(&vector)?.id)
    }

    fn binary(
        &mut self,
        op: ElementwiseOp,
        lhs: &LoweredValue,
        rhs: &LoweredValue,
    ) -> LoweringResult<LoweredValue> {
        if let (Ok(a), Ok(b)) = (lhs.as_ints(), rhs.as_ints()) {
            let len = broadcast_len(a.len(), b.len())?;
            let values = (0..len)
                .map(|idx| {
                    let (x, y) = (pick(&a, idx), pick(&b, idx));
                    fold_binary(op, x, y).ok_or_else(|| {
                        LoweringError::invalid(format!("cannot fold {op:?} on {x} and {y}"))
                    })
                })
                .collect::<LoweringResult<Vec<i64>>>()?;
            let literal = if op.produces_bool() {
                TensorLiteral::from_i64s(DType::I1, &[len], &values)?
            } else {
                TensorLiteral::int_vector(&values)?
            };
            return Ok(literal.into());
        }
        let lhs = self.int_operand(lhs)?;
        let rhs = self.int_operand(rhs)?;
        Ok(self
            .add_layer(Layer::ElementwiseBinary { op, lhs, rhs })?
            .into())
    }

    pub fn sum(&mut self, lhs: &LoweredValue, rhs: &LoweredValue) -> LoweringResult<LoweredValue> {
        self.binary(ElementwiseOp::Sum, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: &LoweredValue, rhs: &LoweredValue) -> LoweringResult<LoweredValue> {
        self.binary(ElementwiseOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: &LoweredValue, rhs: &LoweredValue) -> LoweringResult<LoweredValue> {
        self.binary(ElementwiseOp::Prod, lhs, rhs)
    }

    pub fn floor_div(
        &mut self,
        lhs: &LoweredValue,
        rhs: &LoweredValue,
    ) -> LoweringResult<LoweredValue> {
        self.binary(ElementwiseOp::FloorDiv, lhs, rhs)
    }

    pub fn min(&mut self, lhs: &LoweredValue, rhs: &LoweredValue) -> LoweringResult<LoweredValue> {
        self.binary(ElementwiseOp::Min, lhs, rhs)
    }

    pub fn max(&mut self, lhs: &LoweredValue, rhs: &LoweredValue) -> LoweringResult<LoweredValue> {
        self.binary(ElementwiseOp::Max, lhs, rhs)
    }

    pub fn less_than(
        &mut self,
        lhs: &LoweredValue,
        rhs: &LoweredValue,
    ) -> LoweringResult<LoweredValue> {
        self.binary(ElementwiseOp::Less, lhs, rhs)
    }

    pub fn equal(&mut self, lhs: &LoweredValue, rhs: &LoweredValue) -> LoweringResult<LoweredValue> {
        self.binary(ElementwiseOp::Equal, lhs, rhs)
    }

    pub fn cast_bool_to_int(&mut self, value: &LoweredValue) -> LoweringResult<LoweredValue> {
        self.cast(value, DType::Si32)
    }

    /// `index + (index < 0) * dim`, elementwise.
    ///
    /// A literal index is resolved now: non-negative entries are kept and
    /// negative ones are added to `dim`, even when `dim` is a tensor.
    pub fn normalize_index(
        &mut self,
        index: &LoweredValue,
        dim: &LoweredValue,
    ) -> LoweringResult<LoweredValue> {
        if let Ok(values) = index.as_ints() {
            if values.iter().all(|&value| value >= 0) {
                return self.shape_vector(index);
            }
            if values.iter().all(|&value| value < 0) {
                return self.sum(index, dim);
            }
        }
        let zero = self.int_const(&[0])?;
        let negative = self.less_than(index, &zero)?;
        let negative = self.cast_bool_to_int(&negative)?;
        let offset = self.mul(&negative, dim)?;
        self.sum(index, &offset)
    }

    /// `max(lower, min(value, upper))`, elementwise.
    pub fn clamp(
        &mut self,
        value: &LoweredValue,
        lower: &LoweredValue,
        upper: &LoweredValue,
    ) -> LoweringResult<LoweredValue> {
        let capped = self.min(value, upper)?;
        self.max(&capped, lower)
    }

    pub fn select(
        &mut self,
        condition: &LoweredValue,
        then_value: &LoweredValue,
        else_value: &LoweredValue,
    ) -> LoweringResult<LoweredValue> {
        if let (Ok(flags), Ok(a), Ok(b)) = (
            condition.as_ints(),
            then_value.as_ints(),
            else_value.as_ints(),
        ) {
            let len = broadcast_len(flags.len(), broadcast_len(a.len(), b.len())?)?;
            let values: Vec<i64> = (0..len)
                .map(|idx| {
                    if pick(&flags, idx) != 0 {
                        pick(&a, idx)
                    } else {
                        pick(&b, idx)
                    }
                })
                .collect();
            return self.int_const(&values);
        }
        let condition = self.materialize(condition)?;
        let then_value = self.int_operand(then_value)?;
        let else_value = self.int_operand(else_value)?;
        Ok(self
            .add_layer(Layer::Select {
                condition: condition.id,
                then_value,
                else_value,
            })?
            .into())
    }

    /// Concatenates shape vectors; empty parts are skipped.
    pub fn concat(&mut self, parts: &[LoweredValue]) -> LoweringResult<LoweredValue> {
        let parts: Vec<&LoweredValue> = parts
            .iter()
            .filter(|part| part.shape().element_count() != Some(0))
            .collect();
        let literal: Result<Vec<Vec<i64>>, _> = parts.iter().map(|part| part.as_ints()).collect();
        if let Ok(pieces) = literal {
            return self.int_const(&pieces.concat());
        }
        if parts.len() == 1 {
            return self.shape_vector(parts[0]);
        }
        let mut inputs = Vec::with_capacity(parts.len());
        for part in parts {
            inputs.push(self.int_operand(part)?);
        }
        Ok(self.add_layer(Layer::Concat { inputs, axis: 0 })?.into())
    }

    /// `vector[index]` as a one-element vector.
    pub fn gather_element(
        &mut self,
        vector: &LoweredValue,
        index: usize,
    ) -> LoweringResult<LoweredValue> {
        let indices = self.int_const(&[index as i64])?;
        self.gather(vector, &indices)
    }

    /// `vector[indices]` for 1-D vectors.
    pub fn gather(
        &mut self,
        vector: &LoweredValue,
        indices: &LoweredValue,
    ) -> LoweringResult<LoweredValue> {
        if let (Ok(values), Ok(picks)) = (vector.as_ints(), indices.as_ints()) {
            let picked = picks
                .iter()
                .map(|&idx| {
                    usize::try_from(idx)
                        .ok()
                        .and_then(|idx| values.get(idx).copied())
                        .ok_or_else(|| {
                            LoweringError::invalid(format!(
                                "index {idx} out of range for {} values",
                                values.len()
                            ))
                        })
                })
                .collect::<LoweringResult<Vec<i64>>>()?;
            return self.int_const(&picked);
        }
        let data = self.int_operand(vector)?;
        let indices = self.int_operand(indices)?;
        Ok(self
            .add_layer(Layer::Gather {
                data,
                indices,
                axis: 0,
                mode: Default::default(),
            })?
            .into())
    }

    /// `vector[start..start + len]`.
    pub fn slice_1d(
        &mut self,
        vector: &LoweredValue,
        start: usize,
        len: usize,
    ) -> LoweringResult<LoweredValue> {
        if let Ok(values) = vector.as_ints() {
            let piece = values.get(start..start + len).ok_or_else(|| {
                LoweringError::invalid(format!(
                    "range {start}..{} out of bounds for {} values",
                    start + len,
                    values.len()
                ))
            })?;
            return self.int_const(piece);
        }
        let input = self.int_operand(vector)?;
        Ok(self
            .add_layer(Layer::Slice {
                input,
                start: LayerParam::Static(vec![start as i64]),
                size: LayerParam::Static(vec![len as i64]),
                stride: LayerParam::Static(vec![1]),
                mode: SampleMode::Strict,
            })?
            .into())
    }

    /// Product of all entries as a one-element vector.
    pub fn reduce_prod(&mut self, vector: &LoweredValue) -> LoweringResult<LoweredValue> {
        if let Ok(values) = vector.as_ints() {
            let product = values
                .iter()
                .try_fold(1i64, |acc, &value| acc.checked_mul(value))
                .ok_or_else(|| LoweringError::invalid(format!("product of {values:?} overflows")))?;
            return self.int_const(&[product]);
        }
        if vector.shape().element_count() == Some(0) {
            return self.int_const(&[1]);
        }
        let input = self.int_operand(vector)?;
        Ok(self
            .add_layer(Layer::Reduce {
                op: ReduceOp::Prod,
                input,
                axes: 1,
                keep_dims: true,
            })?
            .into())
    }

    /// `[start, start + count)` as a vector.
    pub fn arange(
        &mut self,
        start: &LoweredValue,
        count: &LoweredValue,
    ) -> LoweringResult<LoweredValue> {
        if let (Ok(first), Ok(n)) = (start.as_scalar_int(), count.as_scalar_int()) {
            let values: Vec<i64> = (first..first + n.max(0)).collect();
            return self.int_const(&values);
        }
        let start = self.layer_param(start)?;
        let count = self.layer_param(count)?;
        Ok(self
            .add_layer(Layer::Arange {
                count,
                start,
                step: LayerParam::Static(vec![1]),
                dtype: DType::Si32,
            })?
            .into())
    }

    /// Literal vectors become static parameters, tensors runtime ones.
    pub fn layer_param(&mut self, value: &LoweredValue) -> LoweringResult<LayerParam> {
        match value.as_ints() {
            Ok(values) => Ok(LayerParam::Static(values)),
            Err(LoweringError::NotConstant) => {
                let vector = self.shape_vector(value)?;
                Ok(LayerParam::Runtime(self.materialize(&vector)?.id))
            }
            Err(err) => Err(err),
        }
    }

    /// Slice of a data tensor with start/size/stride given as shape vectors.
    pub fn slice(
        &mut self,
        value: &LoweredValue,
        start: &LoweredValue,
        size: &LoweredValue,
        stride: &LoweredValue,
        mode: SampleMode,
    ) -> LoweringResult<LoweredValue> {
        let input = self.materialize(value)?;
        let start = self.layer_param(start)?;
        let size = self.layer_param(size)?;
        let stride = self.layer_param(stride)?;
        Ok(self
            .add_layer(Layer::Slice {
                input: input.id,
                start,
                size,
                stride,
                mode,
            })?
            .into())
    }

    /// Left-pads the shape of `value` with unit extents up to `rank`.
    pub fn pad_rank(&mut self, value: &LoweredValue, rank: usize) -> LoweringResult<LoweredValue> {
        let current = value.rank();
        if current >= rank {
            return Ok(value.clone());
        }
        let pad = rank - current;
        if let Some(dims) = value.shape().static_dims() {
            let mut target = vec![1i64; pad];
            target.extend(dims.iter().map(|&dim| dim as i64));
            return self.reshape_static(value, &target);
        }
        let ones = self.int_const(&vec![1; pad])?;
        let shape = self.shape_of(value)?;
        let target = self.concat(&[ones, shape])?;
        self.reshape(value, &target)
    }

    /// Broadcasts `value` to `target_shape` after padding it to `target_rank`.
    ///
    /// Output extents are `max(input, target)`, so a `-1` target keeps the
    /// input extent. Unit input axes are read with stride 0.
    pub fn expand(
        &mut self,
        value: &LoweredValue,
        target_rank: usize,
        target_shape: &LoweredValue,
    ) -> LoweringResult<LoweredValue> {
        let value = self.pad_rank(value, target_rank)?;
        let input_shape = self.shape_of(&value)?;
        let target = self.shape_vector(target_shape)?;
        let sizes = self.max(&input_shape, &target)?;
        if let (Some(dims), Ok(out)) = (value.shape().static_dims(), sizes.as_ints()) {
            if dims.iter().map(|&dim| dim as i64).eq(out.iter().copied()) {
                return Ok(value);
            }
        }
        trace!(rank = target_rank, "expand via strided slice");
        let one = self.int_const(&[1])?;
        let extent_minus_one = self.sub(&input_shape, &one)?;
        let strides = self.min(&one, &extent_minus_one)?;
        let zeros = self.int_const(&vec![0; target_rank])?;
        self.slice(&value, &zeros, &sizes, &strides, SampleMode::Strict)
    }

    /// Aligns ranks by left-padding with unit extents, then expands both to the elementwise max.
    pub fn broadcast_pair(
        &mut self,
        lhs: &LoweredValue,
        rhs: &LoweredValue,
    ) -> LoweringResult<(LoweredValue, LoweredValue)> {
        let rank = lhs.rank().max(rhs.rank());
        let lhs = self.pad_rank(lhs, rank)?;
        let rhs = self.pad_rank(rhs, rank)?;
        let lhs_shape = self.shape_of(&lhs)?;
        let rhs_shape = self.shape_of(&rhs)?;
        let target = self.max(&lhs_shape, &rhs_shape)?;
        let lhs = self.expand(&lhs, rank, &target)?;
        let rhs = self.expand(&rhs, rank, &target)?;
        Ok((lhs, rhs))
    }

    /// Inserts a unit axis at `axis` (already normalized against `rank + 1`).
    pub fn insert_unit_dim(
        &mut self,
        value: &LoweredValue,
        axis: usize,
    ) -> LoweringResult<LoweredValue> {
        let rank = value.rank();
        if axis > rank {
            return Err(LoweringError::invalid(format!(
                "cannot insert axis {axis} into rank {rank}"
            )));
        }
        if let Some(dims) = value.shape().static_dims() {
            let mut target: Vec<i64> = dims.iter().map(|&dim| dim as i64).collect();
            target.insert(axis, 1);
            return self.reshape_static(value, &target);
        }
        let shape = self.shape_of(value)?;
        let prefix = self.slice_1d(&shape, 0, axis)?;
        let unit = self.int_const(&[1])?;
        let suffix = self.slice_1d(&shape, axis, rank - axis)?;
        let target = self.concat(&[prefix, unit, suffix])?;
        self.reshape(value, &target)
    }

    /// Removes the listed axes, which must have unit extent at runtime.
    pub fn drop_axes(
        &mut self,
        value: &LoweredValue,
        axes: &[usize],
    ) -> LoweringResult<LoweredValue> {
        let rank = value.rank();
        if let Some(&axis) = axes.iter().find(|&&axis| axis >= rank) {
            return Err(LoweringError::invalid(format!(
                "axis {axis} out of range for rank {rank}"
            )));
        }
        let kept: Vec<i64> = (0..rank)
            .filter(|axis| !axes.contains(axis))
            .map(|axis| axis as i64)
            .collect();
        if kept.len() == rank {
            return Ok(value.clone());
        }
        if kept.is_empty() {
            return self.reshape_static(value, &[]);
        }
        let shape = self.shape_of(value)?;
        let indices = self.int_const(&kept)?;
        let target = self.gather(&shape, &indices)?;
        self.reshape(value, &target)
    }
}
