//! Reference evaluator for recorded networks.
//!
//! Every element is held as `f64`, which is exact for the integer ranges
//! shape arithmetic deals in. Integer dtypes truncate after each op.

use std::collections::BTreeMap;

use super::infer::floor_div;
use super::layer::{
    ActivationKind, ElementwiseOp, GatherMode, Layer, LayerParam, ReduceOp, SampleMode, TensorId,
    UnaryOp,
};
use super::network::Network;
use crate::error::{LoweringError, LoweringResult};
use crate::tensor::{DType, TensorLiteral};

/// Dense host tensor with row-major layout.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub dtype: DType,
    pub dims: Vec<usize>,
    pub data: Vec<f64>,
}

impl HostTensor {
    pub fn new(dtype: DType, dims: Vec<usize>, data: Vec<f64>) -> LoweringResult<Self> {
        let count: usize = dims.iter().product();
        if count != data.len() {
            return Err(fail(format!(
                "host tensor with dims {dims:?} needs {count} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { dtype, dims, data })
    }

    pub fn from_i64s(dtype: DType, dims: Vec<usize>, values: &[i64]) -> LoweringResult<Self> {
        Self::new(dtype, dims, values.iter().map(|&v| v as f64).collect())
    }

    pub fn from_literal(literal: &TensorLiteral) -> LoweringResult<Self> {
        let dims = literal
            .shape()
            .static_dims()
            .ok_or_else(|| fail("literal shape must be static"))?;
        Self::new(literal.dtype(), dims, literal.to_f64s())
    }

    pub fn to_i64s(&self) -> Vec<i64> {
        self.data.iter().map(|&v| v as i64).collect()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

fn fail(message: impl Into<String>) -> LoweringError {
    LoweringError::target(message)
}

/// Runs `network` on named inputs and returns its named outputs.
pub fn evaluate(
    network: &Network,
    inputs: &BTreeMap<String, HostTensor>,
) -> LoweringResult<BTreeMap<String, HostTensor>> {
    let mut values: Vec<Option<HostTensor>> = vec![None; network.tensor_count()];
    for (name, id) in network.inputs() {
        let tensor = inputs
            .get(name)
            .ok_or_else(|| fail(format!("missing value for network input '{name}'")))?;
        let spec = network
            .spec(*id)
            .ok_or_else(|| fail(format!("unknown tensor {id}")))?;
        if spec.rank() != tensor.dims.len() {
            return Err(fail(format!(
                "input '{name}' has rank {}, network expects {spec}",
                tensor.dims.len()
            )));
        }
        for (dim, &extent) in spec.shape.dims().iter().zip(&tensor.dims) {
            if dim.as_static().is_some_and(|expected| expected != extent) {
                return Err(fail(format!("input '{name}' dims {:?} do not fit {spec}", tensor.dims)));
            }
        }
        values[id.0 as usize] = Some(HostTensor {
            dtype: spec.dtype,
            ..tensor.clone()
        });
    }

    for recorded in network.layers() {
        let result = eval_layer(&recorded.layer, &values)?;
        let out = recorded
            .outputs
            .first()
            .ok_or_else(|| fail("layer defines no outputs"))?;
        values[out.0 as usize] = Some(result);
    }

    let mut outputs = BTreeMap::new();
    for (name, id) in network.outputs() {
        let value = values[id.0 as usize]
            .clone()
            .ok_or_else(|| fail(format!("output '{name}' was never computed")))?;
        outputs.insert(name.clone(), value);
    }
    Ok(outputs)
}

fn get(values: &[Option<HostTensor>], id: TensorId) -> LoweringResult<&HostTensor> {
    values
        .get(id.0 as usize)
        .and_then(Option::as_ref)
        .ok_or_else(|| fail(format!("tensor {id} read before it was computed")))
}

fn param(values: &[Option<HostTensor>], param: &LayerParam) -> LoweringResult<Vec<i64>> {
    match param {
        LayerParam::Static(items) => Ok(items.clone()),
        LayerParam::Runtime(id) => Ok(get(values, *id)?.to_i64s()),
    }
}

fn strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}

fn unravel(mut flat: usize, dims: &[usize]) -> Vec<usize> {
    let mut index = vec![0usize; dims.len()];
    for axis in (0..dims.len()).rev() {
        if dims[axis] > 0 {
            index[axis] = flat % dims[axis];
            flat /= dims[axis];
        }
    }
    index
}

fn ravel(index: &[usize], dims: &[usize]) -> usize {
    index
        .iter()
        .zip(strides(dims))
        .map(|(&i, stride)| i * stride)
        .sum()
}

/// Flat offset into `dims` for an output coordinate, broadcasting size-1 axes.
fn broadcast_offset(index: &[usize], dims: &[usize]) -> usize {
    let clipped: Vec<usize> = index
        .iter()
        .zip(dims)
        .map(|(&i, &dim)| if dim == 1 { 0 } else { i })
        .collect();
    ravel(&clipped, dims)
}

fn broadcast_shape(shapes: &[&[usize]]) -> LoweringResult<Vec<usize>> {
    let rank = shapes[0].len();
    let mut out = vec![1usize; rank];
    for dims in shapes {
        if dims.len() != rank {
            return Err(fail("broadcast operands must share a rank"));
        }
        for (slot, &dim) in out.iter_mut().zip(dims.iter()) {
            if *slot == 1 {
                *slot = dim;
            } else if dim != 1 && dim != *slot {
                return Err(fail(format!("cannot broadcast extents {slot} and {dim}")));
            }
        }
    }
    Ok(out)
}

fn normalize_int(dtype: DType, value: f64) -> f64 {
    match dtype {
        DType::I1 => f64::from(u8::from(value != 0.0)),
        DType::Si32 | DType::Si64 => value.trunc(),
        DType::F16 | DType::F32 | DType::F64 => value,
    }
}

fn binary(op: ElementwiseOp, dtype: DType, x: f64, y: f64) -> LoweringResult<f64> {
    let integer = !dtype.is_float();
    let value = match op {
        ElementwiseOp::Sum => x + y,
        ElementwiseOp::Sub => x - y,
        ElementwiseOp::Prod => x * y,
        ElementwiseOp::Div if integer => {
            if y == 0.0 {
                return Err(fail("integer division by zero"));
            }
            (x / y).trunc()
        }
        ElementwiseOp::Div => x / y,
        ElementwiseOp::FloorDiv if integer => floor_div(x as i64, y as i64)
            .ok_or_else(|| fail("integer division by zero"))? as f64,
        ElementwiseOp::FloorDiv => (x / y).floor(),
        ElementwiseOp::Min => x.min(y),
        ElementwiseOp::Max => x.max(y),
        ElementwiseOp::Pow => x.powf(y),
        ElementwiseOp::Less => f64::from(u8::from(x < y)),
        ElementwiseOp::Greater => f64::from(u8::from(x > y)),
        ElementwiseOp::Equal => f64::from(u8::from(x == y)),
        ElementwiseOp::And => f64::from(u8::from(x != 0.0 && y != 0.0)),
        ElementwiseOp::Or => f64::from(u8::from(x != 0.0 || y != 0.0)),
    };
    let out_dtype = if op.produces_bool() { DType::I1 } else { dtype };
    Ok(normalize_int(out_dtype, value))
}

/// Abramowitz and Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}

fn reduce_groups(
    dims: &[usize],
    axes: u32,
) -> (Vec<usize>, impl Fn(&[usize]) -> Vec<usize> + '_) {
    let kept: Vec<usize> = dims
        .iter()
        .enumerate()
        .map(|(axis, &dim)| if axes & (1 << axis) != 0 { 1 } else { dim })
        .collect();
    let project = move |index: &[usize]| -> Vec<usize> {
        index
            .iter()
            .enumerate()
            .map(|(axis, &i)| if axes & (1 << axis) != 0 { 0 } else { i })
            .collect()
    };
    (kept, project)
}

fn eval_layer(layer: &Layer, values: &[Option<HostTensor>]) -> LoweringResult<HostTensor> {
    match layer {
        Layer::Constant { literal } => HostTensor::from_literal(literal),
        Layer::ElementwiseBinary { op, lhs, rhs } => {
            let a = get(values, *lhs)?;
            let b = get(values, *rhs)?;
            let dims = broadcast_shape(&[&a.dims, &b.dims])?;
            let count: usize = dims.iter().product();
            let mut data = Vec::with_capacity(count);
            for flat in 0..count {
                let index = unravel(flat, &dims);
                let x = a.data[broadcast_offset(&index, &a.dims)];
                let y = b.data[broadcast_offset(&index, &b.dims)];
                data.push(binary(*op, a.dtype, x, y)?);
            }
            let dtype = if op.produces_bool() { DType::I1 } else { a.dtype };
            HostTensor::new(dtype, dims, data)
        }
        Layer::Unary { op, input } => {
            let x = get(values, *input)?;
            let data = x
                .data
                .iter()
                .map(|&v| {
                    let value = match op {
                        UnaryOp::Exp => v.exp(),
                        UnaryOp::Log => v.ln(),
                        UnaryOp::Sqrt => v.sqrt(),
                        UnaryOp::Abs => v.abs(),
                        UnaryOp::Neg => -v,
                        UnaryOp::Erf => erf(v),
                        UnaryOp::Floor => v.floor(),
                        UnaryOp::Not => f64::from(u8::from(v == 0.0)),
                    };
                    normalize_int(x.dtype, value)
                })
                .collect();
            HostTensor::new(x.dtype, x.dims.clone(), data)
        }
        Layer::Activation {
            kind,
            input,
            alpha,
            beta,
        } => {
            let x = get(values, *input)?;
            let data = x
                .data
                .iter()
                .map(|&v| match kind {
                    ActivationKind::Relu => v.max(0.0),
                    ActivationKind::Tanh => v.tanh(),
                    ActivationKind::Sigmoid => 1.0 / (1.0 + (-v).exp()),
                    ActivationKind::HardSigmoid => (alpha * v + beta).clamp(0.0, 1.0),
                    ActivationKind::Clip => v.min(*beta).max(*alpha),
                    ActivationKind::Softplus => alpha * (1.0 + (beta * v).exp()).ln(),
                })
                .collect();
            HostTensor::new(x.dtype, x.dims.clone(), data)
        }
        Layer::Reduce {
            op,
            input,
            axes,
            keep_dims,
        } => {
            let x = get(values, *input)?;
            let (kept, project) = reduce_groups(&x.dims, *axes);
            let count: usize = kept.iter().product();
            let init = match op {
                ReduceOp::Sum => 0.0,
                ReduceOp::Prod => 1.0,
                ReduceOp::Max => f64::NEG_INFINITY,
                ReduceOp::Min => f64::INFINITY,
            };
            let mut data = vec![init; count];
            for (flat, &v) in x.data.iter().enumerate() {
                let slot = ravel(&project(&unravel(flat, &x.dims)), &kept);
                data[slot] = match op {
                    ReduceOp::Sum => data[slot] + v,
                    ReduceOp::Prod => data[slot] * v,
                    ReduceOp::Max => data[slot].max(v),
                    ReduceOp::Min => data[slot].min(v),
                };
            }
            let dims = if *keep_dims {
                kept
            } else {
                x.dims
                    .iter()
                    .enumerate()
                    .filter(|(axis, _)| axes & (1 << axis) == 0)
                    .map(|(_, &dim)| dim)
                    .collect()
            };
            HostTensor::new(x.dtype, dims, data)
        }
        Layer::Shape { input } => {
            let x = get(values, *input)?;
            HostTensor::new(
                DType::Si32,
                vec![x.dims.len()],
                x.dims.iter().map(|&dim| dim as f64).collect(),
            )
        }
        Layer::Slice {
            input,
            start,
            size,
            stride,
            mode,
        } => {
            let x = get(values, *input)?;
            let start = param(values, start)?;
            let size = param(values, size)?;
            let stride = param(values, stride)?;
            let rank = x.dims.len();
            if start.len() != rank || size.len() != rank || stride.len() != rank {
                return Err(fail("slice parameters must match input rank"));
            }
            let dims: Vec<usize> = size
                .iter()
                .map(|&extent| usize::try_from(extent).map_err(|_| fail("negative slice size")))
                .collect::<LoweringResult<_>>()?;
            let count: usize = dims.iter().product();
            let mut data = Vec::with_capacity(count);
            for flat in 0..count {
                let out_index = unravel(flat, &dims);
                let mut in_index = Vec::with_capacity(rank);
                for axis in 0..rank {
                    let extent = x.dims[axis] as i64;
                    let pos = start[axis] + out_index[axis] as i64 * stride[axis];
                    let pos = match mode {
                        SampleMode::Strict if (0..extent).contains(&pos) => pos,
                        SampleMode::Strict => {
                            return Err(fail(format!(
                                "slice index {pos} out of bounds for extent {extent}"
                            )))
                        }
                        SampleMode::Wrap if extent > 0 => pos.rem_euclid(extent),
                        SampleMode::Clamp if extent > 0 => pos.clamp(0, extent - 1),
                        _ => return Err(fail("slice samples an empty axis")),
                    };
                    in_index.push(pos as usize);
                }
                data.push(x.data[ravel(&in_index, &x.dims)]);
            }
            HostTensor::new(x.dtype, dims, data)
        }
        Layer::Concat { inputs, axis } => {
            let parts: Vec<&HostTensor> = inputs
                .iter()
                .map(|id| get(values, *id))
                .collect::<LoweringResult<_>>()?;
            let first = parts.first().ok_or_else(|| fail("concat without inputs"))?;
            let mut dims = first.dims.clone();
            dims[*axis] = parts.iter().map(|part| part.dims[*axis]).sum();
            let count: usize = dims.iter().product();
            let mut data = Vec::with_capacity(count);
            for flat in 0..count {
                let mut index = unravel(flat, &dims);
                let mut part_idx = 0;
                while index[*axis] >= parts[part_idx].dims[*axis] {
                    index[*axis] -= parts[part_idx].dims[*axis];
                    part_idx += 1;
                }
                let part = parts[part_idx];
                data.push(part.data[ravel(&index, &part.dims)]);
            }
            HostTensor::new(first.dtype, dims, data)
        }
        Layer::Gather {
            data: source,
            indices,
            axis,
            mode,
        } => {
            let x = get(values, *source)?;
            let idx = get(values, *indices)?;
            match mode {
                GatherMode::Default => {
                    let mut dims = x.dims[..*axis].to_vec();
                    dims.extend_from_slice(&idx.dims);
                    dims.extend_from_slice(&x.dims[axis + 1..]);
                    let count: usize = dims.iter().product();
                    let mut data = Vec::with_capacity(count);
                    let idx_rank = idx.dims.len();
                    for flat in 0..count {
                        let out_index = unravel(flat, &dims);
                        let pick_at = ravel(&out_index[*axis..axis + idx_rank], &idx.dims);
                        let pick = idx.data[pick_at] as i64;
                        if !(0..x.dims[*axis] as i64).contains(&pick) {
                            return Err(fail(format!("gather index {pick} out of bounds")));
                        }
                        let mut in_index = out_index[..*axis].to_vec();
                        in_index.push(pick as usize);
                        in_index.extend_from_slice(&out_index[axis + idx_rank..]);
                        data.push(x.data[ravel(&in_index, &x.dims)]);
                    }
                    HostTensor::new(x.dtype, dims, data)
                }
                GatherMode::Nd => {
                    let depth = *idx.dims.last().ok_or_else(|| fail("gather_nd needs indices"))?;
                    let batch = &idx.dims[..idx.dims.len() - 1];
                    let mut dims = batch.to_vec();
                    dims.extend_from_slice(&x.dims[depth..]);
                    let count: usize = dims.iter().product();
                    let mut data = Vec::with_capacity(count);
                    for flat in 0..count {
                        let out_index = unravel(flat, &dims);
                        let tuple_at = ravel(&out_index[..batch.len()], batch) * depth;
                        let mut in_index = Vec::with_capacity(x.dims.len());
                        for k in 0..depth {
                            let coord = idx.data[tuple_at + k] as i64;
                            if !(0..x.dims[k] as i64).contains(&coord) {
                                return Err(fail(format!("gather_nd index {coord} out of bounds")));
                            }
                            in_index.push(coord as usize);
                        }
                        in_index.extend_from_slice(&out_index[batch.len()..]);
                        data.push(x.data[ravel(&in_index, &x.dims)]);
                    }
                    HostTensor::new(x.dtype, dims, data)
                }
            }
        }
        Layer::Shuffle {
            input,
            first_transpose,
            reshape,
            zero_is_placeholder,
        } => {
            let x = get(values, *input)?;
            let mut current = x.clone();
            if let Some(perm) = first_transpose {
                let dims: Vec<usize> = perm.iter().map(|&axis| x.dims[axis]).collect();
                let mut data = Vec::with_capacity(x.len());
                for flat in 0..x.len() {
                    let out_index = unravel(flat, &dims);
                    let mut in_index = vec![0usize; dims.len()];
                    for (pos, &axis) in perm.iter().enumerate() {
                        in_index[axis] = out_index[pos];
                    }
                    data.push(x.data[ravel(&in_index, &x.dims)]);
                }
                current = HostTensor::new(x.dtype, dims, data)?;
            }
            if let Some(target) = reshape {
                let target = param(values, target)?;
                let mut dims = Vec::with_capacity(target.len());
                let mut infer_at = None;
                for (pos, &value) in target.iter().enumerate() {
                    match value {
                        0 if *zero_is_placeholder => dims.push(
                            *current
                                .dims
                                .get(pos)
                                .ok_or_else(|| fail("reshape placeholder out of range"))?,
                        ),
                        -1 => {
                            infer_at = Some(pos);
                            dims.push(1);
                        }
                        v if v < 0 => return Err(fail(format!("reshape dim {v} is negative"))),
                        v => dims.push(v as usize),
                    }
                }
                if let Some(pos) = infer_at {
                    let rest: usize = dims.iter().product();
                    if rest == 0 || current.len() % rest != 0 {
                        return Err(fail("cannot infer reshape extent"));
                    }
                    dims[pos] = current.len() / rest;
                }
                current = HostTensor::new(current.dtype, dims, current.data)?;
            }
            Ok(current)
        }
        Layer::Select {
            condition,
            then_value,
            else_value,
        } => {
            let c = get(values, *condition)?;
            let a = get(values, *then_value)?;
            let b = get(values, *else_value)?;
            let dims = broadcast_shape(&[&c.dims, &a.dims, &b.dims])?;
            let count: usize = dims.iter().product();
            let data = (0..count)
                .map(|flat| {
                    let index = unravel(flat, &dims);
                    if c.data[broadcast_offset(&index, &c.dims)] != 0.0 {
                        a.data[broadcast_offset(&index, &a.dims)]
                    } else {
                        b.data[broadcast_offset(&index, &b.dims)]
                    }
                })
                .collect();
            HostTensor::new(a.dtype, dims, data)
        }
        Layer::Arange {
            count,
            start,
            step,
            dtype,
        } => {
            let scalar = |p: &LayerParam| -> LoweringResult<f64> {
                match p {
                    LayerParam::Static(items) if items.len() == 1 => Ok(items[0] as f64),
                    LayerParam::Runtime(id) => {
                        let t = get(values, *id)?;
                        t.data.first().copied().ok_or_else(|| fail("empty arange parameter"))
                    }
                    LayerParam::Static(_) => Err(fail("arange parameter must be a scalar")),
                }
            };
            let n = scalar(count)?;
            if n < 0.0 {
                return Err(fail("arange count is negative"));
            }
            let first = scalar(start)?;
            let delta = scalar(step)?;
            let n = n as usize;
            let data = (0..n)
                .map(|i| normalize_int(*dtype, first + i as f64 * delta))
                .collect();
            HostTensor::new(*dtype, vec![n], data)
        }
        Layer::Cast { input, dtype } => {
            let x = get(values, *input)?;
            let data = x.data.iter().map(|&v| normalize_int(*dtype, v)).collect();
            HostTensor::new(*dtype, x.dims.clone(), data)
        }
        Layer::Softmax { input, axes } => {
            let x = get(values, *input)?;
            let (kept, project) = reduce_groups(&x.dims, *axes);
            let groups: usize = kept.iter().product();
            let mut max = vec![f64::NEG_INFINITY; groups];
            let slots: Vec<usize> = (0..x.len())
                .map(|flat| ravel(&project(&unravel(flat, &x.dims)), &kept))
                .collect();
            for (flat, &slot) in slots.iter().enumerate() {
                max[slot] = max[slot].max(x.data[flat]);
            }
            let exps: Vec<f64> = slots
                .iter()
                .enumerate()
                .map(|(flat, &slot)| (x.data[flat] - max[slot]).exp())
                .collect();
            let mut sums = vec![0.0; groups];
            for (flat, &slot) in slots.iter().enumerate() {
                sums[slot] += exps[flat];
            }
            let data = slots
                .iter()
                .enumerate()
                .map(|(flat, &slot)| exps[flat] / sums[slot])
                .collect();
            HostTensor::new(x.dtype, x.dims.clone(), data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erf_matches_known_points() {
        assert!(erf(0.0).abs() < 1e-7);
        assert!((erf(1.0) - 0.842_700_79).abs() < 1e-6);
        assert!((erf(-1.0) + 0.842_700_79).abs() < 1e-6);
    }

    #[test]
    fn unravel_inverts_ravel() {
        let dims = [2, 3, 4];
        for flat in 0..24 {
            assert_eq!(ravel(&unravel(flat, &dims), &dims), flat);
        }
    }
}
