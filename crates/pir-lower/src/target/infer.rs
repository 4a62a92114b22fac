//! Output shape inference for target layers.
//!
//! Besides dtype and shape, small 1-D integer tensors carry the values that
//! are known while the network is being built, element by element. This is
//! what keeps `[?, 9]` split three ways at `[?, 3]`: the shape vector of the
//! input knows its second entry even though the tensor itself is dynamic.

use super::layer::{ElementwiseOp, GatherMode, Layer, LayerParam, ReduceOp, TensorId, UnaryOp};
use crate::error::{LoweringError, LoweringResult};
use crate::tensor::{DType, Dimension, Shape, TensorSpec};

/// Tensors larger than this never carry known values.
pub(crate) const KNOWN_VALUE_LIMIT: usize = 128;

pub(crate) type Known = Vec<Option<i64>>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Inferred {
    pub spec: TensorSpec,
    pub known: Option<Known>,
}

impl Inferred {
    fn new(spec: TensorSpec) -> Self {
        Self { spec, known: None }
    }

    fn with_known(spec: TensorSpec, known: Option<Known>) -> Self {
        let known = known.filter(|values| {
            spec.rank() <= 1
                && !spec.dtype.is_float()
                && spec.shape.element_count() == Some(values.len())
                && values.len() <= KNOWN_VALUE_LIMIT
        });
        Self { spec, known }
    }
}

pub(crate) trait TensorLookup {
    fn spec_of(&self, id: TensorId) -> LoweringResult<&TensorSpec>;
    fn known_of(&self, id: TensorId) -> Option<&[Option<i64>]>;
}

fn fail(message: impl Into<String>) -> LoweringError {
    LoweringError::target(message)
}

/// Infers the outputs of `layer` from the specs and known values of its inputs.
pub(crate) fn infer_layer<L: TensorLookup + ?Sized>(
    lookup: &L,
    layer: &Layer,
) -> LoweringResult<Vec<Inferred>> {
    let inferred = match layer {
        Layer::Constant { literal } => {
            let known = if literal.dtype().is_float() {
                None
            } else {
                literal
                    .to_i64s()
                    .ok()
                    .map(|values| values.into_iter().map(Some).collect())
            };
            Inferred::with_known(literal.spec.clone(), known)
        }
        Layer::ElementwiseBinary { op, lhs, rhs } => {
            let lhs_spec = lookup.spec_of(*lhs)?;
            let rhs_spec = lookup.spec_of(*rhs)?;
            if lhs_spec.dtype != rhs_spec.dtype {
                return Err(fail(format!(
                    "elementwise {op:?} operands disagree on dtype: {} vs {}",
                    lhs_spec.dtype, rhs_spec.dtype
                )));
            }
            let dims = broadcast_dims(lhs_spec.shape.dims(), rhs_spec.shape.dims())?;
            let dtype = if op.produces_bool() {
                DType::I1
            } else {
                lhs_spec.dtype
            };
            let known = match (lookup.known_of(*lhs), lookup.known_of(*rhs)) {
                (Some(a), Some(b)) => zip_broadcast(a, b, |x, y| fold_binary(*op, x, y)),
                (Some(a), None) if *op == ElementwiseOp::Prod && is_all_zero(a) => {
                    known_len(&dims).map(|len| vec![Some(0); len])
                }
                (None, Some(b)) if *op == ElementwiseOp::Prod && is_all_zero(b) => {
                    known_len(&dims).map(|len| vec![Some(0); len])
                }
                _ => None,
            };
            Inferred::with_known(TensorSpec::new(dtype, Shape::new(dims)), known)
        }
        Layer::Unary { op, input } => {
            let spec = lookup.spec_of(*input)?.clone();
            if *op == UnaryOp::Not && spec.dtype != DType::I1 {
                return Err(fail("logical not requires a bool input"));
            }
            let known = lookup.known_of(*input).and_then(|values| match op {
                UnaryOp::Neg => Some(values.iter().map(|v| v.map(|v| -v)).collect()),
                UnaryOp::Abs => Some(values.iter().map(|v| v.map(i64::abs)).collect()),
                UnaryOp::Not => Some(values.iter().map(|v| v.map(|v| i64::from(v == 0))).collect()),
                _ => None,
            });
            Inferred::with_known(spec, known)
        }
        Layer::Activation { input, .. } | Layer::Softmax { input, .. } => {
            let spec = lookup.spec_of(*input)?;
            if !spec.dtype.is_float() {
                return Err(fail(format!("activation requires a float input, got {}", spec.dtype)));
            }
            Inferred::new(spec.clone())
        }
        Layer::Reduce {
            op,
            input,
            axes,
            keep_dims,
        } => {
            let spec = lookup.spec_of(*input)?;
            let rank = spec.rank();
            if rank < 32 && (*axes >> rank) != 0 {
                return Err(fail(format!("reduce axes {axes:#b} exceed rank {rank}")));
            }
            let mut dims = Vec::with_capacity(rank);
            for (axis, dim) in spec.shape.dims().iter().enumerate() {
                if axes & (1 << axis) == 0 {
                    dims.push(*dim);
                } else if *keep_dims {
                    dims.push(Dimension::Static(1));
                }
            }
            let known = match lookup.known_of(*input) {
                Some(values) if rank == 1 && *axes == 1 => Some(vec![fold_reduce(*op, values)]),
                _ => None,
            };
            Inferred::with_known(TensorSpec::new(spec.dtype, Shape::new(dims)), known)
        }
        Layer::Shape { input } => {
            let spec = lookup.spec_of(*input)?;
            let known = spec
                .shape
                .dims()
                .iter()
                .map(|dim| dim.as_static().map(|value| value as i64))
                .collect();
            Inferred::with_known(
                TensorSpec::new(DType::Si32, Shape::from_static(&[spec.rank()])),
                Some(known),
            )
        }
        Layer::Slice {
            input,
            start,
            size,
            stride,
            ..
        } => {
            let spec = lookup.spec_of(*input)?;
            let rank = spec.rank();
            let start_known = param_values(lookup, start, rank, "slice start")?;
            let size_known = param_values(lookup, size, rank, "slice size")?;
            let stride_known = param_values(lookup, stride, rank, "slice stride")?;
            let mut dims = Vec::with_capacity(rank);
            for value in &size_known {
                match value {
                    Some(extent) if *extent < 0 => {
                        return Err(fail(format!("slice size {extent} is negative")))
                    }
                    Some(extent) => dims.push(Dimension::Static(*extent as usize)),
                    None => dims.push(Dimension::Dynamic),
                }
            }
            let known = match (lookup.known_of(*input), rank) {
                (Some(values), 1) => slice_known(values, start_known[0], size_known[0], stride_known[0]),
                _ => None,
            };
            Inferred::with_known(TensorSpec::new(spec.dtype, Shape::new(dims)), known)
        }
        Layer::Concat { inputs, axis } => {
            let first = inputs
                .first()
                .ok_or_else(|| fail("concat needs at least one input"))?;
            let first_spec = lookup.spec_of(*first)?;
            let rank = first_spec.rank();
            if *axis >= rank {
                return Err(fail(format!("concat axis {axis} out of range for rank {rank}")));
            }
            let mut dims = first_spec.shape.dims().to_vec();
            let mut extent = Some(0usize);
            let mut known: Option<Known> = Some(Vec::new());
            for id in inputs {
                let spec = lookup.spec_of(*id)?;
                if spec.rank() != rank || spec.dtype != first_spec.dtype {
                    return Err(fail(format!(
                        "concat input {id} is {}, expected rank {rank} {}",
                        spec, first_spec.dtype
                    )));
                }
                for (idx, dim) in spec.shape.dims().iter().enumerate() {
                    if idx != *axis {
                        dims[idx] = merge_dim(dims[idx], *dim)?;
                    }
                }
                extent = match (extent, spec.shape.dims()[*axis].as_static()) {
                    (Some(total), Some(value)) => Some(total + value),
                    _ => None,
                };
                known = match (known, lookup.known_of(*id), spec.shape.element_count()) {
                    (Some(mut acc), Some(values), _) => {
                        acc.extend_from_slice(values);
                        Some(acc)
                    }
                    (Some(mut acc), None, Some(count)) => {
                        acc.extend(std::iter::repeat(None).take(count));
                        Some(acc)
                    }
                    _ => None,
                };
            }
            dims[*axis] = extent.map_or(Dimension::Dynamic, Dimension::Static);
            let known = known.filter(|values| values.iter().any(Option::is_some));
            Inferred::with_known(TensorSpec::new(first_spec.dtype, Shape::new(dims)), known)
        }
        Layer::Gather {
            data,
            indices,
            axis,
            mode,
        } => {
            let data_spec = lookup.spec_of(*data)?;
            let index_spec = lookup.spec_of(*indices)?;
            if !index_spec.dtype.is_integer() {
                return Err(fail(format!("gather indices must be integers, got {}", index_spec.dtype)));
            }
            match mode {
                GatherMode::Default => {
                    if *axis >= data_spec.rank() {
                        return Err(fail(format!(
                            "gather axis {axis} out of range for rank {}",
                            data_spec.rank()
                        )));
                    }
                    let data_dims = data_spec.shape.dims();
                    let mut dims = data_dims[..*axis].to_vec();
                    dims.extend_from_slice(index_spec.shape.dims());
                    dims.extend_from_slice(&data_dims[axis + 1..]);
                    let known = match (lookup.known_of(*data), lookup.known_of(*indices)) {
                        (Some(values), Some(picks)) if data_spec.rank() == 1 => Some(
                            picks
                                .iter()
                                .map(|pick| {
                                    pick.and_then(|idx| usize::try_from(idx).ok())
                                        .and_then(|idx| values.get(idx).copied().flatten())
                                })
                                .collect(),
                        ),
                        _ => None,
                    };
                    Inferred::with_known(TensorSpec::new(data_spec.dtype, Shape::new(dims)), known)
                }
                GatherMode::Nd => {
                    let index_dims = index_spec.shape.dims();
                    let depth = index_dims
                        .last()
                        .and_then(|dim| dim.as_static())
                        .ok_or_else(|| fail("gather_nd needs a static index depth"))?;
                    if depth > data_spec.rank() {
                        return Err(fail(format!(
                            "gather_nd index depth {depth} exceeds data rank {}",
                            data_spec.rank()
                        )));
                    }
                    let mut dims = index_dims[..index_dims.len() - 1].to_vec();
                    dims.extend_from_slice(&data_spec.shape.dims()[depth..]);
                    Inferred::new(TensorSpec::new(data_spec.dtype, Shape::new(dims)))
                }
            }
        }
        Layer::Shuffle {
            input,
            first_transpose,
            reshape,
            zero_is_placeholder,
        } => {
            let spec = lookup.spec_of(*input)?;
            let mut dims = spec.shape.dims().to_vec();
            if let Some(perm) = first_transpose {
                dims = permute(&dims, perm)?;
            }
            if let Some(param) = reshape {
                let targets: Known = match param {
                    LayerParam::Static(values) => values.iter().copied().map(Some).collect(),
                    LayerParam::Runtime(id) => runtime_vector(lookup, *id, "reshape dims")?,
                };
                dims = reshape_dims(&dims, &targets, *zero_is_placeholder)?;
            }
            let known = lookup
                .known_of(*input)
                .filter(|_| dims.len() <= 1)
                .map(<[Option<i64>]>::to_vec);
            Inferred::with_known(TensorSpec::new(spec.dtype, Shape::new(dims)), known)
        }
        Layer::Select {
            condition,
            then_value,
            else_value,
        } => {
            let cond_spec = lookup.spec_of(*condition)?;
            let then_spec = lookup.spec_of(*then_value)?;
            let else_spec = lookup.spec_of(*else_value)?;
            if cond_spec.dtype != DType::I1 {
                return Err(fail("select condition must be bool"));
            }
            if then_spec.dtype != else_spec.dtype {
                return Err(fail(format!(
                    "select branches disagree on dtype: {} vs {}",
                    then_spec.dtype, else_spec.dtype
                )));
            }
            let dims = broadcast_dims(then_spec.shape.dims(), else_spec.shape.dims())?;
            let dims = broadcast_dims(cond_spec.shape.dims(), &dims)?;
            let known = match (
                lookup.known_of(*condition),
                lookup.known_of(*then_value),
                lookup.known_of(*else_value),
            ) {
                (Some(cond), Some(a), Some(b)) => zip_broadcast(a, b, |x, y| Some((x, y)))
                    .and_then(|pairs| select_known(cond, &pairs)),
                _ => None,
            };
            Inferred::with_known(TensorSpec::new(then_spec.dtype, Shape::new(dims)), known)
        }
        Layer::Arange {
            count,
            start,
            step,
            dtype,
        } => {
            let count_value = scalar_param(lookup, count, "arange count")?;
            let dim = match count_value {
                Some(value) if value < 0 => {
                    return Err(fail(format!("arange count {value} is negative")))
                }
                Some(value) => Dimension::Static(value as usize),
                None => Dimension::Dynamic,
            };
            let start_value = scalar_param(lookup, start, "arange start")?;
            let step_value = scalar_param(lookup, step, "arange step")?;
            let known = match (count_value, start_value, step_value) {
                (Some(n), Some(first), Some(delta)) if (n as usize) <= KNOWN_VALUE_LIMIT => {
                    Some((0..n).map(|i| Some(first + i * delta)).collect())
                }
                _ => None,
            };
            Inferred::with_known(TensorSpec::new(*dtype, Shape::new(vec![dim])), known)
        }
        Layer::Cast { input, dtype } => {
            let spec = lookup.spec_of(*input)?;
            let known = if spec.dtype.is_float() {
                None
            } else {
                lookup.known_of(*input).map(|values| {
                    values
                        .iter()
                        .map(|value| {
                            value.map(|v| if *dtype == DType::I1 { i64::from(v != 0) } else { v })
                        })
                        .collect()
                })
            };
            Inferred::with_known(TensorSpec::new(*dtype, spec.shape.clone()), known)
        }
    };
    Ok(vec![inferred])
}

/// Numpy-style broadcast of two equal-rank shapes. Ranks must already be aligned.
pub(crate) fn broadcast_dims(lhs: &[Dimension], rhs: &[Dimension]) -> LoweringResult<Vec<Dimension>> {
    if lhs.len() != rhs.len() {
        return Err(fail(format!(
            "broadcast operands have ranks {} and {}",
            lhs.len(),
            rhs.len()
        )));
    }
    lhs.iter()
        .zip(rhs)
        .map(|(a, b)| match (*a, *b) {
            (Dimension::Static(1), other) | (other, Dimension::Static(1)) => Ok(other),
            (Dimension::Static(x), Dimension::Static(y)) if x == y => Ok(Dimension::Static(x)),
            (Dimension::Static(x), Dimension::Static(y)) => {
                Err(fail(format!("cannot broadcast extents {x} and {y}")))
            }
            (Dimension::Static(x), Dimension::Dynamic) | (Dimension::Dynamic, Dimension::Static(x)) => {
                Ok(Dimension::Static(x))
            }
            (Dimension::Dynamic, Dimension::Dynamic) => Ok(Dimension::Dynamic),
        })
        .collect()
}

fn merge_dim(a: Dimension, b: Dimension) -> LoweringResult<Dimension> {
    match (a, b) {
        (Dimension::Static(x), Dimension::Static(y)) if x != y => {
            Err(fail(format!("concat inputs disagree on extent: {x} vs {y}")))
        }
        (Dimension::Static(x), _) | (_, Dimension::Static(x)) => Ok(Dimension::Static(x)),
        (Dimension::Dynamic, Dimension::Dynamic) => Ok(Dimension::Dynamic),
    }
}

fn permute(dims: &[Dimension], perm: &[usize]) -> LoweringResult<Vec<Dimension>> {
    let mut seen = vec![false; dims.len()];
    if perm.len() != dims.len() {
        return Err(fail(format!("permutation {perm:?} does not match rank {}", dims.len())));
    }
    perm.iter()
        .map(|&axis| {
            if axis >= dims.len() || std::mem::replace(&mut seen[axis], true) {
                Err(fail(format!("invalid permutation {perm:?}")))
            } else {
                Ok(dims[axis])
            }
        })
        .collect()
}

fn reshape_dims(
    input: &[Dimension],
    targets: &[Option<i64>],
    zero_is_placeholder: bool,
) -> LoweringResult<Vec<Dimension>> {
    let mut dims = Vec::with_capacity(targets.len());
    let mut infer_at = None;
    for (idx, target) in targets.iter().enumerate() {
        let dim = match target {
            None => Dimension::Dynamic,
            Some(0) if zero_is_placeholder => *input
                .get(idx)
                .ok_or_else(|| fail(format!("reshape placeholder at {idx} has no input axis")))?,
            Some(-1) => {
                if infer_at.replace(idx).is_some() {
                    return Err(fail("reshape dims contain more than one -1"));
                }
                Dimension::Dynamic
            }
            Some(value) if *value < 0 => {
                return Err(fail(format!("reshape dim {value} is negative")))
            }
            Some(value) => Dimension::Static(*value as usize),
        };
        dims.push(dim);
    }
    if let Some(idx) = infer_at {
        let total = Shape::new(input.to_vec()).element_count();
        let known: Option<usize> = dims
            .iter()
            .enumerate()
            .filter(|(pos, _)| *pos != idx)
            .try_fold(1usize, |acc, (_, dim)| acc.checked_mul(dim.as_static()?));
        if let (Some(total), Some(known)) = (total, known) {
            if known == 0 || total % known != 0 {
                return Err(fail(format!(
                    "cannot infer reshape extent: {total} elements over {known}"
                )));
            }
            dims[idx] = Dimension::Static(total / known);
        }
    } else if let (Some(before), Some(after)) = (
        Shape::new(input.to_vec()).element_count(),
        Shape::new(dims.clone()).element_count(),
    ) {
        if before != after {
            return Err(fail(format!(
                "reshape changes element count from {before} to {after}"
            )));
        }
    }
    Ok(dims)
}

/// Values of a 1-D int tensor used as a layer parameter; unknown entries are `None`.
fn runtime_vector<L: TensorLookup + ?Sized>(
    lookup: &L,
    id: TensorId,
    what: &str,
) -> LoweringResult<Known> {
    let spec = lookup.spec_of(id)?;
    if !spec.dtype.is_integer() || spec.rank() > 1 {
        return Err(fail(format!("{what} must be a 1-D int tensor, got {spec}")));
    }
    let len = spec
        .shape
        .element_count()
        .ok_or_else(|| fail(format!("{what} must have a static length")))?;
    Ok(lookup
        .known_of(id)
        .map(<[Option<i64>]>::to_vec)
        .unwrap_or_else(|| vec![None; len]))
}

fn param_values<L: TensorLookup + ?Sized>(
    lookup: &L,
    param: &LayerParam,
    rank: usize,
    what: &str,
) -> LoweringResult<Known> {
    let values = match param {
        LayerParam::Static(values) => values.iter().copied().map(Some).collect(),
        LayerParam::Runtime(id) => runtime_vector(lookup, *id, what)?,
    };
    if values.len() != rank {
        return Err(fail(format!(
            "{what} has {} entries for rank {rank}",
            values.len()
        )));
    }
    Ok(values)
}

fn scalar_param<L: TensorLookup + ?Sized>(
    lookup: &L,
    param: &LayerParam,
    what: &str,
) -> LoweringResult<Option<i64>> {
    let values = match param {
        LayerParam::Static(values) => values.iter().copied().map(Some).collect(),
        LayerParam::Runtime(id) => runtime_vector(lookup, *id, what)?,
    };
    match values.as_slice() {
        [value] => Ok(*value),
        _ => Err(fail(format!("{what} must hold exactly one value"))),
    }
}

fn known_len(dims: &[Dimension]) -> Option<usize> {
    Shape::new(dims.to_vec()).element_count()
}

fn is_all_zero(values: &[Option<i64>]) -> bool {
    values.iter().all(|value| *value == Some(0))
}

fn zip_broadcast<T: Clone, F>(a: &[Option<i64>], b: &[Option<i64>], f: F) -> Option<Vec<Option<T>>>
where
    F: Fn(i64, i64) -> Option<T>,
{
    let len = match (a.len(), b.len()) {
        (x, y) if x == y => x,
        (1, y) => y,
        (x, 1) => x,
        _ => return None,
    };
    Some(
        (0..len)
            .map(|idx| {
                let x = a[if a.len() == 1 { 0 } else { idx }]?;
                let y = b[if b.len() == 1 { 0 } else { idx }]?;
                f(x, y)
            })
            .collect(),
    )
}

fn select_known(cond: &[Option<i64>], pairs: &[Option<(i64, i64)>]) -> Option<Known> {
    let len = cond.len().max(pairs.len());
    if (cond.len() != len && cond.len() != 1) || (pairs.len() != len && pairs.len() != 1) {
        return None;
    }
    Some(
        (0..len)
            .map(|idx| {
                let flag = cond[if cond.len() == 1 { 0 } else { idx }]?;
                let (x, y) = pairs[if pairs.len() == 1 { 0 } else { idx }]?;
                Some(if flag != 0 { x } else { y })
            })
            .collect(),
    )
}

pub(crate) fn fold_binary(op: ElementwiseOp, x: i64, y: i64) -> Option<i64> {
    match op {
        ElementwiseOp::Sum => x.checked_add(y),
        ElementwiseOp::Sub => x.checked_sub(y),
        ElementwiseOp::Prod => x.checked_mul(y),
        ElementwiseOp::Div => x.checked_div(y),
        ElementwiseOp::FloorDiv => floor_div(x, y),
        ElementwiseOp::Min => Some(x.min(y)),
        ElementwiseOp::Max => Some(x.max(y)),
        ElementwiseOp::Pow => u32::try_from(y).ok().and_then(|exp| x.checked_pow(exp)),
        ElementwiseOp::Less => Some(i64::from(x < y)),
        ElementwiseOp::Greater => Some(i64::from(x > y)),
        ElementwiseOp::Equal => Some(i64::from(x == y)),
        ElementwiseOp::And => Some(i64::from(x != 0 && y != 0)),
        ElementwiseOp::Or => Some(i64::from(x != 0 || y != 0)),
    }
}

/// Integer division rounding toward negative infinity.
pub(crate) fn floor_div(x: i64, y: i64) -> Option<i64> {
    let quotient = x.checked_div(y)?;
    if (x % y != 0) && ((x < 0) != (y < 0)) {
        Some(quotient - 1)
    } else {
        Some(quotient)
    }
}

fn fold_reduce(op: ReduceOp, values: &[Option<i64>]) -> Option<i64> {
    let values: Option<Vec<i64>> = values.iter().copied().collect();
    let values = values?;
    match op {
        ReduceOp::Sum => values.iter().try_fold(0i64, |acc, v| acc.checked_add(*v)),
        ReduceOp::Prod => values.iter().try_fold(1i64, |acc, v| acc.checked_mul(*v)),
        ReduceOp::Max => values.iter().copied().max(),
        ReduceOp::Min => values.iter().copied().min(),
    }
}

fn slice_known(
    values: &[Option<i64>],
    start: Option<i64>,
    size: Option<i64>,
    stride: Option<i64>,
) -> Option<Known> {
    let (start, size, stride) = (start?, size?, stride?);
    let len = values.len() as i64;
    (0..size)
        .map(|i| {
            let idx = start + i * stride;
            if (0..len).contains(&idx) {
                Some(values[idx as usize])
            } else {
                None
            }
        })
        .collect()
}
