use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tensor::{DType, TensorLiteral, TensorSpec};

/// Handle of a tensor inside a target network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub u32);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// A tensor handle together with the spec the network inferred for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorRef {
    pub id: TensorId,
    pub spec: TensorSpec,
}

impl TensorRef {
    pub fn new(id: TensorId, spec: TensorSpec) -> Self {
        Self { id, spec }
    }

    pub fn rank(&self) -> usize {
        self.spec.rank()
    }

    pub fn dtype(&self) -> DType {
        self.spec.dtype
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseOp {
    Sum,
    Sub,
    Prod,
    Div,
    FloorDiv,
    Min,
    Max,
    Pow,
    Less,
    Greater,
    Equal,
    And,
    Or,
}

impl ElementwiseOp {
    /// Comparison and logical ops produce `bool` regardless of input dtype.
    pub fn produces_bool(self) -> bool {
        matches!(
            self,
            ElementwiseOp::Less
                | ElementwiseOp::Greater
                | ElementwiseOp::Equal
                | ElementwiseOp::And
                | ElementwiseOp::Or
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Exp,
    Log,
    Sqrt,
    Abs,
    Neg,
    Erf,
    Floor,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivationKind {
    Relu,
    Tanh,
    Sigmoid,
    /// `max(0, min(1, alpha * x + beta))`
    HardSigmoid,
    /// `max(alpha, min(beta, x))`
    Clip,
    /// `alpha * ln(1 + exp(beta * x))`
    Softplus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Prod,
    Max,
    Min,
}

/// Out-of-bounds policy of a slice layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SampleMode {
    #[default]
    Strict,
    /// Indices wrap around modulo the input extent.
    Wrap,
    Clamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GatherMode {
    #[default]
    Default,
    /// The last index dimension holds coordinate tuples into the leading data axes.
    Nd,
}

/// A layer parameter that is either fixed at build time or read from a 1-D int tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerParam {
    Static(Vec<i64>),
    Runtime(TensorId),
}

impl LayerParam {
    pub fn as_static(&self) -> Option<&[i64]> {
        match self {
            LayerParam::Static(values) => Some(values),
            LayerParam::Runtime(_) => None,
        }
    }

    fn runtime(&self) -> Option<TensorId> {
        match self {
            LayerParam::Static(_) => None,
            LayerParam::Runtime(id) => Some(*id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Layer {
    Constant {
        literal: TensorLiteral,
    },
    ElementwiseBinary {
        op: ElementwiseOp,
        lhs: TensorId,
        rhs: TensorId,
    },
    Unary {
        op: UnaryOp,
        input: TensorId,
    },
    Activation {
        kind: ActivationKind,
        input: TensorId,
        alpha: f64,
        beta: f64,
    },
    Reduce {
        op: ReduceOp,
        input: TensorId,
        /// Bit `i` set means axis `i` is reduced.
        axes: u32,
        keep_dims: bool,
    },
    /// Runtime shape of `input` as a 1-D `int32` tensor.
    Shape {
        input: TensorId,
    },
    Slice {
        input: TensorId,
        start: LayerParam,
        size: LayerParam,
        stride: LayerParam,
        mode: SampleMode,
    },
    Concat {
        inputs: Vec<TensorId>,
        axis: usize,
    },
    Gather {
        data: TensorId,
        indices: TensorId,
        axis: usize,
        mode: GatherMode,
    },
    /// Optional permutation followed by an optional reshape.
    Shuffle {
        input: TensorId,
        first_transpose: Option<Vec<usize>>,
        reshape: Option<LayerParam>,
        /// A `0` in the reshape dims copies the input extent at that position.
        zero_is_placeholder: bool,
    },
    Select {
        condition: TensorId,
        then_value: TensorId,
        else_value: TensorId,
    },
    /// 1-D sequence `start + i * step` for `i in 0..count`.
    Arange {
        count: LayerParam,
        start: LayerParam,
        step: LayerParam,
        dtype: DType,
    },
    Cast {
        input: TensorId,
        dtype: DType,
    },
    Softmax {
        input: TensorId,
        axes: u32,
    },
}

/// Coarse layer classification used for statistics and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LayerKind {
    Constant,
    ElementwiseBinary,
    Unary,
    Activation,
    Reduce,
    Shape,
    Slice,
    Concat,
    Gather,
    Shuffle,
    Select,
    Arange,
    Cast,
    Softmax,
}

impl LayerKind {
    pub fn from_layer(layer: &Layer) -> Self {
        match layer {
            Layer::Constant { .. } => LayerKind::Constant,
            Layer::ElementwiseBinary { .. } => LayerKind::ElementwiseBinary,
            Layer::Unary { .. } => LayerKind::Unary,
            Layer::Activation { .. } => LayerKind::Activation,
            Layer::Reduce { .. } => LayerKind::Reduce,
            Layer::Shape { .. } => LayerKind::Shape,
            Layer::Slice { .. } => LayerKind::Slice,
            Layer::Concat { .. } => LayerKind::Concat,
            Layer::Gather { .. } => LayerKind::Gather,
            Layer::Shuffle { .. } => LayerKind::Shuffle,
            Layer::Select { .. } => LayerKind::Select,
            Layer::Arange { .. } => LayerKind::Arange,
            Layer::Cast { .. } => LayerKind::Cast,
            Layer::Softmax { .. } => LayerKind::Softmax,
        }
    }
}

impl Layer {
    pub fn kind(&self) -> LayerKind {
        LayerKind::from_layer(self)
    }

    /// Every tensor the layer reads, including runtime parameters.
    pub fn inputs(&self) -> Vec<TensorId> {
        match self {
            Layer::Constant { .. } => Vec::new(),
            Layer::ElementwiseBinary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Layer::Unary { input, .. }
            | Layer::Activation { input, .. }
            | Layer::Reduce { input, .. }
            | Layer::Shape { input }
            | Layer::Cast { input, .. }
            | Layer::Softmax { input, .. } => vec![*input],
            Layer::Slice {
                input,
                start,
                size,
                stride,
                ..
            } => std::iter::once(*input)
                .chain([start, size, stride].into_iter().filter_map(LayerParam::runtime))
                .collect(),
            Layer::Concat { inputs, .. } => inputs.clone(),
            Layer::Gather { data, indices, .. } => vec![*data, *indices],
            Layer::Shuffle { input, reshape, .. } => std::iter::once(*input)
                .chain(reshape.iter().filter_map(LayerParam::runtime))
                .collect(),
            Layer::Select {
                condition,
                then_value,
                else_value,
            } => vec![*condition, *then_value, *else_value],
            Layer::Arange {
                count, start, step, ..
            } => [count, start, step]
                .into_iter()
                .filter_map(LayerParam::runtime)
                .collect(),
        }
    }
}
