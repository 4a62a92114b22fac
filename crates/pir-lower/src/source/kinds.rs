//! Operator kind names as they appear in Paddle PIR programs.

pub const DATA: &str = "pd_op.data";
pub const FULL: &str = "pd_op.full";
pub const FULL_INT_ARRAY: &str = "pd_op.full_int_array";
pub const ASSIGN_VALUE: &str = "pd_op.assign_value";
pub const BUILTIN_CONSTANT: &str = "builtin.constant";

pub const RESHAPE: &str = "pd_op.reshape";
pub const FLATTEN: &str = "pd_op.flatten";
pub const CONCAT: &str = "pd_op.concat";
pub const STACK: &str = "pd_op.stack";
pub const UNSQUEEZE: &str = "pd_op.unsqueeze";
pub const UNSQUEEZE_: &str = "pd_op.unsqueeze_";
pub const SQUEEZE: &str = "pd_op.squeeze";
pub const SQUEEZE_: &str = "pd_op.squeeze_";
pub const EXPAND: &str = "pd_op.expand";
pub const EXPAND_AS: &str = "pd_op.expand_as";
pub const CAST: &str = "pd_op.cast";
pub const CAST_: &str = "pd_op.cast_";
pub const SLICE: &str = "pd_op.slice";
pub const STRIDED_SLICE: &str = "pd_op.strided_slice";
pub const SPLIT: &str = "pd_op.split";
pub const SPLIT_WITH_NUM: &str = "pd_op.split_with_num";
pub const TILE: &str = "pd_op.tile";
pub const ROLL: &str = "pd_op.roll";
pub const GATHER_ND: &str = "pd_op.gather_nd";
pub const ARANGE: &str = "pd_op.arange";

pub const ADD: &str = "pd_op.add";
pub const ADD_: &str = "pd_op.add_";
pub const SUBTRACT: &str = "pd_op.subtract";
pub const MULTIPLY: &str = "pd_op.multiply";
pub const DIVIDE: &str = "pd_op.divide";
pub const FLOOR_DIVIDE: &str = "pd_op.floor_divide";
pub const MAXIMUM: &str = "pd_op.maximum";
pub const MINIMUM: &str = "pd_op.minimum";
pub const REMAINDER: &str = "pd_op.remainder";
pub const REMAINDER_: &str = "pd_op.remainder_";
pub const SCALE: &str = "pd_op.scale";
pub const MAX: &str = "pd_op.max";
pub const MIN: &str = "pd_op.min";
pub const SUM: &str = "pd_op.sum";
pub const ANY: &str = "pd_op.any";
pub const ALL: &str = "pd_op.all";
pub const CLIP: &str = "pd_op.clip";
pub const LOG: &str = "pd_op.log";

pub const RELU: &str = "pd_op.relu";
pub const TANH: &str = "pd_op.tanh";
pub const SIGMOID: &str = "pd_op.sigmoid";
pub const SOFTMAX: &str = "pd_op.softmax";
pub const GELU: &str = "pd_op.gelu";
pub const HARDSIGMOID: &str = "pd_op.hardsigmoid";
pub const HARDSWISH: &str = "pd_op.hardswish";
pub const SOFTPLUS: &str = "pd_op.softplus";
pub const SWISH: &str = "pd_op.swish";
pub const SILU: &str = "pd_op.silu";

/// Kinds whose payload the driver reads directly instead of dispatching a converter.
pub fn is_constant_producer(kind: &str) -> bool {
    matches!(kind, FULL | FULL_INT_ARRAY | ASSIGN_VALUE | BUILTIN_CONSTANT)
}
