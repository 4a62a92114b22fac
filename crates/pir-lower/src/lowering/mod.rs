//! The lowering engine: value abstraction, shape arithmetic, converter registry and driver.

mod context;
mod driver;
mod registry;
mod shape_math;
mod value;

pub use context::LowerCtx;
pub use driver::{translate, Translation, ValueTable};
pub use registry::{
    builtin_registry, Converter, ConverterDef, ConverterRegistry, LowerFn, TargetVersion,
    VersionReq, CONVERTERS,
};
pub use shape_math::{checked_axis, floor_div_i64, normalize_axis};
pub use value::LoweredValue;
