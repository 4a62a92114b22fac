use std::fmt;

use serde::{Deserialize, Serialize};

/// Element types that cross the lowering boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    I1,
    Si32,
    Si64,
    F16,
    F32,
    F64,
}

impl DType {
    /// Maps Paddle dtype names (`"float32"`, `"paddle.int64"`, `"bool"`, ...) to a dtype.
    pub fn from_name(name: &str) -> Option<DType> {
        let name = name.trim();
        let name = name.strip_prefix("paddle.").unwrap_or(name);
        match name.to_ascii_lowercase().as_str() {
            "bool" => Some(DType::I1),
            "int32" => Some(DType::Si32),
            "int64" => Some(DType::Si64),
            "float16" => Some(DType::F16),
            "float32" => Some(DType::F32),
            "float64" => Some(DType::F64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::I1 => "bool",
            DType::Si32 => "int32",
            DType::Si64 => "int64",
            DType::F16 => "float16",
            DType::F32 => "float32",
            DType::F64 => "float64",
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DType::Si32 | DType::Si64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    pub fn is_bool(self) -> bool {
        self == DType::I1
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 => 1,
            DType::F16 => 2,
            DType::Si32 | DType::F32 => 4,
            DType::Si64 | DType::F64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
