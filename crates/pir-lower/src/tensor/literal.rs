use std::sync::Arc;

use half::f16;
use serde::{ser::SerializeStruct, Deserialize, Serialize};

use super::{DType, Shape, TensorSpec};
use crate::error::{LoweringError, LoweringResult};

/// Dense little-endian tensor payload known at lowering time.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, bytes: Arc<[u8]>) -> LoweringResult<Self> {
        let count = spec
            .shape
            .element_count()
            .ok_or_else(|| LoweringError::invalid("literal shape must be fully static"))?;
        let expected = count * spec.dtype.size_in_bytes();
        if bytes.len() != expected {
            return Err(LoweringError::invalid(format!(
                "literal {spec} expects {expected} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self { spec, bytes })
    }

    pub fn from_i64s(dtype: DType, dims: &[usize], values: &[i64]) -> LoweringResult<Self> {
        let spec = TensorSpec::new(dtype, Shape::from_static(dims));
        check_count(&spec, values.len())?;
        let mut bytes = Vec::with_capacity(values.len() * dtype.size_in_bytes());
        for &value in values {
            encode_i64(dtype, value, &mut bytes)?;
        }
        Self::new(spec, Arc::from(bytes))
    }

    pub fn from_f64s(dtype: DType, dims: &[usize], values: &[f64]) -> LoweringResult<Self> {
        let spec = TensorSpec::new(dtype, Shape::from_static(dims));
        check_count(&spec, values.len())?;
        let mut bytes = Vec::with_capacity(values.len() * dtype.size_in_bytes());
        for &value in values {
            encode_f64(dtype, value, &mut bytes)?;
        }
        Self::new(spec, Arc::from(bytes))
    }

    /// A 1-D `int32` vector, the element type of target shape tensors.
    pub fn int_vector(values: &[i64]) -> LoweringResult<Self> {
        Self::from_i64s(DType::Si32, &[values.len()], values)
    }

    pub fn scalar_f64(dtype: DType, value: f64) -> LoweringResult<Self> {
        Self::from_f64s(dtype, &[], &[value])
    }

    pub fn dtype(&self) -> DType {
        self.spec.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.spec.shape
    }

    pub fn element_count(&self) -> usize {
        self.bytes.len() / self.spec.dtype.size_in_bytes()
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Decodes every element as an integer. Floating payloads must hold integral values.
    pub fn to_i64s(&self) -> LoweringResult<Vec<i64>> {
        let dtype = self.spec.dtype;
        if dtype.is_float() {
            return self
                .to_f64s()
                .into_iter()
                .map(|value| {
                    if value.fract() == 0.0 && value.is_finite() {
                        Ok(value as i64)
                    } else {
                        Err(LoweringError::invalid(format!(
                            "literal value {value} is not an integer"
                        )))
                    }
                })
                .collect();
        }
        Ok(self
            .bytes
            .chunks_exact(dtype.size_in_bytes())
            .map(|chunk| decode_i64(dtype, chunk))
            .collect())
    }

    pub fn to_f64s(&self) -> Vec<f64> {
        let dtype = self.spec.dtype;
        self.bytes
            .chunks_exact(dtype.size_in_bytes())
            .map(|chunk| decode_f64(dtype, chunk))
            .collect()
    }

    /// Converts the payload to another dtype, truncating toward zero for float-to-int.
    pub fn cast(&self, dtype: DType) -> LoweringResult<Self> {
        if dtype == self.spec.dtype {
            return Ok(self.clone());
        }
        let dims = self
            .spec
            .shape
            .static_dims()
            .ok_or_else(|| LoweringError::invalid("literal shape must be fully static"))?;
        let values = self.to_f64s();
        if dtype.is_float() {
            return Self::from_f64s(dtype, &dims, &values);
        }
        let ints: Vec<i64> = values
            .iter()
            .map(|&value| {
                if dtype.is_bool() {
                    i64::from(value != 0.0)
                } else {
                    value.trunc() as i64
                }
            })
            .collect();
        Self::from_i64s(dtype, &dims, &ints)
    }

    /// Same payload with a new static shape of equal element count.
    pub fn reshaped(&self, dims: &[usize]) -> LoweringResult<Self> {
        let spec = TensorSpec::new(self.spec.dtype, Shape::from_static(dims));
        Self::new(spec, self.bytes.clone())
    }
}

fn check_count(spec: &TensorSpec, got: usize) -> LoweringResult<()> {
    match spec.shape.element_count() {
        Some(count) if count == got => Ok(()),
        _ => Err(LoweringError::invalid(format!(
            "literal {spec} cannot hold {got} elements"
        ))),
    }
}

fn encode_i64(dtype: DType, value: i64, out: &mut Vec<u8>) -> LoweringResult<()> {
    match dtype {
        DType::I1 => out.push(u8::from(value != 0)),
        DType::Si32 => {
            let narrow = i32::try_from(value).map_err(|_| {
                LoweringError::invalid(format!("value {value} does not fit in int32"))
            })?;
            out.extend_from_slice(&narrow.to_le_bytes());
        }
        DType::Si64 => out.extend_from_slice(&value.to_le_bytes()),
        DType::F16 | DType::F32 | DType::F64 => return encode_f64(dtype, value as f64, out),
    }
    Ok(())
}

fn encode_f64(dtype: DType, value: f64, out: &mut Vec<u8>) -> LoweringResult<()> {
    match dtype {
        DType::F16 => out.extend_from_slice(&f16::from_f64(value).to_le_bytes()),
        DType::F32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
        DType::F64 => out.extend_from_slice(&value.to_le_bytes()),
        DType::I1 => out.push(u8::from(value != 0.0)),
        DType::Si32 | DType::Si64 => return encode_i64(dtype, value as i64, out),
    }
    Ok(())
}

fn decode_i64(dtype: DType, chunk: &[u8]) -> i64 {
    match dtype {
        DType::I1 => i64::from(chunk[0] != 0),
        DType::Si32 => i64::from(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
        DType::Si64 => i64::from_le_bytes(array8(chunk)),
        DType::F16 | DType::F32 | DType::F64 => decode_f64(dtype, chunk) as i64,
    }
}

fn decode_f64(dtype: DType, chunk: &[u8]) -> f64 {
    match dtype {
        DType::F16 => f16::from_le_bytes([chunk[0], chunk[1]]).to_f64(),
        DType::F32 => f64::from(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
        DType::F64 => f64::from_le_bytes(array8(chunk)),
        DType::I1 | DType::Si32 | DType::Si64 => decode_i64(dtype, chunk) as f64,
    }
}

fn array8(chunk: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&chunk[..8]);
    out
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("spec", &self.spec)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            spec: TensorSpec,
            bytes: Vec<u8>,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        TensorLiteral::new(helper.spec, Arc::<[u8]>::from(helper.bytes))
            .map_err(serde::de::Error::custom)
    }
}
