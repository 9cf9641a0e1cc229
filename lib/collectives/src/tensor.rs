// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Buffer and device surface consumed by the engine.
//!
//! A [`Tensor`] is an immutable, cheaply clonable byte buffer tagged with its element
//! type, shape and placement. The engine only moves bytes around; arithmetic on the
//! contents belongs to the transport (reductions) and to [`Tensor::scaled`] (averaging).

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::{CollectiveError, Result};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    U8,
    I8,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I32 | DataType::F32 => 4,
            DataType::I64 | DataType::F64 => 8,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            DataType::U8 => "uint8",
            DataType::I8 => "int8",
            DataType::I32 => "int32",
            DataType::I64 => "int64",
            DataType::F16 => "float16",
            DataType::BF16 => "bfloat16",
            DataType::F32 => "float32",
            DataType::F64 => "float64",
        }
    }

    pub const fn is_floating(&self) -> bool {
        matches!(
            self,
            DataType::F16 | DataType::BF16 | DataType::F32 | DataType::F64
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Placement of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Gpu(u32),
}

impl Device {
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Gpu(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Gpu(id) => write!(f, "gpu:{id}"),
        }
    }
}

/// Rust scalar types with a [`DataType`] counterpart, stored little-endian.
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DataType;

    fn write_le(&self, out: &mut Vec<u8>);

    /// `bytes` is exactly `DTYPE.size()` long.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($t:ty, $dtype:expr) => {
        impl Element for $t {
            const DTYPE: DataType = $dtype;

            fn write_le(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_le_bytes(raw)
            }
        }
    };
}

impl_element!(u8, DataType::U8);
impl_element!(i8, DataType::I8);
impl_element!(i32, DataType::I32);
impl_element!(i64, DataType::I64);
impl_element!(f16, DataType::F16);
impl_element!(bf16, DataType::BF16);
impl_element!(f32, DataType::F32);
impl_element!(f64, DataType::F64);

/// Dense tensor with immutable contents.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    dtype: DataType,
    shape: Vec<usize>,
    device: Device,
    data: Bytes,
}

impl Tensor {
    /// Wrap raw little-endian bytes. The length must match `shape` and `dtype`.
    pub fn new(
        dtype: DataType,
        shape: impl Into<Vec<usize>>,
        device: Device,
        data: impl Into<Bytes>,
    ) -> Result<Self> {
        let shape = shape.into();
        let data = data.into();
        let expected = shape.iter().product::<usize>() * dtype.size();
        if data.len() != expected {
            return Err(CollectiveError::InvalidArgument(format!(
                "{} bytes do not describe a {dtype} tensor of shape {shape:?} ({expected} bytes)",
                data.len()
            )));
        }
        Ok(Self {
            dtype,
            shape,
            device,
            data,
        })
    }

    /// Host tensor holding `values` in row-major order.
    pub fn from_slice<T: Element>(values: &[T], shape: impl Into<Vec<usize>>) -> Result<Self> {
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.size());
        for v in values {
            v.write_le(&mut data);
        }
        Self::new(T::DTYPE, shape, Device::Cpu, data)
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Decode the contents. Fails if `T` does not match the element type.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(CollectiveError::InvalidArgument(format!(
                "cannot read a {} tensor as {}",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(self
            .data
            .chunks_exact(self.dtype.size())
            .map(T::read_le)
            .collect())
    }

    /// Multiply every element by `factor`. Floating-point tensors are scaled;
    /// integer tensors are returned unchanged.
    pub fn scaled(&self, factor: f64) -> Tensor {
        let data = match self.dtype {
            DataType::F16 => scale_as::<f16>(&self.data, |v| f16::from_f64(v.to_f64() * factor)),
            DataType::BF16 => {
                scale_as::<bf16>(&self.data, |v| bf16::from_f64(v.to_f64() * factor))
            }
            DataType::F32 => scale_as::<f32>(&self.data, |v| (v as f64 * factor) as f32),
            DataType::F64 => scale_as::<f64>(&self.data, |v| v * factor),
            _ => return self.clone(),
        };
        Tensor {
            data: Bytes::from(data),
            ..self.clone()
        }
    }
}

fn scale_as<T: Element>(data: &[u8], f: impl Fn(T) -> T) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks_exact(T::DTYPE.size()) {
        f(T::read_le(chunk)).write_le(&mut out);
    }
    out
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("device", &self.device)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Non-blocking readiness check for an externally produced buffer, e.g. a device
/// event recorded after the kernel that writes the tensor.
pub trait ReadyEvent: Send + Sync {
    /// Must not block.
    fn ready(&self) -> bool;
}

/// A [`ReadyEvent`] the producer flips by hand.
#[derive(Debug, Clone, Default)]
pub struct ReadyFlag(Arc<AtomicBool>);

impl ReadyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl ReadyEvent for ReadyFlag {
    fn ready(&self) -> bool {
        self.is_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::u8(DataType::U8, 1, false)]
    #[case::i64(DataType::I64, 8, false)]
    #[case::f16(DataType::F16, 2, true)]
    #[case::f32(DataType::F32, 4, true)]
    fn test_dtype_properties(
        #[case] dtype: DataType,
        #[case] size: usize,
        #[case] floating: bool,
    ) {
        assert_eq!(dtype.size(), size);
        assert_eq!(dtype.is_floating(), floating);
    }

    #[test]
    fn test_from_slice_and_back() -> anyhow::Result<()> {
        let t = Tensor::from_slice(&[1.5f32, -2.0, 3.25, 0.0], [2, 2])?;
        assert_eq!(t.numel(), 4);
        assert_eq!(t.size_bytes(), 16);
        assert_eq!(t.device(), Device::Cpu);
        assert_eq!(t.to_vec::<f32>()?, vec![1.5, -2.0, 3.25, 0.0]);
        assert!(t.to_vec::<i32>().is_err());
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let err = Tensor::from_slice(&[1i32, 2, 3], [2, 2]).unwrap_err();
        assert!(matches!(err, CollectiveError::InvalidArgument(_)));
    }

    #[test]
    fn test_scaled_only_touches_floats() -> anyhow::Result<()> {
        let f = Tensor::from_slice(&[4.0f64, 8.0], [2])?.scaled(0.25);
        assert_eq!(f.to_vec::<f64>()?, vec![1.0, 2.0]);

        let i = Tensor::from_slice(&[4i32, 8], [2])?.scaled(0.25);
        assert_eq!(i.to_vec::<i32>()?, vec![4, 8]);
        Ok(())
    }

    #[test]
    fn test_scaled_half_precision() -> anyhow::Result<()> {
        // 2.0 in IEEE half precision
        let raw = Tensor::new(DataType::F16, [1], Device::Cpu, vec![0x00, 0x40])?;
        assert_eq!(raw.scaled(0.5).data().as_ref(), &[0x00u8, 0x3c]);

        let h = Tensor::from_slice(&[f16::from_f32(6.0), f16::from_f32(-3.0)], [2])?;
        assert_eq!(
            h.scaled(0.5).to_vec::<f16>()?,
            vec![f16::from_f32(3.0), f16::from_f32(-1.5)]
        );

        let b = Tensor::from_slice(&[bf16::from_f32(6.0), bf16::from_f32(1.0)], [2])?;
        assert_eq!(
            b.scaled(0.25).to_vec::<bf16>()?,
            vec![bf16::from_f32(1.5), bf16::from_f32(0.25)]
        );
        Ok(())
    }

    #[test]
    fn test_ready_flag_is_shared() {
        let flag = ReadyFlag::new();
        let event: Arc<dyn ReadyEvent> = Arc::new(flag.clone());
        assert!(!event.ready());
        flag.set();
        assert!(event.ready());
    }
}
