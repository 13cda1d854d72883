use std::fmt;
use std::sync::{Arc, Mutex};

use half::{bf16, f16};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{Error, Result};
use crate::memory::allocator::{calc_mem_size_with_alignment, Allocator, Buffer, MemoryLocation};

/// Element types for tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum DataType {
    Float,
    Double,
    Float16,
    BFloat16,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Bool,
    String,
}

impl DataType {
    /// Get the size in bytes of one element
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Float => std::mem::size_of::<f32>(),
            DataType::Double => std::mem::size_of::<f64>(),
            DataType::Float16 => std::mem::size_of::<f16>(),
            DataType::BFloat16 => std::mem::size_of::<bf16>(),
            DataType::Int8 | DataType::Uint8 | DataType::Bool => 1,
            DataType::Int16 | DataType::Uint16 => 2,
            DataType::Int32 | DataType::Uint32 => 4,
            DataType::Int64 | DataType::Uint64 => 8,
            DataType::String => std::mem::size_of::<String>(),
        }
    }

    /// String tensors need constructed elements and never live in raw buffers
    pub fn is_string(&self) -> bool {
        matches!(self, DataType::String)
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(
            self,
            DataType::Float | DataType::Double | DataType::Float16 | DataType::BFloat16
        )
    }
}

/// Dimensions of a tensor; negative entries mark an invalid or unknown extent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TensorShape {
    dims: Vec<i64>,
}

impl TensorShape {
    pub fn new(dims: impl Into<Vec<i64>>) -> Self {
        Self { dims: dims.into() }
    }

    /// A rank-0 shape
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements, or -1 if any dimension is negative.
    ///
    /// Saturates at `i64::MAX`, so byte-size computation reports the overflow.
    pub fn size(&self) -> i64 {
        let mut size: i64 = 1;
        for &dim in &self.dims {
            if dim < 0 {
                return -1;
            }
            size = size.saturating_mul(dim);
        }
        size
    }
}

impl From<Vec<i64>> for TensorShape {
    fn from(dims: Vec<i64>) -> Self {
        Self::new(dims)
    }
}

impl From<&[i64]> for TensorShape {
    fn from(dims: &[i64]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl<const N: usize> From<[i64; N]> for TensorShape {
    fn from(dims: [i64; N]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "[{}]", dims.join(","))
    }
}

/// Where a tensor's elements are stored
#[derive(Debug, Clone)]
pub enum TensorStorage {
    /// Zero-sized tensor
    Empty,
    /// Raw elements inside an arena
    Buffer(Buffer),
    /// Constructed string elements
    Strings(Arc<Mutex<Vec<String>>>),
}

/// A dense tensor: element type, shape, and the buffer holding its elements
#[derive(Debug, Clone)]
pub struct Tensor {
    data_type: DataType,
    shape: TensorShape,
    location: MemoryLocation,
    storage: TensorStorage,
}

impl Tensor {
    /// Wrap an already-allocated buffer. The buffer must cover the tensor's bytes.
    pub fn new(data_type: DataType, shape: TensorShape, buffer: Buffer) -> Result<Self> {
        let required = Self::required_bytes(data_type, &shape)?;
        if buffer.size() < required {
            return Err(Error::Fail(format!(
                "buffer of {} bytes is too small for a {} tensor of shape {} ({} bytes)",
                buffer.size(),
                data_type,
                shape,
                required
            )));
        }
        let location = buffer.location();
        let storage = if required == 0 {
            TensorStorage::Empty
        } else {
            TensorStorage::Buffer(buffer.slice(0, required)?)
        };
        Ok(Self {
            data_type,
            shape,
            location,
            storage,
        })
    }

    /// A tensor with no elements at `location`
    pub fn empty(data_type: DataType, shape: TensorShape, location: MemoryLocation) -> Self {
        Self {
            data_type,
            shape,
            location,
            storage: TensorStorage::Empty,
        }
    }

    /// A string tensor with default-constructed elements
    pub fn new_strings(shape: TensorShape, location: MemoryLocation) -> Result<Self> {
        let len = shape.size();
        if len < 0 {
            return Err(Error::InvalidArgument(
                "Tensor shape cannot contain any negative value".to_string(),
            ));
        }
        Ok(Self {
            data_type: DataType::String,
            shape,
            location,
            storage: TensorStorage::Strings(Arc::new(Mutex::new(vec![String::new(); len as usize]))),
        })
    }

    pub fn from_strings(shape: TensorShape, values: Vec<String>) -> Result<Self> {
        if shape.size() != values.len() as i64 {
            return Err(Error::InvalidArgument(format!(
                "shape {} does not match {} string elements",
                shape,
                values.len()
            )));
        }
        Ok(Self {
            data_type: DataType::String,
            shape,
            location: MemoryLocation::cpu(),
            storage: TensorStorage::Strings(Arc::new(Mutex::new(values))),
        })
    }

    /// Allocate a float tensor from `allocator` and fill it with `data`
    pub fn from_f32(shape: impl Into<TensorShape>, data: &[f32], allocator: &dyn Allocator) -> Result<Self> {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(DataType::Float, shape.into(), data.len(), &bytes, allocator)
    }

    /// Allocate an int64 tensor from `allocator` and fill it with `data`
    pub fn from_i64(shape: impl Into<TensorShape>, data: &[i64], allocator: &dyn Allocator) -> Result<Self> {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(DataType::Int64, shape.into(), data.len(), &bytes, allocator)
    }

    /// Allocate a tensor and copy raw little-endian element bytes into it
    pub fn from_bytes(
        data_type: DataType,
        shape: TensorShape,
        count: usize,
        bytes: &[u8],
        allocator: &dyn Allocator,
    ) -> Result<Self> {
        if data_type.is_string() {
            return Err(Error::InvalidArgument(
                "string tensors cannot be created from raw bytes".to_string(),
            ));
        }
        if shape.size() != count as i64 {
            return Err(Error::InvalidArgument(format!(
                "shape {} does not match {} elements",
                shape, count
            )));
        }
        let required = Self::required_bytes(data_type, &shape)?;
        if bytes.len() != required {
            return Err(Error::InvalidArgument(format!(
                "expected {} bytes for a {} tensor of shape {}, got {}",
                required,
                data_type,
                shape,
                bytes.len()
            )));
        }
        if required == 0 {
            return Ok(Self::empty(data_type, shape, allocator.location()));
        }
        let buffer = allocator.alloc(required)?;
        buffer.write(bytes)?;
        Self::new(data_type, shape, buffer)
    }

    /// Unaligned byte count of a tensor's elements
    pub fn required_bytes(data_type: DataType, shape: &TensorShape) -> Result<usize> {
        let len = shape.size();
        if len < 0 {
            return Err(Error::InvalidArgument(
                "Tensor shape cannot contain any negative value".to_string(),
            ));
        }
        calc_mem_size_with_alignment(len as usize, data_type.size_in_bytes(), 0)
            .ok_or_else(|| Error::Fail("size overflow".to_string()))
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    pub fn storage(&self) -> &TensorStorage {
        &self.storage
    }

    /// The raw buffer, if the tensor has one
    pub fn buffer(&self) -> Option<&Buffer> {
        match &self.storage {
            TensorStorage::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        match &self.storage {
            TensorStorage::Buffer(buffer) => buffer.size(),
            _ => 0,
        }
    }

    /// True when both tensors are views of the same bytes
    pub fn shares_buffer_with(&self, other: &Tensor) -> bool {
        match (self.buffer(), other.buffer()) {
            (Some(a), Some(b)) => a.same_region(b),
            _ => false,
        }
    }

    /// Raw element bytes
    pub fn bytes(&self) -> Result<Vec<u8>> {
        match &self.storage {
            TensorStorage::Empty => Ok(Vec::new()),
            TensorStorage::Buffer(buffer) => buffer.read(),
            TensorStorage::Strings(_) => Err(Error::InvalidArgument(
                "string tensors have no raw bytes".to_string(),
            )),
        }
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        self.expect_type(DataType::Float)?;
        let bytes = self.bytes()?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        self.expect_type(DataType::Int64)?;
        let bytes = self.bytes()?;
        Ok(bytes
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect())
    }

    /// View a float tensor as an `ndarray` array (copies the elements)
    pub fn to_ndarray_f32(&self) -> Result<ArrayD<f32>> {
        let dims: Vec<usize> = self.shape.dims().iter().map(|&d| d.max(0) as usize).collect();
        ArrayD::from_shape_vec(IxDyn(&dims), self.to_f32_vec()?)
            .map_err(|e| Error::Fail(format!("tensor shape {} does not fit its data: {}", self.shape, e)))
    }

    /// Overwrite the elements of a float tensor
    pub fn write_f32(&self, data: &[f32]) -> Result<()> {
        self.expect_type(DataType::Float)?;
        if data.len() as i64 != self.shape.size() {
            return Err(Error::InvalidArgument(format!(
                "cannot write {} elements into a tensor of shape {}",
                data.len(),
                self.shape
            )));
        }
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.write_bytes(&bytes)
    }

    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        match &self.storage {
            TensorStorage::Empty if bytes.is_empty() => Ok(()),
            TensorStorage::Buffer(buffer) => buffer.write(bytes),
            _ => Err(Error::InvalidArgument(
                "tensor has no raw buffer to write into".to_string(),
            )),
        }
    }

    pub fn strings(&self) -> Result<Vec<String>> {
        match &self.storage {
            TensorStorage::Strings(values) => values
                .lock()
                .map(|v| v.clone())
                .map_err(|_| Error::Fail("string tensor lock poisoned".to_string())),
            _ => Err(Error::InvalidArgument(format!(
                "expected a string tensor, found {}",
                self.data_type
            ))),
        }
    }

    fn expect_type(&self, data_type: DataType) -> Result<()> {
        if self.data_type != data_type {
            return Err(Error::InvalidArgument(format!(
                "expected a {} tensor, found {}",
                data_type, self.data_type
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::allocator::CpuAllocator;

    #[test]
    fn test_shape_size() {
        assert_eq!(TensorShape::from([1, 4]).size(), 4);
        assert_eq!(TensorShape::scalar().size(), 1);
        assert_eq!(TensorShape::from([2, 0, 3]).size(), 0);
        assert_eq!(TensorShape::from([2, -1]).size(), -1);
        assert_eq!(TensorShape::from([i64::MAX, 2]).size(), i64::MAX);
        assert_eq!(TensorShape::from([1, 4]).to_string(), "[1,4]");
    }

    #[test]
    fn test_float_round_trip_through_buffer() {
        let allocator = CpuAllocator::new(None);
        let tensor = Tensor::from_f32([2, 2], &[1.0, -2.0, 3.5, 0.0], &allocator).unwrap();
        assert_eq!(tensor.size_in_bytes(), 16);
        assert_eq!(tensor.to_f32_vec().unwrap(), vec![1.0, -2.0, 3.5, 0.0]);

        tensor.write_f32(&[4.0, 3.0, 2.0, 1.0]).unwrap();
        let array = tensor.to_ndarray_f32().unwrap();
        assert_eq!(array.shape(), &[2, 2]);
        assert_eq!(array[[1, 0]], 2.0);
        assert!(tensor.to_i64_vec().is_err());
    }

    #[test]
    fn test_negative_shape_rejected() {
        let result = Tensor::required_bytes(DataType::Float, &TensorShape::from([-1, 4]));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        let result = Tensor::required_bytes(DataType::Double, &TensorShape::from([i64::MAX]));
        assert!(matches!(result, Err(Error::Fail(_))));
    }

    #[test]
    fn test_element_sizes() {
        assert_eq!(DataType::Float16.size_in_bytes(), 2);
        assert_eq!(DataType::BFloat16.size_in_bytes(), 2);
        assert_eq!(DataType::Int64.size_in_bytes(), 8);
        assert_eq!("Float".parse::<DataType>().unwrap(), DataType::Float);
    }

    #[test]
    fn test_string_tensor() {
        let tensor = Tensor::from_strings([2].into(), vec!["a".into(), "b".into()]).unwrap();
        assert_eq!(tensor.strings().unwrap(), vec!["a", "b"]);
        assert!(tensor.buffer().is_none());
        assert!(tensor.bytes().is_err());
    }
}
