//! Tensor descriptor: element count and shape of a single tensor-like value.

use serde::Serialize;

/// Why a value's shape or element count could not be computed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("negative dimension {dim} at axis {axis}")]
    NegativeDimension { axis: usize, dim: i64 },

    #[error("element count of shape {shape:?} overflows")]
    Overflow { shape: Vec<usize> },

    #[error("value of type {kind} is not tensor-like")]
    NotTensor { kind: String },

    #[error("unreadable tensor metadata: {0}")]
    Unreadable(String),
}

/// Anything exposing a shape. The element count is derived from it.
pub trait TensorLike {
    /// Ordered dimensions, outermost first.
    fn shape(&self) -> Result<Vec<usize>, ShapeError>;

    /// Product of the dimensions. A zero-dimensional tensor holds one element.
    fn numel(&self) -> Result<u64, ShapeError> {
        describe_tensor(self).map(|desc| desc.num_elements)
    }
}

impl<T: TensorLike + ?Sized> TensorLike for &T {
    fn shape(&self) -> Result<Vec<usize>, ShapeError> {
        (**self).shape()
    }

    fn numel(&self) -> Result<u64, ShapeError> {
        (**self).numel()
    }
}

/// Tensor metadata as recovered from a checkpoint, without payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorMeta {
    dtype: Option<String>,
    dims: Result<Vec<i64>, String>,
}

impl TensorMeta {
    /// Create metadata for a tensor with the given dtype and raw dimensions.
    pub fn new(dtype: impl Into<String>, dims: Vec<i64>) -> Self {
        Self {
            dtype: Some(dtype.into()),
            dims: Ok(dims),
        }
    }

    /// Metadata for a tensor entry whose layout could not be recovered.
    pub fn unreadable(reason: impl Into<String>) -> Self {
        Self {
            dtype: None,
            dims: Err(reason.into()),
        }
    }

    /// Snapshot the metadata of any tensor-like value.
    pub fn of<T: TensorLike + ?Sized>(value: &T, dtype: impl Into<String>) -> Self {
        let shape = match value.shape() {
            Ok(shape) => shape,
            Err(e) => return Self::unreadable(e.to_string()),
        };
        let dims: Result<Vec<i64>, _> = shape.iter().map(|&d| i64::try_from(d)).collect();
        match dims {
            Ok(dims) => Self::new(dtype, dims),
            Err(_) => Self::unreadable(format!("dimension of shape {:?} exceeds i64", shape)),
        }
    }

    pub fn dtype(&self) -> Option<&str> {
        self.dtype.as_deref()
    }
}

impl TensorLike for TensorMeta {
    fn shape(&self) -> Result<Vec<usize>, ShapeError> {
        let dims = self
            .dims
            .as_ref()
            .map_err(|reason| ShapeError::Unreadable(reason.clone()))?;
        dims.iter()
            .enumerate()
            .map(|(axis, &dim)| {
                usize::try_from(dim).map_err(|_| ShapeError::NegativeDimension { axis, dim })
            })
            .collect()
    }
}

#[cfg(feature = "torch")]
impl TensorLike for tch::Tensor {
    fn shape(&self) -> Result<Vec<usize>, ShapeError> {
        self.size()
            .into_iter()
            .enumerate()
            .map(|(axis, dim)| {
                usize::try_from(dim).map_err(|_| ShapeError::NegativeDimension { axis, dim })
            })
            .collect()
    }
}

/// Element count and shape of one tensor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TensorDescription {
    pub num_elements: u64,
    pub shape: Vec<usize>,
}

/// Describe a single tensor-like value.
///
/// Fails per value; callers substitute an error marker for that entry only.
pub fn describe_tensor<T: TensorLike + ?Sized>(value: &T) -> Result<TensorDescription, ShapeError> {
    let shape = value.shape()?;
    let num_elements = shape
        .iter()
        .try_fold(1u64, |acc, &dim| acc.checked_mul(dim as u64))
        .ok_or_else(|| ShapeError::Overflow {
            shape: shape.clone(),
        })?;
    Ok(TensorDescription {
        num_elements,
        shape,
    })
}
