//! Host-backed tensor handle used by the reference engine and tests.

use std::sync::Arc;

use anyhow::{bail, Result};
use rand::Rng;

use offload_bridge::engine::{DType, TensorValue};

/// Cheap-to-clone host tensor: the payload lives behind an `Arc` and every
/// derived handle (detach, zero-fill) allocates a fresh inner.
#[derive(Debug, Clone)]
pub struct RefTensor {
    inner: Arc<TensorInner>,
}

#[derive(Debug)]
struct TensorInner {
    shape: Vec<usize>,
    dtype: DType,
    data: Vec<f32>,
    requires_grad: bool,
}

impl RefTensor {
    /// Constructs an `F32` tensor from raw values, validating the length
    /// against the shape.
    pub fn from_vec(shape: impl Into<Vec<usize>>, data: Vec<f32>) -> Result<Self> {
        let shape = shape.into();
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape
            );
        }
        Ok(Self::build(shape, DType::F32, data, false))
    }

    /// Samples from `N(0, std^2)` using the Box-Muller transform.
    pub fn randn(shape: impl Into<Vec<usize>>, std: f32, rng: &mut impl Rng) -> Self {
        let shape = shape.into();
        let len: usize = shape.iter().product();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            values.push(r * theta.cos() * std);
            if values.len() < len {
                values.push(r * theta.sin() * std);
            }
        }
        Self::build(shape, DType::F32, values, false)
    }

    /// Zero-element placeholder standing in for offloaded storage.
    pub fn placeholder(dtype: DType) -> Self {
        Self::build(vec![0], dtype, Vec::new(), false)
    }

    pub fn with_requires_grad(self, flag: bool) -> Self {
        Self::build(
            self.inner.shape.clone(),
            self.inner.dtype,
            self.inner.data.clone(),
            flag,
        )
    }

    pub fn values(&self) -> &[f32] {
        &self.inner.data
    }

    /// Reports whether the handle is a zero-element placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.inner.data.is_empty()
    }

    pub(crate) fn build(shape: Vec<usize>, dtype: DType, data: Vec<f32>, requires_grad: bool) -> Self {
        Self {
            inner: Arc::new(TensorInner {
                shape,
                dtype,
                data,
                requires_grad,
            }),
        }
    }
}

impl PartialEq for RefTensor {
    fn eq(&self, other: &Self) -> bool {
        self.inner.shape == other.inner.shape
            && self.inner.dtype == other.inner.dtype
            && self.inner.data == other.inner.data
    }
}

impl TensorValue for RefTensor {
    fn shape(&self) -> &[usize] {
        &self.inner.shape
    }

    fn dtype(&self) -> DType {
        self.inner.dtype
    }

    fn requires_grad(&self) -> bool {
        self.inner.requires_grad
    }

    fn detached(&self, requires_grad: bool) -> Self {
        Self::build(
            self.inner.shape.clone(),
            self.inner.dtype,
            self.inner.data.clone(),
            requires_grad,
        )
    }

    fn zeros(shape: &[usize], dtype: DType) -> Self {
        let len: usize = shape.iter().product();
        Self::build(shape.to_vec(), dtype, vec![0.0; len], false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_rejects_length_mismatch() {
        assert!(RefTensor::from_vec(vec![2, 3], vec![0.0; 5]).is_err());
        assert!(RefTensor::from_vec(vec![2, 3], vec![0.0; 6]).is_ok());
    }

    #[test]
    fn detached_preserves_payload_and_remarks_grad() {
        let tensor = RefTensor::from_vec(vec![2], vec![1.0, 2.0]).unwrap();
        let detached = tensor.detached(true);
        assert_eq!(detached.values(), tensor.values());
        assert!(detached.requires_grad());
        assert!(!tensor.requires_grad());
    }

    #[test]
    fn zeros_matches_requested_shape() {
        let tensor = RefTensor::zeros(&[4, 2], DType::F32);
        assert_eq!(tensor.shape(), &[4, 2]);
        assert_eq!(tensor.values(), &[0.0; 8]);
    }

    #[test]
    fn placeholder_has_no_elements() {
        let tensor = RefTensor::placeholder(DType::F32);
        assert!(tensor.is_placeholder());
        assert_eq!(tensor.shape(), &[0]);
    }
}
