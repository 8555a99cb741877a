//! Named, shaped tensors and their flat representation
//!
//! The averaging engine only sees one flat `f32` buffer; a `TensorSet`
//! remembers the names and shapes needed to turn it back into tensors.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One named tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    /// Create a tensor, checking the buffer matches the shape
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let name = name.into();
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(Error::local_compute(
                "tensor",
                format!(
                    "tensor '{}' has {} values but shape {:?} needs {}",
                    name,
                    data.len(),
                    shape,
                    expected
                ),
            ));
        }
        Ok(Self { name, shape, data })
    }

    /// Zero-filled tensor of the given shape
    pub fn zeros(name: impl Into<String>, shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            name: name.into(),
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// Ordered collection of tensors sharing one layout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TensorSet {
    tensors: Vec<Tensor>,
}

impl TensorSet {
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self { tensors }
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalar values
    pub fn total_elements(&self) -> usize {
        self.tensors.iter().map(Tensor::numel).sum()
    }

    /// Whether `other` has the same names and shapes in the same order
    pub fn same_layout(&self, other: &TensorSet) -> bool {
        self.tensors.len() == other.tensors.len()
            && self
                .tensors
                .iter()
                .zip(&other.tensors)
                .all(|(a, b)| a.name == b.name && a.shape == b.shape)
    }

    /// Whether every value is finite
    pub fn is_finite(&self) -> bool {
        self.tensors.iter().all(|t| t.data.iter().all(|v| v.is_finite()))
    }

    /// Concatenate every tensor into one buffer
    pub fn flatten(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(self.total_elements());
        for tensor in &self.tensors {
            flat.extend_from_slice(&tensor.data);
        }
        flat
    }

    /// Split a flat buffer back into tensors with this set's layout
    pub fn unflatten_like(&self, flat: &[f32]) -> Result<TensorSet> {
        if flat.len() != self.total_elements() {
            return Err(Error::local_compute(
                "unflatten",
                format!(
                    "buffer has {} values, layout needs {}",
                    flat.len(),
                    self.total_elements()
                ),
            ));
        }

        let mut offset = 0;
        let tensors = self
            .tensors
            .iter()
            .map(|t| {
                let end = offset + t.numel();
                let tensor = Tensor {
                    name: t.name.clone(),
                    shape: t.shape.clone(),
                    data: flat[offset..end].to_vec(),
                };
                offset = end;
                tensor
            })
            .collect();
        Ok(TensorSet { tensors })
    }

    /// `self += weight * other`
    pub fn add_scaled(&mut self, other: &TensorSet, weight: f32) -> Result<()> {
        if !self.same_layout(other) {
            return Err(Error::local_compute("accumulate", "gradient layout changed between batches"));
        }
        for (mine, theirs) in self.tensors.iter_mut().zip(&other.tensors) {
            for (a, b) in mine.data.iter_mut().zip(&theirs.data) {
                *a += weight * b;
            }
        }
        Ok(())
    }

    /// Multiply every value by `factor`
    pub fn scale(&mut self, factor: f32) {
        for tensor in &mut self.tensors {
            for value in &mut tensor.data {
                *value *= factor;
            }
        }
    }
}
