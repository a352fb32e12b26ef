//! An N-dimensional array of `f32` on the CPU.

use std::sync::Arc;

mod error;
pub mod layout;
pub mod sparse;

pub use error::TensorError;
pub use layout::Layout;
pub use sparse::Incidence;

/// A row-major tensor.
///
/// The buffer is shared between clones, so cloning a tensor is cheap. Every operation returns a
/// new tensor and leaves its operands untouched. Element-wise operations broadcast their operands
/// by aligning axes from the right.
#[derive(Debug, Clone)]
pub struct Tensor {
    buffer: Arc<[f32]>,
    layout: Layout,
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.shape() == other.shape() && self.buffer == other.buffer
    }
}

impl<'a> IntoIterator for &'a Tensor {
    type Item = &'a f32;

    type IntoIter = std::slice::Iter<'a, f32>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffer.iter()
    }
}

impl<const N: usize> From<[f32; N]> for Tensor {
    fn from(data: [f32; N]) -> Self {
        Self {
            buffer: Arc::from(data.as_slice()),
            layout: Layout::new(&[N]),
        }
    }
}

impl Tensor {
    /// Create a tensor given its shape and data.
    ///
    /// The order of the elements in `data` is in increasing order of the last axis, then the second
    /// last, and so on.
    pub fn new(shape: &[usize], data: &[f32]) -> Result<Self, TensorError> {
        Self::from_vec(shape, data.to_vec())
    }

    /// Create a tensor taking ownership of its data.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Self, TensorError> {
        let layout = Layout::new(shape);
        if layout.elems() != data.len() {
            return Err(TensorError::ElementCount {
                shape: shape.to_vec(),
                expected: layout.elems(),
                got: data.len(),
            });
        }
        Ok(Self {
            buffer: Arc::from(data),
            layout,
        })
    }

    /// Create a scalar holding the given value.
    ///
    /// This is a special tensor that has no shape.
    pub fn scalar(value: f32) -> Self {
        Self {
            buffer: Arc::from([value].as_slice()),
            layout: Layout::new(&[]),
        }
    }

    /// Create a tensor given its shape filled with a single value.
    pub fn full(shape: &[usize], value: f32) -> Self {
        let layout = Layout::new(shape);
        Self {
            buffer: vec![value; layout.elems()].into(),
            layout,
        }
    }

    /// Create a tensor given its shape filled with zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    /// Return the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    /// Return the number of elements.
    pub fn elems(&self) -> usize {
        self.layout.elems()
    }

    /// Return the number of rows and columns of a matrix.
    pub fn dims2(&self) -> Result<(usize, usize), TensorError> {
        match self.shape() {
            [rows, cols] => Ok((*rows, *cols)),
            shape => Err(TensorError::Rank {
                expected: 2,
                shape: shape.to_vec(),
            }),
        }
    }

    /// Return the element at the given index.
    pub fn get(&self, index: &[usize]) -> Option<f32> {
        if index.len() != self.shape().len()
            || index.iter().zip(self.shape()).any(|(i, d)| i >= d)
        {
            return None;
        }
        Some(self.buffer[self.layout.index_to_position(index)])
    }

    /// Return the elements in row-major order.
    pub fn as_slice(&self) -> &[f32] {
        &self.buffer
    }

    /// Return a copy of the elements in row-major order.
    pub fn ravel(&self) -> Vec<f32> {
        self.buffer.to_vec()
    }

    /// Return the only element of a tensor holding exactly one element.
    pub fn item(&self) -> Option<f32> {
        (self.elems() == 1).then(|| self.buffer[0])
    }

    /// Apply `f` to each element.
    #[must_use]
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(f32) -> f32,
    {
        Self {
            buffer: self.buffer.iter().map(|x| f(*x)).collect(),
            layout: Layout::new(self.shape()),
        }
    }

    /// Combine two tensors element-wise with `f`, broadcasting them to a common shape.
    pub fn zip<F>(&self, other: &Self, f: F) -> Result<Self, TensorError>
    where
        F: Fn(f32, f32) -> f32,
    {
        if self.shape() == other.shape() {
            return Ok(Self {
                buffer: self
                    .buffer
                    .iter()
                    .zip(other.buffer.iter())
                    .map(|(x, y)| f(*x, *y))
                    .collect(),
                layout: Layout::new(self.shape()),
            });
        }
        let shape = layout::broadcast_shape(self.shape(), other.shape())?;
        let layout = Layout::new(&shape);
        let lhs = self.layout.expand(&shape)?;
        let rhs = other.layout.expand(&shape)?;
        let buffer = lhs
            .positions()
            .zip(rhs.positions())
            .map(|(l, r)| f(self.buffer[l], other.buffer[r]))
            .collect();
        Ok(Self { buffer, layout })
    }

    /// Add `other` element-wise.
    pub fn add(&self, other: &Self) -> Result<Self, TensorError> {
        self.zip(other, |x, y| x + y)
    }

    /// Subtract `other` element-wise.
    pub fn sub(&self, other: &Self) -> Result<Self, TensorError> {
        self.zip(other, |x, y| x - y)
    }

    /// Multiply by `other` element-wise.
    pub fn mul(&self, other: &Self) -> Result<Self, TensorError> {
        self.zip(other, |x, y| x * y)
    }

    /// Multiply every element by a constant.
    #[must_use]
    pub fn scale(&self, factor: f32) -> Self {
        self.map(|x| x * factor)
    }

    /// Sum all elements.
    pub fn sum(&self) -> f32 {
        self.buffer.iter().sum()
    }

    /// Average all elements.
    pub fn mean(&self) -> f32 {
        if self.elems() == 0 {
            return f32::NAN;
        }
        self.sum() / self.elems() as f32
    }

    /// Reduce the tensor by summation until it has the given shape.
    ///
    /// This undoes broadcasting: `shape` must be broadcastable to the tensor's shape, and every
    /// axis along which `shape` was broadcast is summed away.
    pub fn sum_to(&self, shape: &[usize]) -> Result<Self, TensorError> {
        if self.shape() == shape {
            return Ok(self.clone());
        }
        let reducer = Layout::new(shape).expand(self.shape())?;
        let mut buffer = vec![0.0; Layout::new(shape).elems()];
        for (position, x) in reducer.positions().zip(self.buffer.iter()) {
            buffer[position] += x;
        }
        Self::from_vec(shape, buffer)
    }

    /// Reshape the tensor, keeping the number of elements unchanged.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self, TensorError> {
        let layout = Layout::new(shape);
        if layout.elems() != self.elems() {
            return Err(TensorError::IncompatibleShapes(
                self.shape().to_vec(),
                shape.to_vec(),
            ));
        }
        Ok(Self {
            buffer: Arc::clone(&self.buffer),
            layout,
        })
    }

    /// Swap the two axes of a matrix.
    pub fn transpose(&self) -> Result<Self, TensorError> {
        let (rows, cols) = self.dims2()?;
        let mut buffer = vec![0.0; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                buffer[c * rows + r] = self.buffer[r * cols + c];
            }
        }
        Self::from_vec(&[cols, rows], buffer)
    }

    /// Multiply two matrices.
    pub fn matmul(&self, other: &Self) -> Result<Self, TensorError> {
        let (m, k) = self.dims2()?;
        let (k2, n) = other.dims2()?;
        if k != k2 {
            return Err(TensorError::IncompatibleShapes(
                self.shape().to_vec(),
                other.shape().to_vec(),
            ));
        }
        let mut buffer = vec![0.0; m * n];
        for i in 0..m {
            let out = &mut buffer[i * n..(i + 1) * n];
            for p in 0..k {
                let a = self.buffer[i * k + p];
                if a == 0.0 {
                    continue;
                }
                let row = &other.buffer[p * n..(p + 1) * n];
                for (o, b) in out.iter_mut().zip(row) {
                    *o += a * b;
                }
            }
        }
        Self::from_vec(&[m, n], buffer)
    }

    /// Collect the given rows of a matrix into a new matrix, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Result<Self, TensorError> {
        let (nrows, cols) = self.dims2()?;
        let mut buffer = Vec::with_capacity(rows.len() * cols);
        for &r in rows {
            if r >= nrows {
                return Err(TensorError::OutOfBounds {
                    index: r,
                    size: nrows,
                });
            }
            buffer.extend_from_slice(&self.buffer[r * cols..(r + 1) * cols]);
        }
        Self::from_vec(&[rows.len(), cols], buffer)
    }

    /// Return a row of a matrix.
    pub fn row(&self, row: usize) -> Result<&[f32], TensorError> {
        let (rows, cols) = self.dims2()?;
        if row >= rows {
            return Err(TensorError::OutOfBounds {
                index: row,
                size: rows,
            });
        }
        Ok(&self.buffer[row * cols..(row + 1) * cols])
    }
}
