//! Mapping between multi-dimensional indices and positions in a flat buffer.

use std::iter;

use super::error::TensorError;

/// Shape and strides of a tensor.
///
/// Layouts built with [`Layout::new`] are contiguous and row-major. Layouts returned by
/// [`Layout::expand`] may contain zero strides, in which case several indices map to the same
/// position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Vec<usize>,
    strides: Vec<usize>,
}

impl Layout {
    /// Create a contiguous row-major layout for the given shape.
    pub fn new(shape: &[usize]) -> Self {
        let mut strides = Vec::with_capacity(shape.len());
        let mut stride = 1;
        for s in shape.iter().rev() {
            strides.push(stride);
            stride *= s;
        }
        strides.reverse();
        Self {
            shape: shape.to_vec(),
            strides,
        }
    }

    /// The size of each axis.
    pub fn shape(&self) -> &[usize] {
        self.shape.as_slice()
    }

    /// The distance in the buffer between two consecutive indices along each axis.
    pub fn strides(&self) -> &[usize] {
        self.strides.as_slice()
    }

    /// The number of addressable elements.
    pub fn elems(&self) -> usize {
        self.shape.iter().product()
    }

    /// Broadcast this layout to `shape`.
    ///
    /// Axes are aligned from the right. An axis of size 1, or a missing leading axis, is
    /// repeated along the corresponding axis of `shape` by giving it a zero stride.
    pub fn expand(&self, shape: &[usize]) -> Result<Self, TensorError> {
        if self.shape.len() > shape.len() {
            return Err(TensorError::IncompatibleShapes(
                self.shape.clone(),
                shape.to_vec(),
            ));
        }
        let mut new_strides = Vec::with_capacity(shape.len());
        let own = self
            .shape
            .iter()
            .zip(self.strides.iter())
            .rev()
            .map(Some)
            .chain(iter::repeat(None));
        for (dim, own) in shape.iter().rev().zip(own) {
            match own {
                None | Some((1, _)) => new_strides.push(0),
                Some((d, s)) if d == dim => new_strides.push(*s),
                Some(_) => {
                    return Err(TensorError::IncompatibleShapes(
                        self.shape.clone(),
                        shape.to_vec(),
                    ))
                }
            }
        }
        new_strides.reverse();
        Ok(Self {
            shape: shape.to_vec(),
            strides: new_strides,
        })
    }

    /// Convert an index into a position in the underlying buffer.
    pub fn index_to_position(&self, index: &[usize]) -> usize {
        index
            .iter()
            .zip(self.strides.iter())
            .map(|(x, s)| x * s)
            .sum()
    }

    /// Iterate over the buffer positions of all indices in row-major order.
    pub fn positions(&self) -> Positions<'_> {
        Positions {
            layout: self,
            index: vec![0; self.shape.len()],
            position: 0,
            remaining: self.elems(),
        }
    }

    /// Convert a position in a contiguous buffer back into an index.
    pub fn position_to_index(&self, position: usize) -> Vec<usize> {
        let mut index = Vec::with_capacity(self.shape.len());
        let mut remainder = position;
        for s in self.strides() {
            if *s == 0 {
                index.push(0);
                continue;
            }
            index.push(remainder / s);
            remainder %= s;
        }
        index
    }
}

/// Iterator returned by [`Layout::positions`].
#[derive(Debug)]
pub struct Positions<'a> {
    layout: &'a Layout,
    index: Vec<usize>,
    position: usize,
    remaining: usize,
}

impl Iterator for Positions<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.position;
        self.remaining -= 1;
        if self.remaining > 0 {
            for axis in (0..self.index.len()).rev() {
                let stride = self.layout.strides[axis];
                self.index[axis] += 1;
                self.position += stride;
                if self.index[axis] < self.layout.shape[axis] {
                    break;
                }
                self.position -= stride * self.layout.shape[axis];
                self.index[axis] = 0;
            }
        }
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Positions<'_> {}

impl From<&[usize]> for Layout {
    fn from(shape: &[usize]) -> Self {
        Self::new(shape)
    }
}

impl<const N: usize> From<&[usize; N]> for Layout {
    fn from(shape: &[usize; N]) -> Self {
        Self::new(shape)
    }
}

/// Compute the shape two operands are broadcast to, aligning axes from the right.
pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, TensorError> {
    let (short, long) = if lhs.len() < rhs.len() {
        (lhs, rhs)
    } else {
        (rhs, lhs)
    };
    let mut shape = Vec::with_capacity(long.len());
    for dims in short
        .iter()
        .rev()
        .chain(iter::once(&1usize).cycle())
        .zip(long.iter().rev())
    {
        match dims {
            (1, d) | (d, 1) => shape.push(*d),
            (dx, dy) if dx == dy => shape.push(*dx),
            _ => return Err(TensorError::IncompatibleShapes(lhs.to_vec(), rhs.to_vec())),
        }
    }
    shape.reverse();
    Ok(shape)
}
