//! A sparse binary matrix that groups element slots under set slots.
//!
//! Multiplying the matrix with a dense matrix of per-element rows sums the rows belonging to each
//! group, which is how sets are pooled. The same structure can be read as a grouping map from a
//! row to the columns it owns, so the product is computed as a segmented sum rather than a
//! general sparse product.

use std::sync::Arc;

use crate::tensor::{Tensor, TensorError};

/// Sparse boolean matrix in compressed sparse row form.
///
/// Entries are sorted by row and then by column, unique, and all equal to 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incidence {
    offsets: Arc<[usize]>,
    columns: Arc<[usize]>,
    cols: usize,
}

impl Incidence {
    /// Build the relation for consecutive groups.
    ///
    /// Group `j` owns the `sizes[j]` columns that follow those of group `j - 1`. Rows after the
    /// last group own nothing.
    pub fn from_group_sizes(sizes: &[usize], rows: usize, cols: usize) -> Result<Self, TensorError> {
        if sizes.len() > rows {
            return Err(TensorError::OutOfBounds {
                index: sizes.len(),
                size: rows,
            });
        }
        let total: usize = sizes.iter().sum();
        if total > cols {
            return Err(TensorError::OutOfBounds {
                index: total,
                size: cols,
            });
        }
        let mut offsets = Vec::with_capacity(rows + 1);
        offsets.push(0);
        let mut end = 0;
        for size in sizes {
            end += size;
            offsets.push(end);
        }
        offsets.resize(rows + 1, end);
        Ok(Self {
            offsets: offsets.into(),
            columns: (0..total).collect(),
            cols,
        })
    }

    /// Build the relation from explicit member lists, one per row.
    ///
    /// Members of a row are sorted and deduplicated.
    pub fn from_groups(groups: &[Vec<usize>], cols: usize) -> Result<Self, TensorError> {
        let mut offsets = Vec::with_capacity(groups.len() + 1);
        let mut columns = Vec::new();
        offsets.push(0);
        for group in groups {
            let mut members = group.clone();
            members.sort_unstable();
            members.dedup();
            if let Some(&last) = members.last() {
                if last >= cols {
                    return Err(TensorError::OutOfBounds {
                        index: last,
                        size: cols,
                    });
                }
            }
            columns.extend(members);
            offsets.push(columns.len());
        }
        Ok(Self {
            offsets: offsets.into(),
            columns: columns.into(),
            cols,
        })
    }

    /// The number of rows, one per group slot.
    pub fn rows(&self) -> usize {
        self.offsets.len() - 1
    }

    /// The number of columns, one per element slot.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// The number of non-zero entries.
    pub fn nnz(&self) -> usize {
        self.columns.len()
    }

    /// The columns owned by a row, in increasing order.
    pub fn members(&self, row: usize) -> &[usize] {
        &self.columns[self.offsets[row]..self.offsets[row + 1]]
    }

    /// Iterate over the `(row, column)` coordinates of the non-zero entries in sorted order.
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.rows()).flat_map(move |r| self.members(r).iter().map(move |c| (r, *c)))
    }

    /// The number of columns owned by some row.
    pub fn column_coverage(&self) -> usize {
        let mut covered = vec![false; self.cols];
        for c in self.columns.iter() {
            covered[*c] = true;
        }
        covered.into_iter().filter(|x| *x).count()
    }

    /// Multiply the relation with a vector.
    pub fn matvec(&self, x: &[f32]) -> Result<Vec<f32>, TensorError> {
        if x.len() != self.cols {
            return Err(TensorError::IncompatibleShapes(
                vec![self.rows(), self.cols],
                vec![x.len()],
            ));
        }
        Ok((0..self.rows())
            .map(|r| self.members(r).iter().map(|c| x[*c]).sum())
            .collect())
    }

    /// Multiply the relation with a `[cols, k]` matrix, summing the rows of every group.
    pub fn matmul(&self, x: &Tensor) -> Result<Tensor, TensorError> {
        let (rows, k) = x.dims2()?;
        if rows != self.cols {
            return Err(TensorError::IncompatibleShapes(
                vec![self.rows(), self.cols],
                x.shape().to_vec(),
            ));
        }
        let data = x.as_slice();
        let mut buffer = vec![0.0; self.rows() * k];
        for (r, out) in buffer.chunks_mut(k.max(1)).enumerate().take(self.rows()) {
            for c in self.members(r) {
                for (o, v) in out.iter_mut().zip(&data[c * k..(c + 1) * k]) {
                    *o += v;
                }
            }
        }
        Tensor::from_vec(&[self.rows(), k], buffer)
    }

    /// Multiply the transposed relation with a `[rows, k]` matrix, copying every group's row to
    /// the columns it owns.
    pub fn transpose_matmul(&self, y: &Tensor) -> Result<Tensor, TensorError> {
        let (rows, k) = y.dims2()?;
        if rows != self.rows() {
            return Err(TensorError::IncompatibleShapes(
                vec![self.cols, self.rows()],
                y.shape().to_vec(),
            ));
        }
        let data = y.as_slice();
        let mut buffer = vec![0.0; self.cols * k];
        for r in 0..self.rows() {
            let src = &data[r * k..(r + 1) * k];
            for c in self.members(r) {
                for (o, v) in buffer[c * k..(c + 1) * k].iter_mut().zip(src) {
                    *o += v;
                }
            }
        }
        Tensor::from_vec(&[self.cols, k], buffer)
    }

    /// Materialize the relation as a dense `[rows, cols]` matrix.
    pub fn to_dense(&self) -> Tensor {
        let mut buffer = vec![0.0; self.rows() * self.cols];
        for (r, c) in self.entries() {
            buffer[r * self.cols + c] = 1.0;
        }
        Tensor {
            buffer: buffer.into(),
            layout: crate::tensor::Layout::new(&[self.rows(), self.cols]),
        }
    }
}
