//! Dense row-major 2-D `f32` tensor used by the instrumented module graph.

use crate::errors::InstrumentError;

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self, InstrumentError> {
        if rows * cols != data.len() {
            return Err(InstrumentError::InvalidInput(format!(
                "tensor data has {} elements, shape [{rows}, {cols}] needs {}",
                data.len(),
                rows * cols
            )));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Stack equally sized rows.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self, InstrumentError> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(InstrumentError::InvalidInput("ragged rows".to_string()));
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data: rows.iter().flatten().copied().collect(),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn last_row(&self) -> Option<&[f32]> {
        self.rows.checked_sub(1).map(|i| self.row(i))
    }

    /// Columns `[start, start + width)` of every row, as a new tensor (one attention head).
    pub fn column_block(&self, start: usize, width: usize) -> Result<Tensor, InstrumentError> {
        if start + width > self.cols {
            return Err(InstrumentError::ShapeMismatch {
                op: "column_block",
                detail: format!("[{start}, {}) out of {} columns", start + width, self.cols),
            });
        }
        let mut data = Vec::with_capacity(self.rows * width);
        for r in 0..self.rows {
            data.extend_from_slice(&self.row(r)[start..start + width]);
        }
        Ok(Tensor {
            rows: self.rows,
            cols: width,
            data,
        })
    }

    /// Write `block` into columns `[start, start + block.cols)`.
    pub fn set_column_block(&mut self, start: usize, block: &Tensor) -> Result<(), InstrumentError> {
        if block.rows != self.rows || start + block.cols > self.cols {
            return Err(InstrumentError::ShapeMismatch {
                op: "set_column_block",
                detail: format!(
                    "block {:?} at column {start} into {:?}",
                    block.shape(),
                    self.shape()
                ),
            });
        }
        let cols = self.cols;
        for r in 0..self.rows {
            self.data[r * cols + start..r * cols + start + block.cols]
                .copy_from_slice(block.row(r));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_checked() {
        assert!(Tensor::new(2, 3, vec![0.0; 5]).is_err());
        let t = Tensor::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(t.row(1), &[4.0, 5.0, 6.0]);
        assert_eq!(t.last_row().unwrap(), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn column_blocks_round_trip() {
        let t = Tensor::new(2, 4, (0..8).map(|x| x as f32).collect()).unwrap();
        let head = t.column_block(2, 2).unwrap();
        assert_eq!(head.data(), &[2.0, 3.0, 6.0, 7.0]);
        let mut out = Tensor::zeros(2, 4);
        out.set_column_block(2, &head).unwrap();
        assert_eq!(out.data(), &[0.0, 0.0, 2.0, 3.0, 0.0, 0.0, 6.0, 7.0]);
        assert!(t.column_block(3, 2).is_err());
    }

    #[test]
    fn ragged_rows_rejected() {
        assert!(Tensor::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }
}
