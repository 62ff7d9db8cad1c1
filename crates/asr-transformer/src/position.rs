//! Sinusoid position encoding table.

use asr_core::{AsrError, AsrResult};
use candle_core::{DType, Device, Tensor};

use crate::check;

/// Fixed sinusoid position table of shape `(n_position, d_pos_vec)`.
///
/// Row 0 is reserved for the padding position and is all zeros. For a real
/// position `pos >= 1` and dimension `j` the angle is
/// `pos / 10000^(2 * (j / 2) / d_pos_vec)`; even dimensions hold its sine,
/// odd dimensions its cosine.
///
/// The table is built once and only read afterwards; clones share storage.
#[derive(Debug, Clone)]
pub struct PositionEncoding {
    table: Tensor,
    n_position: usize,
    d_pos_vec: usize,
}

impl PositionEncoding {
    /// Build the table.
    ///
    /// # Arguments
    /// * `n_position` - Number of rows, including the reserved zero row
    /// * `d_pos_vec` - Encoding width (must be even and positive)
    /// * `device` - Device to create the table on
    pub fn new(n_position: usize, d_pos_vec: usize, device: &Device) -> AsrResult<Self> {
        if n_position == 0 {
            return Err(AsrError::config("n_position must be positive"));
        }
        if d_pos_vec == 0 || d_pos_vec % 2 != 0 {
            return Err(AsrError::config(format!(
                "position encoding needs an even positive width, got {d_pos_vec}"
            )));
        }

        // Angles in f64, rounded to f32 once.
        let mut data = vec![0.0_f32; n_position * d_pos_vec];
        for pos in 1..n_position {
            for j in 0..d_pos_vec {
                let exponent = (2 * (j / 2)) as f64 / d_pos_vec as f64;
                let angle = pos as f64 / 10000_f64.powf(exponent);
                let value = if j % 2 == 0 { angle.sin() } else { angle.cos() };
                data[pos * d_pos_vec + j] = value as f32;
            }
        }

        let table = Tensor::from_vec(data, (n_position, d_pos_vec), device)?;
        Ok(Self {
            table,
            n_position,
            d_pos_vec,
        })
    }

    /// The full `(n_position, d_pos_vec)` table.
    pub fn table(&self) -> &Tensor {
        &self.table
    }

    pub fn n_position(&self) -> usize {
        self.n_position
    }

    pub fn d_pos_vec(&self) -> usize {
        self.d_pos_vec
    }

    /// Position indices for a padding reference.
    ///
    /// Non-PAD position `i` gets index `i + 1`, PAD positions get the zero row.
    /// Returns a `U32` tensor of shape `(batch, len)`.
    pub fn positions(&self, pad_ref: &Tensor, pad_index: u32) -> AsrResult<Tensor> {
        let (reference, batch, len) = check::index_ref(pad_ref, "position reference")?;
        if len >= self.n_position {
            return Err(AsrError::shape(format!(
                "sequence length {len} exceeds the {} encodable positions",
                self.n_position - 1
            )));
        }
        let steps = Tensor::arange(1u32, len as u32 + 1, reference.device())?
            .unsqueeze(0)?
            .broadcast_as((batch, len))?;
        let valid = reference.ne(pad_index)?.to_dtype(DType::U32)?;
        Ok(steps.broadcast_mul(&valid)?)
    }

    /// Look up encodings for a padding reference: `(batch, len)` -> `(batch, len, d_pos_vec)`.
    pub fn forward(&self, pad_ref: &Tensor, pad_index: u32) -> AsrResult<Tensor> {
        let positions = self.positions(pad_ref, pad_index)?;
        let (batch, len) = positions.dims2()?;
        let flat = positions.flatten_all()?;
        let encoded = self
            .table
            .index_select(&flat, 0)?
            .reshape((batch, len, self.d_pos_vec))?;
        Ok(encoded)
    }
}
