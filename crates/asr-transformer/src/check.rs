//! Eager shape checks that turn rank/size violations into `ShapeMismatch`.

use asr_core::{AsrError, AsrResult};
use candle_core::{DType, Tensor};

pub(crate) fn dims2(t: &Tensor, what: &str) -> AsrResult<(usize, usize)> {
    match t.dims() {
        &[b, l] => Ok((b, l)),
        dims => Err(AsrError::shape(format!(
            "{what}: expected rank 2 (batch, len), got {dims:?}"
        ))),
    }
}

pub(crate) fn dims3(t: &Tensor, what: &str) -> AsrResult<(usize, usize, usize)> {
    match t.dims() {
        &[b, l, d] => Ok((b, l, d)),
        dims => Err(AsrError::shape(format!(
            "{what}: expected rank 3 (batch, len, width), got {dims:?}"
        ))),
    }
}

/// Validate a `(batch, len)` reference and return it as `U32`.
pub(crate) fn index_ref(t: &Tensor, what: &str) -> AsrResult<(Tensor, usize, usize)> {
    let (b, l) = dims2(t, what)?;
    let t = if t.dtype() == DType::U32 {
        t.clone()
    } else {
        t.to_dtype(DType::U32)?
    };
    Ok((t, b, l))
}

/// Sequence tensor `(b, l, width)` with a fixed expected width.
pub(crate) fn sequence(
    t: &Tensor,
    width: usize,
    what: &str,
) -> AsrResult<(usize, usize)> {
    let (b, l, d) = dims3(t, what)?;
    if d != width {
        return Err(AsrError::shape(format!(
            "{what}: expected width {width}, got {d}"
        )));
    }
    Ok((b, l))
}

/// A padding reference must cover exactly the sequence it describes.
pub(crate) fn same_extent(
    seq: (usize, usize),
    reference: (usize, usize),
    what: &str,
) -> AsrResult<()> {
    if seq != reference {
        return Err(AsrError::shape(format!(
            "{what}: sequence is (batch={}, len={}) but its padding reference is (batch={}, len={})",
            seq.0, seq.1, reference.0, reference.1
        )));
    }
    Ok(())
}
