//! Attention mask construction.
//!
//! Masks are `U8` tensors of shape `(batch, len_q, len_k)` where `1` marks a
//! (query, key) pair that must be excluded from attention. They depend on the
//! padding pattern of the current batch and are rebuilt on every forward pass.

use asr_core::{AsrError, AsrResult};
use candle_core::{DType, Tensor};

use crate::check;

/// Block every key position whose reference value is PAD.
///
/// `query_ref` is `(batch, len_q)`, `key_ref` is `(batch, len_k)`; the result
/// is `(batch, len_q, len_k)` with `mask[b, i, k] = key_ref[b, k] == pad_index`.
///
/// Only keys are masked. The query side contributes its length and nothing
/// else: a padded query still attends normally and its output is ignored
/// downstream.
pub fn padding_mask(query_ref: &Tensor, key_ref: &Tensor, pad_index: u32) -> AsrResult<Tensor> {
    let (batch_q, len_q) = check::dims2(query_ref, "query padding reference")?;
    let (key_ref, batch_k, len_k) = check::index_ref(key_ref, "key padding reference")?;
    if batch_q != batch_k {
        return Err(AsrError::shape(format!(
            "query reference batch {batch_q} != key reference batch {batch_k}"
        )));
    }

    let mask = key_ref
        .eq(pad_index)?
        .unsqueeze(1)?
        .broadcast_as((batch_k, len_q, len_k))?
        .contiguous()?;
    Ok(mask)
}

/// Block attention to later positions: `mask[b, i, k] = k > i`.
///
/// Only the shape of `reference` (`(batch, len)`) is used.
pub fn causal_mask(reference: &Tensor) -> AsrResult<Tensor> {
    let (batch, len) = check::dims2(reference, "causal mask reference")?;

    let upper: Vec<u8> = (0..len)
        .flat_map(|i| (0..len).map(move |k| u8::from(k > i)))
        .collect();
    let mask = Tensor::from_vec(upper, (1, len, len), reference.device())?
        .broadcast_as((batch, len, len))?
        .contiguous()?;
    Ok(mask)
}

/// Elementwise OR of two masks of identical shape (sum, then `> 0`).
pub fn combine(a: &Tensor, b: &Tensor) -> AsrResult<Tensor> {
    if a.dims() != b.dims() {
        return Err(AsrError::shape(format!(
            "cannot combine masks of shapes {:?} and {:?}",
            a.dims(),
            b.dims()
        )));
    }
    let a = a.to_dtype(DType::U8)?;
    let b = b.to_dtype(DType::U8)?;
    Ok((a + b)?.gt(0u8)?)
}

/// Check that every row's PAD positions form a right-aligned suffix.
pub fn check_right_padded(reference: &Tensor, pad_index: u32) -> AsrResult<()> {
    let (reference, _, _) = check::index_ref(reference, "padding reference")?;
    let rows = reference.to_vec2::<u32>()?;
    for (row_idx, row) in rows.iter().enumerate() {
        if let Some(first_pad) = row.iter().position(|&v| v == pad_index) {
            if let Some(offset) = row[first_pad..].iter().position(|&v| v != pad_index) {
                return Err(AsrError::PaddingInvariant(format!(
                    "row {row_idx}: value at position {} follows padding that starts at {first_pad}",
                    first_pad + offset
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn reference(device: &Device) -> Tensor {
        Tensor::new(&[[4u32, 5, 6, 0, 0], [7, 8, 9, 10, 11]], device).unwrap()
    }

    #[test]
    fn test_padding_mask_blocks_pad_keys_only() {
        let device = Device::Cpu;
        let r = reference(&device);
        let mask = padding_mask(&r, &r, 0).unwrap();
        assert_eq!(mask.dims(), &[2, 5, 5]);
        assert_eq!(mask.dtype(), DType::U8);

        let mask = mask.to_vec3::<u8>().unwrap();
        for i in 0..5 {
            // Padded query rows (i = 3, 4) are not masked themselves.
            assert_eq!(mask[0][i], vec![0, 0, 0, 1, 1]);
            assert_eq!(mask[1][i], vec![0, 0, 0, 0, 0]);
        }
    }

    #[test]
    fn test_padding_mask_cross_lengths() {
        let device = Device::Cpu;
        let query = Tensor::new(&[[1u32, 2, 0], [1, 0, 0]], &device).unwrap();
        let keys = Tensor::new(&[[1u32, 1, 1, 1], [1, 1, 0, 0]], &device).unwrap();
        let mask = padding_mask(&query, &keys, 0).unwrap();
        assert_eq!(mask.dims(), &[2, 3, 4]);

        let mask = mask.to_vec3::<u8>().unwrap();
        assert!(mask[0].iter().all(|row| row == &vec![0, 0, 0, 0]));
        assert!(mask[1].iter().all(|row| row == &vec![0, 0, 1, 1]));
    }

    #[test]
    fn test_padding_mask_respects_pad_index() {
        let device = Device::Cpu;
        let r = Tensor::new(&[[3u32, 0, 9, 9]], &device).unwrap();
        let mask = padding_mask(&r, &r, 9).unwrap().to_vec3::<u8>().unwrap();
        assert_eq!(mask[0][0], vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_padding_mask_batch_mismatch() {
        let device = Device::Cpu;
        let q = Tensor::ones((2, 3), DType::U32, &device).unwrap();
        let k = Tensor::ones((3, 3), DType::U32, &device).unwrap();
        assert!(matches!(
            padding_mask(&q, &k, 0),
            Err(AsrError::ShapeMismatch(_))
        ));

        let rank3 = Tensor::ones((2, 3, 1), DType::U32, &device).unwrap();
        assert!(matches!(
            padding_mask(&rank3, &k, 0),
            Err(AsrError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_causal_mask_is_strict_upper_triangle() {
        let device = Device::Cpu;
        let r = reference(&device);
        let mask = causal_mask(&r).unwrap();
        assert_eq!(mask.dims(), &[2, 5, 5]);

        let mask = mask.to_vec3::<u8>().unwrap();
        for b in 0..2 {
            for i in 0..5 {
                for k in 0..5 {
                    assert_eq!(mask[b][i][k], u8::from(k > i), "b={b} i={i} k={k}");
                }
                assert_eq!(mask[b][i][i], 0);
            }
        }
    }

    #[test]
    fn test_combine_or() {
        let device = Device::Cpu;
        let r = reference(&device);
        let pad = padding_mask(&r, &r, 0).unwrap();
        let causal = causal_mask(&r).unwrap();
        let combined = combine(&pad, &causal).unwrap().to_vec3::<u8>().unwrap();

        // Row 0: position 2 may see 0..=2, never the padded 3 and 4.
        assert_eq!(combined[0][2], vec![0, 0, 0, 1, 1]);
        assert_eq!(combined[0][4], vec![0, 0, 0, 1, 1]);
        assert_eq!(combined[1][1], vec![0, 0, 1, 1, 1]);
    }

    #[test]
    fn test_combine_commutative_and_idempotent() {
        let device = Device::Cpu;
        let r = reference(&device);
        let a = padding_mask(&r, &r, 0).unwrap();
        let b = causal_mask(&r).unwrap();

        let aa = combine(&a, &a).unwrap().to_vec3::<u8>().unwrap();
        assert_eq!(aa, a.to_vec3::<u8>().unwrap());

        let ab = combine(&a, &b).unwrap().to_vec3::<u8>().unwrap();
        let ba = combine(&b, &a).unwrap().to_vec3::<u8>().unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_combine_shape_mismatch() {
        let device = Device::Cpu;
        let a = Tensor::zeros((1, 2, 2), DType::U8, &device).unwrap();
        let b = Tensor::zeros((1, 2, 3), DType::U8, &device).unwrap();
        assert!(matches!(combine(&a, &b), Err(AsrError::ShapeMismatch(_))));
    }

    #[test]
    fn test_check_right_padded() {
        let device = Device::Cpu;
        assert!(check_right_padded(&reference(&device), 0).is_ok());

        let holes = Tensor::new(&[[4u32, 0, 6, 0]], &device).unwrap();
        assert!(matches!(
            check_right_padded(&holes, 0),
            Err(AsrError::PaddingInvariant(_))
        ));

        let all_pad = Tensor::zeros((1, 3), DType::U32, &device).unwrap();
        assert!(check_right_padded(&all_pad, 0).is_ok());
    }
}
