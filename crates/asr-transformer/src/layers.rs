//! Attention layers used by the encoder and decoder stacks.
//!
//! The stacks only depend on the two capability traits,
//! [`SelfAttentionLayer`] and [`CrossAttentionLayer`]. [`EncoderLayer`] and
//! [`DecoderLayer`] are the concrete post-norm implementations:
//! - multi-head scaled dot-product attention with residual + LayerNorm
//! - position-wise feed-forward (fc -> ReLU -> fc) with residual + LayerNorm
//!
//! All masks follow the crate convention: `U8`, `(batch, len_q, len_k)`,
//! `1` = blocked.

use candle_core::{Result, Tensor};
use candle_nn::{Dropout, LayerNorm, Linear, Module, VarBuilder, layer_norm, linear, linear_no_bias};

use crate::config::TransformerConfig;

/// Score assigned to blocked (query, key) pairs before the softmax.
///
/// Large enough that `exp` underflows to exactly zero, finite so that a row
/// with every key blocked degrades to a uniform distribution instead of NaN.
const MASK_FILL: f32 = -1e9;

/// A layer that attends over its own input sequence.
pub trait SelfAttentionLayer {
    /// `x`: `(batch, len, d_model)`, `mask`: `(batch, len, len)`.
    ///
    /// Returns the transformed sequence (same shape as `x`) and the attention
    /// weights `(batch, n_head, len, len)`.
    fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<(Tensor, Tensor)>;
}

/// A layer that attends over its own input, then over an encoded source.
pub trait CrossAttentionLayer {
    /// `x`: `(batch, len_t, d_model)`, `enc_output`: `(batch, len_s, d_model)`,
    /// `self_mask`: `(batch, len_t, len_t)`, `cross_mask`: `(batch, len_t, len_s)`.
    ///
    /// Returns the transformed sequence, the self-attention weights and the
    /// cross-attention weights.
    fn forward(
        &self,
        x: &Tensor,
        enc_output: &Tensor,
        self_mask: &Tensor,
        cross_mask: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor)>;
}

/// Multi-head attention with post residual LayerNorm.
///
/// Queries and keys are projected to `n_head * d_k`, values to `n_head * d_v`.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    w_qs: Linear,
    w_ks: Linear,
    w_vs: Linear,
    proj: Linear,
    layer_norm: LayerNorm,
    dropout: Dropout,
    n_head: usize,
    d_k: usize,
    d_v: usize,
}

impl MultiHeadAttention {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let TransformerConfig {
            n_head,
            d_k,
            d_v,
            d_model,
            ..
        } = *config;

        let w_qs = linear_no_bias(d_model, n_head * d_k, vb.pp("w_qs"))?;
        let w_ks = linear_no_bias(d_model, n_head * d_k, vb.pp("w_ks"))?;
        let w_vs = linear_no_bias(d_model, n_head * d_v, vb.pp("w_vs"))?;
        let proj = linear(n_head * d_v, d_model, vb.pp("proj"))?;
        let layer_norm = layer_norm(d_model, config.layer_norm_eps, vb.pp("layer_norm"))?;

        Ok(Self {
            w_qs,
            w_ks,
            w_vs,
            proj,
            layer_norm,
            dropout: Dropout::new(config.dropout),
            n_head,
            d_k,
            d_v,
        })
    }

    /// Attend from `q_in` over `kv_in`.
    ///
    /// Returns `(output, weights)`; output has the shape of `q_in`, weights are
    /// `(batch, n_head, len_q, len_k)`.
    pub fn forward(
        &self,
        q_in: &Tensor,
        kv_in: &Tensor,
        mask: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, len_q, _) = q_in.dims3()?;

        // [batch, len, n_head * width] -> [batch, n_head, len, width]
        let q = split_heads(&self.w_qs.forward(q_in)?, self.n_head, self.d_k)?;
        let k = split_heads(&self.w_ks.forward(kv_in)?, self.n_head, self.d_k)?;
        let v = split_heads(&self.w_vs.forward(kv_in)?, self.n_head, self.d_v)?;

        let scale = (self.d_k as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? / scale)?;

        // mask: [batch, len_q, len_k] -> [batch, 1, len_q, len_k]
        let mask = mask.unsqueeze(1)?.broadcast_as(scores.shape())?;
        let fill = Tensor::new(MASK_FILL, scores.device())?
            .to_dtype(scores.dtype())?
            .broadcast_as(scores.shape())?;
        let scores = mask.where_cond(&fill, &scores)?;

        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let context = self
            .dropout
            .forward(&weights, train)?
            .matmul(&v)?;

        // [batch, n_head, len_q, d_v] -> [batch, len_q, n_head * d_v]
        let context = context.transpose(1, 2)?.contiguous()?.reshape((
            batch,
            len_q,
            self.n_head * self.d_v,
        ))?;

        let output = self.dropout.forward(&self.proj.forward(&context)?, train)?;
        let output = self.layer_norm.forward(&(output + q_in)?)?;
        Ok((output, weights))
    }
}

fn split_heads(x: &Tensor, n_head: usize, width: usize) -> Result<Tensor> {
    let (batch, len, _) = x.dims3()?;
    x.reshape((batch, len, n_head, width))?
        .transpose(1, 2)?
        .contiguous()
}

/// Position-wise feed-forward block: fc -> ReLU -> fc, residual, LayerNorm.
#[derive(Debug, Clone)]
pub struct PositionwiseFeedForward {
    w_1: Linear,
    w_2: Linear,
    layer_norm: LayerNorm,
    dropout: Dropout,
}

impl PositionwiseFeedForward {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let w_1 = linear(config.d_model, config.d_inner_hid, vb.pp("w_1"))?;
        let w_2 = linear(config.d_inner_hid, config.d_model, vb.pp("w_2"))?;
        let layer_norm = layer_norm(config.d_model, config.layer_norm_eps, vb.pp("layer_norm"))?;

        Ok(Self {
            w_1,
            w_2,
            layer_norm,
            dropout: Dropout::new(config.dropout),
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.w_1.forward(x)?.relu()?;
        let hidden = self.dropout.forward(&self.w_2.forward(&hidden)?, train)?;
        self.layer_norm.forward(&(hidden + x)?)
    }
}

/// Encoder layer: self-attention followed by the feed-forward block.
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    slf_attn: MultiHeadAttention,
    pos_ffn: PositionwiseFeedForward,
}

impl EncoderLayer {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let slf_attn = MultiHeadAttention::new(config, vb.pp("slf_attn"))?;
        let pos_ffn = PositionwiseFeedForward::new(config, vb.pp("pos_ffn"))?;
        Ok(Self { slf_attn, pos_ffn })
    }
}

impl SelfAttentionLayer for EncoderLayer {
    fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (hidden, weights) = self.slf_attn.forward(x, x, mask, train)?;
        let hidden = self.pos_ffn.forward(&hidden, train)?;
        Ok((hidden, weights))
    }
}

/// Decoder layer: masked self-attention, attention over the encoder output,
/// then the feed-forward block.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    slf_attn: MultiHeadAttention,
    enc_attn: MultiHeadAttention,
    pos_ffn: PositionwiseFeedForward,
}

impl DecoderLayer {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let slf_attn = MultiHeadAttention::new(config, vb.pp("slf_attn"))?;
        let enc_attn = MultiHeadAttention::new(config, vb.pp("enc_attn"))?;
        let pos_ffn = PositionwiseFeedForward::new(config, vb.pp("pos_ffn"))?;
        Ok(Self {
            slf_attn,
            enc_attn,
            pos_ffn,
        })
    }
}

impl CrossAttentionLayer for DecoderLayer {
    fn forward(
        &self,
        x: &Tensor,
        enc_output: &Tensor,
        self_mask: &Tensor,
        cross_mask: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let (hidden, slf_weights) = self.slf_attn.forward(x, x, self_mask, train)?;
        let (hidden, enc_weights) = self.enc_attn.forward(&hidden, enc_output, cross_mask, train)?;
        let hidden = self.pos_ffn.forward(&hidden, train)?;
        Ok((hidden, slf_weights, enc_weights))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    fn small_config() -> TransformerConfig {
        TransformerConfig::new(12, 10, 16)
            .with_layers(1)
            .with_heads(2, 4, 3)
            .with_d_model(8)
            .with_d_inner_hid(16)
            .with_dropout(0.0)
    }

    #[test]
    fn test_encoder_layer_shapes() {
        let device = Device::Cpu;
        let config = small_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = EncoderLayer::new(&config, vb.pp("layer")).unwrap();

        let x = Tensor::randn(0f32, 1f32, (2, 5, 8), &device).unwrap();
        let reference = Tensor::ones((2, 5), DType::U32, &device).unwrap();
        let m = mask::padding_mask(&reference, &reference, 0).unwrap();

        let (out, weights) = SelfAttentionLayer::forward(&layer, &x, &m, false).unwrap();
        assert_eq!(out.dims(), &[2, 5, 8]);
        assert_eq!(weights.dims(), &[2, 2, 5, 5]);
    }

    #[test]
    fn test_blocked_keys_get_zero_weight() {
        let device = Device::Cpu;
        let config = small_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = MultiHeadAttention::new(&config, vb.pp("attn")).unwrap();

        let x = Tensor::randn(0f32, 1f32, (1, 4, 8), &device).unwrap();
        let reference = Tensor::new(&[[3u32, 4, 0, 0]], &device).unwrap();
        let m = mask::padding_mask(&reference, &reference, 0).unwrap();

        let (_, weights) = attn.forward(&x, &x, &m, false).unwrap();
        let weights = weights.i(0).unwrap().to_vec3::<f32>().unwrap();
        for head in &weights {
            for row in head {
                assert_eq!(row[2], 0.0);
                assert_eq!(row[3], 0.0);
                let sum: f32 = row.iter().sum();
                assert!((sum - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_decoder_layer_shapes() {
        let device = Device::Cpu;
        let config = small_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = DecoderLayer::new(&config, vb.pp("layer")).unwrap();

        let tgt = Tensor::randn(0f32, 1f32, (2, 3, 8), &device).unwrap();
        let enc = Tensor::randn(0f32, 1f32, (2, 6, 8), &device).unwrap();
        let tgt_ref = Tensor::ones((2, 3), DType::U32, &device).unwrap();
        let src_ref = Tensor::ones((2, 6), DType::U32, &device).unwrap();
        let self_mask = mask::causal_mask(&tgt_ref).unwrap();
        let cross_mask = mask::padding_mask(&tgt_ref, &src_ref, 0).unwrap();

        let (out, slf, enc_w) =
            CrossAttentionLayer::forward(&layer, &tgt, &enc, &self_mask, &cross_mask, false)
                .unwrap();
        assert_eq!(out.dims(), &[2, 3, 8]);
        assert_eq!(slf.dims(), &[2, 2, 3, 3]);
        assert_eq!(enc_w.dims(), &[2, 2, 3, 6]);
    }
}
