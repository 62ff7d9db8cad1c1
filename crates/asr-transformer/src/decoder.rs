//! Decoder stack: N layers of masked self-attention plus attention over the
//! encoder output.

use asr_core::AsrResult;
use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::debug;

use crate::check;
use crate::config::TransformerConfig;
use crate::layers::{CrossAttentionLayer, DecoderLayer};
use crate::mask;

/// Decoder output together with the per-layer attention weights.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// `(batch, len_t, d_model)`
    pub output: Tensor,
    /// `(batch, n_head, len_t, len_t)` per layer.
    pub self_attentions: Vec<Tensor>,
    /// `(batch, n_head, len_t, len_s)` per layer.
    pub cross_attentions: Vec<Tensor>,
}

/// Ordered stack of self + cross attention layers.
#[derive(Debug, Clone)]
pub struct Decoder<L = DecoderLayer> {
    layers: Vec<L>,
    d_model: usize,
    pad_index: u32,
}

impl Decoder<DecoderLayer> {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let mut layers = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            layers.push(DecoderLayer::new(config, vb.pp(format!("layer_stack.{i}")))?);
        }
        Ok(Self::from_layers(layers, config.d_model, config.pad_index))
    }
}

impl<L: CrossAttentionLayer> Decoder<L> {
    pub fn from_layers(layers: Vec<L>, d_model: usize, pad_index: u32) -> Self {
        Self {
            layers,
            d_model,
            pad_index,
        }
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Inference pass.
    ///
    /// # Arguments
    /// * `tgt` - Embedded target `(batch, len_t, d_model)`
    /// * `tgt_pad_ref` - Target padding reference `(batch, len_t)`
    /// * `src_pad_ref` - Source padding reference `(batch, len_s)`
    /// * `enc_output` - Encoder output `(batch, len_s, d_model)`
    pub fn forward(
        &self,
        tgt: &Tensor,
        tgt_pad_ref: &Tensor,
        src_pad_ref: &Tensor,
        enc_output: &Tensor,
    ) -> AsrResult<Tensor> {
        self.forward_t(tgt, tgt_pad_ref, src_pad_ref, enc_output, false)
    }

    pub fn forward_t(
        &self,
        tgt: &Tensor,
        tgt_pad_ref: &Tensor,
        src_pad_ref: &Tensor,
        enc_output: &Tensor,
        train: bool,
    ) -> AsrResult<Tensor> {
        Ok(self
            .run(tgt, tgt_pad_ref, src_pad_ref, enc_output, train, false)?
            .output)
    }

    /// Like [`Decoder::forward_t`], also returning both attention lists.
    pub fn forward_with_attentions(
        &self,
        tgt: &Tensor,
        tgt_pad_ref: &Tensor,
        src_pad_ref: &Tensor,
        enc_output: &Tensor,
        train: bool,
    ) -> AsrResult<DecoderOutput> {
        self.run(tgt, tgt_pad_ref, src_pad_ref, enc_output, train, true)
    }

    fn run(
        &self,
        tgt: &Tensor,
        tgt_pad_ref: &Tensor,
        src_pad_ref: &Tensor,
        enc_output: &Tensor,
        train: bool,
        collect: bool,
    ) -> AsrResult<DecoderOutput> {
        let tgt_seq = check::sequence(tgt, self.d_model, "decoder input")?;
        let tgt_ref = check::dims2(tgt_pad_ref, "target padding reference")?;
        check::same_extent(tgt_seq, tgt_ref, "decoder input")?;

        let enc_seq = check::sequence(enc_output, self.d_model, "encoder output")?;
        let src_ref = check::dims2(src_pad_ref, "source padding reference")?;
        check::same_extent(enc_seq, src_ref, "encoder output")?;

        // Self: padded keys or future keys. Cross: padded source keys.
        let pad_mask = mask::padding_mask(tgt_pad_ref, tgt_pad_ref, self.pad_index)?;
        let causal = mask::causal_mask(tgt_pad_ref)?;
        let self_mask = mask::combine(&pad_mask, &causal)?;
        let cross_mask = mask::padding_mask(tgt_pad_ref, src_pad_ref, self.pad_index)?;

        let capacity = if collect { self.layers.len() } else { 0 };
        let mut self_attentions = Vec::with_capacity(capacity);
        let mut cross_attentions = Vec::with_capacity(capacity);

        let mut output = tgt.clone();
        for layer in &self.layers {
            let (next, slf, enc) =
                layer.forward(&output, enc_output, &self_mask, &cross_mask, train)?;
            output = next;
            if collect {
                self_attentions.push(slf);
                cross_attentions.push(enc);
            }
        }

        asr_core::debug::dump("decoder output", &output);
        debug!(
            batch = tgt_seq.0,
            tgt_len = tgt_seq.1,
            src_len = enc_seq.1,
            layers = self.layers.len(),
            "decoder forward"
        );
        Ok(DecoderOutput {
            output,
            self_attentions,
            cross_attentions,
        })
    }
}
