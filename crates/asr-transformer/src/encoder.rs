//! Encoder stack: N self-attention layers over the projected source.

use asr_core::AsrResult;
use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::debug;

use crate::check;
use crate::config::TransformerConfig;
use crate::layers::{EncoderLayer, SelfAttentionLayer};
use crate::mask;

/// Encoder output together with the per-layer attention weights.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `(batch, len, d_model)`
    pub output: Tensor,
    /// One `(batch, n_head, len, len)` tensor per layer, in stack order.
    pub attentions: Vec<Tensor>,
}

/// Ordered stack of self-attention layers.
///
/// The self mask is built once per call from the source padding reference
/// and handed unchanged to every layer.
#[derive(Debug, Clone)]
pub struct Encoder<L = EncoderLayer> {
    layers: Vec<L>,
    d_model: usize,
    pad_index: u32,
}

impl Encoder<EncoderLayer> {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let mut layers = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            layers.push(EncoderLayer::new(config, vb.pp(format!("layer_stack.{i}")))?);
        }
        Ok(Self::from_layers(layers, config.d_model, config.pad_index))
    }
}

impl<L: SelfAttentionLayer> Encoder<L> {
    /// Assemble an encoder from already constructed layers.
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
    /// * `src` - Projected source `(batch, len, d_model)`
    /// * `src_pad_ref` - Source padding reference `(batch, len)`
    pub fn forward(&self, src: &Tensor, src_pad_ref: &Tensor) -> AsrResult<Tensor> {
        self.forward_t(src, src_pad_ref, false)
    }

    pub fn forward_t(&self, src: &Tensor, src_pad_ref: &Tensor, train: bool) -> AsrResult<Tensor> {
        Ok(self.run(src, src_pad_ref, train, false)?.output)
    }

    /// Like [`Encoder::forward_t`], also returning every layer's attention weights.
    pub fn forward_with_attentions(
        &self,
        src: &Tensor,
        src_pad_ref: &Tensor,
        train: bool,
    ) -> AsrResult<EncoderOutput> {
        self.run(src, src_pad_ref, train, true)
    }

    fn run(
        &self,
        src: &Tensor,
        src_pad_ref: &Tensor,
        train: bool,
        collect: bool,
    ) -> AsrResult<EncoderOutput> {
        let seq = check::sequence(src, self.d_model, "encoder input")?;
        let reference = check::dims2(src_pad_ref, "source padding reference")?;
        check::same_extent(seq, reference, "encoder input")?;

        let self_mask = mask::padding_mask(src_pad_ref, src_pad_ref, self.pad_index)?;

        let mut output = src.clone();
        let mut attentions = Vec::with_capacity(if collect { self.layers.len() } else { 0 });
        for layer in &self.layers {
            let (next, weights) = layer.forward(&output, &self_mask, train)?;
            output = next;
            if collect {
                attentions.push(weights);
            }
        }

        asr_core::debug::dump("encoder output", &output);
        debug!(
            batch = seq.0,
            len = seq.1,
            layers = self.layers.len(),
            "encoder forward"
        );
        Ok(EncoderOutput { output, attentions })
    }
}
