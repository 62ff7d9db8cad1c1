//! Encoder-decoder Transformer: feature projection, label embedding, the two
//! stacks and the logit projection.

use asr_core::{AsrError, AsrResult};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Embedding, Linear, Module, VarBuilder, VarMap, embedding, linear_no_bias};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::check;
use crate::config::TransformerConfig;
use crate::decoder::Decoder;
use crate::encoder::Encoder;
use crate::mask;
use crate::position::PositionEncoding;

const EMBEDDING_WEIGHT: &str = "tgt_word_emb.weight";

/// Logits together with every attention map of the pass.
#[derive(Debug, Clone)]
pub struct TransformerOutput {
    /// `(batch, len_t, tgt_vocab_size)`
    pub logits: Tensor,
    pub enc_self_attentions: Vec<Tensor>,
    pub dec_self_attentions: Vec<Tensor>,
    pub dec_cross_attentions: Vec<Tensor>,
}

/// `d_model -> vocab` projection without bias, over a `[vocab, d_model]` matrix.
///
/// With `proj_share_weight` the matrix is the target embedding table itself.
#[derive(Debug, Clone)]
struct LogitProjection {
    weight: Tensor,
}

impl LogitProjection {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let (b, s, h) = x.dims3()?;
        let x2 = x.reshape((b * s, h))?;
        let y = x2.matmul(&self.weight.t()?)?;
        y.reshape((b, s, self.weight.dim(0)?))
    }
}

/// Sequence-to-sequence attention model from acoustic features to label logits.
///
/// Owns every trainable parameter through its [`VarMap`]. The position table
/// is not a parameter and never appears in [`Transformer::trainable_parameters`].
pub struct Transformer {
    config: TransformerConfig,
    device: Device,
    varmap: VarMap,
    src_projection: Linear,
    tgt_word_emb: Embedding,
    tgt_word_proj: LogitProjection,
    position: PositionEncoding,
    encoder: Encoder,
    decoder: Decoder,
    frozen_prefixes: Vec<String>,
}

impl Transformer {
    /// Build a freshly initialised model.
    pub fn new(config: TransformerConfig, device: &Device) -> AsrResult<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let src_projection = linear_no_bias(config.src_dim, config.d_model, vb.pp("src_projection"))?;
        let tgt_word_emb = embedding(config.tgt_vocab_size, config.d_model, vb.pp("tgt_word_emb"))?;
        let tgt_word_proj = if config.proj_share_weight {
            LogitProjection {
                weight: tgt_word_emb.embeddings().clone(),
            }
        } else {
            let proj = linear_no_bias(config.d_model, config.tgt_vocab_size, vb.pp("tgt_word_proj"))?;
            LogitProjection {
                weight: proj.weight().clone(),
            }
        };
        if config.embs_share_weight {
            warn!("embs_share_weight has no effect: the source side is a feature projection, not an embedding");
        }

        let position = PositionEncoding::new(config.n_position(), config.d_model, device)?;
        let encoder = Encoder::new(&config, vb.pp("encoder"))?;
        let decoder = Decoder::new(&config, vb.pp("decoder"))?;

        let model = Self {
            config,
            device: device.clone(),
            varmap,
            src_projection,
            tgt_word_emb,
            tgt_word_proj,
            position,
            encoder,
            decoder,
            frozen_prefixes: Vec::new(),
        };
        model.zero_pad_embedding()?;

        info!(
            layers = model.config.n_layers,
            heads = model.config.n_head,
            d_model = model.config.d_model,
            vocab = model.config.tgt_vocab_size,
            parameters = model.num_parameters()?,
            "Transformer created"
        );
        Ok(model)
    }

    /// PAD embedding row is the zero vector.
    fn zero_pad_embedding(&self) -> AsrResult<()> {
        let var = self.var(EMBEDDING_WEIGHT)?;
        let vocab = self.config.tgt_vocab_size;
        let keep: Vec<f32> = (0..vocab)
            .map(|i| if i == self.config.pad_index as usize { 0.0 } else { 1.0 })
            .collect();
        let keep = Tensor::from_vec(keep, (vocab, 1), &self.device)?;
        let zeroed = var.as_tensor().broadcast_mul(&keep)?;
        var.set(&zeroed)?;
        Ok(())
    }

    fn var(&self, name: &str) -> AsrResult<Var> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| AsrError::Model("parameter map lock poisoned".into()))?;
        data.get(name)
            .cloned()
            .ok_or_else(|| AsrError::Model(format!("missing parameter {name}")))
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn position_encoding(&self) -> &PositionEncoding {
        &self.position
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Replace all parameters with those stored in a safetensors file.
    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> AsrResult<()> {
        let path = path.as_ref();
        self.varmap.load(path)?;
        info!(path = %path.display(), "weights loaded");
        Ok(())
    }

    pub fn save_weights(&self, path: impl AsRef<Path>) -> AsrResult<()> {
        let path = path.as_ref();
        self.varmap.save(path)?;
        info!(path = %path.display(), "weights saved");
        Ok(())
    }

    /// Every parameter with its name, sorted by name.
    pub fn named_parameters(&self) -> AsrResult<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| AsrError::Model("parameter map lock poisoned".into()))?;
        let mut params: Vec<(String, Var)> =
            data.iter().map(|(name, var)| (name.clone(), var.clone())).collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    /// Parameters handed to an optimizer: everything not excluded by
    /// [`Transformer::freeze_prefix`]. With no frozen prefixes this is the
    /// whole model.
    pub fn trainable_parameters(&self) -> AsrResult<Vec<Var>> {
        Ok(self
            .named_parameters()?
            .into_iter()
            .filter(|(name, _)| !self.is_frozen(name))
            .map(|(_, var)| var)
            .collect())
    }

    /// Exclude every parameter whose name starts with `prefix` from
    /// [`Transformer::trainable_parameters`].
    pub fn freeze_prefix(&mut self, prefix: impl Into<String>) {
        let prefix = prefix.into();
        debug!(prefix = %prefix, "freezing parameters");
        self.frozen_prefixes.push(prefix);
    }

    pub fn is_frozen(&self, name: &str) -> bool {
        self.frozen_prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> AsrResult<usize> {
        Ok(self
            .named_parameters()?
            .iter()
            .map(|(_, var)| var.elem_count())
            .sum())
    }

    /// Inference pass.
    ///
    /// # Arguments
    /// * `src` - Acoustic features `(batch, len_s, src_dim)`
    /// * `src_pad_ref` - Source padding reference `(batch, len_s)`
    /// * `tgt` - Target token ids `(batch, len_t)`
    /// * `tgt_pad_ref` - Target padding reference `(batch, len_t)`, usually `tgt` itself
    ///
    /// # Returns
    /// Logits `(batch, len_t, tgt_vocab_size)`
    pub fn forward(
        &self,
        src: &Tensor,
        src_pad_ref: &Tensor,
        tgt: &Tensor,
        tgt_pad_ref: &Tensor,
    ) -> AsrResult<Tensor> {
        self.forward_t(src, src_pad_ref, tgt, tgt_pad_ref, false)
    }

    /// Forward pass with dropout enabled when `train` is set.
    pub fn forward_t(
        &self,
        src: &Tensor,
        src_pad_ref: &Tensor,
        tgt: &Tensor,
        tgt_pad_ref: &Tensor,
        train: bool,
    ) -> AsrResult<Tensor> {
        let (src, tgt) = self.prepare(src, src_pad_ref, tgt, tgt_pad_ref)?;
        let enc_output = self.encoder.forward_t(&src, src_pad_ref, train)?;
        let dec_output = self
            .decoder
            .forward_t(&tgt, tgt_pad_ref, src_pad_ref, &enc_output, train)?;
        self.logits(&dec_output)
    }

    /// Forward pass that also returns every attention map.
    pub fn forward_with_attentions(
        &self,
        src: &Tensor,
        src_pad_ref: &Tensor,
        tgt: &Tensor,
        tgt_pad_ref: &Tensor,
        train: bool,
    ) -> AsrResult<TransformerOutput> {
        let (src, tgt) = self.prepare(src, src_pad_ref, tgt, tgt_pad_ref)?;
        let enc = self.encoder.forward_with_attentions(&src, src_pad_ref, train)?;
        let dec = self.decoder.forward_with_attentions(
            &tgt,
            tgt_pad_ref,
            src_pad_ref,
            &enc.output,
            train,
        )?;
        Ok(TransformerOutput {
            logits: self.logits(&dec.output)?,
            enc_self_attentions: enc.attentions,
            dec_self_attentions: dec.self_attentions,
            dec_cross_attentions: dec.cross_attentions,
        })
    }

    /// Validate all inputs, then project the source and embed the target.
    fn prepare(
        &self,
        src: &Tensor,
        src_pad_ref: &Tensor,
        tgt: &Tensor,
        tgt_pad_ref: &Tensor,
    ) -> AsrResult<(Tensor, Tensor)> {
        let pad = self.config.pad_index;

        let src_seq = check::sequence(src, self.config.src_dim, "source features")?;
        check::same_extent(src_seq, check::dims2(src_pad_ref, "source padding reference")?, "source features")?;
        let (tgt, batch_t, len_t) = check::index_ref(tgt, "target tokens")?;
        check::same_extent(
            (batch_t, len_t),
            check::dims2(tgt_pad_ref, "target padding reference")?,
            "target tokens",
        )?;
        if src_seq.0 != batch_t {
            return Err(AsrError::shape(format!(
                "source batch {} != target batch {batch_t}",
                src_seq.0
            )));
        }
        let max_len = self.config.max_seq_len;
        if self.config.position_encoding && (src_seq.1 > max_len || len_t > max_len) {
            return Err(AsrError::shape(format!(
                "sequence lengths (source {}, target {len_t}) exceed max_seq_len {max_len}",
                src_seq.1
            )));
        }
        if self.config.strict_padding {
            mask::check_right_padded(src_pad_ref, pad)?;
            mask::check_right_padded(tgt_pad_ref, pad)?;
        }

        let src = if src.dtype() == DType::F32 {
            src.clone()
        } else {
            src.to_dtype(DType::F32)?
        };
        let mut src = self.src_projection.forward(&src)?;
        let mut tgt = self.tgt_word_emb.forward(&tgt)?;
        if self.config.position_encoding {
            src = (src + self.position.forward(src_pad_ref, pad)?)?;
            tgt = (tgt + self.position.forward(tgt_pad_ref, pad)?)?;
        }

        asr_core::debug::dump("Transformer projected source", &src);
        asr_core::debug::dump("Transformer embedded target", &tgt);
        Ok((src, tgt))
    }

    fn logits(&self, dec_output: &Tensor) -> AsrResult<Tensor> {
        Ok(self.tgt_word_proj.forward(dec_output)?)
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("config", &self.config)
            .field("device", &self.device)
            .field("frozen_prefixes", &self.frozen_prefixes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> TransformerConfig {
        TransformerConfig::new(6, 12, 10)
            .with_layers(1)
            .with_heads(2, 4, 4)
            .with_d_model(8)
            .with_d_inner_hid(16)
            .with_dropout(0.0)
    }

    #[test]
    fn test_pad_embedding_row_is_zero() {
        let model = Transformer::new(tiny().with_pad_index(3), &Device::Cpu).unwrap();
        let rows = model.tgt_word_emb.embeddings().to_vec2::<f32>().unwrap();
        assert!(rows[3].iter().all(|&v| v == 0.0));
        assert!(rows[4].iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_shared_projection_has_no_separate_weight() {
        let shared = Transformer::new(tiny(), &Device::Cpu).unwrap();
        let names: Vec<String> = shared
            .named_parameters()
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert!(names.iter().any(|n| n == EMBEDDING_WEIGHT));
        assert!(!names.iter().any(|n| n.starts_with("tgt_word_proj")));

        let separate =
            Transformer::new(tiny().with_weight_sharing(false, false), &Device::Cpu).unwrap();
        assert_eq!(
            separate.num_parameters().unwrap(),
            shared.num_parameters().unwrap() + 12 * 8
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Transformer::new(tiny().with_d_model(7), &Device::Cpu);
        assert!(matches!(result, Err(AsrError::Config(_))));
    }

    #[test]
    fn test_position_encoding_length_checked() {
        let model = Transformer::new(tiny().with_position_encoding(true), &Device::Cpu).unwrap();
        let device = Device::Cpu;
        let src = Tensor::randn(0f32, 1f32, (1, 11, 6), &device).unwrap();
        let src_ref = Tensor::ones((1, 11), DType::U32, &device).unwrap();
        let tgt = Tensor::ones((1, 3), DType::U32, &device).unwrap();
        assert!(matches!(
            model.forward(&src, &src_ref, &tgt, &tgt),
            Err(AsrError::ShapeMismatch(_))
        ));

        let src = Tensor::randn(0f32, 1f32, (1, 10, 6), &device).unwrap();
        let src_ref = Tensor::ones((1, 10), DType::U32, &device).unwrap();
        let logits = model.forward(&src, &src_ref, &tgt, &tgt).unwrap();
        assert_eq!(logits.dims(), &[1, 3, 12]);
    }
}
