//! Configuration for the encoder-decoder transformer.

use asr_core::{AsrError, AsrResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Construction-time configuration of a [`crate::Transformer`].
///
/// Defaults: 6 layers, 8 heads of width 64,
/// model width 512 and a 1024-wide feed-forward block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Width of the raw acoustic feature vectors (input of the source projection).
    pub src_dim: usize,

    /// Size of the label vocabulary (output of the logit projection).
    pub tgt_vocab_size: usize,

    /// Longest supported sequence. The position table has `max_seq_len + 1` rows.
    pub max_seq_len: usize,

    /// Number of layers in each of the encoder and decoder stacks.
    #[serde(default = "default_n_layers")]
    pub n_layers: usize,

    /// Number of attention heads.
    #[serde(default = "default_n_head")]
    pub n_head: usize,

    /// Per-head query/key width.
    #[serde(default = "default_head_width")]
    pub d_k: usize,

    /// Per-head value width.
    #[serde(default = "default_head_width")]
    pub d_v: usize,

    /// Model width D, shared by every layer input and output.
    #[serde(default = "default_d_model")]
    pub d_model: usize,

    /// Inner width of the position-wise feed-forward block.
    #[serde(default = "default_d_inner_hid")]
    pub d_inner_hid: usize,

    /// Dropout probability, in `[0, 1)`.
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    /// Output projection reuses the target embedding matrix.
    #[serde(default = "default_true")]
    pub proj_share_weight: bool,

    /// Tie encoder and decoder embeddings.
    #[serde(default = "default_true")]
    pub embs_share_weight: bool,

    /// Reserved PAD value in token and reference sequences.
    #[serde(default)]
    pub pad_index: u32,

    /// Layer normalization epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,

    /// Add the sinusoid position table to the projected source and the embedded target.
    #[serde(default)]
    pub position_encoding: bool,

    /// Reject padding references whose PAD positions are not a right-aligned suffix.
    #[serde(default = "default_true")]
    pub strict_padding: bool,
}

fn default_n_layers() -> usize {
    6
}

fn default_n_head() -> usize {
    8
}

fn default_head_width() -> usize {
    64
}

fn default_d_model() -> usize {
    512
}

fn default_d_inner_hid() -> usize {
    1024
}

fn default_dropout() -> f32 {
    0.1
}

fn default_true() -> bool {
    true
}

fn default_layer_norm_eps() -> f64 {
    1e-6
}

impl TransformerConfig {
    /// Configuration with default hyper-parameters for the given data dimensions.
    pub fn new(src_dim: usize, tgt_vocab_size: usize, max_seq_len: usize) -> Self {
        Self {
            src_dim,
            tgt_vocab_size,
            max_seq_len,
            n_layers: default_n_layers(),
            n_head: default_n_head(),
            d_k: default_head_width(),
            d_v: default_head_width(),
            d_model: default_d_model(),
            d_inner_hid: default_d_inner_hid(),
            dropout: default_dropout(),
            proj_share_weight: true,
            embs_share_weight: true,
            pad_index: asr_core::vocab::PAD,
            layer_norm_eps: default_layer_norm_eps(),
            position_encoding: false,
            strict_padding: true,
        }
    }

    pub fn with_layers(mut self, n_layers: usize) -> Self {
        self.n_layers = n_layers;
        self
    }

    /// Set the head count and per-head key/value widths.
    pub fn with_heads(mut self, n_head: usize, d_k: usize, d_v: usize) -> Self {
        self.n_head = n_head;
        self.d_k = d_k;
        self.d_v = d_v;
        self
    }

    pub fn with_d_model(mut self, d_model: usize) -> Self {
        self.d_model = d_model;
        self
    }

    pub fn with_d_inner_hid(mut self, d_inner_hid: usize) -> Self {
        self.d_inner_hid = d_inner_hid;
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_weight_sharing(mut self, proj_share_weight: bool, embs_share_weight: bool) -> Self {
        self.proj_share_weight = proj_share_weight;
        self.embs_share_weight = embs_share_weight;
        self
    }

    pub fn with_pad_index(mut self, pad_index: u32) -> Self {
        self.pad_index = pad_index;
        self
    }

    pub fn with_position_encoding(mut self, enabled: bool) -> Self {
        self.position_encoding = enabled;
        self
    }

    pub fn with_strict_padding(mut self, strict: bool) -> Self {
        self.strict_padding = strict;
        self
    }

    /// Number of rows in the position table (positions `1..=max_seq_len` plus PAD row 0).
    pub fn n_position(&self) -> usize {
        self.max_seq_len + 1
    }

    /// Check every field against the construction contract.
    pub fn validate(&self) -> AsrResult<()> {
        let positive = [
            ("src_dim", self.src_dim),
            ("tgt_vocab_size", self.tgt_vocab_size),
            ("max_seq_len", self.max_seq_len),
            ("n_layers", self.n_layers),
            ("n_head", self.n_head),
            ("d_k", self.d_k),
            ("d_v", self.d_v),
            ("d_model", self.d_model),
            ("d_inner_hid", self.d_inner_hid),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(AsrError::config(format!("{name} must be positive")));
            }
        }
        if self.d_model % 2 != 0 {
            return Err(AsrError::config(format!(
                "d_model must be even, got {}",
                self.d_model
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(AsrError::config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.pad_index as usize >= self.tgt_vocab_size {
            return Err(AsrError::config(format!(
                "pad_index {} is outside the vocabulary of size {}",
                self.pad_index, self.tgt_vocab_size
            )));
        }
        if self.layer_norm_eps.is_nan() || self.layer_norm_eps <= 0.0 {
            return Err(AsrError::config(format!(
                "layer_norm_eps must be positive, got {}",
                self.layer_norm_eps
            )));
        }
        Ok(())
    }

    /// Load a configuration from a JSON file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> AsrResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> AsrResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TransformerConfig::new(40, 30, 50);
        assert_eq!(config.n_layers, 6);
        assert_eq!(config.n_head, 8);
        assert_eq!(config.d_model, 512);
        assert_eq!(config.d_inner_hid, 1024);
        assert_eq!(config.n_position(), 51);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let base = TransformerConfig::new(40, 30, 50);

        let cases = [
            base.clone().with_layers(0),
            base.clone().with_heads(0, 64, 64),
            base.clone().with_heads(8, 0, 64),
            base.clone().with_d_model(511),
            base.clone().with_dropout(1.0),
            base.clone().with_dropout(-0.1),
            base.clone().with_pad_index(30),
            TransformerConfig::new(40, 0, 50),
            TransformerConfig::new(0, 30, 50),
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(AsrError::Config(_))),
                "accepted {config:?}"
            );
        }
    }

    #[test]
    fn test_json_round_trip() {
        let config = TransformerConfig::new(40, 30, 50)
            .with_layers(2)
            .with_heads(4, 16, 8)
            .with_d_model(64)
            .with_dropout(0.25)
            .with_weight_sharing(false, true)
            .with_position_encoding(true);

        let json = serde_json::to_string(&config).unwrap();
        let back: TransformerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_missing_optional_fields_use_defaults() {
        let json = r#"{ "src_dim": 40, "tgt_vocab_size": 30, "max_seq_len": 50 }"#;
        let config: TransformerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config, TransformerConfig::new(40, 30, 50));
    }
}
