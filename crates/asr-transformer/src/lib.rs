//! # asr-transformer
//!
//! Encoder-decoder attention model for speech recognition.
//!
//! Acoustic feature sequences are projected to the model width and encoded
//! by a stack of self-attention layers; label tokens are embedded and decoded
//! by a stack of masked self-attention + cross-attention layers, then
//! projected to per-position vocabulary logits.
//!
//! - Sinusoid position table ([`PositionEncoding`])
//! - Padding and causal attention masks ([`mask`])
//! - Encoder / decoder stacks generic over the attention layer traits
//! - Checkpoint directories ([`save_checkpoint`], [`load_checkpoint`])

mod check;
pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod layers;
pub mod mask;
pub mod model;
pub mod position;

pub use checkpoint::{CheckpointMeta, load_checkpoint, save_checkpoint};
pub use config::TransformerConfig;
pub use decoder::{Decoder, DecoderOutput};
pub use encoder::{Encoder, EncoderOutput};
pub use layers::{CrossAttentionLayer, DecoderLayer, EncoderLayer, SelfAttentionLayer};
pub use model::{Transformer, TransformerOutput};
pub use position::PositionEncoding;
