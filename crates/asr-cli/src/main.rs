//! RustASR CLI.
//!
//! CLI для создания и проверки моделей encoder-decoder Transformer.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use asr_core::Vocabulary;
use asr_transformer::{Transformer, TransformerConfig, load_checkpoint, save_checkpoint};
use candle_core::{DType, Tensor};

#[derive(Parser)]
#[command(name = "rustasr")]
#[command(author, version, about = "RustASR: attention Transformer for speech recognition", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a freshly initialised model and save it as an epoch-0 checkpoint
    Init {
        /// Width of the acoustic feature vectors
        #[arg(long)]
        src_dim: usize,

        /// Label vocabulary (JSON object `{token: index}`)
        #[arg(long)]
        vocab: PathBuf,

        /// Longest token sequence the model must handle
        #[arg(long)]
        max_seq_len: usize,

        #[arg(long, default_value_t = 6)]
        n_layers: usize,

        #[arg(long, default_value_t = 8)]
        n_head: usize,

        #[arg(long, default_value_t = 64)]
        d_k: usize,

        #[arg(long, default_value_t = 64)]
        d_v: usize,

        #[arg(long, default_value_t = 512)]
        d_model: usize,

        #[arg(long, default_value_t = 1024)]
        d_inner_hid: usize,

        #[arg(long, default_value_t = 0.1)]
        dropout: f32,

        /// Output projection reuses the target embedding matrix
        #[arg(long, default_value_t = false)]
        proj_share_weight: bool,

        /// Encoder/decoder embedding tying (хранится в конфиге, на вычисления не влияет)
        #[arg(long, default_value_t = false)]
        embs_share_weight: bool,

        /// Добавлять синусоидальную позиционку к входам encoder/decoder
        #[arg(long, default_value_t = false)]
        position_encoding: bool,

        /// Checkpoint directory to write
        #[arg(long)]
        out: PathBuf,

        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,
    },

    /// Print configuration, epoch and parameters of a checkpoint
    Inspect {
        /// Checkpoint directory
        #[arg(long)]
        checkpoint: PathBuf,

        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,
    },

    /// Run a simple test to verify the setup
    Test {
        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            src_dim,
            vocab,
            max_seq_len,
            n_layers,
            n_head,
            d_k,
            d_v,
            d_model,
            d_inner_hid,
            dropout,
            proj_share_weight,
            embs_share_weight,
            position_encoding,
            out,
            device,
        } => {
            let vocab = Vocabulary::from_json_file(&vocab)
                .with_context(|| format!("reading vocabulary {}", vocab.display()))?;
            println!("Vocabulary: {} labels, PAD = {}", vocab.len(), vocab.pad_index());

            let config = TransformerConfig::new(src_dim, vocab.len(), max_seq_len)
                .with_layers(n_layers)
                .with_heads(n_head, d_k, d_v)
                .with_d_model(d_model)
                .with_d_inner_hid(d_inner_hid)
                .with_dropout(dropout)
                .with_weight_sharing(proj_share_weight, embs_share_weight)
                .with_pad_index(vocab.pad_index())
                .with_position_encoding(position_encoding);

            let device = create_device(&device)?;
            let model = Transformer::new(config, &device)?;
            save_checkpoint(&model, 0, &out)?;

            println!(
                "✅ Model with {} parameters saved to {}",
                model.num_parameters()?,
                out.display()
            );
            Ok(())
        }

        Commands::Inspect { checkpoint, device } => {
            let device = create_device(&device)?;
            let (model, epoch) = load_checkpoint(&checkpoint, &device)
                .with_context(|| format!("loading checkpoint {}", checkpoint.display()))?;

            println!("Checkpoint: {}", checkpoint.display());
            println!("Epoch: {epoch}");
            println!("Config:");
            println!("{}", serde_json::to_string_pretty(model.config())?);
            println!();
            println!("Parameters:");
            for (name, var) in model.named_parameters()? {
                println!("  {name:<48} {:?}", var.dims());
            }
            println!(
                "Total: {} tensors, {} values",
                model.named_parameters()?.len(),
                model.num_parameters()?
            );
            Ok(())
        }

        Commands::Test { device } => {
            println!("🧪 RustASR - Setup Test");
            println!("=======================");

            let device = create_device(&device)?;
            println!("Device: {device:?}");

            let config = TransformerConfig::new(8, 10, 16)
                .with_layers(2)
                .with_heads(2, 8, 8)
                .with_d_model(16)
                .with_d_inner_hid(32);
            let model = Transformer::new(config, &device)?;

            let src = Tensor::randn(0f32, 1f32, (2, 5, 8), &device)?;
            let src_ref = Tensor::ones((2, 5), DType::U32, &device)?;
            let tgt = Tensor::new(&[[2u32, 4, 5, 6, 3], [2, 7, 3, 0, 0]], &device)?;
            let logits = model.forward(&src, &src_ref, &tgt, &tgt)?;

            println!("✅ Test passed. Logits shape: {:?}", logits.dims());
            Ok(())
        }
    }
}

fn create_device(device: &str) -> Result<candle_core::Device> {
    match device {
        "metal" => {
            // candle может panic в процессе инициализации Metal (например, если устройство недоступно).
            // Панику ловим, а hook временно глушим, чтобы не засорять stderr.
            let prev_hook = std::panic::take_hook();
            std::panic::set_hook(Box::new(|_| {}));
            let res = std::panic::catch_unwind(|| candle_core::Device::new_metal(0));
            std::panic::set_hook(prev_hook);

            match res {
                Ok(Ok(dev)) => Ok(dev),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow::anyhow!(
                    "Инициализация Metal недоступна в этом окружении. Попробуйте --device cpu."
                )),
            }
        }
        "cuda" => Ok(candle_core::Device::new_cuda(0)?),
        _ => Ok(candle_core::Device::Cpu),
    }
}
