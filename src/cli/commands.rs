// ============================================================
// Layer 1 - CLI Commands and Arguments
// ============================================================
// Defines the four subcommands and all their flags:
//   init-base, train, merge, generate
//
// clap's derive macros generate help text, error messages for
// missing args, and string → number conversion.
//
// Reference: Rust Book §12 (Building a CLI Program)

use clap::{Args, Subcommand};

use crate::application::{
    init_base_use_case::InitBaseConfig,
    train_use_case::TrainConfig,
};
use crate::data::loader::{DatasetSpec, SplitSpec, DEFAULT_DATA_FILE};
use crate::ml::{
    generator::GenerationConfig,
    lora::LoraSettings,
    quant::QuantSettings,
    trainer::SftConfig,
};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a randomly initialised base checkpoint from a dataset
    InitBase(InitBaseArgs),

    /// Quantize, fine-tune with LoRA, merge, and try one example
    Train(TrainArgs),

    /// Merge a trained adapter into its base model
    Merge(MergeArgs),

    /// Generate SQL for a schema and a question
    Generate(GenerateArgs),
}

// ─── Shared argument groups ───────────────────────────────────────────────────

#[derive(Args, Debug, Clone)]
pub struct DatasetArgs {
    /// Local JSON/JSONL file or directory, or a hub dataset id
    #[arg(long, default_value = "b-mc2/sql-create-context")]
    pub dataset: String,

    /// Split with optional slice, e.g. "train", "train[:10%]", "train[100:200]"
    #[arg(long, default_value = "train")]
    pub split: SplitSpec,

    /// File inside the dataset directory / repo holding the records
    #[arg(long, default_value = DEFAULT_DATA_FILE)]
    pub data_file: String,

    /// Keep at most this many records after slicing
    #[arg(long)]
    pub limit: Option<usize>,
}

impl From<DatasetArgs> for DatasetSpec {
    fn from(a: DatasetArgs) -> Self {
        DatasetSpec {
            id:        a.dataset,
            split:     a.split,
            data_file: a.data_file,
            limit:     a.limit,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct GenerationArgs {
    /// Upper bound on generated tokens
    #[arg(long, default_value_t = 100)]
    pub max_new_tokens: usize,

    /// 0 for greedy decoding
    #[arg(long, default_value_t = 0.0)]
    pub temperature: f64,

    /// Sampling candidates per step (0 = whole vocabulary)
    #[arg(long, default_value_t = 50)]
    pub top_k: usize,

    #[arg(long, default_value_t = 1234)]
    pub gen_seed: u64,
}

impl From<GenerationArgs> for GenerationConfig {
    fn from(a: GenerationArgs) -> Self {
        GenerationConfig {
            max_new_tokens: a.max_new_tokens,
            temperature:    a.temperature,
            top_k:          a.top_k,
            seed:           a.gen_seed,
        }
    }
}

// ─── init-base ────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct InitBaseArgs {
    #[command(flatten)]
    pub data: DatasetArgs,

    /// Where the base checkpoint is written
    #[arg(long, default_value = "models/base")]
    pub output_dir: String,

    /// Maximum vocabulary size (special tokens included)
    #[arg(long, default_value_t = 16000)]
    pub vocab_size: usize,

    #[arg(long, default_value_t = 512)]
    pub max_seq_len: usize,

    /// Hidden size; must be divisible by num_heads
    #[arg(long, default_value_t = 256)]
    pub d_model: usize,

    #[arg(long, default_value_t = 8)]
    pub num_heads: usize,

    #[arg(long, default_value_t = 4)]
    pub num_layers: usize,

    /// Inner size of the gated MLP
    #[arg(long, default_value_t = 688)]
    pub d_ff: usize,

    #[arg(long, default_value_t = 0.0)]
    pub dropout: f64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl From<InitBaseArgs> for InitBaseConfig {
    fn from(a: InitBaseArgs) -> Self {
        InitBaseConfig {
            dataset:     a.data.into(),
            output_dir:  a.output_dir,
            vocab_size:  a.vocab_size,
            max_seq_len: a.max_seq_len,
            d_model:     a.d_model,
            num_heads:   a.num_heads,
            num_layers:  a.num_layers,
            d_ff:        a.d_ff,
            dropout:     a.dropout,
            seed:        a.seed,
        }
    }
}

// ─── train ────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Base checkpoint directory (config.json, model.mpk, tokenizer.json)
    #[arg(long, default_value = "models/base")]
    pub base_model: String,

    #[command(flatten)]
    pub data: DatasetArgs,

    /// Fraction of records held out for evaluation
    #[arg(long, default_value_t = 0.2)]
    pub test_fraction: f64,

    /// Seed for the train/test shuffle
    #[arg(long, default_value_t = 1234)]
    pub split_seed: u64,

    // ── Quantization ──────────────────────────────────────────────────────────
    /// Keep the base in full precision instead of NF4
    #[arg(long)]
    pub no_4bit: bool,

    /// Values per NF4 absmax block
    #[arg(long, default_value_t = 64)]
    pub quant_block_size: usize,

    /// Store the absmax constants in full precision
    #[arg(long)]
    pub no_double_quant: bool,

    // ── LoRA ──────────────────────────────────────────────────────────────────
    #[arg(long, default_value_t = 8)]
    pub lora_r: usize,

    #[arg(long, default_value_t = 32.0)]
    pub lora_alpha: f64,

    #[arg(long, default_value_t = 0.05)]
    pub lora_dropout: f64,

    /// Comma-separated projection names
    #[arg(long, value_delimiter = ',', default_value = "q_proj,k_proj,v_proj,o_proj")]
    pub target_modules: Vec<String>,

    // ── SFT ───────────────────────────────────────────────────────────────────
    #[arg(long, default_value_t = 1)]
    pub epochs: usize,

    /// Stop after this many optimizer steps
    #[arg(long)]
    pub max_steps: Option<usize>,

    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 4)]
    pub grad_accum_steps: usize,

    #[arg(long, default_value_t = 2e-4)]
    pub lr: f64,

    #[arg(long, default_value_t = 0.03)]
    pub warmup_ratio: f64,

    #[arg(long, default_value_t = 0.0)]
    pub weight_decay: f32,

    #[arg(long, default_value_t = 0.3)]
    pub max_grad_norm: f32,

    #[arg(long, default_value_t = 1)]
    pub logging_steps: usize,

    /// Seed for batch shuffling
    #[arg(long, default_value_t = 1234)]
    pub seed: u64,

    // ── Outputs ───────────────────────────────────────────────────────────────
    /// Metrics, train_config.json and per-epoch checkpoints
    #[arg(long, default_value = "results")]
    pub output_dir: String,

    #[arg(long, default_value = "models/adapter")]
    pub adapter_dir: String,

    #[arg(long, default_value = "models/merged")]
    pub merged_dir: String,

    #[command(flatten)]
    pub generation: GenerationArgs,
}

/// Convert CLI TrainArgs into the application-layer TrainConfig.
/// The application layer never sees clap types.
impl From<TrainArgs> for TrainConfig {
    fn from(a: TrainArgs) -> Self {
        TrainConfig {
            base_model:    a.base_model,
            dataset:       a.data.into(),
            test_fraction: a.test_fraction,
            split_seed:    a.split_seed,
            quant: QuantSettings {
                load_in_4bit: !a.no_4bit,
                block_size:   a.quant_block_size,
                double_quant: !a.no_double_quant,
            },
            lora: LoraSettings {
                rank:           a.lora_r,
                alpha:          a.lora_alpha,
                dropout:        a.lora_dropout,
                target_modules: a.target_modules,
            },
            sft: SftConfig {
                epochs:           a.epochs,
                max_steps:        a.max_steps,
                batch_size:       a.batch_size,
                grad_accum_steps: a.grad_accum_steps,
                lr:               a.lr,
                warmup_ratio:     a.warmup_ratio,
                weight_decay:     a.weight_decay,
                max_grad_norm:    a.max_grad_norm,
                logging_steps:    a.logging_steps,
                seed:             a.seed,
            },
            generation:  a.generation.into(),
            output_dir:  a.output_dir,
            adapter_dir: a.adapter_dir,
            merged_dir:  a.merged_dir,
        }
    }
}

// ─── merge ────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct MergeArgs {
    #[arg(long, default_value = "models/base")]
    pub base_model: String,

    #[arg(long, default_value = "models/adapter")]
    pub adapter_dir: String,

    #[arg(long, default_value = "models/merged")]
    pub merged_dir: String,
}

// ─── generate ─────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Merged (or base) model directory
    #[arg(long, default_value = "models/merged")]
    pub model_dir: String,

    /// Schema text, e.g. "CREATE TABLE head (age INTEGER)"
    #[arg(long)]
    pub context: String,

    #[arg(long)]
    pub question: String,

    #[command(flatten)]
    pub generation: GenerationArgs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    #[test]
    fn test_train_defaults_match_config_defaults() {
        let cli = Cli::parse_from(["sql-qlora", "train"]);
        let Commands::Train(args) = cli.command else { panic!("expected train") };
        let cfg: TrainConfig = args.into();
        let def = TrainConfig::default();

        assert_eq!(cfg.lora, def.lora);
        assert_eq!(cfg.sft, def.sft);
        assert_eq!(cfg.quant, def.quant);
        assert_eq!(cfg.generation, def.generation);
        assert_eq!(cfg.dataset.split, def.dataset.split);
    }

    #[test]
    fn test_train_flags_are_parsed() {
        let cli = Cli::parse_from([
            "sql-qlora", "train",
            "--split", "train[:10%]",
            "--target-modules", "q_proj,v_proj",
            "--no-4bit",
            "--max-steps", "20",
        ]);
        let Commands::Train(args) = cli.command else { panic!("expected train") };
        let cfg: TrainConfig = args.into();

        assert_eq!(cfg.dataset.split.to_string(), "train[:10%]");
        assert_eq!(cfg.lora.target_modules, vec!["q_proj", "v_proj"]);
        assert!(!cfg.quant.load_in_4bit);
        assert_eq!(cfg.sft.max_steps, Some(20));
    }

    #[test]
    fn test_bad_split_is_rejected() {
        assert!(Cli::try_parse_from(["sql-qlora", "train", "--split", "train[:x]"]).is_err());
    }
}
