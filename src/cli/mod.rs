// ============================================================
// Layer 1 - CLI / Presentation Layer
// ============================================================
// Entry point for all user interaction. Parses arguments with
// clap, hands a plain config to a use case (Layer 2), and prints
// the result. No pipeline logic lives here.
//
//   init-base  dataset → random base checkpoint + tokenizer
//   train      base + dataset → adapter, merged model, one example
//   merge      base + adapter → merged model
//   generate   model + schema + question → SQL
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, GenerateArgs, InitBaseArgs, MergeArgs, TrainArgs};

#[derive(Parser, Debug)]
#[command(
    name = "sql-qlora",
    version = "0.1.0",
    about = "Fine-tune a causal LM for text-to-SQL with 4-bit QLoRA, merge the adapter, and generate SQL."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Match on the subcommand and dispatch to the correct use case.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::InitBase(args) => run_init_base(args),
            Commands::Train(args)    => run_train(args),
            Commands::Merge(args)    => run_merge(args),
            Commands::Generate(args) => run_generate(args),
        }
    }
}

fn run_init_base(args: InitBaseArgs) -> Result<()> {
    use crate::application::init_base_use_case::InitBaseUseCase;

    let output_dir = args.output_dir.clone();
    let model_cfg  = InitBaseUseCase::new(args.into()).execute()?;
    println!(
        "Base model written to '{}' (vocab={}, d_model={}, layers={}).",
        output_dir, model_cfg.vocab_size, model_cfg.d_model, model_cfg.num_layers
    );
    Ok(())
}

fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    tracing::info!("Fine-tuning '{}' on '{}' split '{}'", args.base_model, args.data.dataset, args.data.split);

    let adapter_dir = args.adapter_dir.clone();
    let merged_dir  = args.merged_dir.clone();
    let report      = TrainUseCase::new(args.into()).execute()?;

    println!("{}", report.parameters);
    println!("Split: {} train / {} test samples", report.train_samples, report.test_samples);
    if let Some(m) = &report.last_epoch {
        println!("Final epoch {}: train_loss={:.4} eval_loss={:.4}", m.epoch, m.train_loss, m.eval_loss);
    }
    println!("Adapter saved to '{adapter_dir}', merged model saved to '{merged_dir}' ({} params).", report.merged.total);

    if let Some(sample) = &report.sample {
        println!("\nQuestion:  {}", sample.record.question);
        println!("Generated: {}", sample.generated);
        println!("Reference: {}", sample.record.answer);
    }
    Ok(())
}

fn run_merge(args: MergeArgs) -> Result<()> {
    use crate::application::merge_use_case::MergeUseCase;

    let report = MergeUseCase::new(&args.base_model, &args.adapter_dir, &args.merged_dir).execute()?;
    println!("Merged model saved to '{}' ({} params).", args.merged_dir, report.total);
    Ok(())
}

fn run_generate(args: GenerateArgs) -> Result<()> {
    use crate::application::generate_use_case::GenerateUseCase;
    use crate::domain::traits::SqlGenerator;

    let use_case = GenerateUseCase::open(&args.model_dir, args.generation.into())?;
    let sql      = use_case.generate_sql(&args.context, &args.question)?;
    println!("{sql}");
    Ok(())
}
