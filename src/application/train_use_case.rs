// ============================================================
// Layer 2 - TrainUseCase
// ============================================================
// Orchestrates the full QLoRA pipeline in order:
//
//   Step 1: Read the hub credential     (Layer 6 - infra)
//   Step 2: Load base + quantize to NF4 (Layer 5 - ml)
//   Step 3: Load + split records        (Layer 4 - data)
//   Step 4: Tokenise into datasets      (Layer 4 - data)
//   Step 5: Attach LoRA adapters        (Layer 5 - ml)
//   Step 6: Fine-tune, checkpoint/epoch (Layer 5 - ml, Layer 6 - infra)
//   Step 7: Save the final adapter      (Layer 6 - infra)
//   Step 8: Release the training model, merge into the base
//   Step 9: Generate SQL for one held-out record
//
// Only plain values cross from one step to the next.
//
// Reference: Burn Book §5 (Training)
//            Dettmers et al. (2023) QLoRA

use anyhow::Result;
use burn::{prelude::*, tensor::backend::AutodiffBackend};
use serde::{Deserialize, Serialize};

use crate::application::{generate_use_case::GenerateUseCase, merge_use_case::MergeUseCase};
use crate::data::{
    dataset::LmDataset,
    loader::{DatasetLoader, DatasetSpec, SplitSpec, DEFAULT_DATA_FILE},
    preprocessor::{Preprocessor, SpecialTokens},
    splitter::split_train_test,
};
use crate::domain::{record::SqlRecord, traits::{RecordSource, SqlGenerator}};
use crate::infra::{
    checkpoint::{AdapterConfig, AdapterDir, ModelDir, RunDir},
    env,
    metrics::{EpochMetrics, MetricsLogger},
};
use crate::ml::{
    generator::GenerationConfig,
    lora::LoraSettings,
    model::ParameterReport,
    quant::QuantSettings,
    trainer::{train_loop, SftConfig},
    TrainBackend,
};

// ─── Training Configuration ──────────────────────────────────────────────────
// Everything one run needs. Saved as train_config.json in output_dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub base_model:    String,
    pub dataset:       DatasetSpec,
    pub test_fraction: f64,
    pub split_seed:    u64,
    pub quant:         QuantSettings,
    pub lora:          LoraSettings,
    pub sft:           SftConfig,
    pub generation:    GenerationConfig,
    /// Metrics, train_config.json and per-epoch adapter checkpoints
    pub output_dir:    String,
    pub adapter_dir:   String,
    pub merged_dir:    String,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            base_model:    "models/base".to_string(),
            dataset:       DatasetSpec {
                id:        "b-mc2/sql-create-context".to_string(),
                split:     SplitSpec::whole("train"),
                data_file: DEFAULT_DATA_FILE.to_string(),
                limit:     None,
            },
            test_fraction: 0.2,
            split_seed:    1234,
            quant:         QuantSettings::default(),
            lora:          LoraSettings::default(),
            sft:           SftConfig::default(),
            generation:    GenerationConfig::default(),
            output_dir:    "results".to_string(),
            adapter_dir:   "models/adapter".to_string(),
            merged_dir:    "models/merged".to_string(),
        }
    }
}

/// One generated answer next to its reference.
#[derive(Debug, Clone)]
pub struct SampleOutput {
    pub record:    SqlRecord,
    pub generated: String,
}

/// What a finished run hands back to the CLI.
#[derive(Debug, Clone)]
pub struct TrainReport {
    pub train_samples: usize,
    pub test_samples:  usize,
    pub parameters:    ParameterReport,
    pub last_epoch:    Option<EpochMetrics>,
    pub merged:        ParameterReport,
    pub sample:        Option<SampleOutput>,
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// Run on the default GPU device.
    pub fn execute(&self) -> Result<TrainReport> {
        let device = burn::backend::wgpu::WgpuDevice::default();
        tracing::info!("Using WGPU device: {:?}", device);
        self.run::<TrainBackend>(&device)
    }

    /// Execute the full pipeline end to end. Merging and generation
    /// run on the backend underneath `B`, without autodiff.
    pub fn run<B: AutodiffBackend>(&self, device: &B::Device) -> Result<TrainReport> {
        let cfg = &self.config;
        cfg.quant.validate()?;
        cfg.lora.validate()?;
        cfg.sft.validate()?;

        // ── Step 1: Credential ────────────────────────────────────────────────
        let token = env::hub_token();
        if token.is_none() {
            tracing::debug!("No hub token set; only public datasets can be fetched");
        }

        // ── Step 2: Base model, quantized ─────────────────────────────────────
        let base_dir = ModelDir::new(&cfg.base_model);
        let (model_cfg, model) = base_dir.load_model::<B>(device)?;
        let tokenizer = base_dir.load_tokenizer()?;
        let special   = SpecialTokens::resolve(&tokenizer, &model_cfg.bos_token, &model_cfg.eos_token)?;
        let model     = model.quantize_base(&cfg.quant)?;

        // ── Step 3: Records, shuffled and split ───────────────────────────────
        let records = DatasetLoader::new(cfg.dataset.clone())
            .with_token(token)
            .load_records()?;
        let (train_records, test_records) =
            split_train_test(records, cfg.test_fraction, cfg.split_seed)?;
        tracing::info!(
            "Split: {} train, {} test",
            train_records.len(),
            test_records.len()
        );

        // ── Step 4: Token datasets ────────────────────────────────────────────
        let pre = Preprocessor::new(&tokenizer, special, model_cfg.max_seq_len);
        let train_dataset = LmDataset::new(pre.build_samples(&train_records)?);
        let test_dataset  = LmDataset::new(pre.build_samples(&test_records)?);
        let (train_samples, test_samples) = (train_dataset.sample_count(), test_dataset.sample_count());
        tracing::info!(
            "{} train targets, {} test targets",
            train_dataset.target_count(),
            test_dataset.target_count()
        );

        // ── Step 5: LoRA ──────────────────────────────────────────────────────
        let model      = model.apply_lora(&cfg.lora, device)?;
        let parameters = model.parameter_report();
        tracing::info!("{}", parameters);
        tracing::info!("Weights occupy ~{:.1} MiB", parameters.memory_bytes as f64 / (1024.0 * 1024.0));

        // ── Step 6: Fine-tune ─────────────────────────────────────────────────
        let run = RunDir::create(&cfg.output_dir)?;
        run.save_config(cfg)?;
        let metrics_log = MetricsLogger::new(run.path())?;
        tracing::info!("Epoch metrics go to '{}'", metrics_log.csv_path().display());
        let adapter_cfg = AdapterConfig {
            base_model: cfg.base_model.clone(),
            lora:       cfg.lora.clone(),
            quant:      cfg.quant,
        };

        let mut last_epoch = None;
        let model = train_loop(
            &cfg.sft,
            model,
            train_dataset,
            test_dataset,
            special.pad_id(),
            device,
            |metrics, model| {
                run.epoch_dir(metrics.epoch).save(&adapter_cfg, model.adapters(), &tokenizer)?;
                run.mark_latest(metrics.epoch)?;
                metrics_log.log(metrics)?;
                tracing::info!("Checkpoint saved for epoch {}", metrics.epoch);
                last_epoch = Some(metrics.clone());
                Ok(())
            },
        )?;

        // ── Step 7: Final adapter ─────────────────────────────────────────────
        AdapterDir::new(&cfg.adapter_dir).save(&adapter_cfg, model.adapters(), &tokenizer)?;
        tracing::info!("Adapter written to '{}'", cfg.adapter_dir);

        // ── Step 8: Release the 4-bit model, then merge ───────────────────────
        drop(model);
        let inner_device = device.clone();
        let merged = MergeUseCase::new(&cfg.base_model, &cfg.adapter_dir, &cfg.merged_dir)
            .run::<B::InnerBackend>(&inner_device)?;

        // ── Step 9: One held-out example ──────────────────────────────────────
        let sample = match test_records.first() {
            Some(record) => {
                let generator = GenerateUseCase::<B::InnerBackend>::load(
                    &cfg.merged_dir,
                    cfg.generation.clone(),
                    &inner_device,
                )?;
                let generated = generator.generate_sql(&record.context, &record.question)?;
                Some(SampleOutput { record: record.clone(), generated })
            }
            None => {
                tracing::warn!("Test split is empty; skipping the generation example");
                None
            }
        };

        Ok(TrainReport { train_samples, test_samples, parameters, last_epoch, merged, sample })
    }
}
