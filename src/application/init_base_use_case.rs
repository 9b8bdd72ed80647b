// ============================================================
// Layer 2 - InitBaseUseCase
// ============================================================
// Writes a randomly initialised base checkpoint so the rest of
// the pipeline has something to quantize and adapt:
//
//   Step 1: Load records               (Layer 4 - data)
//   Step 2: Build tokenizer on prompts (Layer 6 - infra)
//   Step 3: Build the architecture     (Layer 5 - ml)
//   Step 4: Save config + weights + tokenizer

use anyhow::Result;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::loader::{DatasetLoader, DatasetSpec};
use crate::domain::{prompt, traits::RecordSource};
use crate::infra::{
    checkpoint::ModelDir,
    env,
    tokenizer_store::{build_tokenizer, BOS_TOKEN, EOS_TOKEN},
};
use crate::ml::model::DecoderConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitBaseConfig {
    pub dataset:     DatasetSpec,
    pub output_dir:  String,
    /// Upper bound; the real size is whatever the corpus fills
    pub vocab_size:  usize,
    pub max_seq_len: usize,
    pub d_model:     usize,
    pub num_heads:   usize,
    pub num_layers:  usize,
    pub d_ff:        usize,
    pub dropout:     f64,
    pub seed:        u64,
}

pub struct InitBaseUseCase {
    config: InitBaseConfig,
}

impl InitBaseUseCase {
    pub fn new(config: InitBaseConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<DecoderConfig> {
        let device = burn::backend::wgpu::WgpuDevice::default();
        self.run::<crate::ml::InferBackend>(&device)
    }

    pub fn run<B: Backend>(&self, device: &B::Device) -> Result<DecoderConfig> {
        let cfg = &self.config;

        // ── Step 1: Load records ──────────────────────────────────────────────
        let records = DatasetLoader::new(cfg.dataset.clone())
            .with_token(env::hub_token())
            .load_records()?;

        // ── Step 2: Tokenizer over the rendered prompts ───────────────────────
        let prompts: Vec<String> = records.iter().map(prompt::training_prompt).collect();
        let tokenizer = build_tokenizer(&prompts, cfg.vocab_size)?;

        // ── Step 3: Architecture sized to the tokenizer ───────────────────────
        let model_cfg = DecoderConfig::new(
            tokenizer.get_vocab_size(true),
            cfg.max_seq_len,
            BOS_TOKEN.to_string(),
            EOS_TOKEN.to_string(),
        )
        .with_d_model(cfg.d_model)
        .with_num_heads(cfg.num_heads)
        .with_num_layers(cfg.num_layers)
        .with_d_ff(cfg.d_ff)
        .with_dropout(cfg.dropout);
        model_cfg.validate()?;

        B::seed(cfg.seed);
        let model = model_cfg.init::<B>(device);
        tracing::info!(
            "Initialised base: vocab={}, d_model={}, layers={}, params={}",
            model_cfg.vocab_size,
            model_cfg.d_model,
            model_cfg.num_layers,
            model.num_params()
        );

        // ── Step 4: Save ──────────────────────────────────────────────────────
        ModelDir::new(&cfg.output_dir).save(&model_cfg, &model, &tokenizer)?;
        Ok(model_cfg)
    }
}
