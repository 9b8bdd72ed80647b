// ============================================================
// Layer 2 - MergeUseCase
// ============================================================
// Base model + trained adapter → standalone merged model.
//
//   Step 1: Read adapter_config.json
//   Step 2: Reload the base in full precision (no quantization)
//   Step 3: Load the adapter weights and attach them
//   Step 4: W' = W + scaling·A·B for every adapted projection
//   Step 5: Save config + weights + tokenizer to merged_dir
//
// The merged checkpoint has the same layout as the base, so it
// can be fine-tuned again or used for generation directly.

use anyhow::Result;
use burn::prelude::*;

use crate::infra::{
    checkpoint::{AdapterDir, ModelDir},
    tokenizer_store::TokenizerStore,
};
use crate::ml::model::ParameterReport;

pub struct MergeUseCase {
    base_dir:    String,
    adapter_dir: String,
    merged_dir:  String,
}

impl MergeUseCase {
    pub fn new(base_dir: impl Into<String>, adapter_dir: impl Into<String>, merged_dir: impl Into<String>) -> Self {
        Self {
            base_dir:    base_dir.into(),
            adapter_dir: adapter_dir.into(),
            merged_dir:  merged_dir.into(),
        }
    }

    pub fn execute(&self) -> Result<ParameterReport> {
        let device = burn::backend::wgpu::WgpuDevice::default();
        self.run::<crate::ml::InferBackend>(&device)
    }

    pub fn run<B: Backend>(&self, device: &B::Device) -> Result<ParameterReport> {
        // ── Step 1: Adapter settings ──────────────────────────────────────────
        let adapter_dir = AdapterDir::new(&self.adapter_dir);
        let adapter_cfg = adapter_dir.load_config()?;
        if adapter_cfg.base_model != self.base_dir {
            tracing::warn!(
                "Adapter was trained on '{}' but is being merged into '{}'",
                adapter_cfg.base_model, self.base_dir
            );
        }

        // ── Step 2: Full-precision base ───────────────────────────────────────
        let (model_cfg, base) = ModelDir::new(&self.base_dir).load_model::<B>(device)?;

        // ── Step 3: Adapter weights ───────────────────────────────────────────
        let adapters = adapter_dir.load_adapters::<B>(&model_cfg, &adapter_cfg.lora, device)?;
        tracing::info!("Loaded {} adapters from '{}'", adapters.num_adapters(), self.adapter_dir);

        // ── Step 4: Fold them in ──────────────────────────────────────────────
        let merged = base.attach_adapters(adapters)?.merge_lora();
        let report = merged.parameter_report();

        // ── Step 5: Save ──────────────────────────────────────────────────────
        let tokenizer = TokenizerStore::new(adapter_dir.path()).load()?;
        ModelDir::new(&self.merged_dir).save(&model_cfg, &merged, &tokenizer)?;
        tracing::info!("Merged model written to '{}'", self.merged_dir);

        Ok(report)
    }
}
