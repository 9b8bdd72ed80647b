// ============================================================
// Layer 2 - GenerateUseCase
// ============================================================
// Schema + question in, SQL out:
//
//   1. Render the inference prompt (ends at "### Answer:")
//   2. <bos> + prompt tokens
//   3. Autoregressive generation until <eos>
//   4. Decode, cut at any further "###" section

use anyhow::Result;
use burn::prelude::*;
use std::path::Path;
use tokenizers::Tokenizer;

use crate::data::preprocessor::{Preprocessor, SpecialTokens};
use crate::domain::{prompt, traits::SqlGenerator};
use crate::infra::{checkpoint::ModelDir, tokenizer_store};
use crate::ml::{
    generator::{GenerationConfig, Generator},
    model::{DecoderConfig, DecoderModel},
    InferBackend,
};

pub struct GenerateUseCase<B: Backend = InferBackend> {
    tokenizer:   Tokenizer,
    special:     SpecialTokens,
    max_seq_len: usize,
    generator:   Generator<B>,
    config:      GenerationConfig,
}

impl GenerateUseCase<InferBackend> {
    /// Load a (merged) model directory on the default GPU device.
    pub fn open(model_dir: impl AsRef<Path>, config: GenerationConfig) -> Result<Self> {
        let device = burn::backend::wgpu::WgpuDevice::default();
        Self::load(model_dir, config, &device)
    }
}

impl<B: Backend> GenerateUseCase<B> {
    pub fn load(model_dir: impl AsRef<Path>, config: GenerationConfig, device: &B::Device) -> Result<Self> {
        let dir = ModelDir::new(model_dir);
        let (model_cfg, model) = dir.load_model::<B>(device)?;
        let tokenizer = dir.load_tokenizer()?;
        Self::from_model(model, &model_cfg, tokenizer, config, device)
    }

    pub fn from_model(
        model:     DecoderModel<B>,
        model_cfg: &DecoderConfig,
        tokenizer: Tokenizer,
        config:    GenerationConfig,
        device:    &B::Device,
    ) -> Result<Self> {
        let special   = SpecialTokens::resolve(&tokenizer, &model_cfg.bos_token, &model_cfg.eos_token)?;
        let generator = Generator::new(model, device.clone(), special.eos_id);
        Ok(Self { tokenizer, special, max_seq_len: model_cfg.max_seq_len, generator, config })
    }
}

impl<B: Backend> SqlGenerator for GenerateUseCase<B> {
    fn generate_sql(&self, context: &str, question: &str) -> Result<String> {
        let pre = Preprocessor::new(&self.tokenizer, self.special, self.max_seq_len);
        let ids = pre.encode_prompt(&prompt::inference_prompt(context, question))?;
        tracing::debug!("Prompt is {} tokens", ids.len());

        let new_ids = self.generator.generate(&ids, &self.config)?;
        let text    = tokenizer_store::decode(&self.tokenizer, &new_ids)?;
        Ok(prompt::extract_answer(&text))
    }
}
