// ============================================================
// Layer 6 - Checkpoints
// ============================================================
// Three kinds of directory are written and read:
//
//   Model directory (base or merged model):
//     config.json          DecoderConfig: architecture + special tokens
//     model.mpk            every weight, Burn CompactRecorder
//     tokenizer.json
//
//   Adapter directory (LoRA only, a few MB):
//     adapter_config.json  AdapterConfig: base model path, LoRA + quant settings
//     adapter_model.mpk    AdapterSet record
//     tokenizer.json
//
//   Run directory (one fine-tuning run):
//     train_config.json    the full TrainConfig
//     metrics.csv          (metrics.rs)
//     checkpoint-epoch-N/  adapter directory after epoch N
//     latest_epoch.json    number of the newest epoch directory
//
// Why save the config separately?
//   To load weights, the exact model has to be rebuilt first;
//   the record only holds values, not the architecture.
//
// CompactRecorder stores MessagePack with half-precision floats.
// Loading fails if the architecture doesn't match the record.
//
// Reference: Burn Book §5 (Records and Checkpointing)

use anyhow::{anyhow, bail, Context, Result};
use burn::{
    prelude::*,
    record::{CompactRecorder, Recorder},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tokenizers::Tokenizer;

use crate::infra::tokenizer_store::{TokenizerStore, TOKENIZER_FILE};
use crate::ml::{
    lora::{AdapterSet, LoraSettings},
    model::{DecoderConfig, DecoderModel},
    quant::QuantSettings,
};

pub const MODEL_CONFIG_FILE:   &str = "config.json";
/// Recorder appends ".mpk"
pub const MODEL_WEIGHTS:       &str = "model";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS:     &str = "adapter_model";
pub const TRAIN_CONFIG_FILE:   &str = "train_config.json";
pub const LATEST_EPOCH_FILE:   &str = "latest_epoch.json";

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).with_context(|| format!("Cannot write '{}'", path.display()))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("Cannot read '{}'", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("Malformed '{}'", path.display()))
}

fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Cannot create '{}'", dir.display()))
}

// ─── ModelDir ─────────────────────────────────────────────────────────────────

/// A full model checkpoint: base or merged.
pub struct ModelDir {
    dir: PathBuf,
}

impl ModelDir {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Fail early, naming every missing file.
    pub fn check(&self) -> Result<()> {
        let missing: Vec<&str> = [MODEL_CONFIG_FILE, "model.mpk", TOKENIZER_FILE]
            .into_iter()
            .filter(|f| !self.dir.join(f).is_file())
            .collect();
        if !missing.is_empty() {
            bail!(
                "'{}' is not a model checkpoint: missing {}",
                self.dir.display(),
                missing.join(", ")
            );
        }
        Ok(())
    }

    pub fn load_config(&self) -> Result<DecoderConfig> {
        let path = self.dir.join(MODEL_CONFIG_FILE);
        let cfg  = DecoderConfig::load(&path)
            .map_err(|e| anyhow!("Cannot load model config '{}': {e:?}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_tokenizer(&self) -> Result<Tokenizer> {
        TokenizerStore::new(&self.dir).load()
    }

    /// Rebuild the architecture from config.json and load the weights into it.
    pub fn load_model<B: Backend>(&self, device: &B::Device) -> Result<(DecoderConfig, DecoderModel<B>)> {
        self.check()?;
        let cfg  = self.load_config()?;
        let path = self.dir.join(MODEL_WEIGHTS);

        let record = CompactRecorder::new()
            .load(path.clone(), device)
            .with_context(|| format!("Cannot load weights '{}'", path.display()))?;

        tracing::info!("Loaded model from '{}'", self.path().display());
        Ok((cfg.clone(), cfg.init::<B>(device).load_record(record)))
    }

    /// Write config, weights and tokenizer.
    pub fn save<B: Backend>(
        &self,
        cfg:       &DecoderConfig,
        model:     &DecoderModel<B>,
        tokenizer: &Tokenizer,
    ) -> Result<()> {
        ensure_dir(&self.dir)?;

        let cfg_path = self.dir.join(MODEL_CONFIG_FILE);
        cfg.save(&cfg_path)
            .with_context(|| format!("Cannot write '{}'", cfg_path.display()))?;

        let path = self.dir.join(MODEL_WEIGHTS);
        CompactRecorder::new()
            .record(model.clone().into_record(), path.clone())
            .with_context(|| format!("Failed to save weights to '{}'", path.display()))?;

        TokenizerStore::new(&self.dir).save(tokenizer)?;
        tracing::info!("Saved model to '{}'", self.path().display());
        Ok(())
    }
}

// ─── AdapterDir ───────────────────────────────────────────────────────────────

/// Contents of adapter_config.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Model directory the adapter was trained on
    pub base_model: String,
    pub lora:       LoraSettings,
    pub quant:      QuantSettings,
}

/// A LoRA adapter checkpoint.
pub struct AdapterDir {
    dir: PathBuf,
}

impl AdapterDir {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn save<B: Backend>(
        &self,
        cfg:       &AdapterConfig,
        adapters:  AdapterSet<B>,
        tokenizer: &Tokenizer,
    ) -> Result<()> {
        ensure_dir(&self.dir)?;
        write_json(&self.dir.join(ADAPTER_CONFIG_FILE), cfg)?;
        let (count, params) = (adapters.num_adapters(), adapters.num_trainable());

        let path = self.dir.join(ADAPTER_WEIGHTS);
        CompactRecorder::new()
            .record(adapters.into_record(), path.clone())
            .with_context(|| format!("Failed to save adapter to '{}'", path.display()))?;

        TokenizerStore::new(&self.dir).save(tokenizer)?;
        tracing::debug!(
            "Saved {} adapters ({} params) to '{}'",
            count, params, self.dir.display()
        );
        Ok(())
    }

    pub fn load_config(&self) -> Result<AdapterConfig> {
        let cfg: AdapterConfig = read_json(&self.dir.join(ADAPTER_CONFIG_FILE))
            .context("Is this an adapter directory written by 'train'?")?;
        cfg.lora.validate()?;
        Ok(cfg)
    }

    /// Load adapter weights shaped for `model_cfg`.
    pub fn load_adapters<B: Backend>(
        &self,
        model_cfg: &DecoderConfig,
        lora:      &LoraSettings,
        device:    &B::Device,
    ) -> Result<AdapterSet<B>> {
        let path = self.dir.join(ADAPTER_WEIGHTS);
        let record = CompactRecorder::new()
            .load(path.clone(), device)
            .with_context(|| format!("Cannot load adapter weights '{}'", path.display()))?;
        Ok(AdapterSet::init(model_cfg, lora, device).load_record(record))
    }
}

// ─── RunDir ───────────────────────────────────────────────────────────────────

/// Output directory of one fine-tuning run.
pub struct RunDir {
    dir: PathBuf,
}

impl RunDir {
    /// Creates the directory if it doesn't already exist.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        ensure_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn save_config<T: Serialize>(&self, cfg: &T) -> Result<()> {
        let path = self.dir.join(TRAIN_CONFIG_FILE);
        write_json(&path, cfg)?;
        tracing::debug!("Saved training config to '{}'", path.display());
        Ok(())
    }

    pub fn epoch_dir(&self, epoch: usize) -> AdapterDir {
        AdapterDir::new(self.dir.join(format!("checkpoint-epoch-{epoch}")))
    }

    /// Update the pointer to the newest epoch checkpoint.
    pub fn mark_latest(&self, epoch: usize) -> Result<()> {
        write_json(&self.dir.join(LATEST_EPOCH_FILE), &epoch)
    }
}
