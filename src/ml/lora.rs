// ============================================================
// Layer 5 - LoRA Adapters
// ============================================================
// Low-rank adaptation: for a frozen weight W [d_in, d_out],
// train two small matrices instead of W itself:
//
//   A [d_in, r]   initialised uniform in ±1/√d_in
//   B [r, d_out]  initialised to zero
//
//   y = x·W + (alpha / r) · (dropout(x)·A)·B
//
// Because B starts at zero the adapted model is exactly the base
// model at step 0; training only ever moves A and B.
//
// Merging folds the update back into a plain weight:
//   W' = W + (alpha / r) · A·B
//
// Reference: Hu et al. (2021) LoRA
//            burn::nn::Linear (weight layout)

use anyhow::{bail, Result};
use burn::{
    module::Param,
    nn::{Dropout, DropoutConfig},
    prelude::*,
    tensor::Distribution,
};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ml::model::DecoderConfig;

// ─── Projection names ─────────────────────────────────────────────────────────

/// The seven linear projections inside every decoder block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Projection {
    Q,
    K,
    V,
    O,
    Gate,
    Up,
    Down,
}

impl Projection {
    pub const ALL: [Projection; 7] = [
        Projection::Q,
        Projection::K,
        Projection::V,
        Projection::O,
        Projection::Gate,
        Projection::Up,
        Projection::Down,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Projection::Q    => "q_proj",
            Projection::K    => "k_proj",
            Projection::V    => "v_proj",
            Projection::O    => "o_proj",
            Projection::Gate => "gate_proj",
            Projection::Up   => "up_proj",
            Projection::Down => "down_proj",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    /// (d_input, d_output) of this projection for a given architecture.
    pub fn dims(self, cfg: &DecoderConfig) -> (usize, usize) {
        match self {
            Projection::Q | Projection::K | Projection::V | Projection::O => (cfg.d_model, cfg.d_model),
            Projection::Gate | Projection::Up => (cfg.d_model, cfg.d_ff),
            Projection::Down => (cfg.d_ff, cfg.d_model),
        }
    }

    /// Position in `Projection::ALL`.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Settings ─────────────────────────────────────────────────────────────────

/// Which projections get an adapter and how it is shaped.
/// Persisted as part of adapter_config.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraSettings {
    pub rank:           usize,
    pub alpha:          f64,
    pub dropout:        f64,
    pub target_modules: Vec<String>,
}

impl Default for LoraSettings {
    fn default() -> Self {
        Self {
            rank:           8,
            alpha:          32.0,
            dropout:        0.05,
            target_modules: ["q_proj", "k_proj", "v_proj", "o_proj"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl LoraSettings {
    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            bail!("LoRA rank must be at least 1");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            bail!("LoRA dropout must be in [0, 1), got {}", self.dropout);
        }
        if self.target_modules.is_empty() {
            bail!("LoRA needs at least one target module");
        }
        for name in &self.target_modules {
            if Projection::from_name(name).is_none() {
                let known: Vec<_> = Projection::ALL.iter().map(|p| p.name()).collect();
                bail!("Unknown LoRA target module '{name}' (expected one of {known:?})");
            }
        }
        Ok(())
    }

    pub fn targets(&self, projection: Projection) -> bool {
        self.target_modules.iter().any(|m| m == projection.name())
    }

    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }
}

// ─── LoraAdapter ──────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct LoraAdapter<B: Backend> {
    /// Down projection [d_in, r]
    pub lora_a:  Param<Tensor<B, 2>>,
    /// Up projection [r, d_out]
    pub lora_b:  Param<Tensor<B, 2>>,
    pub dropout: Dropout,
    pub scaling: f64,
}

impl<B: Backend> LoraAdapter<B> {
    pub fn init(d_input: usize, d_output: usize, settings: &LoraSettings, device: &B::Device) -> Self {
        let bound  = 1.0 / (d_input as f64).sqrt();
        let lora_a = Tensor::<B, 2>::random(
            [d_input, settings.rank],
            Distribution::Uniform(-bound, bound),
            device,
        );
        let lora_b = Tensor::<B, 2>::zeros([settings.rank, d_output], device);

        Self {
            lora_a:  Param::from_tensor(lora_a),
            lora_b:  Param::from_tensor(lora_b),
            dropout: DropoutConfig::new(settings.dropout).init(),
            scaling: settings.scaling(),
        }
    }

    /// scaling · (dropout(x)·A)·B
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let hidden = self.dropout.forward(input).matmul(self.lora_a.val().unsqueeze());
        hidden
            .matmul(self.lora_b.val().unsqueeze())
            .mul_scalar(self.scaling)
    }

    /// scaling · A·B, shape [d_in, d_out]
    pub fn delta_weight(&self) -> Tensor<B, 2> {
        self.lora_a
            .val()
            .matmul(self.lora_b.val())
            .mul_scalar(self.scaling)
    }

    pub fn num_params(&self) -> usize {
        let [d_in, r]  = self.lora_a.dims();
        let [_, d_out] = self.lora_b.dims();
        d_in * r + r * d_out
    }
}

// ─── AdapterSet ───────────────────────────────────────────────────────────────
// Just the adapters of a model, detached from the frozen base.
// This is what gets written to adapter_model.mpk, so an adapter
// checkpoint is a few megabytes instead of a full model copy.

#[derive(Module, Debug)]
pub struct BlockAdapters<B: Backend> {
    /// One slot per projection, in `Projection::ALL` order
    pub slots: Vec<Option<LoraAdapter<B>>>,
}

#[derive(Module, Debug)]
pub struct AdapterSet<B: Backend> {
    pub blocks: Vec<BlockAdapters<B>>,
}

impl<B: Backend> AdapterSet<B> {
    /// Fresh adapters shaped for `cfg`; used as the target when loading a record.
    pub fn init(cfg: &DecoderConfig, settings: &LoraSettings, device: &B::Device) -> Self {
        let blocks = (0..cfg.num_layers)
            .map(|_| BlockAdapters {
                slots: Projection::ALL
                    .iter()
                    .map(|&p| {
                        settings.targets(p).then(|| {
                            let (d_in, d_out) = p.dims(cfg);
                            LoraAdapter::init(d_in, d_out, settings, device)
                        })
                    })
                    .collect(),
            })
            .collect();
        Self { blocks }
    }

    pub fn num_adapters(&self) -> usize {
        self.blocks.iter().flat_map(|b| &b.slots).filter(|s| s.is_some()).count()
    }

    pub fn num_trainable(&self) -> usize {
        self.blocks
            .iter()
            .flat_map(|b| &b.slots)
            .flatten()
            .map(LoraAdapter::num_params)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn tiny_config() -> DecoderConfig {
        DecoderConfig::new(32, 16, "<bos>".into(), "<eos>".into())
            .with_d_model(8)
            .with_num_heads(2)
            .with_num_layers(2)
            .with_d_ff(12)
    }

    #[test]
    fn test_default_settings() {
        let s = LoraSettings::default();
        assert!(s.validate().is_ok());
        assert_eq!(s.scaling(), 4.0);
        assert!(s.targets(Projection::Q));
        assert!(!s.targets(Projection::Gate));
    }

    #[test]
    fn test_validation_rejects_bad_settings() {
        let mut s = LoraSettings::default();
        s.rank = 0;
        assert!(s.validate().is_err());

        let mut s = LoraSettings::default();
        s.target_modules.push("qkv".into());
        assert!(s.validate().is_err());

        let mut s = LoraSettings::default();
        s.target_modules.clear();
        assert!(s.validate().is_err());

        let mut s = LoraSettings::default();
        s.dropout = 1.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_projection_names_round_trip() {
        for p in Projection::ALL {
            assert_eq!(Projection::from_name(p.name()), Some(p));
            assert_eq!(Projection::ALL[p.index()], p);
        }
        assert_eq!(Projection::from_name("lm_head"), None);
    }

    #[test]
    fn test_fresh_adapter_is_a_no_op() {
        let device  = Default::default();
        let adapter = LoraAdapter::<TestBackend>::init(6, 5, &LoraSettings::default(), &device);
        let x       = Tensor::<TestBackend, 3>::ones([2, 3, 6], &device);

        let out = adapter.forward(x);
        assert_eq!(out.dims(), [2, 3, 5]);
        let max = out.abs().max().into_scalar();
        assert_eq!(max, 0.0);
    }

    #[test]
    fn test_delta_weight_matches_forward() {
        let device   = Default::default();
        let mut settings = LoraSettings::default();
        settings.dropout = 0.0;
        let mut adapter = LoraAdapter::<TestBackend>::init(4, 3, &settings, &device);
        adapter.lora_b = Param::from_tensor(Tensor::ones([settings.rank, 3], &device));

        let x     = Tensor::<TestBackend, 2>::random([5, 4], Distribution::Default, &device);
        let via_forward = adapter.forward(x.clone());
        let via_delta   = x.matmul(adapter.delta_weight());

        let diff = (via_forward - via_delta).abs().max().into_scalar();
        assert!(diff < 1e-4);
    }

    #[test]
    fn test_adapter_set_shapes() {
        let cfg      = tiny_config();
        let settings = LoraSettings::default();
        let set      = AdapterSet::<TestBackend>::init(&cfg, &settings, &Default::default());

        assert_eq!(set.blocks.len(), 2);
        assert_eq!(set.num_adapters(), 8);
        // 4 projections of 8x8 with rank 8: (8*8 + 8*8) each, per block
        assert_eq!(set.num_trainable(), 2 * 4 * 128);
        assert!(set.blocks[0].slots[Projection::Down.index()].is_none());
        let v = set.blocks[1].slots[Projection::V.index()].as_ref().unwrap();
        assert_eq!(v.lora_a.dims(), [8, 8]);
    }
}
