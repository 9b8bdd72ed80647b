// ============================================================
// Layer 5 - Supervised Fine-Tuning Loop
// ============================================================
// Trains only the LoRA adapters of a (quantized) decoder with
// causal-LM loss.
//
// Per optimizer step:
//   1. grad_accum_steps micro-batches, each loss / grad_accum_steps
//   2. gradients summed in a GradientsAccumulator
//   3. AdamW step with norm clipping at the scheduled learning rate
//
// Frozen parameters never receive gradients, so AdamW only ever
// sees the adapter matrices.
//
// Key Burn insight:
//   - Training uses an AutodiffBackend for gradients
//   - model.valid() returns the model on the inner backend
//   - The evaluation batcher must also use the inner backend
//
// Reference: Burn Book §5, Loshchilov & Hutter (2019) AdamW

use anyhow::{bail, Result};
use burn::{
    data::dataloader::DataLoaderBuilder,
    grad_clipping::GradientClippingConfig,
    module::AutodiffModule,
    optim::{AdamWConfig, GradientsAccumulator, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

use crate::data::{batcher::LmBatcher, dataset::LmDataset};
use crate::infra::metrics::EpochMetrics;
use crate::ml::model::DecoderModel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftConfig {
    pub epochs:           usize,
    /// Hard cap on optimizer steps across all epochs
    pub max_steps:        Option<usize>,
    pub batch_size:       usize,
    pub grad_accum_steps: usize,
    pub lr:               f64,
    pub warmup_ratio:     f64,
    pub weight_decay:     f32,
    pub max_grad_norm:    f32,
    /// Optimizer steps between training-loss log lines
    pub logging_steps:    usize,
    pub seed:             u64,
}

impl Default for SftConfig {
    fn default() -> Self {
        Self {
            epochs:           1,
            max_steps:        None,
            batch_size:       1,
            grad_accum_steps: 4,
            lr:               2e-4,
            warmup_ratio:     0.03,
            weight_decay:     0.0,
            max_grad_norm:    0.3,
            logging_steps:    1,
            seed:             1234,
        }
    }
}

impl SftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.batch_size == 0 || self.grad_accum_steps == 0 {
            bail!("epochs, batch_size and grad_accum_steps must all be at least 1");
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            bail!("warmup_ratio must be in [0, 1], got {}", self.warmup_ratio);
        }
        if self.lr <= 0.0 {
            bail!("learning rate must be positive, got {}", self.lr);
        }
        Ok(())
    }

    /// Optimizer steps the run will take for `num_samples` training samples.
    pub fn total_steps(&self, num_samples: usize) -> usize {
        let batches = num_samples.div_ceil(self.batch_size);
        let per_epoch = batches.div_ceil(self.grad_accum_steps);
        let total = per_epoch * self.epochs;
        self.max_steps.map_or(total, |cap| total.min(cap))
    }
}

// ─── Learning-rate schedule ───────────────────────────────────────────────────

/// Linear warmup from 0 to `peak`, then linear decay to 0 at `total`.
#[derive(Debug, Clone, Copy)]
pub struct LinearWarmupDecay {
    peak:   f64,
    warmup: usize,
    total:  usize,
}

impl LinearWarmupDecay {
    pub fn new(peak: f64, total: usize, warmup_ratio: f64) -> Self {
        let warmup = (warmup_ratio * total as f64).ceil() as usize;
        Self { peak, warmup, total }
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup
    }

    /// Learning rate for optimizer step `step` (0-based).
    pub fn lr(&self, step: usize) -> f64 {
        if step < self.warmup {
            return self.peak * step as f64 / self.warmup as f64;
        }
        let remaining = self.total.saturating_sub(step) as f64;
        let span      = self.total.saturating_sub(self.warmup).max(1) as f64;
        self.peak * remaining / span
    }
}

// ─── Loss window ───────────────────────────────────────────────────────────────

/// Training losses since the last log line.
#[derive(Debug, Default)]
struct LossWindow {
    sum: f64,
    n:   usize,
}

impl LossWindow {
    fn push(&mut self, loss: f64) {
        self.sum += loss;
        self.n   += 1;
    }

    /// Mean of the pushed losses, emptying the window. NaN when empty.
    fn take_mean(&mut self) -> f64 {
        let mean = if self.n == 0 { f64::NAN } else { self.sum / self.n as f64 };
        *self = Self::default();
        mean
    }
}

// ─── Training loop ────────────────────────────────────────────────────────────

/// Train the adapters of `model`. `on_epoch` runs after each epoch's
/// evaluation, with the metrics and the current model, so the caller
/// can checkpoint.
pub fn train_loop<B, F>(
    cfg:       &SftConfig,
    mut model: DecoderModel<B>,
    train:     LmDataset,
    test:      LmDataset,
    pad_id:    u32,
    device:    &B::Device,
    mut on_epoch: F,
) -> Result<DecoderModel<B>>
where
    B: AutodiffBackend,
    F: FnMut(&EpochMetrics, &DecoderModel<B>) -> Result<()>,
{
    cfg.validate()?;
    if train.sample_count() == 0 {
        bail!("No training samples");
    }

    let total_steps = cfg.total_steps(train.sample_count());
    let schedule    = LinearWarmupDecay::new(cfg.lr, total_steps, cfg.warmup_ratio);
    tracing::info!(
        "SFT: {} samples, {} optimizer steps ({} warmup), effective batch {}",
        train.sample_count(),
        total_steps,
        schedule.warmup_steps(),
        cfg.batch_size * cfg.grad_accum_steps,
    );

    // ── AdamW with gradient-norm clipping ─────────────────────────────────────
    let mut optim = AdamWConfig::new()
        .with_weight_decay(cfg.weight_decay)
        .with_grad_clipping(Some(GradientClippingConfig::Norm(cfg.max_grad_norm)))
        .init::<B, DecoderModel<B>>();

    // ── Training data loader (AutodiffBackend) ────────────────────────────────
    let train_batcher = LmBatcher::<B>::new(device.clone(), pad_id);
    let train_loader  = DataLoaderBuilder::new(train_batcher)
        .batch_size(cfg.batch_size)
        .shuffle(cfg.seed)
        .num_workers(1)
        .build(train);

    // ── Evaluation data loader (InnerBackend, no autodiff overhead) ───────────
    let eval_batcher = LmBatcher::<B::InnerBackend>::new(device.clone(), pad_id);
    let eval_loader  = DataLoaderBuilder::new(eval_batcher)
        .batch_size(cfg.batch_size)
        .num_workers(1)
        .build(test);

    let mut step        = 0usize;
    let mut accumulator = GradientsAccumulator::new();
    let mut pending     = 0usize;
    let mut window      = LossWindow::default();

    // ── Epoch loop ────────────────────────────────────────────────────────────
    for epoch in 1..=cfg.epochs {
        let mut epoch_loss = 0.0f64;
        let mut epoch_n    = 0usize;

        for batch in train_loader.iter() {
            if step >= total_steps {
                break;
            }

            let loss = model.forward_loss(batch.inputs, batch.targets, batch.target_mask);
            let loss_val: f64 = loss.clone().into_scalar().elem::<f64>();
            epoch_loss  += loss_val;
            epoch_n     += 1;
            window.push(loss_val);

            let grads = loss.div_scalar(cfg.grad_accum_steps as f64).backward();
            let grads = GradientsParams::from_grads(grads, &model);
            accumulator.accumulate(&model, grads);
            pending += 1;

            if pending == cfg.grad_accum_steps {
                let lr = schedule.lr(step);
                model  = optim.step(lr, model, accumulator.grads());
                pending = 0;
                step   += 1;

                if step % cfg.logging_steps.max(1) == 0 {
                    tracing::info!(
                        "step {}/{} | loss={:.4} | lr={:.3e}",
                        step, total_steps, window.take_mean(), lr
                    );
                }
            }
        }

        // Flush a partial accumulation at the end of the epoch
        if pending > 0 && step < total_steps {
            let lr = schedule.lr(step);
            model  = optim.step(lr, model, accumulator.grads());
            step  += 1;
            tracing::info!(
                "step {}/{} | loss={:.4} | lr={:.3e} (partial, {} of {} micro-batches)",
                step, total_steps, window.take_mean(), lr,
                pending, cfg.grad_accum_steps
            );
        }
        // Nothing carries into the next epoch's first step
        pending     = 0;
        window      = LossWindow::default();
        accumulator = GradientsAccumulator::new();

        let train_loss = if epoch_n > 0 { epoch_loss / epoch_n as f64 } else { f64::NAN };

        // ── Evaluation phase ──────────────────────────────────────────────────
        // model.valid() → DecoderModel<B::InnerBackend>, dropout disabled
        let model_valid = model.valid();
        let mut eval_sum     = 0.0f64;
        let mut eval_targets = 0.0f64;

        for batch in eval_loader.iter() {
            let targets: f64 = batch.target_mask.clone().sum().into_scalar().elem::<f64>();
            let loss: f64 = model_valid
                .forward_loss(batch.inputs, batch.targets, batch.target_mask)
                .into_scalar()
                .elem::<f64>();
            // Weight each batch by its real target count
            eval_sum     += loss * targets;
            eval_targets += targets;
        }
        let eval_loss = if eval_targets > 0.0 { eval_sum / eval_targets } else { f64::NAN };

        let metrics = EpochMetrics::new(epoch, step, train_loss, eval_loss, schedule.lr(step));
        println!(
            "Epoch {:>3}/{} | step={} | train_loss={:.4} | eval_loss={:.4}",
            epoch, cfg.epochs, step, train_loss, eval_loss,
        );

        on_epoch(&metrics, &model)?;

        if step >= total_steps {
            break;
        }
    }

    tracing::info!("Fine-tuning complete after {} optimizer steps", step);
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::LmSample;
    use crate::ml::{lora::LoraSettings, model::DecoderConfig, quant::QuantSettings};
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn test_schedule_warmup_then_decay() {
        let s = LinearWarmupDecay::new(1.0, 100, 0.1);
        assert_eq!(s.warmup_steps(), 10);
        assert_eq!(s.lr(0), 0.0);
        assert!((s.lr(5) - 0.5).abs() < 1e-12);
        assert_eq!(s.lr(10), 1.0);
        assert!((s.lr(55) - 0.5).abs() < 1e-12);
        assert_eq!(s.lr(100), 0.0);
    }

    #[test]
    fn test_schedule_warmup_rounds_up() {
        // 0.03 · 10 = 0.3 → 1 warmup step
        let s = LinearWarmupDecay::new(2e-4, 10, 0.03);
        assert_eq!(s.warmup_steps(), 1);
        assert_eq!(s.lr(1), 2e-4);
    }

    #[test]
    fn test_total_steps() {
        let cfg = SftConfig { batch_size: 2, grad_accum_steps: 4, epochs: 3, ..SftConfig::default() };
        // 10 samples → 5 batches → 2 optimizer steps per epoch
        assert_eq!(cfg.total_steps(10), 6);
        let capped = SftConfig { max_steps: Some(4), ..cfg };
        assert_eq!(capped.total_steps(10), 4);
    }

    #[test]
    fn test_loss_window_empties_on_take() {
        let mut w = LossWindow::default();
        w.push(1.0);
        w.push(3.0);
        assert_eq!(w.take_mean(), 2.0);
        assert!(w.take_mean().is_nan());
        w.push(5.0);
        assert_eq!(w.take_mean(), 5.0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(SftConfig { grad_accum_steps: 0, ..SftConfig::default() }.validate().is_err());
        assert!(SftConfig { warmup_ratio: 1.5, ..SftConfig::default() }.validate().is_err());
        assert!(SftConfig::default().validate().is_ok());
    }

    #[test]
    fn test_training_moves_only_adapters() {
        let device = Default::default();
        let model_cfg = DecoderConfig::new(12, 10, "<bos>".into(), "<eos>".into())
            .with_d_model(8)
            .with_num_heads(2)
            .with_num_layers(1)
            .with_d_ff(16)
            .with_dropout(0.0);

        let model = model_cfg
            .init::<TestBackend>(&device)
            .quantize_base(&QuantSettings { block_size: 16, ..QuantSettings::default() })
            .unwrap()
            .apply_lora(&LoraSettings { dropout: 0.0, ..LoraSettings::default() }, &device)
            .unwrap();
        let embedding_before = model.token_embedding.weight.val().inner();

        let samples: Vec<LmSample> = (0..6)
            .map(|i| LmSample { input_ids: vec![1, 3 + i % 4, 4, 5, 2] })
            .collect();
        let cfg = SftConfig {
            grad_accum_steps: 2,
            batch_size:       2,
            lr:               1e-2,
            warmup_ratio:     0.0,
            epochs:           2,
            ..SftConfig::default()
        };

        let mut epochs_seen = Vec::new();
        let trained = train_loop(
            &cfg,
            model,
            LmDataset::new(samples.clone()),
            LmDataset::new(samples[..2].to_vec()),
            2,
            &device,
            |m, _| {
                epochs_seen.push((m.epoch, m.step));
                assert!(m.eval_loss.is_finite());
                Ok(())
            },
        )
        .unwrap();

        // 3 batches per epoch: one full step plus one flushed partial step
        assert_eq!(epochs_seen, vec![(1, 2), (2, 4)]);

        let adapters = trained.adapters();
        let lora_b_norm: f32 = adapters.blocks[0]
            .slots
            .iter()
            .flatten()
            .map(|a| a.lora_b.val().inner().abs().sum().into_scalar())
            .sum();
        assert!(lora_b_norm > 0.0);

        let embedding_after = trained.token_embedding.weight.val().inner();
        let drift: f32 = (embedding_after - embedding_before).abs().max().into_scalar();
        assert_eq!(drift, 0.0);
    }
}
