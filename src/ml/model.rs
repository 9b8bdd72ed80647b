// ============================================================
// Layer 5 - Decoder-only Causal LM
// ============================================================
// A small Llama-shaped decoder:
//
//   input_ids [b, s]
//       │
//       ▼
//   token embedding + learned position embedding
//       │
//       ▼
//   N × DecoderBlock (pre-norm)
//       x = x + o_proj(attention(rms_norm(x)))       causal mask
//       x = x + down_proj(silu(gate_proj(h)) * up_proj(h)),  h = rms_norm(x)
//       │
//       ▼
//   final RMS norm → lm_head → logits [b, s, vocab]
//
// The seven projections per block are AdaptedLinear, so the same
// model type carries the dense base, the 4-bit training model and
// the merged result. The embeddings, norms and lm_head are never
// quantized or adapted.
//
// Reference: Burn Book §3 (Building Blocks)
//            Vaswani et al. (2017) Attention Is All You Need
//            Touvron et al. (2023) Llama

use anyhow::{bail, Result};
use burn::{
    nn::{
        attention::generate_autoregressive_mask,
        Dropout, DropoutConfig,
        Embedding, EmbeddingConfig,
        Linear, LinearConfig,
        RmsNorm, RmsNormConfig,
    },
    prelude::*,
    tensor::activation::{log_softmax, silu, softmax},
};
use std::fmt;

use crate::ml::{
    linear::AdaptedLinear,
    lora::{AdapterSet, BlockAdapters, LoraAdapter, LoraSettings, Projection},
    quant::QuantSettings,
};

/// Additive bias for masked attention scores.
const MASK_BIAS: f64 = -1.0e4;

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize
// internally, do NOT add them again or you get conflicting impls.
#[derive(Config, Debug)]
pub struct DecoderConfig {
    pub vocab_size:  usize,
    pub max_seq_len: usize,
    pub bos_token:   String,
    pub eos_token:   String,
    #[config(default = 128)]
    pub d_model:     usize,
    #[config(default = 4)]
    pub num_heads:   usize,
    #[config(default = 2)]
    pub num_layers:  usize,
    #[config(default = 512)]
    pub d_ff:        usize,
    #[config(default = 0.1)]
    pub dropout:     f64,
}

impl DecoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.d_model % self.num_heads != 0 {
            bail!(
                "d_model ({}) must be divisible by num_heads ({})",
                self.d_model, self.num_heads
            );
        }
        if self.vocab_size == 0 || self.max_seq_len < 2 || self.num_layers == 0 || self.d_ff == 0 {
            bail!("vocab_size, d_ff and num_layers must be positive and max_seq_len at least 2");
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> DecoderModel<B> {
        let token_embedding    = EmbeddingConfig::new(self.vocab_size, self.d_model).init(device);
        let position_embedding = EmbeddingConfig::new(self.max_seq_len, self.d_model).init(device);
        let blocks: Vec<DecoderBlock<B>> = (0..self.num_layers)
            .map(|_| self.build_block(device))
            .collect();
        let final_norm = RmsNormConfig::new(self.d_model).init(device);
        let lm_head    = LinearConfig::new(self.d_model, self.vocab_size)
            .with_bias(false)
            .init(device);
        let dropout    = DropoutConfig::new(self.dropout).init();
        DecoderModel {
            token_embedding, position_embedding, blocks,
            final_norm, lm_head, dropout,
            max_seq_len: self.max_seq_len,
        }
    }

    fn build_block<B: Backend>(&self, device: &B::Device) -> DecoderBlock<B> {
        let proj = |d_in: usize, d_out: usize| {
            AdaptedLinear::new(LinearConfig::new(d_in, d_out).with_bias(false).init(device))
        };
        DecoderBlock {
            attn_norm: RmsNormConfig::new(self.d_model).init(device),
            q_proj:    proj(self.d_model, self.d_model),
            k_proj:    proj(self.d_model, self.d_model),
            v_proj:    proj(self.d_model, self.d_model),
            o_proj:    proj(self.d_model, self.d_model),
            mlp_norm:  RmsNormConfig::new(self.d_model).init(device),
            gate_proj: proj(self.d_model, self.d_ff),
            up_proj:   proj(self.d_model, self.d_ff),
            down_proj: proj(self.d_ff, self.d_model),
            dropout:   DropoutConfig::new(self.dropout).init(),
            num_heads: self.num_heads,
        }
    }
}

// ─── DecoderBlock ─────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    pub attn_norm: RmsNorm<B>,
    pub q_proj:    AdaptedLinear<B>,
    pub k_proj:    AdaptedLinear<B>,
    pub v_proj:    AdaptedLinear<B>,
    pub o_proj:    AdaptedLinear<B>,
    pub mlp_norm:  RmsNorm<B>,
    pub gate_proj: AdaptedLinear<B>,
    pub up_proj:   AdaptedLinear<B>,
    pub down_proj: AdaptedLinear<B>,
    pub dropout:   Dropout,
    pub num_heads: usize,
}

impl<B: Backend> DecoderBlock<B> {
    /// mask_bias: [b, 1, s, s], 0 where attention is allowed
    pub fn forward(&self, x: Tensor<B, 3>, mask_bias: Tensor<B, 4>) -> Tensor<B, 3> {
        let attn = self.attention(self.attn_norm.forward(x.clone()), mask_bias);
        let x    = x + self.dropout.forward(attn);
        let mlp  = self.mlp(self.mlp_norm.forward(x.clone()));
        x + self.dropout.forward(mlp)
    }

    fn attention(&self, x: Tensor<B, 3>, mask_bias: Tensor<B, 4>) -> Tensor<B, 3> {
        let [batch_size, seq_len, d_model] = x.dims();
        let d_head = d_model / self.num_heads;

        // [b, s, d] → [b, h, s, d_head]
        let heads = |t: Tensor<B, 3>| {
            t.reshape([batch_size, seq_len, self.num_heads, d_head]).swap_dims(1, 2)
        };
        let q = heads(self.q_proj.forward(x.clone()));
        let k = heads(self.k_proj.forward(x.clone()));
        let v = heads(self.v_proj.forward(x));

        let scores  = q.matmul(k.swap_dims(2, 3)).div_scalar((d_head as f64).sqrt()) + mask_bias;
        let weights = self.dropout.forward(softmax(scores, 3));

        let context = weights
            .matmul(v)
            .swap_dims(1, 2)
            .reshape([batch_size, seq_len, d_model]);
        self.o_proj.forward(context)
    }

    fn mlp(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let gate = silu(self.gate_proj.forward(x.clone()));
        self.down_proj.forward(gate * self.up_proj.forward(x))
    }

    pub fn projection(&self, projection: Projection) -> &AdaptedLinear<B> {
        match projection {
            Projection::Q    => &self.q_proj,
            Projection::K    => &self.k_proj,
            Projection::V    => &self.v_proj,
            Projection::O    => &self.o_proj,
            Projection::Gate => &self.gate_proj,
            Projection::Up   => &self.up_proj,
            Projection::Down => &self.down_proj,
        }
    }

    fn try_map_projections<F>(self, mut f: F) -> Result<Self>
    where
        F: FnMut(Projection, AdaptedLinear<B>) -> Result<AdaptedLinear<B>>,
    {
        Ok(Self {
            q_proj:    f(Projection::Q, self.q_proj)?,
            k_proj:    f(Projection::K, self.k_proj)?,
            v_proj:    f(Projection::V, self.v_proj)?,
            o_proj:    f(Projection::O, self.o_proj)?,
            gate_proj: f(Projection::Gate, self.gate_proj)?,
            up_proj:   f(Projection::Up, self.up_proj)?,
            down_proj: f(Projection::Down, self.down_proj)?,
            ..self
        })
    }
}

// ─── DecoderModel ─────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct DecoderModel<B: Backend> {
    pub token_embedding:    Embedding<B>,
    pub position_embedding: Embedding<B>,
    pub blocks:             Vec<DecoderBlock<B>>,
    pub final_norm:         RmsNorm<B>,
    pub lm_head:            Linear<B>,
    pub dropout:            Dropout,
    pub max_seq_len:        usize,
}

impl<B: Backend> DecoderModel<B> {
    /// input_ids: [batch, seq_len] → logits: [batch, seq_len, vocab]
    pub fn forward(&self, input_ids: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [batch_size, seq_len] = input_ids.dims();
        let device = input_ids.device();

        let tok_emb = self.token_embedding.forward(input_ids);

        let positions = Tensor::<B, 1, Int>::arange(0..seq_len as i64, &device)
            .unsqueeze::<2>()
            .expand([batch_size, seq_len]);
        let pos_emb = self.position_embedding.forward(positions);

        // true above the diagonal → large negative bias
        let mask_bias = generate_autoregressive_mask::<B>(batch_size, seq_len, &device)
            .float()
            .mul_scalar(MASK_BIAS)
            .unsqueeze_dim::<4>(1);

        let mut x = self.dropout.forward(tok_emb + pos_emb);
        for block in &self.blocks {
            x = block.forward(x, mask_bias.clone());
        }
        self.lm_head.forward(self.final_norm.forward(x))
    }

    /// Mean next-token cross-entropy over the unmasked targets.
    pub fn forward_loss(
        &self,
        inputs:      Tensor<B, 2, Int>,
        targets:     Tensor<B, 2, Int>,
        target_mask: Tensor<B, 2, Int>,
    ) -> Tensor<B, 1> {
        let logits = self.forward(inputs);
        masked_cross_entropy(logits, targets, target_mask)
    }

    fn try_map_projections<F>(self, mut f: F) -> Result<Self>
    where
        F: FnMut(usize, Projection, AdaptedLinear<B>) -> Result<AdaptedLinear<B>>,
    {
        let blocks = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(layer, block)| block.try_map_projections(|p, lin| f(layer, p, lin)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { blocks, ..self })
    }

    /// Replace every block projection with its NF4 form.
    /// A no-op when 4-bit loading is disabled.
    pub fn quantize_base(self, settings: &QuantSettings) -> Result<Self> {
        if !settings.load_in_4bit {
            return Ok(self);
        }
        settings.validate()?;
        let model = self.try_map_projections(|_, _, lin| lin.quantize(settings))?;
        let quantized = model
            .blocks
            .iter()
            .flat_map(|b| Projection::ALL.map(|p| b.projection(p)))
            .filter(|proj| proj.is_quantized())
            .count();
        tracing::info!(
            "Quantized {} projections to NF4 (block_size={}, double_quant={})",
            quantized,
            settings.block_size,
            settings.double_quant,
        );
        Ok(model)
    }

    /// Freeze every base parameter and attach fresh adapters to the
    /// targeted projections of every block.
    pub fn apply_lora(self, settings: &LoraSettings, device: &B::Device) -> Result<Self> {
        settings.validate()?;
        self.no_grad().try_map_projections(|_, p, lin| {
            if !settings.targets(p) {
                return Ok(lin);
            }
            let [d_in, d_out] = lin.dims();
            Ok(lin.with_adapter(LoraAdapter::init(d_in, d_out, settings, device)))
        })
    }

    /// Copy of the adapters only, for saving.
    pub fn adapters(&self) -> AdapterSet<B> {
        AdapterSet {
            blocks: self
                .blocks
                .iter()
                .map(|block| BlockAdapters {
                    slots: Projection::ALL
                        .iter()
                        .map(|&p| block.projection(p).adapter().cloned())
                        .collect(),
                })
                .collect(),
        }
    }

    /// Attach previously trained adapters (e.g. loaded from disk).
    pub fn attach_adapters(self, set: AdapterSet<B>) -> Result<Self> {
        if set.blocks.len() != self.blocks.len() {
            bail!(
                "Adapter has {} blocks but the model has {}",
                set.blocks.len(),
                self.blocks.len()
            );
        }
        let mut slots: Vec<Vec<Option<LoraAdapter<B>>>> =
            set.blocks.into_iter().map(|b| b.slots).collect();
        if slots.iter().any(|s| s.len() != Projection::ALL.len()) {
            bail!("Adapter blocks must have one slot per projection");
        }

        self.try_map_projections(|layer, p, lin| match slots[layer][p.index()].take() {
            Some(adapter) => {
                let expected = lin.dims();
                let got = [adapter.lora_a.dims()[0], adapter.lora_b.dims()[1]];
                if got != expected {
                    bail!("Adapter for block {layer} {p} has shape {got:?}, expected {expected:?}");
                }
                Ok(lin.with_adapter(adapter))
            }
            None => Ok(lin),
        })
    }

    /// Fold every adapter into its base weight; the result has only
    /// dense projections and no adapters.
    pub fn merge_lora(self) -> Self {
        let blocks = self
            .blocks
            .into_iter()
            .map(|block| DecoderBlock {
                q_proj:    block.q_proj.merge(),
                k_proj:    block.k_proj.merge(),
                v_proj:    block.v_proj.merge(),
                o_proj:    block.o_proj.merge(),
                gate_proj: block.gate_proj.merge(),
                up_proj:   block.up_proj.merge(),
                down_proj: block.down_proj.merge(),
                ..block
            })
            .collect();
        Self { blocks, ..self }
    }

    pub fn parameter_report(&self) -> ParameterReport {
        let projections = self
            .blocks
            .iter()
            .flat_map(|b| Projection::ALL.map(|p| b.projection(p)));

        let (mut quantized, mut quantized_bytes, mut trainable) = (0, 0, 0);
        for proj in projections {
            quantized       += proj.quantized_values();
            quantized_bytes += proj.quantized_storage_bytes();
            trainable       += proj.adapter().map_or(0, LoraAdapter::num_params);
        }

        // num_params() only counts burn parameters; NF4 weights are constants
        let dense = self.num_params();
        ParameterReport {
            trainable,
            total:        dense + quantized,
            memory_bytes: dense * 4 + quantized_bytes,
        }
    }
}

/// Mean of -log p(target) over positions where `mask` is 1.
///
/// logits [b, s, V], targets [b, s], mask [b, s] → [1]
pub fn masked_cross_entropy<B: Backend>(
    logits:  Tensor<B, 3>,
    targets: Tensor<B, 2, Int>,
    mask:    Tensor<B, 2, Int>,
) -> Tensor<B, 1> {
    let [batch_size, seq_len, _] = logits.dims();

    let log_probs = log_softmax(logits, 2);
    let picked = log_probs
        .gather(2, targets.reshape([batch_size, seq_len, 1]))
        .reshape([batch_size, seq_len]);

    let mask  = mask.float();
    let count = mask.clone().sum().clamp_min(1.0);
    (picked * mask).sum().neg() / count
}

// ─── ParameterReport ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterReport {
    pub trainable:    usize,
    pub total:        usize,
    /// Approximate bytes held by weights (f32 params + packed NF4)
    pub memory_bytes: usize,
}

impl ParameterReport {
    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.trainable as f64 / self.total as f64
        }
    }
}

impl fmt::Display for ParameterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            self.trainable,
            self.total,
            self.trainable_percent()
        )
    }
}
