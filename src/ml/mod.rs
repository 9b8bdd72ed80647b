// ============================================================
// Layer 5 - ML / Model Layer (Burn)
// ============================================================
// All tensor code lives here. The other layers hand over plain
// values (records, token ids, configs) and get plain values back.
//
// What's in this layer:
//
//   quant.rs       - NF4 code book, block absmax quantization,
//                    double quantization of the constants
//   nf4_linear.rs  - frozen 4-bit linear layer, dequantized on
//                    the device in the forward pass
//   lora.rs        - LoRA settings, adapters, adapter sets
//   linear.rs      - AdaptedLinear: base (dense or NF4) + adapter,
//                    quantize and merge
//   model.rs       - decoder-only causal LM, masked LM loss,
//                    apply_lora / merge_lora / parameter report
//   trainer.rs     - SFT loop: AdamW, warmup/decay, gradient
//                    accumulation, per-epoch evaluation
//   generator.rs   - greedy and top-k sampled generation
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)
//            Dettmers et al. (2023) QLoRA

/// NF4 4-bit quantization on the host
pub mod quant;

/// 4-bit linear layer on the device
pub mod nf4_linear;

/// Low-rank adapters
pub mod lora;

/// Projection = frozen base + optional adapter
pub mod linear;

/// Decoder-only transformer
pub mod model;

/// Supervised fine-tuning loop
pub mod trainer;

/// Autoregressive text generation
pub mod generator;

/// Backend used while training (gradients tracked)
pub type TrainBackend = burn::backend::Autodiff<burn::backend::Wgpu>;

/// Backend used for merging and generation
pub type InferBackend = burn::backend::Wgpu;
