// ============================================================
// Layer 5 - Adapted Projection
// ============================================================
// Every q/k/v/o/gate/up/down projection in the decoder is an
// AdaptedLinear: a frozen base plus an optional LoRA adapter.
//
//   base       dense Linear   (full precision, merge target)
//         or   Nf4Linear      (4-bit, training)
//   adapter    LoraAdapter    (trainable, optional)
//
// Lifecycle of one projection through the pipeline:
//   load       → dense
//   quantize   → quantized
//   apply_lora → quantized + adapter
//   merge      → dense (base + scaling·A·B), no adapter

use anyhow::Result;
use burn::{module::Param, nn::Linear, prelude::*};

use crate::ml::{lora::LoraAdapter, nf4_linear::Nf4Linear, quant::QuantSettings};

#[derive(Module, Debug)]
pub struct AdaptedLinear<B: Backend> {
    dense:     Option<Linear<B>>,
    quantized: Option<Nf4Linear<B>>,
    lora:      Option<LoraAdapter<B>>,
}

impl<B: Backend> AdaptedLinear<B> {
    pub fn new(linear: Linear<B>) -> Self {
        Self { dense: Some(linear), quantized: None, lora: None }
    }

    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        match &self.lora {
            Some(lora) => self.base_forward(input.clone()) + lora.forward(input),
            None       => self.base_forward(input),
        }
    }

    fn base_forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        match (&self.dense, &self.quantized) {
            (Some(dense), _)  => dense.forward(input),
            (None, Some(q))   => q.forward(input),
            (None, None)      => unreachable!("AdaptedLinear always holds a base layer"),
        }
    }

    /// Replace a dense base by its NF4 form. Already-quantized bases are kept.
    pub fn quantize(self, settings: &QuantSettings) -> Result<Self> {
        match self.dense {
            Some(dense) => Ok(Self {
                dense:     None,
                quantized: Some(Nf4Linear::from_linear(&dense, settings)?),
                lora:      self.lora,
            }),
            None => Ok(self),
        }
    }

    pub fn with_adapter(self, adapter: LoraAdapter<B>) -> Self {
        Self { lora: Some(adapter), ..self }
    }

    pub fn adapter(&self) -> Option<&LoraAdapter<B>> {
        self.lora.as_ref()
    }

    /// Fold the adapter into a dense base and drop it.
    /// Without an adapter only the base precision changes (NF4 → dense).
    pub fn merge(self) -> Self {
        let base = match (self.dense, self.quantized) {
            (Some(dense), _)  => dense,
            (None, Some(q))   => q.to_linear(),
            (None, None)      => unreachable!("AdaptedLinear always holds a base layer"),
        };

        let merged = match self.lora {
            Some(lora) => {
                let weight = base.weight.val() + lora.delta_weight();
                Linear {
                    weight: Param::from_tensor(weight.detach()),
                    bias:   base.bias,
                }
            }
            None => base,
        };

        Self::new(merged)
    }

    pub fn is_quantized(&self) -> bool {
        self.quantized.is_some()
    }

    pub fn dims(&self) -> [usize; 2] {
        match (&self.dense, &self.quantized) {
            (Some(dense), _)  => dense.weight.dims(),
            (None, Some(q))   => q.dims(),
            (None, None)      => unreachable!("AdaptedLinear always holds a base layer"),
        }
    }

    /// Values held by a quantized base; these are not burn parameters.
    pub fn quantized_values(&self) -> usize {
        self.quantized.as_ref().map_or(0, Nf4Linear::num_values)
    }

    pub fn quantized_storage_bytes(&self) -> usize {
        self.quantized.as_ref().map_or(0, Nf4Linear::storage_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::lora::LoraSettings;
    use burn::{backend::NdArray, nn::LinearConfig, tensor::Distribution};

    type TestBackend = NdArray;

    fn max_diff<const D: usize>(a: Tensor<TestBackend, D>, b: Tensor<TestBackend, D>) -> f32 {
        (a - b).abs().max().into_scalar()
    }

    fn trained_adapter(d_in: usize, d_out: usize) -> LoraAdapter<TestBackend> {
        let device = Default::default();
        let settings = LoraSettings { dropout: 0.0, ..LoraSettings::default() };
        let mut adapter = LoraAdapter::init(d_in, d_out, &settings, &device);
        // Pretend training moved B away from zero
        adapter.lora_b = Param::from_tensor(Tensor::random(
            [settings.rank, d_out],
            Distribution::Uniform(-0.1, 0.1),
            &device,
        ));
        adapter
    }

    #[test]
    fn test_zero_init_adapter_matches_base() {
        let device = Default::default();
        let linear = LinearConfig::new(6, 4).init::<TestBackend>(&device);
        let x      = Tensor::<TestBackend, 3>::random([2, 3, 6], Distribution::Default, &device);

        let plain   = AdaptedLinear::new(linear.clone());
        let adapted = AdaptedLinear::new(linear)
            .with_adapter(LoraAdapter::init(6, 4, &LoraSettings::default(), &device));

        assert!(max_diff(plain.forward(x.clone()), adapted.forward(x)) < 1e-6);
    }

    #[test]
    fn test_merge_matches_adapted_forward() {
        let device  = Default::default();
        let linear  = LinearConfig::new(6, 4).init::<TestBackend>(&device);
        let x       = Tensor::<TestBackend, 3>::random([2, 3, 6], Distribution::Default, &device);
        let adapted = AdaptedLinear::new(linear).with_adapter(trained_adapter(6, 4));

        let expected = adapted.forward(x.clone());
        let merged   = adapted.merge();

        assert!(merged.adapter().is_none());
        assert!(!merged.is_quantized());
        assert!(max_diff(expected, merged.forward(x)) < 1e-4);
    }

    #[test]
    fn test_merge_dequantizes_quantized_base() {
        let device    = Default::default();
        let linear    = LinearConfig::new(16, 8).init::<TestBackend>(&device);
        let settings  = QuantSettings { block_size: 16, ..QuantSettings::default() };
        let x         = Tensor::<TestBackend, 2>::random([3, 16], Distribution::Default, &device);

        let quantized = AdaptedLinear::new(linear).quantize(&settings).unwrap();
        assert!(quantized.is_quantized());
        assert_eq!(quantized.dims(), [16, 8]);
        assert_eq!(quantized.quantized_values(), 16 * 8 + 8);

        let adapted  = quantized.with_adapter(trained_adapter(16, 8));
        let expected = adapted.forward(x.clone());
        let merged   = adapted.merge();

        assert!(!merged.is_quantized());
        assert!(max_diff(expected, merged.forward(x)) < 1e-4);
    }

    #[test]
    fn test_projection_without_adapter_is_untouched_by_merge() {
        let device = Default::default();
        let linear = LinearConfig::new(5, 5).init::<TestBackend>(&device);
        let x      = Tensor::<TestBackend, 2>::random([2, 5], Distribution::Default, &device);
        let before = linear.forward(x.clone());
        let merged = AdaptedLinear::new(linear).merge();
        assert!(merged.adapter().is_none());
        assert!(max_diff(before, merged.forward(x)) == 0.0);
    }
}
