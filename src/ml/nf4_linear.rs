// ============================================================
// Layer 5 - NF4 Quantized Linear
// ============================================================
// A frozen linear layer whose weight lives on the device as
// packed 4-bit NF4 codes (see quant.rs) instead of f32 values.
//
// Storage (all constant tensors, never trained, never saved):
//   codes   [n / 2]     two 4-bit codes per element, low nibble first
//   levels  [16]        the NF4 code book
//   absmax  [blocks]    plain f32 constants, or
//   absmax_dq           8-bit codes + per-group scales + offset
//
// Forward:
//   1. Unpack codes → [n] level indices
//   2. Look up the levels and scale each block by its absmax
//   3. Drop block padding, reshape to [d_input, d_output]
//   4. y = x · W + b         (same layout as burn's Linear)
//
// The weight is rebuilt on every forward pass; only the packed
// form stays resident between calls.
//
// Reference: burn::nn::Linear (weight layout, forward)
//            Dettmers et al. (2023) QLoRA

use anyhow::{anyhow, Result};
use burn::{
    module::Param,
    nn::Linear,
    prelude::*,
};

use crate::ml::quant::{quantize_nf4, Absmax, DoubleQuantized, QuantSettings, NF4_LEVELS};

/// Double-quantized absmax constants on the device.
#[derive(Module, Debug)]
pub struct QuantizedAbsmax<B: Backend> {
    codes:      Tensor<B, 1, Int>,
    scales:     Tensor<B, 1>,
    offset:     f32,
    group_size: usize,
    num_blocks: usize,
}

impl<B: Backend> QuantizedAbsmax<B> {
    fn from_host(dq: &DoubleQuantized, device: &B::Device) -> Self {
        let codes: Vec<i32> = dq.codes.iter().map(|&c| c as i32).collect();
        Self {
            codes:      Tensor::from_ints(codes.as_slice(), device),
            scales:     Tensor::from_data(TensorData::new(dq.scales.clone(), [dq.scales.len()]), device),
            offset:     dq.offset,
            group_size: dq.group_size,
            num_blocks: dq.num_blocks,
        }
    }

    fn values(&self) -> Tensor<B, 1> {
        let num_groups = self.scales.dims()[0];
        let grouped = self.codes.clone().float().reshape([num_groups, self.group_size])
            * self.scales.clone().unsqueeze_dim::<2>(1);
        grouped
            .reshape([num_groups * self.group_size])
            .slice([0..self.num_blocks])
            .add_scalar(self.offset)
    }
}

#[derive(Module, Debug)]
pub struct Nf4Linear<B: Backend> {
    codes:      Tensor<B, 1, Int>,
    levels:     Tensor<B, 1>,
    absmax:     Option<Tensor<B, 1>>,
    absmax_dq:  Option<QuantizedAbsmax<B>>,
    bias:       Option<Tensor<B, 1>>,
    d_input:    usize,
    d_output:   usize,
    block_size: usize,
    /// Host-side byte count of codes + constants, for memory reports
    storage:    usize,
}

impl<B: Backend> Nf4Linear<B> {
    /// Quantize a dense layer. The dense weights are read back to the
    /// host once, quantized there, and uploaded in packed form.
    pub fn from_linear(linear: &Linear<B>, settings: &QuantSettings) -> Result<Self> {
        let [d_input, d_output] = linear.weight.dims();
        let device = linear.weight.device();

        let values = linear
            .weight
            .val()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("Cannot read weight for quantization: {e:?}"))?;

        let q = quantize_nf4(&values, settings.block_size, settings.double_quant)?;

        let codes: Vec<i32> = q.packed.iter().map(|&b| b as i32).collect();
        let (absmax, absmax_dq) = match &q.absmax {
            Absmax::Plain(v)  => (
                Some(Tensor::from_data(TensorData::new(v.clone(), [v.len()]), &device)),
                None,
            ),
            Absmax::Double(d) => (None, Some(QuantizedAbsmax::from_host(d, &device))),
        };

        Ok(Self {
            codes:      Tensor::from_ints(codes.as_slice(), &device),
            levels:     Tensor::from_floats(NF4_LEVELS, &device),
            absmax,
            absmax_dq,
            bias:       linear.bias.as_ref().map(|b| b.val()),
            d_input,
            d_output,
            block_size: settings.block_size,
            storage:    q.storage_bytes(),
        })
    }

    fn absmax_values(&self) -> Tensor<B, 1> {
        match (&self.absmax, &self.absmax_dq) {
            (Some(plain), _)   => plain.clone(),
            (None, Some(dq))   => dq.values(),
            (None, None)       => unreachable!("Nf4Linear is always built with absmax constants"),
        }
    }

    /// Dequantized weight, shape [d_input, d_output].
    pub fn weight(&self) -> Tensor<B, 2> {
        let packed = self.codes.dims()[0];
        let high   = self.codes.clone().div_scalar(16);
        let low    = self.codes.clone() - high.clone().mul_scalar(16);

        // Interleave so index 2i is the low nibble and 2i+1 the high nibble
        let indices = Tensor::stack::<2>(vec![low, high], 1).reshape([packed * 2]);
        let values  = self.levels.clone().select(0, indices);

        let num_blocks = packed * 2 / self.block_size;
        let scaled = values.reshape([num_blocks, self.block_size])
            * self.absmax_values().unsqueeze_dim::<2>(1);

        scaled
            .reshape([num_blocks * self.block_size])
            .slice([0..self.d_input * self.d_output])
            .reshape([self.d_input, self.d_output])
    }

    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let output = input.matmul(self.weight().unsqueeze());
        match &self.bias {
            Some(bias) => output + bias.clone().unsqueeze(),
            None       => output,
        }
    }

    /// Dense layer holding the dequantized weight (frozen).
    pub fn to_linear(&self) -> Linear<B> {
        Linear {
            weight: Param::from_tensor(self.weight()).set_require_grad(false),
            bias:   self.bias.clone().map(|b| Param::from_tensor(b).set_require_grad(false)),
        }
    }

    pub fn dims(&self) -> [usize; 2] {
        [self.d_input, self.d_output]
    }

    pub fn num_values(&self) -> usize {
        self.d_input * self.d_output + self.bias.as_ref().map_or(0, |b| b.dims()[0])
    }

    pub fn storage_bytes(&self) -> usize {
        self.storage + self.bias.as_ref().map_or(0, |b| b.dims()[0] * 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, nn::LinearConfig};

    type TestBackend = NdArray;

    fn floats<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
        t.into_data().convert::<f32>().to_vec::<f32>().unwrap()
    }

    fn settings(double_quant: bool) -> QuantSettings {
        QuantSettings { load_in_4bit: true, block_size: 16, double_quant }
    }

    #[test]
    fn test_device_dequant_matches_host() {
        let device = Default::default();
        let linear = LinearConfig::new(12, 10).init::<TestBackend>(&device);

        let host_values = floats(linear.weight.val());
        let host = quantize_nf4(&host_values, 16, false).unwrap().dequantize();

        let q = Nf4Linear::from_linear(&linear, &settings(false)).unwrap();
        let device_values = floats(q.weight());

        assert_eq!(q.dims(), [12, 10]);
        assert_eq!(device_values.len(), host.len());
        for (a, b) in device_values.iter().zip(&host) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_forward_close_to_dense() {
        let device = Default::default();
        let linear = LinearConfig::new(32, 8).init::<TestBackend>(&device);
        let x      = Tensor::<TestBackend, 3>::random([2, 3, 32], burn::tensor::Distribution::Default, &device);

        let dense = floats(linear.forward(x.clone()));
        for double_quant in [false, true] {
            let q     = Nf4Linear::from_linear(&linear, &settings(double_quant)).unwrap();
            let quant = floats(q.forward(x.clone()));
            let max_err = dense.iter().zip(&quant).map(|(a, b)| (a - b).abs()).fold(0.0, f32::max);
            assert!(max_err < 0.5, "max error {max_err} (double_quant={double_quant})");
        }
    }

    #[test]
    fn test_storage_smaller_than_f32() {
        let device = Default::default();
        let linear = LinearConfig::new(64, 64).with_bias(false).init::<TestBackend>(&device);
        let q      = Nf4Linear::from_linear(&linear, &settings(true)).unwrap();
        assert!(q.storage_bytes() * 6 < 64 * 64 * 4);
    }

    #[test]
    fn test_to_linear_round_trip() {
        let device = Default::default();
        let linear = LinearConfig::new(8, 4).init::<TestBackend>(&device);
        let q      = Nf4Linear::from_linear(&linear, &settings(false)).unwrap();
        let dense  = q.to_linear();
        assert_eq!(floats(dense.weight.val()), floats(q.weight()));
        assert!(dense.bias.is_some());
    }
}
