// ============================================================
// Layer 5 - NF4 Quantization (host side)
// ============================================================
// 4-bit NormalFloat quantization of frozen base weights.
//
// Block-wise absmax scheme:
//   1. Split the flattened weight into blocks of `block_size`
//   2. absmax = max |w| in the block
//   3. Each w / absmax ∈ [-1, 1] is replaced by the index of the
//      nearest of the 16 NF4 levels
//   4. Two 4-bit indices are packed per byte, low nibble first
//
// Double quantization:
//   The f32 absmax constants cost 32 bits per block. They are
//   themselves quantized: subtract their mean, then store each as
//   a signed 8-bit code with one f32 scale per group of 256 blocks.
//
// The NF4 levels are the quantiles of a standard normal
// distribution normalised to [-1, 1], with an exact zero.
//
// Reference: Dettmers et al. (2023) QLoRA

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// The 16 NormalFloat4 levels.
#[allow(clippy::excessive_precision)]
pub const NF4_LEVELS: [f32; 16] = [
    -1.0,
    -0.6961928009986877,
    -0.5250730514526367,
    -0.39491748809814453,
    -0.28444138169288635,
    -0.18477343022823334,
    -0.09105003625154495,
    0.0,
    0.07958029955625534,
    0.16093020141124725,
    0.24611230194568634,
    0.33791524171829224,
    0.44070982933044434,
    0.5626170039176941,
    0.7229568362236023,
    1.0,
];

/// Blocks whose absmax constants share one second-level scale.
pub const DOUBLE_QUANT_GROUP: usize = 256;

/// 4-bit loading options for the base model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantSettings {
    /// Quantize the targeted projections to NF4 when loading
    pub load_in_4bit: bool,
    /// Values sharing one absmax constant
    pub block_size:   usize,
    /// Quantize the absmax constants as well
    pub double_quant: bool,
}

impl Default for QuantSettings {
    fn default() -> Self {
        Self { load_in_4bit: true, block_size: 64, double_quant: true }
    }
}

impl QuantSettings {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % 2 != 0 {
            bail!("block_size must be a positive even number, got {}", self.block_size);
        }
        Ok(())
    }
}

/// Index of the NF4 level closest to `x` (x already scaled into [-1, 1]).
pub fn nearest_level(x: f32) -> u8 {
    // Levels are sorted, so the answer sits next to the first level >= x
    let upper = NF4_LEVELS.partition_point(|&l| l < x);
    if upper == 0 {
        return 0;
    }
    if upper == NF4_LEVELS.len() {
        return (NF4_LEVELS.len() - 1) as u8;
    }
    let below = NF4_LEVELS[upper - 1];
    let above = NF4_LEVELS[upper];
    if (x - below) <= (above - x) { (upper - 1) as u8 } else { upper as u8 }
}

// ─── Absmax storage ───────────────────────────────────────────────────────────

/// Per-block absmax constants quantized to signed 8 bits.
#[derive(Debug, Clone, PartialEq)]
pub struct DoubleQuantized {
    /// One code per block, padded to a multiple of `group_size`
    pub codes:      Vec<i8>,
    /// One scale per group of `group_size` codes
    pub scales:     Vec<f32>,
    /// Mean absmax subtracted before quantizing
    pub offset:     f32,
    pub group_size: usize,
    pub num_blocks: usize,
}

impl DoubleQuantized {
    fn quantize(absmax: &[f32], group_size: usize) -> Self {
        let num_blocks = absmax.len();
        let offset = if num_blocks == 0 {
            0.0
        } else {
            absmax.iter().sum::<f32>() / num_blocks as f32
        };

        let num_groups = num_blocks.div_ceil(group_size);
        let mut codes  = Vec::with_capacity(num_groups * group_size);
        let mut scales = Vec::with_capacity(num_groups);

        for group in 0..num_groups {
            let start = group * group_size;
            let end   = (start + group_size).min(num_blocks);
            let centred: Vec<f32> = absmax[start..end].iter().map(|a| a - offset).collect();

            let max_abs = centred.iter().fold(0.0f32, |m, c| m.max(c.abs()));
            let scale   = if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 };
            scales.push(scale);

            for c in &centred {
                codes.push((c / scale).round().clamp(-127.0, 127.0) as i8);
            }
            // Pad the last group so every group has group_size codes
            codes.resize((group + 1) * group_size, 0);
        }

        Self { codes, scales, offset, group_size, num_blocks }
    }

    pub fn dequantize(&self) -> Vec<f32> {
        (0..self.num_blocks)
            .map(|i| self.codes[i] as f32 * self.scales[i / self.group_size] + self.offset)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Absmax {
    Plain(Vec<f32>),
    Double(DoubleQuantized),
}

impl Absmax {
    pub fn values(&self) -> Vec<f32> {
        match self {
            Absmax::Plain(v)  => v.clone(),
            Absmax::Double(d) => d.dequantize(),
        }
    }

    fn storage_bytes(&self) -> usize {
        match self {
            Absmax::Plain(v)  => v.len() * 4,
            Absmax::Double(d) => d.codes.len() + d.scales.len() * 4 + 4,
        }
    }
}

// ─── Nf4Tensor ────────────────────────────────────────────────────────────────

/// A flattened weight stored as packed NF4 codes.
#[derive(Debug, Clone, PartialEq)]
pub struct Nf4Tensor {
    /// Two codes per byte, low nibble = even index
    pub packed:     Vec<u8>,
    pub absmax:     Absmax,
    pub block_size: usize,
    /// Number of real (unpadded) values
    pub len:        usize,
}

/// Quantize `values` block by block.
/// The input is zero-padded to a whole number of blocks.
pub fn quantize_nf4(values: &[f32], block_size: usize, double_quant: bool) -> Result<Nf4Tensor> {
    if block_size == 0 || block_size % 2 != 0 {
        bail!("block_size must be a positive even number, got {block_size}");
    }

    let len        = values.len();
    let num_blocks = len.div_ceil(block_size);
    let mut packed = Vec::with_capacity(num_blocks * block_size / 2);
    let mut absmax = Vec::with_capacity(num_blocks);

    for block in 0..num_blocks {
        let start = block * block_size;
        let end   = (start + block_size).min(len);
        let slice = &values[start..end];

        let max_abs = slice.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        absmax.push(max_abs);
        let inv = if max_abs > 0.0 { 1.0 / max_abs } else { 0.0 };

        let codes: Vec<u8> = (0..block_size)
            .map(|i| slice.get(i).map_or(7, |v| nearest_level(v * inv)))
            .collect();
        packed.extend(codes.chunks(2).map(|pair| pair[0] | (pair[1] << 4)));
    }

    let absmax = if double_quant {
        Absmax::Double(DoubleQuantized::quantize(&absmax, DOUBLE_QUANT_GROUP))
    } else {
        Absmax::Plain(absmax)
    };

    Ok(Nf4Tensor { packed, absmax, block_size, len })
}

impl Nf4Tensor {
    /// Unpacked 4-bit codes including block padding.
    pub fn codes(&self) -> Vec<u8> {
        self.packed.iter().flat_map(|b| [b & 0x0F, b >> 4]).collect()
    }

    pub fn dequantize(&self) -> Vec<f32> {
        let absmax = self.absmax.values();
        self.codes()
            .into_iter()
            .take(self.len)
            .enumerate()
            .map(|(i, code)| NF4_LEVELS[code as usize] * absmax[i / self.block_size])
            .collect()
    }

    /// Bytes held by the packed codes plus their constants.
    pub fn storage_bytes(&self) -> usize {
        self.packed.len() + self.absmax.storage_bytes()
    }
}
