// ============================================================
// Layer 4 - Causal LM Batcher
// ============================================================
// Implements Burn's Batcher trait to turn a Vec<LmSample> into
// shifted next-token tensors.
//
// For a padded sequence  t0 t1 t2 t3 <pad> <pad>
//   inputs  = t0 t1 t2 t3 <pad>        (all but the last position)
//   targets = t1 t2 t3 <pad> <pad>     (all but the first position)
//   mask    = 1  1  1  0  0            (1 where the target is real)
//
// Padding is dynamic: every batch is padded to its own longest
// sample with the pad id (the end-of-sequence token). Because the
// real <eos> at the end of each sample is a real target, the mask
// is built from sample lengths, not from token ids.
//
// Reference: Burn Book §4 (Batcher)

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
};

use crate::data::dataset::LmSample;

/// A batch of next-token prediction examples.
#[derive(Debug, Clone)]
pub struct LmBatch<B: Backend> {
    /// Model inputs - shape: [batch_size, seq_len - 1]
    pub inputs: Tensor<B, 2, Int>,

    /// Expected next tokens - shape: [batch_size, seq_len - 1]
    pub targets: Tensor<B, 2, Int>,

    /// 1 for real targets, 0 for padding - shape: [batch_size, seq_len - 1]
    pub target_mask: Tensor<B, 2, Int>,
}

#[derive(Clone, Debug)]
pub struct LmBatcher<B: Backend> {
    pub device: B::Device,
    pub pad_id: u32,
}

impl<B: Backend> LmBatcher<B> {
    pub fn new(device: B::Device, pad_id: u32) -> Self {
        Self { device, pad_id }
    }
}

impl<B: Backend> Batcher<LmSample, LmBatch<B>> for LmBatcher<B> {
    fn batch(&self, items: Vec<LmSample>) -> LmBatch<B> {
        let batch_size = items.len();
        // Every sample has at least 2 tokens, so width >= 1
        let seq_len = items.iter().map(LmSample::len).max().unwrap_or(2);
        let width   = seq_len - 1;

        let mut inputs  = Vec::with_capacity(batch_size * width);
        let mut targets = Vec::with_capacity(batch_size * width);
        let mut mask    = Vec::with_capacity(batch_size * width);

        for sample in &items {
            let ids = &sample.input_ids;
            let real_targets = sample.target_count();

            for pos in 0..width {
                let input  = ids.get(pos).copied().unwrap_or(self.pad_id);
                let target = ids.get(pos + 1).copied().unwrap_or(self.pad_id);
                inputs.push(input as i32);
                targets.push(target as i32);
                mask.push(i32::from(pos < real_targets));
            }
        }

        let to_tensor = |flat: Vec<i32>| {
            Tensor::<B, 1, Int>::from_ints(flat.as_slice(), &self.device)
                .reshape([batch_size, width])
        };

        LmBatch {
            inputs:      to_tensor(inputs),
            targets:     to_tensor(targets),
            target_mask: to_tensor(mask),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn ints(t: Tensor<TestBackend, 2, Int>) -> Vec<i64> {
        t.into_data().convert::<i64>().to_vec::<i64>().unwrap()
    }

    #[test]
    fn test_shift_and_padding() {
        let batcher = LmBatcher::<TestBackend>::new(Default::default(), 9);
        let batch   = batcher.batch(vec![
            LmSample { input_ids: vec![1, 5, 6, 7, 2] },
            LmSample { input_ids: vec![1, 8, 2] },
        ]);

        assert_eq!(batch.inputs.dims(), [2, 4]);
        assert_eq!(ints(batch.inputs),      vec![1, 5, 6, 7, 1, 8, 2, 9]);
        assert_eq!(ints(batch.targets),     vec![5, 6, 7, 2, 8, 2, 9, 9]);
        assert_eq!(ints(batch.target_mask), vec![1, 1, 1, 1, 1, 1, 0, 0]);
    }

    #[test]
    fn test_eos_equal_to_pad_still_counts_as_target() {
        // pad == eos == 2: the real trailing <eos> must stay in the mask
        let batcher = LmBatcher::<TestBackend>::new(Default::default(), 2);
        let batch   = batcher.batch(vec![
            LmSample { input_ids: vec![1, 4, 2] },
            LmSample { input_ids: vec![1, 2] },
        ]);
        assert_eq!(ints(batch.target_mask), vec![1, 1, 1, 0]);
    }
}
