use burn::data::dataset::Dataset;
use serde::{Deserialize, Serialize};

/// One tokenised training prompt: <bos> prompt tokens <eos>.
/// Left unpadded; the batcher pads to the longest sample in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LmSample {
    pub input_ids: Vec<u32>,
}

impl LmSample {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Number of next-token targets this sample contributes.
    pub fn target_count(&self) -> usize {
        self.input_ids.len().saturating_sub(1)
    }
}

pub struct LmDataset {
    samples: Vec<LmSample>,
}

impl LmDataset {
    pub fn new(samples: Vec<LmSample>) -> Self { Self { samples } }

    pub fn sample_count(&self) -> usize { self.samples.len() }

    pub fn target_count(&self) -> usize {
        self.samples.iter().map(LmSample::target_count).sum()
    }
}

impl Dataset<LmSample> for LmDataset {
    fn get(&self, index: usize) -> Option<LmSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}
