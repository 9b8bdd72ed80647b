// ============================================================
// Layer 4 - Data Pipeline
// ============================================================
// Everything from a dataset identifier to GPU-ready batches.
//
//   dataset id + split
//       │
//       ▼
//   DatasetLoader     → local file or hub download, split slicing
//       │
//       ▼
//   split_train_test  → seeded shuffle, 80/20 partition
//       │
//       ▼
//   Preprocessor      → training prompt → <bos> tokens <eos>
//       │
//       ▼
//   LmDataset         → implements Burn's Dataset trait
//       │
//       ▼
//   LmBatcher         → dynamic padding, shifted targets, mask
//       │
//       ▼
//   DataLoader        → feeds batches to the training loop
//
// Reference: Burn Book §4 (Datasets and Dataloaders)

/// Loads records by dataset id + split name
pub mod loader;

/// Seeded shuffle and train/test partition
pub mod splitter;

/// Renders and tokenises prompts
pub mod preprocessor;

/// Implements Burn's Dataset trait for token sequences
pub mod dataset;

/// Implements Burn's Batcher trait for next-token batches
pub mod batcher;
