// ============================================================
// Layer 6 - Infrastructure Layer
// ============================================================
// Cross-cutting concerns used by several layers:
//
//   checkpoint.rs      - model, adapter and run directories
//                        (Burn CompactRecorder + JSON configs)
//
//   tokenizer_store.rs - tokenizer.json load/save, word-level
//                        tokenizer building for fresh bases
//
//   metrics.rs         - per-epoch metrics CSV
//
//   env.rs             - hub credential from the environment
//
// Reference: Rust Book §7 (Modules)
//            Burn Book §5 (Checkpointing)

/// Model, adapter and run directory layouts
pub mod checkpoint;

/// Tokenizer building, saving, and loading
pub mod tokenizer_store;

/// Training metrics CSV logger
pub mod metrics;

/// Environment variables
pub mod env;
