// ============================================================
// Layer 2 - Application / Use Cases
// ============================================================
// This layer orchestrates the other layers to accomplish one
// goal per subcommand.
//
// Rules for this layer:
//   - No tensor math or model code here
//   - No argument parsing or result printing (that's Layer 1)
//   - Only workflow coordination
//
// Reference: Clean Architecture pattern
//            Rust Book §7 (Module System)

// Random base checkpoint + tokenizer from a dataset
pub mod init_base_use_case;

// Quantize → LoRA → fine-tune → merge → generate
pub mod train_use_case;

// Base + adapter → merged checkpoint
pub mod merge_use_case;

// Schema + question → SQL
pub mod generate_use_case;
