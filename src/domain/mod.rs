// ============================================================
// Layer 3 - Domain Layer
// ============================================================
// Plain Rust structs and traits that define what the system
// works with: a text-to-SQL record and the prompt layout the
// model is trained and queried with.
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O or network calls
//   - Only plain Rust structs, functions, and traits
//
// The prompt template lives here (not in the data layer)
// because both training and inference depend on the exact
// delimiter text, and neither may drift from the other.
//
// Reference: Rust Book §5 (Structs), §10 (Traits)

// One {context, question, answer} dataset row
pub mod record;

// Training / inference prompt layout
pub mod prompt;

// Core abstractions (traits) that other layers implement
pub mod traits;
