//! Tensor Primitives
//!
//! Core tensor operations, activations and seeded initialization.
//!
//! ## Submodules
//!
//! - [`tensor_ops`]: device resolution, BCE-with-logits, host readback
//! - [`activations`]: sigmoid, ReLU, leaky ReLU, seeded dropout
//! - [`init`]: seeded random streams and parameter initialization

mod tensor_ops;
mod activations;
pub mod init;

// Re-export all primitives at module level
pub use tensor_ops::*;
pub use activations::*;
pub use init::{seeded_rng, RngStream};
