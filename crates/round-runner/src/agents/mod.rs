//! Built-in algorithms.
//!
//! Each module exposes a `build` function taking the algorithm's config
//! entry; the registry maps config kinds to these builders.

pub mod mock;
pub mod precomputed;

pub use mock::{MockAlgorithm, MockParameters};
pub use precomputed::PrecomputedAlgorithm;
