//! Record set: every generation known locally, with download state.

pub mod set;
pub mod types;

pub use set::RecordSet;
pub use types::{GeneratedImage, GenerationStatus, ImageVariation, Record};
