pub mod errors;
pub mod pipeline;
pub mod stages;
pub mod types;

pub use errors::PipelineError;
pub use pipeline::{PipelineEngine, ReworkOutcome, ReworkRequest};
